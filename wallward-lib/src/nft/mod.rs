//! Wallward's view of the kernel packet filter: the rule representation the
//! codec produces, the batch operations the applier commits, and the
//! [`Firewall`] trait behind which the netlink transport lives.

use std::fmt;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use thiserror::Error;

pub mod kernel;
pub mod translate;

#[cfg(test)]
pub(crate) mod mock;

/// Table holding every wallward object.
pub const TABLE: &str = "wallward";
/// Base chain jumped to from the input hook.
pub const INPUT_CHAIN: &str = "input";
/// Base chain jumped to from the output hook.
pub const OUTPUT_CHAIN: &str = "output";
/// Base chain jumped to from the forward hook.
pub const FORWARD_CHAIN: &str = "forward";
/// Shared dispatch chain: established short-circuit, the set-gated jumps
/// into [`CONTAINERS_CHAIN`] and the per-container pre-NAT drops.
pub const DISPATCH_CHAIN: &str = "ww-dispatch";
/// Shared chain holding one pair of jump rules per confined container.
pub const CONTAINERS_CHAIN: &str = "ww-containers";
/// Named set of all confined container addresses, gating the dispatch jumps.
pub const ADDR_SET: &str = "ww-addrs";
/// Userdata marker carried by base-topology objects.
pub const BASE_ANNOTATION: &[u8] = b"wallward";

const CHAIN_NAME_MAX: usize = 28;

/// Deterministic per-container chain name: `ww-<name>-<id prefix>`,
/// truncated so it stays within the kernel's chain name limit.
pub fn container_chain(name: &str, id: &str) -> String {
    let id_part: String = id.chars().take(12).collect();
    let budget = CHAIN_NAME_MAX.saturating_sub(3 + 1 + id_part.len());
    let name_part: String = name.chars().take(budget).collect();
    format!("ww-{name_part}-{id_part}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
    Tcp,
    Udp,
}

impl Proto {
    pub fn number(self) -> u8 {
        match self {
            Proto::Tcp => libc::IPPROTO_TCP as u8,
            Proto::Udp => libc::IPPROTO_UDP as u8,
        }
    }
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proto::Tcp => write!(f, "tcp"),
            Proto::Udp => write!(f, "udp"),
        }
    }
}

/// An address predicate on either endpoint of a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddrMatch {
    /// Exact address.
    Addr(Ipv4Addr),
    /// Inclusive range, the canonical form of a CIDR or `a-b` literal.
    Range(Ipv4Addr, Ipv4Addr),
    /// Everything except the given address.
    Not(Ipv4Addr),
    /// Membership in a named set of the wallward table.
    InSet(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortMatch {
    Port(u16),
    Range(u16, u16),
}

/// Connection-tracking states a rule can require.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtState {
    New,
    Established,
    NewEstablished,
}

impl CtState {
    // bit values of the kernel's ct state keyword
    pub fn bits(self) -> u32 {
        const ESTABLISHED: u32 = 2;
        const NEW: u32 = 8;
        match self {
            CtState::New => NEW,
            CtState::Established => ESTABLISHED,
            CtState::NewEstablished => NEW | ESTABLISHED,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
    Queue(u16),
    Jump(String),
}

/// One generated rule: ordered match fields, a verdict and the owner
/// annotation. The transport renders the fields into kernel expressions in
/// exactly this order: src, dst, proto, dport, sport, ct state, counter,
/// log, verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSpec {
    pub src: Option<AddrMatch>,
    pub dst: Option<AddrMatch>,
    pub proto: Option<Proto>,
    pub dport: Option<PortMatch>,
    pub sport: Option<PortMatch>,
    pub state: Option<CtState>,
    pub counter: bool,
    pub log_prefix: Option<String>,
    pub verdict: Verdict,
    pub annotation: Vec<u8>,
}

impl RuleSpec {
    pub fn annotated(annotation: impl Into<Vec<u8>>, verdict: Verdict) -> Self {
        RuleSpec {
            src: None,
            dst: None,
            proto: None,
            dport: None,
            sport: None,
            state: None,
            counter: true,
            log_prefix: None,
            verdict,
            annotation: annotation.into(),
        }
    }
}

/// A rule as reported back by the kernel, reduced to what removal needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelRule {
    pub chain: String,
    pub handle: u64,
    pub annotation: Option<Vec<u8>>,
}

/// Hooks the base chains attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookSpot {
    Input,
    Output,
    Forward,
}

/// One mutation inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NftOp {
    CreateTable,
    DeleteTable,
    CreateBaseChain {
        name: String,
        hook: HookSpot,
        priority: i32,
    },
    CreateChain {
        name: String,
    },
    DeleteChain {
        name: String,
    },
    CreateAddrSet,
    DeleteAddrSet,
    AddSetElem {
        addr: Ipv4Addr,
    },
    DelSetElem {
        addr: Ipv4Addr,
    },
    AppendRule {
        chain: String,
        rule: RuleSpec,
    },
    DeleteRule {
        chain: String,
        handle: u64,
    },
}

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("netlink batch rejected: {0}")]
    Commit(String),
    #[error("netlink query failed: {0}")]
    Query(String),
    #[error("building kernel objects failed: {0}")]
    Build(String),
    #[error("unknown chain `{0}`")]
    UnknownChain(String),
}

/// The kernel's rule set, behind a trait so the reconciler and applier can
/// be exercised against a recording stand-in. The real implementation is
/// [`kernel::Nftables`]; a committed batch either lands fully or not at all.
#[async_trait]
pub trait Firewall: Send + Sync {
    async fn commit(&self, batch: Vec<NftOp>) -> Result<(), FirewallError>;

    /// Whether the wallward table exists at all.
    async fn table_exists(&self) -> Result<bool, FirewallError>;

    /// Names of every chain in the wallward table.
    async fn list_chains(&self) -> Result<Vec<String>, FirewallError>;

    /// All rules of one chain, top to bottom.
    async fn list_rules(&self, chain: &str) -> Result<Vec<KernelRule>, FirewallError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_chain_is_deterministic_and_bounded() {
        let chain = container_chain("client", "container_one_ID");
        assert_eq!(chain, "ww-client-container_on");
        assert_eq!(chain, container_chain("client", "container_one_ID"));

        let long = container_chain(
            "a-container-with-a-very-long-name",
            "0123456789abcdef0123456789abcdef",
        );
        assert!(long.len() <= CHAIN_NAME_MAX);
        assert!(long.starts_with("ww-"));
        assert!(long.ends_with("0123456789ab"));
    }

    #[test]
    fn ct_state_bits_combine() {
        assert_eq!(CtState::New.bits(), 8);
        assert_eq!(CtState::Established.bits(), 2);
        assert_eq!(
            CtState::NewEstablished.bits(),
            CtState::New.bits() | CtState::Established.bits()
        );
    }
}
