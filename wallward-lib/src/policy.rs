//! The per-container policy document, decoded from the `wallward/rules`
//! label. Parsing is strict: unknown keys, port 0, inverted ranges and
//! malformed verdicts are all hard errors, so a typo in a security policy
//! cannot silently widen it.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnetwork::Ipv4Network;
use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;
use thiserror::Error;

use crate::docker::ContainerRuntime;
use crate::nft::{AddrMatch, PortMatch, Proto};

/// Upper bound on user log prefixes; the kernel caps the rendered prefix at
/// 127 bytes and the chain name is prepended to it.
pub const MAX_LOG_PREFIX: usize = 64;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid policy yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("output rule {index}: `ip` and `container` are mutually exclusive")]
    PeerConflict { index: usize },
    #[error("output rule {index}: log prefix longer than {MAX_LOG_PREFIX} characters")]
    LogPrefixTooLong { index: usize },
    #[error("container `{name}` has no address on network `{network}`: {reason}")]
    UnresolvedRef {
        name: String,
        network: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    #[serde(default)]
    pub output: Vec<OutputRule>,
    #[serde(default)]
    pub mapped_ports: MappedPorts,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputRule {
    pub ip: Option<IpLiteral>,
    pub container: Option<ContainerRef>,
    pub proto: Proto,
    pub port: PortSpec,
    pub log_prefix: Option<String>,
    #[serde(default)]
    pub skip_conntrack: bool,
    pub verdict: Option<VerdictSpec>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerRef {
    pub name: String,
    pub network: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MappedPorts {
    #[serde(default)]
    pub localhost: PortSide,
    #[serde(default)]
    pub external: PortSide,
}

/// Treatment of host-published ports reached from one side (loopback or
/// everything else).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortSide {
    #[serde(default)]
    pub allow: bool,
    pub ip: Option<IpLiteral>,
    pub verdict: Option<VerdictSpec>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerdictSpec {
    Accept,
    Drop,
    Queue(QueueSpec),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueSpec {
    pub num: u16,
    pub input_est_queue: Option<u16>,
    pub output_est_queue: Option<u16>,
}

/// A literal peer: a single address, a CIDR or an `a-b` range, always
/// canonicalized to an [`AddrMatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpLiteral(pub AddrMatch);

impl<'de> Deserialize<'de> for IpLiteral {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        parse_ip_literal(&text).map(IpLiteral).map_err(de::Error::custom)
    }
}

fn parse_ip_literal(text: &str) -> Result<AddrMatch, String> {
    if let Some((low, high)) = text.split_once('-') {
        let low = Ipv4Addr::from_str(low.trim()).map_err(|e| format!("bad range start: {e}"))?;
        let high = Ipv4Addr::from_str(high.trim()).map_err(|e| format!("bad range end: {e}"))?;
        if low > high {
            return Err(format!("inverted address range `{text}`"));
        }
        return Ok(AddrMatch::Range(low, high));
    }
    if text.contains('/') {
        let net = Ipv4Network::from_str(text).map_err(|e| format!("bad cidr `{text}`: {e}"))?;
        if net.prefix() == 32 {
            return Ok(AddrMatch::Addr(net.ip()));
        }
        return Ok(AddrMatch::Range(net.network(), net.broadcast()));
    }
    let addr = Ipv4Addr::from_str(text).map_err(|e| format!("bad address `{text}`: {e}"))?;
    Ok(AddrMatch::Addr(addr))
}

/// A destination port: a literal `1..=65535` or a `"low-high"` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSpec {
    pub low: u16,
    pub high: u16,
}

impl PortSpec {
    pub fn matcher(self) -> PortMatch {
        if self.low == self.high {
            PortMatch::Port(self.low)
        } else {
            PortMatch::Range(self.low, self.high)
        }
    }
}

impl<'de> Deserialize<'de> for PortSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PortVisitor;

        impl Visitor<'_> for PortVisitor {
            type Value = PortSpec;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a port between 1 and 65535 or a \"low-high\" range")
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<PortSpec, E> {
                let port = one_port(value).map_err(E::custom)?;
                Ok(PortSpec {
                    low: port,
                    high: port,
                })
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<PortSpec, E> {
                if value < 0 {
                    return Err(E::custom("port must be positive"));
                }
                self.visit_u64(value as u64)
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<PortSpec, E> {
                match value.split_once('-') {
                    Some((low, high)) => {
                        let low = low
                            .trim()
                            .parse::<u64>()
                            .map_err(|e| E::custom(format!("bad range start: {e}")))
                            .and_then(|p| one_port(p).map_err(E::custom))?;
                        let high = high
                            .trim()
                            .parse::<u64>()
                            .map_err(|e| E::custom(format!("bad range end: {e}")))
                            .and_then(|p| one_port(p).map_err(E::custom))?;
                        if low > high {
                            return Err(E::custom(format!("inverted port range `{value}`")));
                        }
                        Ok(PortSpec { low, high })
                    }
                    None => {
                        let port = value
                            .trim()
                            .parse::<u64>()
                            .map_err(|e| E::custom(format!("bad port: {e}")))
                            .and_then(|p| one_port(p).map_err(E::custom))?;
                        Ok(PortSpec {
                            low: port,
                            high: port,
                        })
                    }
                }
            }
        }

        deserializer.deserialize_any(PortVisitor)
    }
}

fn one_port(value: u64) -> Result<u16, String> {
    match value {
        0 => Err("port 0 is not routable".to_string()),
        1..=65535 => Ok(value as u16),
        _ => Err(format!("port {value} out of range")),
    }
}

impl Policy {
    /// Decodes and validates the label value.
    pub fn parse(yaml: &str) -> Result<Policy, PolicyError> {
        let policy: Policy = serde_yaml::from_str(yaml)?;
        policy.validate()?;
        Ok(policy)
    }

    fn validate(&self) -> Result<(), PolicyError> {
        for (index, rule) in self.output.iter().enumerate() {
            if rule.ip.is_some() && rule.container.is_some() {
                return Err(PolicyError::PeerConflict { index });
            }
            if let Some(prefix) = &rule.log_prefix {
                if prefix.len() > MAX_LOG_PREFIX {
                    return Err(PolicyError::LogPrefixTooLong { index });
                }
            }
        }
        Ok(())
    }

    /// Pins every container-name peer to the address it currently has on
    /// the named network. A single unresolved reference rejects the whole
    /// policy, leaving the container deny-all.
    pub async fn resolve(
        &self,
        runtime: &dyn ContainerRuntime,
    ) -> Result<ResolvedPolicy, PolicyError> {
        let mut output = Vec::with_capacity(self.output.len());
        for rule in &self.output {
            let peer = match (&rule.ip, &rule.container) {
                (Some(IpLiteral(m)), None) => Some(m.clone()),
                (None, Some(r)) => {
                    let addr = runtime
                        .address_on_network(&r.name, &r.network)
                        .await
                        .map_err(|e| PolicyError::UnresolvedRef {
                            name: r.name.clone(),
                            network: r.network.clone(),
                            reason: e.to_string(),
                        })?;
                    Some(AddrMatch::Addr(addr))
                }
                (None, None) => None,
                // rejected by validate()
                (Some(_), Some(_)) => unreachable!("peer conflict survived validation"),
            };
            output.push(ResolvedRule {
                peer,
                proto: rule.proto,
                port: rule.port.matcher(),
                log_prefix: rule.log_prefix.clone(),
                skip_conntrack: rule.skip_conntrack,
                verdict: rule.verdict.clone().unwrap_or(VerdictSpec::Accept),
            });
        }
        Ok(ResolvedPolicy {
            output,
            mapped_ports: self.mapped_ports.clone(),
        })
    }
}

/// A policy with every peer reference pinned to an address, ready for the
/// rule codec.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedPolicy {
    pub output: Vec<ResolvedRule>,
    pub mapped_ports: MappedPorts,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRule {
    pub peer: Option<AddrMatch>,
    pub proto: Proto,
    pub port: PortMatch,
    pub log_prefix: Option<String>,
    pub skip_conntrack: bool,
    pub verdict: VerdictSpec,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_output_rule() {
        let policy = Policy::parse("output:\n  - proto: tcp\n    port: 443\n").unwrap();
        assert_eq!(policy.output.len(), 1);
        let rule = &policy.output[0];
        assert_eq!(rule.proto, Proto::Tcp);
        assert_eq!(rule.port, PortSpec { low: 443, high: 443 });
        assert!(rule.ip.is_none());
        assert!(rule.verdict.is_none());
    }

    #[test]
    fn parses_every_peer_literal_form() {
        let policy = Policy::parse(
            r#"
output:
  - ip: 1.1.1.1
    proto: tcp
    port: 443
  - ip: 192.168.1.0/24
    proto: udp
    port: 53
  - ip: 10.0.0.1-10.0.0.9
    proto: tcp
    port: "1000-2000"
"#,
        )
        .unwrap();
        assert_eq!(
            policy.output[0].ip,
            Some(IpLiteral(AddrMatch::Addr("1.1.1.1".parse().unwrap())))
        );
        assert_eq!(
            policy.output[1].ip,
            Some(IpLiteral(AddrMatch::Range(
                "192.168.1.0".parse().unwrap(),
                "192.168.1.255".parse().unwrap()
            )))
        );
        assert_eq!(
            policy.output[2].ip,
            Some(IpLiteral(AddrMatch::Range(
                "10.0.0.1".parse().unwrap(),
                "10.0.0.9".parse().unwrap()
            )))
        );
        assert_eq!(policy.output[2].port, PortSpec { low: 1000, high: 2000 });
    }

    #[test]
    fn parses_queue_verdict() {
        let policy = Policy::parse(
            r#"
output:
  - proto: tcp
    port: 443
    verdict:
      queue:
        num: 1000
        input_est_queue: 1001
        output_est_queue: 1002
"#,
        )
        .unwrap();
        assert_eq!(
            policy.output[0].verdict,
            Some(VerdictSpec::Queue(QueueSpec {
                num: 1000,
                input_est_queue: Some(1001),
                output_est_queue: Some(1002),
            }))
        );
    }

    #[test]
    fn parses_mapped_ports() {
        let policy = Policy::parse(
            r#"
mapped_ports:
  localhost:
    allow: true
  external:
    allow: true
    ip: 192.168.1.0/24
"#,
        )
        .unwrap();
        assert!(policy.mapped_ports.localhost.allow);
        assert!(policy.mapped_ports.external.allow);
        assert!(policy.mapped_ports.external.ip.is_some());
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(Policy::parse("output:\n  - proto: tcp\n    port: 443\n    prot: tcp\n").is_err());
        assert!(Policy::parse("outputs: []\n").is_err());
        assert!(Policy::parse("mapped_ports:\n  localhost:\n    alow: true\n").is_err());
    }

    #[test]
    fn rejects_port_zero_and_inverted_ranges() {
        assert!(Policy::parse("output:\n  - proto: tcp\n    port: 0\n").is_err());
        assert!(Policy::parse("output:\n  - proto: tcp\n    port: \"2000-1000\"\n").is_err());
        assert!(Policy::parse("output:\n  - proto: tcp\n    port: 70000\n").is_err());
    }

    #[test]
    fn rejects_conflicting_peer_selectors() {
        let err = Policy::parse(
            r#"
output:
  - ip: 1.1.1.1
    container:
      name: other
      network: default
    proto: tcp
    port: 443
"#,
        )
        .unwrap_err();
        assert!(matches!(err, PolicyError::PeerConflict { index: 0 }));
    }

    #[test]
    fn rejects_est_queues_without_queue() {
        // input_est_queue only exists inside the queue mapping
        assert!(Policy::parse(
            r#"
output:
  - proto: tcp
    port: 443
    verdict:
      input_est_queue: 1001
"#,
        )
        .is_err());
    }

    #[test]
    fn empty_policy_is_deny_all() {
        let policy = Policy::parse("").unwrap_or_default();
        assert!(policy.output.is_empty());
        assert!(!policy.mapped_ports.localhost.allow);
        assert!(!policy.mapped_ports.external.allow);
    }
}
