//! Rendering of [`RuleSpec`]s into nftables expression lists.
//!
//! The field order is fixed (src, dst, proto, dport, sport, state, counter,
//! log, verdict) and the byte encodings follow the kernel ABI: ports are
//! big-endian, connection-tracking state words are native-endian, addresses
//! are the raw octets.

use rustables::expr::{
    Bitwise, Cmp, CmpOp, Conntrack, ConntrackKey, Counter, ExpressionList, ExpressionRaw,
    ExpressionVariant, HighLevelPayload, IPv4HeaderField, Immediate, Log, Lookup, Meta, MetaType,
    NetworkHeaderField, RawExpression, Register, TCPHeaderField, TransportHeaderField,
    UDPHeaderField, VerdictKind,
};
use rustables::nlmsg::NfNetlinkDeserializable;

use super::{AddrMatch, CtState, FirewallError, PortMatch, Proto, RuleSpec, Verdict};

// NFTA_QUEUE_NUM, not exposed by the library
const QUEUE_NUM_ATTR: u16 = 1;

pub fn expressions(spec: &RuleSpec) -> Result<ExpressionList, FirewallError> {
    let mut exprs = ExpressionList::default();

    if let Some(src) = &spec.src {
        addr_match(&mut exprs, src, true);
    }
    if let Some(dst) = &spec.dst {
        addr_match(&mut exprs, dst, false);
    }
    if let Some(proto) = spec.proto {
        exprs.add_value(
            Meta::default()
                .with_key(MetaType::L4Proto)
                .with_dreg(Register::Reg1),
        );
        exprs.add_value(Cmp::new(CmpOp::Eq, [proto.number()]));
    }
    if let Some(dport) = spec.dport {
        port_match(&mut exprs, spec.proto, dport, false)?;
    }
    if let Some(sport) = spec.sport {
        port_match(&mut exprs, spec.proto, sport, true)?;
    }
    if let Some(state) = spec.state {
        ct_state_match(&mut exprs, state)?;
    }
    if spec.counter {
        exprs.add_value(Counter::default());
    }
    if let Some(prefix) = &spec.log_prefix {
        let log = Log::new(None, Some(prefix.as_str()))
            .map_err(|e| FirewallError::Build(e.to_string()))?;
        exprs.add_value(log);
    }
    verdict(&mut exprs, &spec.verdict)?;

    Ok(exprs)
}

fn addr_payload(src: bool) -> rustables::expr::Payload {
    let field = if src {
        IPv4HeaderField::Saddr
    } else {
        IPv4HeaderField::Daddr
    };
    HighLevelPayload::Network(NetworkHeaderField::IPv4(field)).build()
}

fn addr_match(exprs: &mut ExpressionList, m: &AddrMatch, src: bool) {
    exprs.add_value(addr_payload(src));
    match m {
        AddrMatch::Addr(addr) => {
            exprs.add_value(Cmp::new(CmpOp::Eq, addr.octets()));
        }
        AddrMatch::Not(addr) => {
            exprs.add_value(Cmp::new(CmpOp::Neq, addr.octets()));
        }
        AddrMatch::Range(low, high) => {
            exprs.add_value(Cmp::new(CmpOp::Gte, low.octets()));
            exprs.add_value(Cmp::new(CmpOp::Lte, high.octets()));
        }
        AddrMatch::InSet(set) => {
            exprs.add_value(
                Lookup::default()
                    .with_set(set.as_str())
                    .with_sreg(Register::Reg1),
            );
        }
    }
}

fn port_match(
    exprs: &mut ExpressionList,
    proto: Option<Proto>,
    m: PortMatch,
    src: bool,
) -> Result<(), FirewallError> {
    let field = match (proto, src) {
        (Some(Proto::Tcp), false) => TransportHeaderField::Tcp(TCPHeaderField::Dport),
        (Some(Proto::Tcp), true) => TransportHeaderField::Tcp(TCPHeaderField::Sport),
        (Some(Proto::Udp), false) => TransportHeaderField::Udp(UDPHeaderField::Dport),
        (Some(Proto::Udp), true) => TransportHeaderField::Udp(UDPHeaderField::Sport),
        (None, _) => {
            return Err(FirewallError::Build(
                "port match requires an L4 protocol".into(),
            ))
        }
    };
    exprs.add_value(HighLevelPayload::Transport(field).build());
    match m {
        PortMatch::Port(port) => {
            exprs.add_value(Cmp::new(CmpOp::Eq, port.to_be_bytes()));
        }
        PortMatch::Range(low, high) => {
            exprs.add_value(Cmp::new(CmpOp::Gte, low.to_be_bytes()));
            exprs.add_value(Cmp::new(CmpOp::Lte, high.to_be_bytes()));
        }
    }
    Ok(())
}

fn ct_state_match(exprs: &mut ExpressionList, state: CtState) -> Result<(), FirewallError> {
    exprs.add_value(Conntrack::default().with_retrieve_value(ConntrackKey::State));
    let mask = Bitwise::new(state.bits().to_ne_bytes(), 0u32.to_ne_bytes())
        .map_err(|e| FirewallError::Build(e.to_string()))?;
    exprs.add_value(mask);
    exprs.add_value(Cmp::new(CmpOp::Neq, 0u32.to_ne_bytes()));
    Ok(())
}

fn verdict(exprs: &mut ExpressionList, verdict: &Verdict) -> Result<(), FirewallError> {
    match verdict {
        Verdict::Accept => exprs.add_value(Immediate::new_verdict(VerdictKind::Accept)),
        Verdict::Drop => exprs.add_value(Immediate::new_verdict(VerdictKind::Drop)),
        Verdict::Jump(chain) => exprs.add_value(Immediate::new_verdict(VerdictKind::Jump {
            chain: chain.clone(),
        })),
        Verdict::Queue(num) => exprs.add_value(queue_expression(*num)?),
    }
    Ok(())
}

// The library has no queue expression, so the attribute payload is written
// by hand: one NFTA_QUEUE_NUM netlink attribute holding the big-endian
// queue number.
fn queue_expression(num: u16) -> Result<RawExpression, FirewallError> {
    let value = num.to_be_bytes();
    let mut attr = Vec::with_capacity(8);
    attr.extend_from_slice(&(4u16 + value.len() as u16).to_le_bytes());
    attr.extend_from_slice(&QUEUE_NUM_ATTR.to_le_bytes());
    attr.extend_from_slice(&value);
    while attr.len() % 4 != 0 {
        attr.push(0);
    }

    let (raw, _) =
        ExpressionRaw::deserialize(&attr).map_err(|e| FirewallError::Build(e.to_string()))?;
    Ok(RawExpression::default()
        .with_name("queue")
        .with_data(ExpressionVariant::ExpressionRaw(raw)))
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn names(exprs: &ExpressionList) -> Vec<String> {
        exprs
            .iter()
            .filter_map(|e| e.get_name().cloned())
            .collect()
    }

    #[test]
    fn egress_rule_renders_in_fixed_order() {
        let spec = RuleSpec {
            src: Some(AddrMatch::Addr(Ipv4Addr::new(172, 0, 1, 2))),
            dst: None,
            proto: Some(Proto::Tcp),
            dport: Some(PortMatch::Port(443)),
            sport: None,
            state: Some(CtState::NewEstablished),
            counter: true,
            log_prefix: None,
            verdict: Verdict::Accept,
            annotation: b"C1".to_vec(),
        };
        let exprs = expressions(&spec).unwrap();
        assert_eq!(
            names(&exprs),
            [
                "payload", "cmp", // src addr
                "meta", "cmp", // l4 proto
                "payload", "cmp", // dport
                "ct", "bitwise", "cmp", // state
                "counter", "immediate",
            ]
        );
    }

    #[test]
    fn range_match_renders_two_comparisons() {
        let spec = RuleSpec {
            src: None,
            dst: Some(AddrMatch::Range(
                Ipv4Addr::new(192, 168, 1, 0),
                Ipv4Addr::new(192, 168, 1, 255),
            )),
            proto: Some(Proto::Udp),
            dport: Some(PortMatch::Port(53)),
            sport: None,
            state: None,
            counter: false,
            log_prefix: None,
            verdict: Verdict::Drop,
            annotation: b"C1".to_vec(),
        };
        let exprs = expressions(&spec).unwrap();
        assert_eq!(
            names(&exprs),
            ["payload", "cmp", "cmp", "meta", "cmp", "payload", "cmp", "immediate"]
        );
    }

    #[test]
    fn queue_verdict_renders_raw_queue_expression() {
        let spec = RuleSpec {
            verdict: Verdict::Queue(1000),
            ..RuleSpec::annotated(b"C1".to_vec(), Verdict::Accept)
        };
        let exprs = expressions(&spec).unwrap();
        assert_eq!(names(&exprs), ["counter", "queue"]);
    }

    #[test]
    fn port_match_without_protocol_is_rejected() {
        let spec = RuleSpec {
            dport: Some(PortMatch::Port(80)),
            ..RuleSpec::annotated(b"C1".to_vec(), Verdict::Accept)
        };
        assert!(matches!(expressions(&spec), Err(FirewallError::Build(_))));
    }

    #[test]
    fn set_lookup_renders_payload_and_lookup() {
        let spec = RuleSpec {
            src: Some(AddrMatch::InSet(crate::nft::ADDR_SET.to_string())),
            counter: false,
            verdict: Verdict::Jump(crate::nft::CONTAINERS_CHAIN.to_string()),
            ..RuleSpec::annotated(crate::nft::BASE_ANNOTATION.to_vec(), Verdict::Accept)
        };
        let exprs = expressions(&spec).unwrap();
        assert_eq!(names(&exprs), ["payload", "lookup", "immediate"]);
    }
}
