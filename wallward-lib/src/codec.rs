//! The rule codec: translation of a resolved policy into the ordered rule
//! lists for one container. Pure data in, pure data out — no I/O.
//!
//! For every policy rule a pair of stateful rules is produced, one for the
//! forward direction and one for replies. Host-published ports additionally
//! produce pre-NAT drops in the shared dispatch chain and post-NAT rules in
//! the container chain, because Docker source-NATs loopback clients to the
//! network gateway before the filter ever sees them. The chain always ends
//! with an annotated drop.

use std::net::Ipv4Addr;

use crate::container::{ContainerMeta, Endpoint, MappedPort};
use crate::nft::{container_chain, AddrMatch, CtState, PortMatch, Proto, RuleSpec, Verdict};
use crate::policy::{PortSide, QueueSpec, ResolvedPolicy, ResolvedRule, VerdictSpec};

/// The loopback address Docker rewrites into the gateway on its way to a
/// published port.
const LOCALHOST: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

/// Everything the applier must install for one container.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GeneratedRules {
    /// Name of the per-container chain.
    pub chain: String,
    /// Ordered contents of the per-container chain.
    pub chain_rules: Vec<RuleSpec>,
    /// Pre-NAT mapped-port drops appended to the dispatch chain.
    pub dispatch_rules: Vec<RuleSpec>,
    /// Address-keyed jumps into the per-container chain, appended to the
    /// shared containers chain.
    pub jump_rules: Vec<RuleSpec>,
    /// Container addresses to add to the dispatch address set.
    pub addrs: Vec<Ipv4Addr>,
}

pub fn build(meta: &ContainerMeta, policy: &ResolvedPolicy) -> GeneratedRules {
    let chain = container_chain(&meta.name, &meta.id);
    let annotation = meta.id.as_bytes().to_vec();
    let mut gen = GeneratedRules {
        chain: chain.clone(),
        ..Default::default()
    };

    for rule in &policy.output {
        for endpoint in &meta.endpoints {
            egress_pair(&mut gen.chain_rules, &chain, endpoint, rule, &annotation);
        }
    }

    for port in &meta.mapped_ports {
        mapped_port_rules(&mut gen, policy, meta, *port, &annotation);
    }

    // default-deny tail
    gen.chain_rules
        .push(RuleSpec::annotated(annotation.clone(), Verdict::Drop));

    for endpoint in &meta.endpoints {
        gen.jump_rules.push(RuleSpec {
            src: Some(AddrMatch::Addr(endpoint.addr)),
            counter: false,
            verdict: Verdict::Jump(chain.clone()),
            ..RuleSpec::annotated(annotation.clone(), Verdict::Drop)
        });
        gen.jump_rules.push(RuleSpec {
            dst: Some(AddrMatch::Addr(endpoint.addr)),
            counter: false,
            verdict: Verdict::Jump(chain.clone()),
            ..RuleSpec::annotated(annotation.clone(), Verdict::Drop)
        });
        if !gen.addrs.contains(&endpoint.addr) {
            gen.addrs.push(endpoint.addr);
        }
    }

    gen
}

/// The established-side queue knobs, oriented by traffic direction: for
/// egress rules the forward direction is container-out
/// (`output_est_queue`), for mapped ports it is host-in
/// (`input_est_queue`).
#[derive(Debug, Clone, Copy, Default)]
struct EstQueues {
    forward: Option<u16>,
    reply: Option<u16>,
}

impl EstQueues {
    fn egress(q: &QueueSpec) -> Self {
        EstQueues {
            forward: q.output_est_queue,
            reply: q.input_est_queue,
        }
    }

    fn ingress(q: &QueueSpec) -> Self {
        EstQueues {
            forward: q.input_est_queue,
            reply: q.output_est_queue,
        }
    }
}

fn egress_pair(
    out: &mut Vec<RuleSpec>,
    chain: &str,
    endpoint: &Endpoint,
    rule: &ResolvedRule,
    annotation: &[u8],
) {
    let forward = RuleSpec {
        src: Some(AddrMatch::Addr(endpoint.addr)),
        dst: rule.peer.clone(),
        proto: Some(rule.proto),
        dport: Some(rule.port),
        ..RuleSpec::annotated(annotation.to_vec(), Verdict::Drop)
    };
    let reply = RuleSpec {
        src: rule.peer.clone(),
        dst: Some(AddrMatch::Addr(endpoint.addr)),
        proto: Some(rule.proto),
        sport: Some(rule.port),
        ..RuleSpec::annotated(annotation.to_vec(), Verdict::Drop)
    };
    let est = match &rule.verdict {
        VerdictSpec::Queue(q) => EstQueues::egress(q),
        _ => EstQueues::default(),
    };
    stateful_pair(
        out,
        forward,
        reply,
        &rule.verdict,
        rule.log_prefix
            .as_deref()
            .map(|p| render_log_prefix(chain, p)),
        rule.skip_conntrack,
        est,
    );
}

/// Expands one logical rule into its stateful forms: the forward rule (or
/// rules, when new and established packets diverge) followed by the reply
/// rule.
fn stateful_pair(
    out: &mut Vec<RuleSpec>,
    forward: RuleSpec,
    reply: RuleSpec,
    verdict: &VerdictSpec,
    log_prefix: Option<String>,
    skip_conntrack: bool,
    est: EstQueues,
) {
    let primary = match verdict {
        VerdictSpec::Accept => Verdict::Accept,
        VerdictSpec::Drop => Verdict::Drop,
        VerdictSpec::Queue(q) => Verdict::Queue(q.num),
    };
    let reply_plain = match verdict {
        VerdictSpec::Drop => Verdict::Drop,
        _ => Verdict::Accept,
    };

    if skip_conntrack {
        // stateless form: one rule per direction, no established variants
        out.push(RuleSpec {
            log_prefix: log_prefix.clone(),
            verdict: primary,
            ..forward
        });
        out.push(RuleSpec {
            verdict: reply_plain,
            ..reply
        });
        return;
    }

    match verdict {
        VerdictSpec::Queue(q) => {
            if est.forward == Some(q.num) {
                out.push(RuleSpec {
                    state: Some(CtState::NewEstablished),
                    log_prefix,
                    verdict: Verdict::Queue(q.num),
                    ..forward
                });
            } else {
                out.push(RuleSpec {
                    state: Some(CtState::New),
                    log_prefix,
                    verdict: Verdict::Queue(q.num),
                    ..forward.clone()
                });
                out.push(RuleSpec {
                    state: Some(CtState::Established),
                    verdict: est.forward.map(Verdict::Queue).unwrap_or(Verdict::Accept),
                    ..forward
                });
            }
            out.push(RuleSpec {
                state: Some(CtState::Established),
                verdict: est.reply.map(Verdict::Queue).unwrap_or(Verdict::Accept),
                ..reply
            });
        }
        _ => {
            if let Some(prefix) = log_prefix {
                // the log action only makes sense on connection setup, so
                // the forward rule splits into new-with-log and established
                out.push(RuleSpec {
                    state: Some(CtState::New),
                    log_prefix: Some(prefix),
                    verdict: primary.clone(),
                    ..forward.clone()
                });
                out.push(RuleSpec {
                    state: Some(CtState::Established),
                    verdict: primary,
                    ..forward
                });
            } else {
                out.push(RuleSpec {
                    state: Some(CtState::NewEstablished),
                    verdict: primary,
                    ..forward
                });
            }
            out.push(RuleSpec {
                state: Some(CtState::Established),
                verdict: reply_plain,
                ..reply
            });
        }
    }
}

fn mapped_port_rules(
    gen: &mut GeneratedRules,
    policy: &ResolvedPolicy,
    meta: &ContainerMeta,
    port: MappedPort,
    annotation: &[u8],
) {
    let localhost = &policy.mapped_ports.localhost;
    let external = &policy.mapped_ports.external;

    if !localhost.allow {
        // loopback clients are dropped before Docker's NAT rewrites them,
        // while the host port is still visible
        gen.dispatch_rules.push(prenat_drop(
            AddrMatch::Addr(LOCALHOST),
            port.proto,
            port.host_port,
            annotation,
        ));
        // and their post-NAT remnant (source rewritten to the gateway) is
        // dropped in the container chain
        for endpoint in &meta.endpoints {
            gen.chain_rules.push(RuleSpec {
                src: Some(AddrMatch::Addr(endpoint.gateway)),
                dst: Some(AddrMatch::Addr(endpoint.addr)),
                proto: Some(port.proto),
                dport: Some(PortMatch::Port(port.container_port)),
                state: Some(CtState::New),
                ..RuleSpec::annotated(annotation.to_vec(), Verdict::Drop)
            });
        }
    }
    if !external.allow {
        gen.dispatch_rules.push(prenat_drop(
            AddrMatch::Not(LOCALHOST),
            port.proto,
            port.host_port,
            annotation,
        ));
    }

    if localhost.allow {
        for endpoint in &meta.endpoints {
            localhost_pair(gen, endpoint, port, localhost, annotation);
        }
    }
    if external.allow {
        for endpoint in &meta.endpoints {
            external_pair(gen, endpoint, port, external, annotation);
        }
    }
}

fn prenat_drop(src: AddrMatch, proto: Proto, host_port: u16, annotation: &[u8]) -> RuleSpec {
    RuleSpec {
        src: Some(src),
        proto: Some(proto),
        dport: Some(PortMatch::Port(host_port)),
        state: Some(CtState::New),
        ..RuleSpec::annotated(annotation.to_vec(), Verdict::Drop)
    }
}

/// Loopback clients appear post-NAT as the network gateway.
fn localhost_pair(
    gen: &mut GeneratedRules,
    endpoint: &Endpoint,
    port: MappedPort,
    side: &PortSide,
    annotation: &[u8],
) {
    let verdict = side.verdict.clone().unwrap_or(VerdictSpec::Accept);
    let forward = RuleSpec {
        src: Some(AddrMatch::Addr(endpoint.gateway)),
        dst: Some(AddrMatch::Addr(endpoint.addr)),
        proto: Some(port.proto),
        dport: Some(PortMatch::Port(port.container_port)),
        ..RuleSpec::annotated(annotation.to_vec(), Verdict::Drop)
    };
    let reply = RuleSpec {
        src: Some(AddrMatch::Addr(endpoint.addr)),
        dst: Some(AddrMatch::Addr(endpoint.gateway)),
        proto: Some(port.proto),
        sport: Some(PortMatch::Port(port.container_port)),
        ..RuleSpec::annotated(annotation.to_vec(), Verdict::Drop)
    };
    let est = match &verdict {
        VerdictSpec::Queue(q) => EstQueues::ingress(q),
        _ => EstQueues::default(),
    };
    stateful_pair(&mut gen.chain_rules, forward, reply, &verdict, None, false, est);
}

/// Non-loopback clients keep their true source address across Docker's
/// destination NAT, so the allowed source set can be matched directly.
fn external_pair(
    gen: &mut GeneratedRules,
    endpoint: &Endpoint,
    port: MappedPort,
    side: &PortSide,
    annotation: &[u8],
) {
    let verdict = side.verdict.clone().unwrap_or(VerdictSpec::Accept);
    let source = side.ip.clone().map(|lit| lit.0);
    let forward = RuleSpec {
        src: source.clone(),
        dst: Some(AddrMatch::Addr(endpoint.addr)),
        proto: Some(port.proto),
        dport: Some(PortMatch::Port(port.container_port)),
        ..RuleSpec::annotated(annotation.to_vec(), Verdict::Drop)
    };
    let reply = RuleSpec {
        src: Some(AddrMatch::Addr(endpoint.addr)),
        dst: source,
        proto: Some(port.proto),
        sport: Some(PortMatch::Port(port.container_port)),
        ..RuleSpec::annotated(annotation.to_vec(), Verdict::Drop)
    };
    let est = match &verdict {
        VerdictSpec::Queue(q) => EstQueues::ingress(q),
        _ => EstQueues::default(),
    };
    stateful_pair(&mut gen.chain_rules, forward, reply, &verdict, None, false, est);
}

fn render_log_prefix(chain: &str, prefix: &str) -> String {
    format!("{chain} {prefix}: ")
}
