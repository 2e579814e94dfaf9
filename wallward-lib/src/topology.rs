//! The static, process-wide part of the rule set: the wallward table, the
//! three hooked base chains, the dispatch chain with its established
//! short-circuit and set-gated jumps, and the shared containers chain the
//! per-container jumps live in. Installed once at startup, torn down only
//! by `--clear`.

use std::sync::Arc;

use crate::nft::{
    AddrMatch, CtState, Firewall, FirewallError, HookSpot, NftOp, RuleSpec, Verdict, ADDR_SET,
    BASE_ANNOTATION, CONTAINERS_CHAIN, DISPATCH_CHAIN, FORWARD_CHAIN, INPUT_CHAIN, OUTPUT_CHAIN,
};

/// Docker's destination NAT hooks at -100; the output chain sits in front
/// of it so pre-NAT mapped-port rules still observe the published host
/// port on locally originated traffic.
const OUTPUT_PRIORITY: i32 = -110;
const FILTER_PRIORITY: i32 = 0;

pub struct Topology {
    fw: Arc<dyn Firewall>,
}

impl Topology {
    pub fn new(fw: Arc<dyn Firewall>) -> Self {
        Topology { fw }
    }

    /// Creates the shared objects if the wallward table is absent. The
    /// whole topology lands in one atomic batch, so a table that exists
    /// implies a complete topology.
    pub async fn ensure(&self) -> Result<(), FirewallError> {
        if self.fw.table_exists().await? {
            tracing::debug!("base topology already present");
            return Ok(());
        }

        let mut batch = vec![NftOp::CreateTable, NftOp::CreateAddrSet];

        for (name, hook, priority) in [
            (INPUT_CHAIN, HookSpot::Input, FILTER_PRIORITY),
            (OUTPUT_CHAIN, HookSpot::Output, OUTPUT_PRIORITY),
            (FORWARD_CHAIN, HookSpot::Forward, FILTER_PRIORITY),
        ] {
            batch.push(NftOp::CreateBaseChain {
                name: name.to_string(),
                hook,
                priority,
            });
        }
        batch.push(NftOp::CreateChain {
            name: DISPATCH_CHAIN.to_string(),
        });
        batch.push(NftOp::CreateChain {
            name: CONTAINERS_CHAIN.to_string(),
        });

        for name in [INPUT_CHAIN, OUTPUT_CHAIN, FORWARD_CHAIN] {
            batch.push(NftOp::AppendRule {
                chain: name.to_string(),
                rule: RuleSpec {
                    counter: false,
                    verdict: Verdict::Jump(DISPATCH_CHAIN.to_string()),
                    ..RuleSpec::annotated(BASE_ANNOTATION.to_vec(), Verdict::Drop)
                },
            });
        }

        // established flows skip per-container policy entirely
        batch.push(NftOp::AppendRule {
            chain: DISPATCH_CHAIN.to_string(),
            rule: RuleSpec {
                state: Some(CtState::Established),
                verdict: Verdict::Accept,
                ..RuleSpec::annotated(BASE_ANNOTATION.to_vec(), Verdict::Drop)
            },
        });
        let gate = AddrMatch::InSet(ADDR_SET.to_string());
        batch.push(NftOp::AppendRule {
            chain: DISPATCH_CHAIN.to_string(),
            rule: RuleSpec {
                src: Some(gate.clone()),
                counter: false,
                verdict: Verdict::Jump(CONTAINERS_CHAIN.to_string()),
                ..RuleSpec::annotated(BASE_ANNOTATION.to_vec(), Verdict::Drop)
            },
        });
        batch.push(NftOp::AppendRule {
            chain: DISPATCH_CHAIN.to_string(),
            rule: RuleSpec {
                dst: Some(gate),
                counter: false,
                verdict: Verdict::Jump(CONTAINERS_CHAIN.to_string()),
                ..RuleSpec::annotated(BASE_ANNOTATION.to_vec(), Verdict::Drop)
            },
        });

        tracing::info!("installing base topology");
        self.fw.commit(batch).await
    }

    /// Removes every shared object, and with them anything still inside
    /// the table. Assumes per-container state has already been removed.
    pub async fn teardown(&self) -> Result<(), FirewallError> {
        if !self.fw.table_exists().await? {
            return Ok(());
        }

        let mut batch = Vec::new();
        for chain in self.fw.list_chains().await? {
            batch.push(NftOp::DeleteChain { name: chain });
        }
        batch.push(NftOp::DeleteAddrSet);
        batch.push(NftOp::DeleteTable);

        tracing::info!("removing base topology");
        self.fw.commit(batch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nft::mock::MockFirewall;

    #[tokio::test]
    async fn ensure_installs_everything_once() {
        let fw = Arc::new(MockFirewall::new());
        let topology = Topology::new(fw.clone());

        topology.ensure().await.unwrap();
        assert!(fw.state.lock().unwrap().table);
        assert!(fw.state.lock().unwrap().addr_set);
        for chain in [
            INPUT_CHAIN,
            OUTPUT_CHAIN,
            FORWARD_CHAIN,
            DISPATCH_CHAIN,
            CONTAINERS_CHAIN,
        ] {
            assert!(fw.has_chain(chain), "missing chain {chain}");
        }

        // dispatch: established accept, then the two set-gated jumps
        let dispatch = fw.chain_rules(DISPATCH_CHAIN);
        assert_eq!(dispatch.len(), 3);
        assert_eq!(dispatch[0].state, Some(CtState::Established));
        assert_eq!(dispatch[0].verdict, Verdict::Accept);
        assert_eq!(
            dispatch[1].src,
            Some(AddrMatch::InSet(ADDR_SET.to_string()))
        );
        assert_eq!(
            dispatch[2].dst,
            Some(AddrMatch::InSet(ADDR_SET.to_string()))
        );
        for rule in &dispatch[1..] {
            assert_eq!(rule.verdict, Verdict::Jump(CONTAINERS_CHAIN.to_string()));
        }

        // second run is a no-op
        topology.ensure().await.unwrap();
        assert_eq!(fw.state.lock().unwrap().batches.len(), 1);
    }

    #[tokio::test]
    async fn teardown_removes_table_and_set() {
        let fw = Arc::new(MockFirewall::new());
        let topology = Topology::new(fw.clone());
        topology.ensure().await.unwrap();

        topology.teardown().await.unwrap();
        let state = fw.state.lock().unwrap();
        assert!(!state.table);
        assert!(!state.addr_set);
        assert!(state.chains.is_empty());
    }

    #[tokio::test]
    async fn teardown_without_table_is_a_noop() {
        let fw = Arc::new(MockFirewall::new());
        Topology::new(fw.clone()).teardown().await.unwrap();
        assert!(fw.state.lock().unwrap().batches.is_empty());
    }
}
