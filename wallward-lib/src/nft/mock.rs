//! Recording stand-in for the kernel, used by unit tests. Batches are
//! validated and applied all-or-nothing against an in-memory model of the
//! wallward table.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Firewall, FirewallError, KernelRule, NftOp, RuleSpec};

#[derive(Debug, Default)]
pub struct State {
    pub table: bool,
    pub addr_set: bool,
    pub chains: BTreeMap<String, Vec<StoredRule>>,
    pub set_elems: Vec<Ipv4Addr>,
    pub batches: Vec<Vec<NftOp>>,
    next_handle: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRule {
    pub handle: u64,
    pub rule: RuleSpec,
}

#[derive(Debug, Default)]
pub struct MockFirewall {
    pub state: Mutex<State>,
    pub fail_commits: Mutex<usize>,
}

impl MockFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail, to exercise the retry paths.
    pub fn fail_next_commits(&self, n: usize) {
        *self.fail_commits.lock().unwrap() = n;
    }

    pub fn rules_annotated(&self, annotation: &[u8]) -> Vec<(String, RuleSpec)> {
        let state = self.state.lock().unwrap();
        let mut found = Vec::new();
        for (chain, rules) in &state.chains {
            for stored in rules {
                if stored.rule.annotation == annotation {
                    found.push((chain.clone(), stored.rule.clone()));
                }
            }
        }
        found
    }

    pub fn chain_rules(&self, chain: &str) -> Vec<RuleSpec> {
        let state = self.state.lock().unwrap();
        state
            .chains
            .get(chain)
            .map(|rules| rules.iter().map(|s| s.rule.clone()).collect())
            .unwrap_or_default()
    }

    pub fn has_chain(&self, chain: &str) -> bool {
        self.state.lock().unwrap().chains.contains_key(chain)
    }

    pub fn set_elems(&self) -> Vec<Ipv4Addr> {
        self.state.lock().unwrap().set_elems.clone()
    }

    fn apply(state: &mut State, ops: &[NftOp]) -> Result<(), FirewallError> {
        for op in ops {
            match op {
                NftOp::CreateTable => state.table = true,
                NftOp::DeleteTable => {
                    state.table = false;
                    state.chains.clear();
                    state.set_elems.clear();
                    state.addr_set = false;
                }
                NftOp::CreateBaseChain { name, .. } | NftOp::CreateChain { name } => {
                    state.chains.entry(name.clone()).or_default();
                }
                NftOp::DeleteChain { name } => {
                    state
                        .chains
                        .remove(name)
                        .ok_or_else(|| FirewallError::UnknownChain(name.clone()))?;
                }
                NftOp::CreateAddrSet => state.addr_set = true,
                NftOp::DeleteAddrSet => {
                    state.addr_set = false;
                    state.set_elems.clear();
                }
                NftOp::AddSetElem { addr } => {
                    if !state.set_elems.contains(addr) {
                        state.set_elems.push(*addr);
                    }
                }
                NftOp::DelSetElem { addr } => {
                    state.set_elems.retain(|a| a != addr);
                }
                NftOp::AppendRule { chain, rule } => {
                    state.next_handle += 1;
                    let handle = state.next_handle;
                    state
                        .chains
                        .get_mut(chain)
                        .ok_or_else(|| FirewallError::UnknownChain(chain.clone()))?
                        .push(StoredRule {
                            handle,
                            rule: rule.clone(),
                        });
                }
                NftOp::DeleteRule { chain, handle } => {
                    let rules = state
                        .chains
                        .get_mut(chain)
                        .ok_or_else(|| FirewallError::UnknownChain(chain.clone()))?;
                    rules.retain(|stored| stored.handle != *handle);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Firewall for MockFirewall {
    async fn commit(&self, batch: Vec<NftOp>) -> Result<(), FirewallError> {
        {
            let mut failures = self.fail_commits.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(FirewallError::Commit("injected failure".into()));
            }
        }
        let mut state = self.state.lock().unwrap();
        // all-or-nothing, like a kernel batch
        let mut scratch = State {
            table: state.table,
            addr_set: state.addr_set,
            chains: state.chains.clone(),
            set_elems: state.set_elems.clone(),
            batches: Vec::new(),
            next_handle: state.next_handle,
        };
        Self::apply(&mut scratch, &batch)?;
        state.table = scratch.table;
        state.addr_set = scratch.addr_set;
        state.chains = scratch.chains;
        state.set_elems = scratch.set_elems;
        state.next_handle = scratch.next_handle;
        state.batches.push(batch);
        Ok(())
    }

    async fn table_exists(&self) -> Result<bool, FirewallError> {
        Ok(self.state.lock().unwrap().table)
    }

    async fn list_chains(&self) -> Result<Vec<String>, FirewallError> {
        Ok(self.state.lock().unwrap().chains.keys().cloned().collect())
    }

    async fn list_rules(&self, chain: &str) -> Result<Vec<KernelRule>, FirewallError> {
        let state = self.state.lock().unwrap();
        let rules = state
            .chains
            .get(chain)
            .ok_or_else(|| FirewallError::UnknownChain(chain.to_string()))?;
        Ok(rules
            .iter()
            .map(|stored| KernelRule {
                chain: chain.to_string(),
                handle: stored.handle,
                annotation: Some(stored.rule.annotation.clone()),
            })
            .collect())
    }
}
