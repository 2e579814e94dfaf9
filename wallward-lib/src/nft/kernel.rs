//! The real netlink transport. Every kernel mutation is submitted as one
//! nftables batch, which the kernel applies atomically; queries go through
//! the same library. Nothing outside this module touches `rustables`
//! directly, apart from the expression rendering in [`super::translate`].

use std::net::Ipv4Addr;

use async_trait::async_trait;
use rustables::set::SetBuilder;
use rustables::{
    Batch, Chain, ChainPolicy, ChainType, Hook, HookClass, MsgType, ProtocolFamily, Rule, Table,
};

use super::translate;
use super::{Firewall, FirewallError, HookSpot, KernelRule, NftOp, RuleSpec, BASE_ANNOTATION, TABLE};

/// Handle to the kernel's nftables subsystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct Nftables;

impl Nftables {
    pub fn new() -> Self {
        Nftables
    }
}

#[async_trait]
impl Firewall for Nftables {
    async fn commit(&self, batch: Vec<NftOp>) -> Result<(), FirewallError> {
        tokio::task::spawn_blocking(move || commit_batch(batch))
            .await
            .map_err(|e| FirewallError::Commit(e.to_string()))?
    }

    async fn table_exists(&self) -> Result<bool, FirewallError> {
        tokio::task::spawn_blocking(|| {
            let tables = rustables::list_tables().map_err(|e| FirewallError::Query(e.to_string()))?;
            Ok(tables
                .iter()
                .any(|t| t.get_name().map(|n| n.as_str()) == Some(TABLE)))
        })
        .await
        .map_err(|e| FirewallError::Query(e.to_string()))?
    }

    async fn list_chains(&self) -> Result<Vec<String>, FirewallError> {
        tokio::task::spawn_blocking(|| {
            let chains = rustables::list_chains_for_table(&owned_table())
                .map_err(|e| FirewallError::Query(e.to_string()))?;
            Ok(chains
                .iter()
                .filter_map(|c| c.get_name().cloned())
                .collect())
        })
        .await
        .map_err(|e| FirewallError::Query(e.to_string()))?
    }

    async fn list_rules(&self, chain: &str) -> Result<Vec<KernelRule>, FirewallError> {
        let chain = chain.to_string();
        tokio::task::spawn_blocking(move || {
            let handle = Chain::new(&owned_table()).with_name(chain.as_str());
            let rules = rustables::list_rules_for_chain(&handle)
                .map_err(|e| FirewallError::Query(e.to_string()))?;
            Ok(rules
                .iter()
                .filter_map(|r| {
                    r.get_handle().map(|h| KernelRule {
                        chain: chain.clone(),
                        handle: *h,
                        annotation: r.get_userdata().cloned(),
                    })
                })
                .collect())
        })
        .await
        .map_err(|e| FirewallError::Query(e.to_string()))?
    }
}

fn owned_table() -> Table {
    Table::new(ProtocolFamily::Ipv4)
        .with_name(TABLE)
        .with_userdata(BASE_ANNOTATION.to_vec())
}

fn commit_batch(ops: Vec<NftOp>) -> Result<(), FirewallError> {
    let table = owned_table();
    let mut batch = Batch::new();

    for op in &ops {
        match op {
            NftOp::CreateTable => batch.add(&table, MsgType::Add),
            NftOp::DeleteTable => batch.add(&table, MsgType::Del),
            NftOp::CreateBaseChain {
                name,
                hook,
                priority,
            } => {
                let class = match hook {
                    HookSpot::Input => HookClass::In,
                    HookSpot::Output => HookClass::Out,
                    HookSpot::Forward => HookClass::Forward,
                };
                let chain = Chain::new(&table)
                    .with_name(name.as_str())
                    .with_type(ChainType::Filter)
                    .with_hook(Hook::new(class, *priority))
                    .with_policy(ChainPolicy::Accept)
                    .with_userdata(BASE_ANNOTATION.to_vec());
                batch.add(&chain, MsgType::Add);
            }
            NftOp::CreateChain { name } => {
                let chain = Chain::new(&table)
                    .with_name(name.as_str())
                    .with_userdata(BASE_ANNOTATION.to_vec());
                batch.add(&chain, MsgType::Add);
            }
            NftOp::DeleteChain { name } => {
                let chain = Chain::new(&table).with_name(name.as_str());
                batch.add(&chain, MsgType::Del);
            }
            NftOp::CreateAddrSet => {
                let builder = addr_set_builder(&table)?;
                let (set, _) = builder.finish();
                batch.add(&set, MsgType::Add);
            }
            NftOp::DeleteAddrSet => {
                let builder = addr_set_builder(&table)?;
                let (set, _) = builder.finish();
                batch.add(&set, MsgType::Del);
            }
            NftOp::AddSetElem { addr } => {
                let elems = set_elements(&table, *addr)?;
                batch.add(&elems, MsgType::Add);
            }
            NftOp::DelSetElem { addr } => {
                let elems = set_elements(&table, *addr)?;
                batch.add(&elems, MsgType::Del);
            }
            NftOp::AppendRule { chain, rule } => {
                let handle = Chain::new(&table).with_name(chain.as_str());
                batch.add(&build_rule(&handle, rule)?, MsgType::Add);
            }
            NftOp::DeleteRule { chain, handle } => {
                let chain = Chain::new(&table).with_name(chain.as_str());
                let rule = Rule::new(&chain)
                    .map_err(|e| FirewallError::Build(e.to_string()))?
                    .with_handle(*handle);
                batch.add(&rule, MsgType::Del);
            }
        }
    }

    batch.send().map_err(|e| FirewallError::Commit(e.to_string()))
}

fn addr_set_builder(table: &Table) -> Result<SetBuilder<Ipv4Addr>, FirewallError> {
    SetBuilder::new(super::ADDR_SET, table).map_err(|e| FirewallError::Build(e.to_string()))
}

fn set_elements(
    table: &Table,
    addr: Ipv4Addr,
) -> Result<impl rustables::nlmsg::NfNetlinkObject, FirewallError> {
    let mut builder = addr_set_builder(table)?;
    builder.add(&addr);
    let (_, elems) = builder.finish();
    Ok(elems)
}

fn build_rule(chain: &Chain, spec: &RuleSpec) -> Result<Rule, FirewallError> {
    let exprs = translate::expressions(spec)?;
    Ok(Rule::new(chain)
        .map_err(|e| FirewallError::Build(e.to_string()))?
        .with_expressions(exprs)
        .with_userdata(spec.annotation.clone()))
}
