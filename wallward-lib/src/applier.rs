//! Commits generated rules to the kernel and keeps the persistent store in
//! step. Every apply and every remove is a single atomic batch: either the
//! kernel holds all of a container's rules or none of them.

use std::sync::Arc;

use thiserror::Error;

use crate::codec::GeneratedRules;
use crate::container::ContainerMeta;
use crate::nft::{container_chain, Firewall, FirewallError, NftOp, DISPATCH_CHAIN, CONTAINERS_CHAIN};
use crate::store::{Record, Store, StoreError};

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error(transparent)]
    Firewall(#[from] FirewallError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct Applier {
    fw: Arc<dyn Firewall>,
    store: Store,
}

impl Applier {
    pub fn new(fw: Arc<dyn Firewall>, store: Store) -> Self {
        Applier { fw, store }
    }

    /// Installs one container's rule set and records it. Re-applying a
    /// container that is already fully installed changes nothing; the
    /// return value says whether anything was installed.
    pub async fn apply(
        &self,
        meta: &ContainerMeta,
        gen: &GeneratedRules,
        peers: &[String],
    ) -> Result<bool, ApplyError> {
        if self.store.get(&meta.id)?.is_some()
            && self.fw.list_chains().await?.contains(&gen.chain)
        {
            tracing::debug!(id = %meta.id, chain = %gen.chain, "rules already installed");
            return Ok(false);
        }

        let mut batch = Vec::new();
        batch.push(NftOp::CreateChain {
            name: gen.chain.clone(),
        });
        for rule in &gen.chain_rules {
            batch.push(NftOp::AppendRule {
                chain: gen.chain.clone(),
                rule: rule.clone(),
            });
        }
        for rule in &gen.dispatch_rules {
            batch.push(NftOp::AppendRule {
                chain: DISPATCH_CHAIN.to_string(),
                rule: rule.clone(),
            });
        }
        for rule in &gen.jump_rules {
            batch.push(NftOp::AppendRule {
                chain: CONTAINERS_CHAIN.to_string(),
                rule: rule.clone(),
            });
        }
        for addr in &gen.addrs {
            batch.push(NftOp::AddSetElem { addr: *addr });
        }

        self.fw.commit(batch).await?;

        self.store.put(
            &meta.id,
            &Record {
                name: meta.name.clone(),
                annotations: vec![meta.id.clone()],
                addrs: gen.addrs.clone(),
                mapped_ports: meta
                    .mapped_ports
                    .iter()
                    .map(|p| (p.proto, p.host_port))
                    .collect(),
                peer_names: peers.to_vec(),
            },
        )?;
        tracing::info!(id = %meta.id, name = %meta.name, chain = %gen.chain,
            rules = gen.chain_rules.len() + gen.dispatch_rules.len() + gen.jump_rules.len(),
            "container rules installed");
        Ok(true)
    }

    /// Deletes every rule annotated with this id, wherever it lives, plus
    /// the per-container chain and the container's set membership. The
    /// record is erased only once the kernel batch went through.
    pub async fn remove(&self, id: &str) -> Result<(), ApplyError> {
        let record = self.store.get(id)?;
        let annotation = id.as_bytes();

        let chains = self.fw.list_chains().await?;
        let own_chain = record
            .as_ref()
            .map(|r| container_chain(&r.name, id))
            .or_else(|| {
                // record lost: fall back to the deterministic name suffix
                let suffix: String = id.chars().take(12).collect();
                chains
                    .iter()
                    .find(|c| c.starts_with("ww-") && c.ends_with(&suffix))
                    .cloned()
            });

        let mut batch = Vec::new();
        for chain in &chains {
            // the container chain goes away as a whole below
            if Some(chain) == own_chain.as_ref() {
                continue;
            }
            for rule in self.fw.list_rules(chain).await? {
                // only annotation equality authorizes deletion; rules of
                // other containers and other tools are left alone
                if rule.annotation.as_deref() == Some(annotation) {
                    batch.push(NftOp::DeleteRule {
                        chain: chain.clone(),
                        handle: rule.handle,
                    });
                }
            }
        }
        if let Some(chain) = own_chain.filter(|c| chains.contains(c)) {
            batch.push(NftOp::DeleteChain { name: chain });
        }
        if let Some(record) = &record {
            for addr in &record.addrs {
                batch.push(NftOp::DelSetElem { addr: *addr });
            }
        }

        if batch.is_empty() {
            tracing::debug!(%id, "no kernel state to remove");
        } else {
            self.fw.commit(batch).await?;
            tracing::info!(%id, "container rules removed");
        }

        self.store.remove(id)?;
        Ok(())
    }
}
