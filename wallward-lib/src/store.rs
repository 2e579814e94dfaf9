//! The on-disk memory of what belongs to whom: one record per confined
//! container, keyed by container id. Records let the daemon find and
//! remove its kernel state after a restart, when the container itself may
//! already be gone. Every write is flushed before the caller proceeds.

use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::nft::Proto;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io: {0}")]
    Io(#[from] sled::Error),
    #[error("corrupt record for `{id}`: {source}")]
    Corrupt {
        id: String,
        source: serde_json::Error,
    },
    #[error("encoding record for `{id}`: {source}")]
    Encode {
        id: String,
        source: serde_json::Error,
    },
}

/// What must survive a daemon restart for one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub name: String,
    /// Userdata values attached to this container's rules. Redundant with
    /// the key, kept for sanity checks against the kernel.
    pub annotations: Vec<String>,
    /// Addresses added to the dispatch set, needed to unmap them on
    /// removal once the container no longer exists.
    pub addrs: Vec<Ipv4Addr>,
    /// Host-published ports, so removal can account for pre-NAT rules in
    /// the shared chains.
    pub mapped_ports: Vec<(Proto, u16)>,
    /// Names of containers this policy references; when one of them gets
    /// a new address, this container's rules are rebuilt.
    pub peer_names: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Store {
    db: sled::Db,
}

impl Store {
    pub fn open(dir: &Path) -> Result<Store, StoreError> {
        let db = sled::open(dir.join("state"))?;
        Ok(Store { db })
    }

    pub fn put(&self, id: &str, record: &Record) -> Result<(), StoreError> {
        let value = serde_json::to_vec(record).map_err(|source| StoreError::Encode {
            id: id.to_string(),
            source,
        })?;
        self.db.insert(id, value)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Record>, StoreError> {
        match self.db.get(id)? {
            Some(value) => {
                let record =
                    serde_json::from_slice(&value).map_err(|source| StoreError::Corrupt {
                        id: id.to_string(),
                        source,
                    })?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    pub fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.db.remove(id)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn all(&self) -> Result<Vec<(String, Record)>, StoreError> {
        let mut records = Vec::new();
        for entry in self.db.iter() {
            let (key, value) = entry?;
            let id = String::from_utf8_lossy(&key).to_string();
            let record = serde_json::from_slice(&value).map_err(|source| StoreError::Corrupt {
                id: id.clone(),
                source,
            })?;
            records.push((id, record));
        }
        Ok(records)
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        self.db.clear()?;
        self.db.flush()?;
        Ok(())
    }
}
