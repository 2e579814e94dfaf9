//! Access to the container runtime. The daemon only ever needs four things
//! from Docker: the running labeled containers, a single container's
//! inspect snapshot, the address of a referenced container on a named
//! network, and the start/die event stream. Those four calls make up the
//! [`ContainerRuntime`] trait so the reconciler can run against a scripted
//! runtime in tests.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::str::FromStr;

use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::models::{EventMessage, EventMessageTypeEnum};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures_util::{Stream, StreamExt};
use thiserror::Error;

use crate::container::{ContainerMeta, MetaError};

/// Containers opt in by setting this label to `"true"`.
pub const ENABLED_LABEL: &str = "wallward/enabled";
/// The policy document lives in this label.
pub const RULES_LABEL: &str = "wallward/rules";

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("docker api error: {0}")]
    Api(#[from] bollard::errors::Error),
    #[error(transparent)]
    Meta(#[from] MetaError),
    #[error("no IPv4 address on network `{network}` for container `{name}`")]
    NoAddress { name: String, network: String },
    #[error("event stream closed by the runtime")]
    StreamClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Start,
    Die,
}

#[derive(Debug, Clone)]
pub struct RuntimeEvent {
    pub id: String,
    pub kind: EventKind,
}

/// One container's inspect snapshot plus the wallward labels on it.
#[derive(Debug, Clone)]
pub struct Inspection {
    pub meta: ContainerMeta,
    pub enabled: bool,
    pub rules: Option<String>,
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<RuntimeEvent, RuntimeError>> + Send>>;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Ids of running containers carrying the enable label.
    async fn running(&self) -> Result<Vec<String>, RuntimeError>;

    async fn inspect(&self, id: &str) -> Result<Inspection, RuntimeError>;

    /// Address of the container called `name` on `network`, for resolving
    /// policy peer references.
    async fn address_on_network(
        &self,
        name: &str,
        network: &str,
    ) -> Result<Ipv4Addr, RuntimeError>;

    /// Stream of container start/die events for labeled containers.
    async fn events(&self) -> Result<EventStream, RuntimeError>;
}

/// The real runtime, backed by the local Docker socket.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(DockerRuntime { docker })
    }
}

fn enabled_filter() -> HashMap<String, Vec<String>> {
    HashMap::from([(
        "label".to_string(),
        vec![format!("{ENABLED_LABEL}=true")],
    )])
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn running(&self) -> Result<Vec<String>, RuntimeError> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: false,
                filters: enabled_filter(),
                ..Default::default()
            }))
            .await?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn inspect(&self, id: &str) -> Result<Inspection, RuntimeError> {
        let resp = self.docker.inspect_container(id, None).await?;
        let meta = ContainerMeta::from_inspect(&resp)?;
        let labels = resp
            .config
            .as_ref()
            .and_then(|c| c.labels.clone())
            .unwrap_or_default();
        Ok(Inspection {
            meta,
            enabled: labels.get(ENABLED_LABEL).map(String::as_str) == Some("true"),
            rules: labels.get(RULES_LABEL).cloned(),
        })
    }

    async fn address_on_network(
        &self,
        name: &str,
        network: &str,
    ) -> Result<Ipv4Addr, RuntimeError> {
        let resp = self.docker.inspect_container(name, None).await?;
        resp.network_settings
            .as_ref()
            .and_then(|s| s.networks.as_ref())
            .and_then(|n| n.get(network))
            .and_then(|e| e.ip_address.as_deref())
            .and_then(|a| Ipv4Addr::from_str(a).ok())
            .ok_or_else(|| RuntimeError::NoAddress {
                name: name.to_string(),
                network: network.to_string(),
            })
    }

    async fn events(&self) -> Result<EventStream, RuntimeError> {
        let mut filters = enabled_filter();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        filters.insert(
            "event".to_string(),
            vec!["start".to_string(), "die".to_string()],
        );
        let stream = self
            .docker
            .events(Some(EventsOptions {
                filters,
                ..Default::default()
            }))
            .filter_map(|item| async {
                match item {
                    Ok(message) => decode_event(message).map(Ok),
                    Err(e) => Some(Err(RuntimeError::Api(e))),
                }
            });
        Ok(Box::pin(stream))
    }
}

fn decode_event(message: EventMessage) -> Option<RuntimeEvent> {
    if message.typ != Some(EventMessageTypeEnum::CONTAINER) {
        return None;
    }
    let kind = match message.action.as_deref() {
        Some("start") => EventKind::Start,
        Some("die") => EventKind::Die,
        _ => return None,
    };
    let id = message.actor.and_then(|a| a.id)?;
    Some(RuntimeEvent { id, kind })
}
