//! Container identity as wallward sees it: id, name, one endpoint per
//! attached network and the host-published port map. Everything is
//! snapshotted from a single Docker inspect call and immutable afterwards.

use std::net::Ipv4Addr;
use std::str::FromStr;

use bollard::models::ContainerInspectResponse;
use thiserror::Error;

use crate::nft::Proto;

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("inspect response carries no container id")]
    MissingId,
    #[error("container `{0}` carries no name")]
    MissingName(String),
}

/// The container's attachment to one network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub network: String,
    pub addr: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

/// One host-published port, as reported by the runtime's port map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MappedPort {
    pub container_port: u16,
    pub proto: Proto,
    pub host_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerMeta {
    pub id: String,
    pub name: String,
    pub endpoints: Vec<Endpoint>,
    pub mapped_ports: Vec<MappedPort>,
}

impl ContainerMeta {
    /// Snapshots identity, addresses and published ports out of an inspect
    /// response. Networks without an IPv4 address (e.g. `none`) are
    /// skipped; endpoints are ordered by network name and ports by
    /// `(container port, proto)` so generated rules are deterministic.
    pub fn from_inspect(resp: &ContainerInspectResponse) -> Result<Self, MetaError> {
        let id = resp.id.clone().ok_or(MetaError::MissingId)?;
        let name = resp
            .name
            .as_deref()
            .map(|n| n.trim_start_matches('/').to_string())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| MetaError::MissingName(id.clone()))?;

        let mut endpoints = Vec::new();
        let mut mapped_ports = Vec::new();

        if let Some(settings) = &resp.network_settings {
            if let Some(networks) = &settings.networks {
                for (network, endpoint) in networks {
                    let addr = endpoint.ip_address.as_deref().and_then(parse_addr);
                    let gateway = endpoint.gateway.as_deref().and_then(parse_addr);
                    match (addr, gateway) {
                        (Some(addr), Some(gateway)) => endpoints.push(Endpoint {
                            network: network.clone(),
                            addr,
                            gateway,
                        }),
                        _ => {
                            tracing::debug!(%id, %network, "skipping network without IPv4 endpoint");
                        }
                    }
                }
            }
            if let Some(ports) = &settings.ports {
                for (spec, bindings) in ports {
                    let Some((container_port, proto)) = parse_port_key(spec) else {
                        tracing::debug!(%id, %spec, "unparseable port specification");
                        continue;
                    };
                    for binding in bindings.iter().flatten() {
                        // the ipv6 wildcard binding duplicates the ipv4 one
                        if binding.host_ip.as_deref().is_some_and(|ip| ip.contains(':')) {
                            continue;
                        }
                        let Some(host_port) =
                            binding.host_port.as_deref().and_then(|p| p.parse().ok())
                        else {
                            continue;
                        };
                        let port = MappedPort {
                            container_port,
                            proto,
                            host_port,
                        };
                        if !mapped_ports.contains(&port) {
                            mapped_ports.push(port);
                        }
                    }
                }
            }
        }

        endpoints.sort_by(|a, b| a.network.cmp(&b.network));
        mapped_ports.sort();

        Ok(ContainerMeta {
            id,
            name,
            endpoints,
            mapped_ports,
        })
    }
}

fn parse_addr(text: &str) -> Option<Ipv4Addr> {
    Ipv4Addr::from_str(text).ok()
}

// "80/tcp" -> (80, Tcp)
fn parse_port_key(spec: &str) -> Option<(u16, Proto)> {
    let (port, proto) = spec.split_once('/')?;
    let port = port.parse().ok()?;
    let proto = match proto {
        "tcp" => Proto::Tcp,
        "udp" => Proto::Udp,
        _ => return None,
    };
    Some((port, proto))
}
