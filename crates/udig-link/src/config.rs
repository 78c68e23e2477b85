use std::num::ParseIntError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PortMapError {
    #[error("Invalid port map {0:?}, expected remote_port:local_host:local_port")]
    Malformed(String),

    #[error("Invalid remote port in {map:?}: {source}")]
    InvalidPort {
        map: String,
        #[source]
        source: ParseIntError,
    },

    #[error("Only one local destination is supported, found {first:?} and {second:?}")]
    MultipleEgress { first: String, second: String },

    #[error("At least one port map is required")]
    Empty,
}

/// What a link asks the broker for, and where it sends the traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMaps {
    /// Requested ingress ports, in the order given
    pub ports: Vec<u16>,
    /// Local `host:port` every tunnel stream is connected to
    pub egress: String,
}

/// Parse `-R remote_port:local_host:local_port` arguments.
///
/// Each argument may hold several comma separated maps. All maps must
/// point at the same local destination.
pub fn parse_port_maps<S: AsRef<str>>(maps: &[S]) -> Result<PortMaps, PortMapError> {
    let mut ports = Vec::new();
    let mut egress: Option<String> = None;

    let entries = maps
        .iter()
        .flat_map(|m| m.as_ref().split(','))
        .map(str::trim)
        .filter(|m| !m.is_empty());

    for map in entries {
        let (remote, local) = map
            .split_once(':')
            .ok_or_else(|| PortMapError::Malformed(map.to_string()))?;

        let port: u16 = remote.parse().map_err(|source| PortMapError::InvalidPort {
            map: map.to_string(),
            source,
        })?;

        match local.rsplit_once(':') {
            Some((host, local_port)) if !host.is_empty() && local_port.parse::<u16>().is_ok() => {}
            _ => return Err(PortMapError::Malformed(map.to_string())),
        }

        match &egress {
            Some(first) if first != local => {
                return Err(PortMapError::MultipleEgress {
                    first: first.clone(),
                    second: local.to_string(),
                })
            }
            Some(_) => {}
            None => egress = Some(local.to_string()),
        }

        if !ports.contains(&port) {
            ports.push(port);
        }
    }

    let egress = egress.ok_or(PortMapError::Empty)?;
    Ok(PortMaps { ports, egress })
}
