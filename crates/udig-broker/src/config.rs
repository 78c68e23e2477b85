//! Broker configuration with environment variable priority
//!
//! Configuration is resolved in this order (first found wins):
//! 1. Environment variables (UDIG_*)
//! 2. Config file (udigd.toml)
//! 3. Default values (where applicable)

use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

/// Environment variable prefix
const ENV_PREFIX: &str = "UDIG";

const DEFAULT_UPLINK_ADDR: &str = "0.0.0.0:4000";
const DEFAULT_DOMAIN: &str = "udig.io";
const DEFAULT_PORTS: [u16; 1] = [443];

/// Broker configuration (parsed from TOML, can be overridden by env)
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct BrokerConfig {
    /// Listen address for link uplink connections
    pub uplink_addr: Option<String>,

    /// Listen address for the debug HTTP endpoint (disabled when unset)
    pub http_addr: Option<String>,

    /// Domain under which tunnel names are published
    pub domain: Option<String>,

    /// Enabled ingress ports
    pub ports: Option<Vec<u16>>,

    /// Address the ingress listeners bind to
    pub ingress_host: Option<String>,

    /// PEM certificate chain served on ingress ports
    #[serde(alias = "cert_path")]
    pub cert: Option<PathBuf>,

    /// PEM private key for `cert`
    #[serde(alias = "key_path")]
    pub key: Option<PathBuf>,
}

/// Fully resolved broker configuration
#[derive(Debug, Clone)]
pub struct ResolvedBrokerConfig {
    pub uplink_addr: SocketAddr,
    pub http_addr: Option<SocketAddr>,
    pub domain: String,
    pub ports: Vec<u16>,
    pub ingress_host: IpAddr,
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl ResolvedBrokerConfig {
    /// Bind addresses of the ingress listeners, one per enabled port
    pub fn ingress_addrs(&self) -> Vec<SocketAddr> {
        self.ports
            .iter()
            .map(|&port| SocketAddr::new(self.ingress_host, port))
            .collect()
    }
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{}_{}", ENV_PREFIX, name)).ok()
}

/// Parse a comma separated port list such as `443,8443`
pub fn parse_ports(list: &str) -> anyhow::Result<Vec<u16>> {
    let mut ports = Vec::new();
    for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let port: u16 = part
            .parse()
            .with_context(|| format!("Invalid port {:?}", part))?;
        if port == 0 {
            anyhow::bail!("Invalid port 0");
        }
        if !ports.contains(&port) {
            ports.push(port);
        }
    }
    if ports.is_empty() {
        anyhow::bail!("At least one ingress port is required");
    }
    Ok(ports)
}

impl BrokerConfig {
    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!("No config file at {}, using environment and defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config =
            toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Resolve configuration from environment variables first, then config file
    pub fn resolve(self) -> anyhow::Result<ResolvedBrokerConfig> {
        self.resolve_with(get_env)
    }

    /// Resolve using `lookup` in place of the process environment
    pub fn resolve_with<F>(self, lookup: F) -> anyhow::Result<ResolvedBrokerConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let uplink_addr = lookup("UPLINK_ADDR")
            .or(self.uplink_addr)
            .unwrap_or_else(|| DEFAULT_UPLINK_ADDR.to_string());
        let uplink_addr: SocketAddr = uplink_addr
            .parse()
            .with_context(|| format!("Invalid uplink address {:?}", uplink_addr))?;

        let http_addr = match lookup("HTTP_ADDR").or(self.http_addr) {
            Some(addr) if !addr.is_empty() => Some(
                addr.parse::<SocketAddr>()
                    .with_context(|| format!("Invalid debug HTTP address {:?}", addr))?,
            ),
            _ => None,
        };

        let domain = lookup("DOMAIN")
            .or(self.domain)
            .unwrap_or_else(|| DEFAULT_DOMAIN.to_string())
            .trim_matches('.')
            .to_ascii_lowercase();
        if domain.is_empty() {
            anyhow::bail!("Domain must not be empty");
        }

        // Ports: ENV > config > default [443]
        let ports = match lookup("PORTS") {
            Some(list) => parse_ports(&list).context("Invalid UDIG_PORTS")?,
            None => match self.ports {
                Some(ports) => parse_ports(
                    &ports
                        .iter()
                        .map(u16::to_string)
                        .collect::<Vec<_>>()
                        .join(","),
                )
                .context("Invalid ports in config")?,
                None => DEFAULT_PORTS.to_vec(),
            },
        };

        let ingress_host = match lookup("INGRESS_HOST").or(self.ingress_host) {
            Some(host) => host
                .parse::<IpAddr>()
                .with_context(|| format!("Invalid ingress host {:?}", host))?,
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };

        // Certificate and key: ENV > config > required
        let cert = lookup("CERT")
            .map(PathBuf::from)
            .or(self.cert)
            .ok_or_else(|| {
                anyhow::anyhow!("Certificate required. Set UDIG_CERT or cert in config")
            })?;
        let key = lookup("KEY")
            .map(PathBuf::from)
            .or(self.key)
            .ok_or_else(|| anyhow::anyhow!("Private key required. Set UDIG_KEY or key in config"))?;

        Ok(ResolvedBrokerConfig {
            uplink_addr,
            http_addr,
            domain,
            ports,
            ingress_host,
            cert,
            key,
        })
    }

    /// Load config file and resolve with environment variable overrides
    pub fn load_and_resolve(path: &Path) -> anyhow::Result<ResolvedBrokerConfig> {
        Self::load(path)?.resolve()
    }
}
