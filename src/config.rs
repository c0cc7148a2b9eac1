use ipnet::IpNet;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::vxlan::Vni;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{host}:{port} is not a valid ip:port combo")]
    InvalidDestination { host: String, port: i64 },

    #[error("Failed to parse control network CIDR '{cidr}': {source}")]
    InvalidControlNet {
        cidr: String,
        #[source]
        source: ipnet::AddrParseError,
    },
}

/// On-disk layout of the configuration file
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    dest_host: String,
    control_net: String,
    dest_port: i64,
    #[serde(default)]
    vni: u32,
    #[serde(default)]
    filter: String,
}

/// Validated tap configuration, read-only after startup
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub dest_host: String,
    pub dest_port: u16,
    pub vni: Vni,
    pub control_net: IpNet,
    pub filter: Option<String>,
}

impl Config {
    /// Load and validate the JSON configuration at `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!("Loading configuration from {}", path.display());

        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let config = Self::from_json(&contents)?;

        info!(
            "Configuration loaded: collector {}:{}, vni {}, control net {}",
            config.dest_host, config.dest_port, config.vni, config.control_net
        );
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(json)?;
        Self::try_from(raw)
    }

    /// User capture filter, if one was configured
    pub fn user_filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }
}

impl TryFrom<RawConfig> for Config {
    type Error = ConfigError;

    fn try_from(raw: RawConfig) -> Result<Self, Self::Error> {
        let dest_host = raw.dest_host.trim().to_string();
        let dest_port = match u16::try_from(raw.dest_port) {
            Ok(port) if !dest_host.is_empty() => port,
            _ => {
                return Err(ConfigError::InvalidDestination {
                    host: raw.dest_host,
                    port: raw.dest_port,
                });
            }
        };

        let control_net = raw
            .control_net
            .trim()
            .parse::<IpNet>()
            .map_err(|source| ConfigError::InvalidControlNet {
                cidr: raw.control_net.clone(),
                source,
            })?;

        if raw.vni > Vni::MAX {
            warn!(
                "VNI {} does not fit in 24 bits, using {}",
                raw.vni,
                Vni::new(raw.vni)
            );
        }

        let filter = match raw.filter.trim() {
            "" => None,
            f => Some(f.to_string()),
        };

        Ok(Self {
            dest_host,
            dest_port,
            vni: Vni::new(raw.vni),
            control_net,
            filter,
        })
    }
}
