//! Checker Configuration
//!
//! Settings for a correction run, read from a TOML file. Every section and
//! every key is optional; missing values take the defaults below. Command line
//! flags are applied on top by the binary.
//!
//! ```toml
//! [network]
//! bind = "0.0.0.0:47808"
//! broadcast = ["192.168.1.255:47808"]
//!
//! [network.foreign_device]
//! bbmd = "10.20.0.1:47808"
//! ttl = 300
//!
//! [device]
//! instance = 1200
//! address = "192.168.1.50:47808"
//! # or a range of instances
//! # low = 1000
//! # high = 1999
//!
//! [timeouts]
//! discovery_ms = 3000
//! request_ms = 5000
//! resolver_ms = 10000
//! retries = 2
//!
//! [resolver]
//! url = "http://jsonip.com"
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resolver::DEFAULT_RESOLVER_URL;
use crate::transport::{BacnetIpConfig, ForeignDevice, TimeoutConfig};
use crate::workflow::{SessionConfig, Target};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid configuration in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CheckerConfig {
    pub network: NetworkSection,
    pub device: DeviceSection,
    pub timeouts: TimeoutSection,
    pub resolver: ResolverSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkSection {
    pub bind: SocketAddr,
    /// Empty means every local subnet broadcast
    pub broadcast: Vec<SocketAddr>,
    pub foreign_device: Option<ForeignDevice>,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            bind: BacnetIpConfig::default().bind_address,
            broadcast: Vec::new(),
            foreign_device: None,
        }
    }
}

/// Which controller to check. Both unset means the first to answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceSection {
    pub instance: Option<u32>,
    pub address: Option<SocketAddr>,
    /// Instance range, both ends inclusive. `instance` takes precedence.
    pub low: Option<u32>,
    pub high: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutSection {
    pub discovery_ms: u64,
    pub request_ms: u64,
    pub resolver_ms: u64,
    pub retries: u32,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            discovery_ms: session.discovery_wait.as_millis() as u64,
            request_ms: session.request_timeout.as_millis() as u64,
            resolver_ms: session.resolver_timeout.as_millis() as u64,
            retries: session.retries,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResolverSection {
    pub url: String,
}

impl Default for ResolverSection {
    fn default() -> Self {
        Self {
            url: DEFAULT_RESOLVER_URL.to_string(),
        }
    }
}

impl CheckerConfig {
    /// Read and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: CheckerConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        log::debug!("loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let timeouts = &self.timeouts;
        if timeouts.discovery_ms == 0 || timeouts.request_ms == 0 || timeouts.resolver_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        if self.network.foreign_device.is_some_and(|fd| fd.ttl == 0) {
            return Err(ConfigError::Invalid("foreign device TTL must be non-zero".into()));
        }
        match (self.device.low, self.device.high) {
            (Some(low), Some(high)) if low > high => {
                return Err(ConfigError::Invalid(format!(
                    "device range {}..={} is empty",
                    low, high
                )));
            }
            (Some(_), None) | (None, Some(_)) => {
                return Err(ConfigError::Invalid(
                    "device low and high must be given together".into(),
                ));
            }
            _ => {}
        }
        if self.resolver.url.is_empty() {
            return Err(ConfigError::Invalid("resolver URL is empty".into()));
        }
        Ok(())
    }

    pub fn transport(&self) -> BacnetIpConfig {
        BacnetIpConfig {
            bind_address: self.network.bind,
            broadcast_addresses: self.network.broadcast.clone(),
            foreign_device: self.network.foreign_device,
            ..BacnetIpConfig::default()
        }
    }

    pub fn client_timeouts(&self) -> TimeoutConfig {
        TimeoutConfig {
            request_timeout: Duration::from_millis(self.timeouts.request_ms),
            discovery_timeout: Duration::from_millis(self.timeouts.discovery_ms),
            ..TimeoutConfig::default()
        }
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            discovery_wait: Duration::from_millis(self.timeouts.discovery_ms),
            request_timeout: Duration::from_millis(self.timeouts.request_ms),
            resolver_timeout: Duration::from_millis(self.timeouts.resolver_ms),
            retries: self.timeouts.retries,
        }
    }

    pub fn target(&self) -> Target {
        Target {
            address: self.device.address,
            device_instance: self.device.instance,
            range: self.device.low.zip(self.device.high),
        }
    }
}
