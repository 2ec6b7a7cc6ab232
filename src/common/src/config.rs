// Copyright 2026 The Metasync Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration surface, deserialized from TOML. Field names and
/// nesting mirror the keys in the spec's "Configuration surface" section so
/// that an operator can match them 1:1 against the on-disk file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub net: NetConfig,
    pub timeout: TimeoutConfig,
    pub periodic: PeriodicConfig,
    pub keepalivetracker: KeepaliveTrackerConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| Error::ConfigIo {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.proxy.primary_url.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "proxy.primary_url must not be empty".into(),
            ));
        }
        if self.net.l4.port == 0 {
            return Err(Error::InvalidConfig(
                "net.l4.port must be nonzero".into(),
            ));
        }
        for (name, secs) in [
            ("timeout.default", self.timeout.default_secs),
            ("timeout.default_long", self.timeout.default_long_secs),
            ("timeout.max_keepalive", self.timeout.max_keepalive_secs),
            (
                "timeout.cplane_operation",
                self.timeout.cplane_operation_secs,
            ),
            ("periodic.retry_sync_time", self.periodic.retry_sync_time_secs),
        ] {
            if secs == 0 {
                return Err(Error::InvalidConfig(format!("{name} must be nonzero")));
            }
        }
        if self.keepalivetracker.retry_factor == 0 || self.keepalivetracker.timeout_factor == 0 {
            return Err(Error::InvalidConfig(
                "keepalivetracker retry_factor and timeout_factor must be nonzero".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub primary_url: String,
    #[serde(default)]
    pub discovery_url: Option<String>,
    #[serde(default)]
    pub original_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    pub ipv4: String,
    #[serde(default)]
    pub ipv4_intra_control: Option<String>,
    #[serde(default)]
    pub ipv4_intra_data: Option<String>,
    pub l4: L4Config,
}

impl NetConfig {
    /// Per the spec: use a dedicated plane only when its IP or port differs
    /// from the public one.
    pub fn uses_intra_control(&self) -> bool {
        self.ipv4_intra_control.is_some() || self.l4.port_intra_control.is_some()
    }

    pub fn uses_intra_data(&self) -> bool {
        self.ipv4_intra_data.is_some() || self.l4.port_intra_data.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct L4Config {
    pub port: u16,
    #[serde(default)]
    pub port_intra_control: Option<u16>,
    #[serde(default)]
    pub port_intra_data: Option<u16>,
}

/// All durations are stored as whole seconds on the wire; `_secs`-suffixed
/// fields are what (de)serializes, the unsuffixed accessors hand back a
/// [`Duration`] so call sites never do the multiplication themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(rename = "default")]
    pub default_secs: u64,
    #[serde(rename = "default_long")]
    pub default_long_secs: u64,
    #[serde(rename = "max_keepalive")]
    pub max_keepalive_secs: u64,
    #[serde(rename = "cplane_operation")]
    pub cplane_operation_secs: u64,
}

impl TimeoutConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_secs)
    }

    pub fn default_long(&self) -> Duration {
        Duration::from_secs(self.default_long_secs)
    }

    pub fn max_keepalive(&self) -> Duration {
        Duration::from_secs(self.max_keepalive_secs)
    }

    pub fn cplane_operation(&self) -> Duration {
        Duration::from_secs(self.cplane_operation_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodicConfig {
    #[serde(rename = "retry_sync_time")]
    pub retry_sync_time_secs: u64,
}

impl PeriodicConfig {
    pub fn retry_sync_time(&self) -> Duration {
        Duration::from_secs(self.retry_sync_time_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeepaliveVariant {
    Heartbeat,
    Average,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepaliveVariantConfig {
    pub interval_secs: u64,
    pub name: KeepaliveVariant,
    pub factor: u32,
}

impl KeepaliveVariantConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepaliveTrackerConfig {
    pub proxy: KeepaliveVariantConfig,
    pub target: KeepaliveVariantConfig,
    pub retry_factor: u32,
    pub timeout_factor: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config {
            proxy: ProxyConfig {
                primary_url: "http://p0:8080".into(),
                discovery_url: None,
                original_url: None,
            },
            net: NetConfig {
                ipv4: "0.0.0.0".into(),
                ipv4_intra_control: None,
                ipv4_intra_data: None,
                l4: L4Config {
                    port: 8080,
                    port_intra_control: None,
                    port_intra_data: None,
                },
            },
            timeout: TimeoutConfig {
                default_secs: 2,
                default_long_secs: 30,
                max_keepalive_secs: 5,
                cplane_operation_secs: 2,
            },
            periodic: PeriodicConfig {
                retry_sync_time_secs: 10,
            },
            keepalivetracker: KeepaliveTrackerConfig {
                proxy: KeepaliveVariantConfig {
                    interval_secs: 3,
                    name: KeepaliveVariant::Heartbeat,
                    factor: 3,
                },
                target: KeepaliveVariantConfig {
                    interval_secs: 3,
                    name: KeepaliveVariant::Average,
                    factor: 3,
                },
                retry_factor: 5,
                timeout_factor: 10,
            },
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn empty_primary_url_rejected() {
        let mut cfg = sample();
        cfg.proxy.primary_url.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_timeout_rejected() {
        let mut cfg = sample();
        cfg.timeout.cplane_operation_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn intra_control_only_used_when_distinct() {
        let mut cfg = sample();
        assert!(!cfg.net.uses_intra_control());
        cfg.net.ipv4_intra_control = Some("10.0.0.1".into());
        assert!(cfg.net.uses_intra_control());
    }
}
