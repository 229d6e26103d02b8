// Copyright (c) 2026 Myco
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Startup configuration: environment variables per spec.md §6, plus an
//! optional TOML file for the parts that don't fit env vars cleanly
//! (bootstrap peers). Mirrors the `env(key, default)` helper the donor
//! codebase's `main.rs` used directly, generalized into one place so both
//! `main.rs` and the simulation harness can build a `NodeConfig` the same way.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::core::types::NodeConfig;

/// Configuration errors. Per spec.md §7, configuration errors are fatal at
/// startup only.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// `PORT` did not parse as a `u16`.
    #[error("invalid PORT: {0}")]
    BadPort(String),
    /// `KEY_EPOCH` did not parse as a `u32`.
    #[error("invalid KEY_EPOCH: {0}")]
    BadEpoch(String),
    /// `MYCO_CONFIG` was set but the file could not be read or parsed.
    #[error("failed to load MYCO_CONFIG file: {0}")]
    ConfigFile(String),
    /// A plaintext override was requested in a build where that is forbidden.
    #[error("ALLOW_PLAINTEXT/FORCE_PLAINTEXT are not permitted in production builds")]
    PlaintextForbidden,
}

fn env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Resolved startup configuration for one node.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Root directory for identity, peer book, and WAL files.
    pub state_dir: PathBuf,
    /// UDP listen port.
    pub port: u16,
    /// Cluster pre-shared secret mixed into every channel's key derivation.
    /// Empty if unset (an empty PSK is a valid, if weaker, configuration —
    /// the channel key still incorporates both peers' identities and the
    /// epoch).
    pub psk: Vec<u8>,
    /// Current key-rotation epoch.
    pub epoch: u32,
    /// Bind address for the admin HTTP surface.
    pub admin_addr: String,
    /// Dev-only plaintext override. Always `false` unless explicitly built
    /// with the `simulation` feature, per spec.md §6.
    pub allow_plaintext: bool,
    /// Parsed `MYCO_CONFIG` contents, if a path was set.
    pub node_config: NodeConfig,
    /// How often to emit gossip summaries.
    pub gossip_interval: Duration,
    /// How often to emit heartbeats.
    pub heartbeat_interval: Duration,
    /// How many datagrams to drain from the socket per tick (step 1, §4.9).
    pub rx_batch: usize,
    /// Maximum age of an un-fsynced WAL write before a forced flush (step 6).
    pub wal_flush_deadline: Duration,
    /// Consecutive MAC failures from one source before temporary quarantine
    /// (spec.md §7: "repeated failure from a source above a threshold").
    pub quarantine_threshold: u32,
    /// How long a quarantined peer is excluded from gossip TX.
    pub quarantine_backoff: Duration,
    /// OS threads in the bounded reconcile worker pool (spec §5: executor
    /// calls SHOULD be issued to a bounded worker pool so the tick is not
    /// blocked by a slow or hanging collaborator).
    pub reconcile_workers: usize,
    /// Maximum reconcile requests in flight (queued + running) at once.
    pub reconcile_queue_depth: usize,
}

impl Settings {
    /// Build settings from the process environment and, if `MYCO_CONFIG` is
    /// set, an on-disk TOML file.
    pub fn from_env() -> Result<Self, ConfigError> {
        let state_dir = env("STATE_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("/var/lib/myco"));

        let port = match env("PORT") {
            Some(v) => v.parse::<u16>().map_err(|_| ConfigError::BadPort(v))?,
            None => 7777,
        };

        let psk = env("PSK").map(|s| s.into_bytes()).unwrap_or_default();

        let epoch = match env("KEY_EPOCH") {
            Some(v) => v.parse::<u32>().map_err(|_| ConfigError::BadEpoch(v))?,
            None => 1,
        };

        let admin_addr = env("MYCO_ADMIN_ADDR").unwrap_or_else(|| "127.0.0.1:7778".to_string());

        let allow_plaintext = env("ALLOW_PLAINTEXT").is_some() || env("FORCE_PLAINTEXT").is_some();
        if allow_plaintext && !cfg!(feature = "simulation") {
            return Err(ConfigError::PlaintextForbidden);
        }

        let reconcile_workers = match env("RECONCILE_WORKERS") {
            Some(v) => v.parse::<usize>().unwrap_or(4).max(1),
            None => 4,
        };
        let reconcile_queue_depth = match env("RECONCILE_QUEUE_DEPTH") {
            Some(v) => v.parse::<usize>().unwrap_or(256).max(1),
            None => 256,
        };

        let node_config = match env("MYCO_CONFIG") {
            Some(path) => {
                let raw = std::fs::read_to_string(&path).map_err(|e| ConfigError::ConfigFile(e.to_string()))?;
                toml::from_str(&raw).map_err(|e| ConfigError::ConfigFile(e.to_string()))?
            }
            None => NodeConfig::default(),
        };

        Ok(Self {
            state_dir,
            port,
            psk,
            epoch,
            admin_addr,
            allow_plaintext,
            node_config,
            gossip_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(5),
            rx_batch: 64,
            wal_flush_deadline: Duration::from_millis(200),
            quarantine_threshold: 8,
            quarantine_backoff: Duration::from_secs(30),
            reconcile_workers,
            reconcile_queue_depth,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_env_unset() {
        for key in ["STATE_DIR", "PORT", "PSK", "KEY_EPOCH", "MYCO_ADMIN_ADDR", "ALLOW_PLAINTEXT", "FORCE_PLAINTEXT", "MYCO_CONFIG"] {
            std::env::remove_var(key);
        }
        let settings = Settings::from_env().unwrap();
        assert_eq!(settings.port, 7777);
        assert_eq!(settings.epoch, 1);
        assert_eq!(settings.state_dir, PathBuf::from("/var/lib/myco"));
        assert!(!settings.allow_plaintext);
    }

    #[test]
    fn bad_port_is_a_config_error() {
        std::env::set_var("PORT", "not-a-port");
        let err = Settings::from_env().unwrap_err();
        std::env::remove_var("PORT");
        assert!(matches!(err, ConfigError::BadPort(_)));
    }
}
