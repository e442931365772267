use crate::policy::DEFAULT_POLICY;
use crate::transport::TransportKind;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Milliseconds between client pings, advertised in the handshake.
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    /// Extra milliseconds to wait past the interval before closing.
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    /// How long a candidate transport has to complete an upgrade.
    #[serde(default = "default_upgrade_timeout_ms")]
    pub upgrade_timeout_ms: u64,
    /// Registered transport variants. Requests naming any other are rejected.
    #[serde(default = "default_transports")]
    pub transports: Vec<TransportKind>,
    #[serde(default = "default_allow_upgrades")]
    pub allow_upgrades: bool,
    /// Cross-domain policy served to raw-socket probes. Defaults to a
    /// permissive built-in document.
    #[serde(default)]
    pub policy_file: Option<PathBuf>,
    /// Deadline for worker-to-coordinator calls. Unset means wait forever.
    #[serde(default)]
    pub rpc_timeout_ms: Option<u64>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// `tracing` filter directive, overridden by `ENGINE_LOG`.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// Log file path. Logs go to stderr when unset.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            file: None,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
            upgrade_timeout_ms: default_upgrade_timeout_ms(),
            transports: default_transports(),
            allow_upgrades: default_allow_upgrades(),
            policy_file: None,
            rpc_timeout_ms: None,
            logging: LoggingConfig::default(),
        }
    }
}

fn default_ping_interval_ms() -> u64 {
    25_000
}

fn default_ping_timeout_ms() -> u64 {
    60_000
}

fn default_upgrade_timeout_ms() -> u64 {
    10_000
}

fn default_transports() -> Vec<TransportKind> {
    TransportKind::ALL.to_vec()
}

fn default_allow_upgrades() -> bool {
    true
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl EngineConfig {
    /// Loads a YAML config file and applies environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: EngineConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies `ENGINE_*` environment variables on top of the current values.
    /// Unparseable values are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Some(ms) = env_parse("ENGINE_PING_INTERVAL_MS") {
            self.ping_interval_ms = ms;
        }
        if let Some(ms) = env_parse("ENGINE_PING_TIMEOUT_MS") {
            self.ping_timeout_ms = ms;
        }
        if let Some(ms) = env_parse("ENGINE_UPGRADE_TIMEOUT_MS") {
            self.upgrade_timeout_ms = ms;
        }
        if let Some(allow) = env_parse("ENGINE_ALLOW_UPGRADES") {
            self.allow_upgrades = allow;
        }
        if let Some(ms) = env_parse("ENGINE_RPC_TIMEOUT_MS") {
            self.rpc_timeout_ms = Some(ms);
        }
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn upgrade_timeout(&self) -> Duration {
        Duration::from_millis(self.upgrade_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Option<Duration> {
        self.rpc_timeout_ms.map(Duration::from_millis)
    }

    pub fn is_registered(&self, kind: TransportKind) -> bool {
        self.transports.contains(&kind)
    }

    /// Reads the configured policy file, or returns the built-in document.
    pub fn policy_document(&self) -> Result<Arc<[u8]>> {
        match &self.policy_file {
            Some(path) => {
                let bytes = std::fs::read(path)
                    .with_context(|| format!("Failed to read policy file: {}", path.display()))?;
                Ok(bytes.into())
            }
            None => Ok(DEFAULT_POLICY.into()),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
