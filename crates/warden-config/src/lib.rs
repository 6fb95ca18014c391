//! Warden's ambient configuration layer — mirrors `aigent-config`'s
//! `AppConfig` pattern: `#[serde(default)]` structs, a `Default` impl with
//! sane literals, `load_from`/`save_to` over TOML, and one environment
//! override point.

use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Seconds the parent waits on any single pipe read before treating the
    /// operation as failed. A single unified timeout knob, not split into
    /// first-byte/inter-byte variants.
    pub timeout_seconds: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self { timeout_seconds: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Byte budget handed to the child's bounded allocator.
    /// Overridden at runtime by the `WARDEN_MAX_MEMORY_BYTES` environment
    /// variable when set.
    pub max_memory_bytes: usize,
    /// Symbolic syscall names to blacklist in the syscall gate. Resolved to
    /// numbers via `warden_sandbox::resolve_syscall_name` at lockdown time;
    /// unresolvable names are dropped with a warning.
    pub syscall_blacklist: Vec<String>,
    /// Whether to run the guest under sandbox lockdown at all. `false` is
    /// only appropriate for local debugging of a trusted script.
    pub enabled: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: 64 * 1024 * 1024,
            syscall_blacklist: warden_sandbox::default_blacklist_names()
                .into_iter()
                .map(str::to_string)
                .collect(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { log_level: "info".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WardenConfig {
    pub proxy: ProxyConfig,
    pub sandbox: SandboxConfig,
    pub telemetry: TelemetryConfig,
}

impl WardenConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("WARDEN_MAX_MEMORY_BYTES") {
            if let Ok(bytes) = value.parse::<usize>() {
                config.sandbox.max_memory_bytes = bytes;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Resolve the configured blacklist to syscall numbers, dropping (and
    /// warning about) any name the current platform doesn't know.
    pub fn resolved_blacklist(&self) -> Vec<i64> {
        self.sandbox
            .syscall_blacklist
            .iter()
            .filter_map(|name| match warden_sandbox::resolve_syscall_name(name) {
                Some(nr) => Some(nr),
                None => {
                    tracing::warn!(%name, "unknown syscall name in blacklist; ignoring");
                    None
                }
            })
            .collect()
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.proxy.timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_literals() {
        let cfg = WardenConfig::default();
        assert_eq!(cfg.proxy.timeout_seconds, 10);
        assert!(cfg.sandbox.enabled);
        assert!(!cfg.sandbox.syscall_blacklist.is_empty());
    }

    #[test]
    fn round_trips_through_toml_file() {
        let dir = std::env::temp_dir().join(format!("warden-config-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("warden.toml");

        let mut cfg = WardenConfig::default();
        cfg.proxy.timeout_seconds = 42;
        cfg.save_to(&path).unwrap();

        let loaded = WardenConfig::load_from(&path).unwrap();
        assert_eq!(loaded.proxy.timeout_seconds, 42);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let path = std::env::temp_dir().join("warden-config-does-not-exist.toml");
        let cfg = WardenConfig::load_from(&path).unwrap();
        assert_eq!(cfg.proxy.timeout_seconds, WardenConfig::default().proxy.timeout_seconds);
    }

    #[test]
    fn resolved_blacklist_drops_unknown_names() {
        let mut cfg = WardenConfig::default();
        cfg.sandbox.syscall_blacklist.push("not_a_real_syscall".to_string());
        let resolved = cfg.resolved_blacklist();
        assert_eq!(resolved.len(), WardenConfig::default().sandbox.syscall_blacklist.len());
    }
}
