use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::policy::StoragePolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// On-disk daemon configuration (§6, expanded by SPEC_FULL §11). Loaded
/// once at startup via `toml::from_str`; every field that isn't
/// mandatory carries a `serde(default)` so a minimal file is valid, the
/// way the teacher's `Manifest`/`ComponentSpec` types do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconstructorConfig {
    pub devices: PathBuf,

    #[serde(default)]
    pub mount_check: bool,

    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
    /// Non-zero enables "servers-per-port": any port on `bind_ip` is
    /// considered local.
    #[serde(default)]
    pub servers_per_port: u16,

    /// `None` means "not explicitly set" — needed to resolve the
    /// `handoffs_first` deprecation precedence in B4.
    #[serde(default)]
    pub handoffs_only: Option<bool>,
    #[serde(default)]
    pub handoffs_first: Option<bool>,

    #[serde(default = "default_reclaim_age")]
    pub reclaim_age: u64,
    #[serde(default = "default_stats_interval")]
    pub stats_interval: u64,

    pub ring_path: PathBuf,
    #[serde(default = "default_ring_freshness")]
    pub ring_freshness_secs: u64,

    #[serde(default)]
    pub policies: Vec<StoragePolicy>,

    #[serde(default = "default_concurrency_per_partition")]
    pub concurrency_per_partition: usize,
    #[serde(default = "default_peer_timeout")]
    pub peer_timeout_secs: u64,
    #[serde(default = "default_peer_sync_timeout")]
    pub peer_sync_timeout_secs: u64,
    #[serde(default = "default_max_backup_handoffs")]
    pub max_backup_handoffs: usize,
    #[serde(default = "default_run_pause")]
    pub run_pause_secs: u64,

    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}
fn default_bind_port() -> u16 {
    6200
}
fn default_reclaim_age() -> u64 {
    86_400
}
fn default_stats_interval() -> u64 {
    300
}
fn default_ring_freshness() -> u64 {
    15
}
fn default_concurrency_per_partition() -> usize {
    2
}
fn default_peer_timeout() -> u64 {
    60
}
fn default_peer_sync_timeout() -> u64 {
    300
}
fn default_max_backup_handoffs() -> usize {
    3
}
fn default_run_pause() -> u64 {
    30
}

/// Outcome of resolving `handoffs_only`/`handoffs_first` precedence
/// (B4): the caller logs according to which branch fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffsOnlyResolution {
    /// `handoffs_only` was explicit; `handoffs_first` (if also set) is
    /// ignored.
    ExplicitOnly { handoffs_first_ignored: bool },
    /// Only the deprecated `handoffs_first = true` alias was set.
    DeprecatedAlias,
    Disabled,
}

impl ReconstructorConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let cfg: ReconstructorConfig = toml::from_str(&raw)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for policy in &self.policies {
            if !policy.is_consistent() {
                return Err(ConfigError::InconsistentPolicy { name: policy.name.clone() });
            }
        }
        Ok(())
    }

    /// Resolves the effective handoffs-only mode per the B4 precedence
    /// rule: an explicit `handoffs_only` always wins; `handoffs_first`
    /// is a deprecated alias that only takes effect when
    /// `handoffs_only` is unset.
    pub fn resolve_handoffs_only(&self) -> (bool, HandoffsOnlyResolution) {
        match self.handoffs_only {
            Some(explicit) => (
                explicit,
                HandoffsOnlyResolution::ExplicitOnly {
                    handoffs_first_ignored: self.handoffs_first.is_some(),
                },
            ),
            None => match self.handoffs_first {
                Some(true) => (true, HandoffsOnlyResolution::DeprecatedAlias),
                _ => (false, HandoffsOnlyResolution::Disabled),
            },
        }
    }

    pub fn policy(&self, policy_index: u32) -> Option<&StoragePolicy> {
        self.policies.iter().find(|p| p.policy_index == policy_index)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse { path: PathBuf, source: toml::de::Error },
    #[error("policy '{name}' has inconsistent replicas/n_data/n_parity/duplication_factor")]
    InconsistentPolicy { name: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handoffs_only_explicit_wins_over_deprecated_alias() {
        let mut cfg = minimal_config();
        cfg.handoffs_only = Some(false);
        cfg.handoffs_first = Some(true);
        let (effective, resolution) = cfg.resolve_handoffs_only();
        assert!(!effective);
        assert_eq!(
            resolution,
            HandoffsOnlyResolution::ExplicitOnly { handoffs_first_ignored: true }
        );
    }

    #[test]
    fn deprecated_alias_enables_handoffs_only_when_unset() {
        let mut cfg = minimal_config();
        cfg.handoffs_first = Some(true);
        let (effective, resolution) = cfg.resolve_handoffs_only();
        assert!(effective);
        assert_eq!(resolution, HandoffsOnlyResolution::DeprecatedAlias);
    }

    #[test]
    fn default_is_disabled() {
        let cfg = minimal_config();
        let (effective, resolution) = cfg.resolve_handoffs_only();
        assert!(!effective);
        assert_eq!(resolution, HandoffsOnlyResolution::Disabled);
    }

    fn minimal_config() -> ReconstructorConfig {
        toml::from_str(
            r#"
            devices = "/srv/node"
            ring_path = "/etc/reconstructor/object.ring"
            "#,
        )
        .unwrap()
    }
}
