use crate::classify::ClassifyMode;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Smallest accepted per-run timeout. Anything below this reaps children
/// faster than most targets can even reach main().
pub const MIN_TIMEOUT_MS: u64 = 20;

/// Smallest accepted address-space limit. Below this the dynamic loader
/// itself fails, which only produces confusing launch errors.
pub const MIN_MEM_LIMIT_MB: u64 = 5;

pub const DEFAULT_MEM_LIMIT_MB: u64 = 25;

/// Configuration errors are reported before any execution starts.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("dangerously low exec timeout {0} ms (minimum is {MIN_TIMEOUT_MS} ms, 0 disables the timer)")]
    TimeoutTooLow(u64),

    #[error("dangerously low memory limit {0} MB (minimum is {MIN_MEM_LIMIT_MB} MB, 0 lifts the limit)")]
    MemLimitTooLow(u64),
}

/// Execution controls for one campaign.
///
/// Loadable from a TOML file and overridable flag by flag from the CLI.
/// The zero sentinel disables the timeout and lifts the memory limit, which
/// keeps both fields representable in a config file without a union type.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Per-run timeout in milliseconds; 0 disables the timer.
    #[serde(default)]
    pub exec_timeout_ms: u64,

    /// Child address-space limit in megabytes; 0 lifts the limit.
    #[serde(default = "default_mem_limit_mb")]
    pub mem_limit_mb: u64,

    /// Keep core dumps from crashing children instead of truncating them.
    #[serde(default)]
    pub keep_cores: bool,

    /// Sink the target's stdout/stderr and suppress per-run narration.
    #[serde(default)]
    pub quiet: bool,

    /// Collapse hit counts to plain edge coverage.
    #[serde(default)]
    pub edges_only: bool,

    /// Bit-flag classification plus raw binary trace output.
    #[serde(default)]
    pub binary: bool,

    /// Corpus-minimization output convention; forces quiet.
    #[serde(default)]
    pub minimize: bool,
}

fn default_mem_limit_mb() -> u64 {
    DEFAULT_MEM_LIMIT_MB
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            exec_timeout_ms: 0,
            mem_limit_mb: default_mem_limit_mb(),
            keep_cores: false,
            quiet: false,
            edges_only: false,
            binary: false,
            minimize: false,
        }
    }
}

impl EngineConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: EngineConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    /// Rejects threshold violations. Zero sentinels pass untouched.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.exec_timeout_ms != 0 && self.exec_timeout_ms < MIN_TIMEOUT_MS {
            return Err(ConfigError::TimeoutTooLow(self.exec_timeout_ms));
        }
        if self.mem_limit_mb != 0 && self.mem_limit_mb < MIN_MEM_LIMIT_MB {
            return Err(ConfigError::MemLimitTooLow(self.mem_limit_mb));
        }
        Ok(())
    }

    /// Applies cross-field rules: minimization output is machine-consumed,
    /// so target output and narration are silenced.
    pub fn normalize(&mut self) {
        if self.minimize {
            self.quiet = true;
        }
    }

    pub fn classify_mode(&self) -> ClassifyMode {
        if self.binary {
            ClassifyMode::Binary
        } else {
            ClassifyMode::Human
        }
    }

    pub fn exec_timeout(&self) -> Option<Duration> {
        (self.exec_timeout_ms > 0).then(|| Duration::from_millis(self.exec_timeout_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().expect("default config must validate");
        assert_eq!(config.mem_limit_mb, DEFAULT_MEM_LIMIT_MB);
        assert_eq!(config.exec_timeout(), None);
        assert_eq!(config.classify_mode(), ClassifyMode::Human);
    }

    #[test]
    fn thresholds_are_enforced() {
        let mut config = EngineConfig::default();
        config.exec_timeout_ms = MIN_TIMEOUT_MS - 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TimeoutTooLow(_))
        ));

        let mut config = EngineConfig::default();
        config.mem_limit_mb = MIN_MEM_LIMIT_MB - 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MemLimitTooLow(_))
        ));

        let mut config = EngineConfig::default();
        config.exec_timeout_ms = 0;
        config.mem_limit_mb = 0;
        config.validate().expect("zero sentinels must pass");
    }

    #[test]
    fn minimize_forces_quiet() {
        let mut config = EngineConfig {
            minimize: true,
            ..EngineConfig::default()
        };
        assert!(!config.quiet);
        config.normalize();
        assert!(config.quiet);
    }

    #[test]
    fn loads_kebab_case_toml() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile failed");
        writeln!(
            file,
            "exec-timeout-ms = 1000\nmem-limit-mb = 0\nedges-only = true\nbinary = true"
        )
        .expect("write failed");

        let config = EngineConfig::load_from_file(file.path()).expect("load failed");
        assert_eq!(config.exec_timeout(), Some(Duration::from_millis(1000)));
        assert_eq!(config.mem_limit_mb, 0);
        assert!(config.edges_only);
        assert_eq!(config.classify_mode(), ClassifyMode::Binary);
        assert!(!config.minimize);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile failed");
        writeln!(file, "not-a-real-knob = 3").expect("write failed");
        assert!(EngineConfig::load_from_file(file.path()).is_err());
    }
}
