//! `bsync.toml`: listener, dispatch tuning and per-engine overrides.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bsync_core::constants::{
    DEFAULT_BATCH_SIZE, DEFAULT_CONTEXT_TTL_SECS, DEFAULT_ENGINE_CONCURRENCY,
    DEFAULT_ENGINE_TOKEN, DEFAULT_HEALTH_INTERVAL_SECS, DEFAULT_RATE_LIMIT_PER_MINUTE,
    DEFAULT_SYNC_INTERVAL_SECS, HEALTH_TIMEOUT_SECS,
};
use bsync_core::{EngineId, EngineSpec};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = "bsync.toml";
pub const DB_FILE: &str = "bsync.db";

/// `$BSYNC_DATA_DIR`, else `~/.bsync`.
pub fn data_dir() -> PathBuf {
    std::env::var("BSYNC_DATA_DIR")
        .ok()
        .filter(|d| !d.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            std::env::var("HOME")
                .or_else(|_| std::env::var("USERPROFILE"))
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(".bsync")
        })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub bind: String,
    /// Shared secret expected from capture clients. Generated on first
    /// start when unset.
    pub sync_token: Option<String>,
    pub dispatch: DispatchConfig,
    /// Keyed by engine name (`HURAII`, `CLOE`, ...).
    pub engines: BTreeMap<String, EngineOverride>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    pub batch_size: usize,
    pub sync_interval_secs: u64,
    pub health_interval_secs: u64,
    pub health_timeout_secs: u64,
    pub max_concurrency_per_engine: usize,
    pub context_ttl_secs: u64,
    pub rate_limit_per_minute: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineOverride {
    pub endpoint: Option<String>,
    pub timeout_secs: Option<f64>,
    pub token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8787".to_string(),
            sync_token: None,
            dispatch: DispatchConfig::default(),
            engines: BTreeMap::new(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            health_interval_secs: DEFAULT_HEALTH_INTERVAL_SECS,
            health_timeout_secs: HEALTH_TIMEOUT_SECS,
            max_concurrency_per_engine: DEFAULT_ENGINE_CONCURRENCY,
            context_ttl_secs: DEFAULT_CONTEXT_TTL_SECS,
            rate_limit_per_minute: DEFAULT_RATE_LIMIT_PER_MINUTE,
        }
    }
}

impl DispatchConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }
}

impl Config {
    /// Read a config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config = Self::parse(&text)
            .with_context(|| format!("invalid config {}", path.display()))?;
        tracing::info!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.dispatch.batch_size == 0 {
            bail!("dispatch.batch_size must be at least 1");
        }
        if self.dispatch.max_concurrency_per_engine == 0 {
            bail!("dispatch.max_concurrency_per_engine must be at least 1");
        }
        if self.dispatch.sync_interval_secs == 0 || self.dispatch.health_interval_secs == 0 {
            bail!("dispatch intervals must be at least one second");
        }
        if self.dispatch.health_timeout_secs == 0 {
            bail!("dispatch.health_timeout_secs must be at least 1");
        }
        for (name, engine) in &self.engines {
            name.parse::<EngineId>()
                .map_err(|e| anyhow::anyhow!("[engines.{name}]: {e}"))?;
            if let Some(t) = engine.timeout_secs {
                engine_timeout(name, t)?;
            }
        }
        Ok(())
    }

    /// The built-in engine table with this file's overrides applied.
    pub fn engine_specs(&self) -> Result<Vec<EngineSpec>> {
        let mut specs = EngineSpec::defaults();
        for (name, over) in &self.engines {
            let id = name
                .parse::<EngineId>()
                .map_err(|e| anyhow::anyhow!("[engines.{name}]: {e}"))?;
            let Some(spec) = specs.iter_mut().find(|s| s.id == id) else {
                continue;
            };
            let endpoint = over.endpoint.as_deref().unwrap_or(&spec.endpoint).to_string();
            let timeout = match over.timeout_secs {
                Some(t) => engine_timeout(name, t)?,
                None => spec.timeout,
            };
            let token = over
                .token
                .as_deref()
                .unwrap_or(DEFAULT_ENGINE_TOKEN)
                .to_string();
            *spec = EngineSpec::new(id, &endpoint, timeout, &token);
        }
        Ok(specs)
    }
}

/// A positive timeout that fits in a `Duration`.
fn engine_timeout(name: &str, secs: f64) -> Result<Duration> {
    match Duration::try_from_secs_f64(secs) {
        Ok(timeout) if !timeout.is_zero() => Ok(timeout),
        _ => bail!("[engines.{name}] timeout_secs must be positive and finite, got {secs}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.dispatch.batch_size, 50);
        assert_eq!(config.dispatch.rate_limit_per_minute, 60);
    }

    #[test]
    fn test_engine_overrides() {
        let config = Config::parse(
            r#"
            bind = "0.0.0.0:9000"
            sync_token = "s3cret"

            [dispatch]
            batch_size = 10
            sync_interval_secs = 2

            [engines.CLOE]
            endpoint = "http://127.0.0.1:7001/"
            timeout_secs = 2.5
            token = "cloe-token"
            "#,
        )
        .unwrap();
        assert_eq!(config.bind, "0.0.0.0:9000");
        assert_eq!(config.dispatch.batch_size, 10);
        assert_eq!(config.dispatch.health_interval_secs, 60);

        let specs = config.engine_specs().unwrap();
        assert_eq!(specs.len(), 5);
        let cloe = specs.iter().find(|s| s.id == EngineId::Cloe).unwrap();
        assert_eq!(cloe.endpoint, "http://127.0.0.1:7001");
        assert_eq!(cloe.timeout, Duration::from_millis(2500));
        assert_eq!(cloe.token, "cloe-token");
        let huraii = specs.iter().find(|s| s.id == EngineId::Huraii).unwrap();
        assert_eq!(huraii.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_rejects_unknown_engine_and_bad_values() {
        assert!(Config::parse("[engines.SKYNET]\nendpoint = \"http://x\"").is_err());
        assert!(Config::parse("[dispatch]\nbatch_size = 0").is_err());
        assert!(Config::parse("[engines.CLOE]\ntimeout_secs = -1.0").is_err());
        assert!(Config::parse("colour = \"blue\"").is_err());
    }

    #[test]
    fn test_rejects_out_of_range_timeouts() {
        let err = Config::parse("[engines.CLOE]\ntimeout_secs = 1e20").unwrap_err();
        assert!(format!("{err:#}").contains("timeout_secs"));
        assert!(Config::parse("[engines.CLOE]\ntimeout_secs = 0.0").is_err());
        assert!(Config::parse("[engines.CLOE]\ntimeout_secs = nan").is_err());
        assert!(Config::parse("[engines.CLOE]\ntimeout_secs = 0.25").is_ok());
        assert!(Config::parse("[dispatch]\nhealth_timeout_secs = 0").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config, Config::default());
    }
}
