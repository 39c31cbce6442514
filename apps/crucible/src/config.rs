//! # Configuration
//!
//! `CrucibleConfig` is assembled in three layers, later layers winning:
//!
//! 1. an optional TOML file (`--config crucible.toml`)
//! 2. `CRUCIBLE_*` environment variables
//! 3. command-line flags
//!
//! ```toml
//! database = "floor.redb"
//!
//! [server]
//! host = "0.0.0.0"
//! port = 8080
//! cors_origins = ["http://floor-terminal:3000"]
//!
//! [sweep]
//! interval_secs = 30
//! grace_secs = 60
//! startup_delay_secs = 2
//! ```

use crucible_core::CrucibleError;
use crucible_core::primitives::{
    DEFAULT_PROMOTION_GRACE_SECS, DEFAULT_SWEEP_INTERVAL_SECS, DEFAULT_SWEEP_STARTUP_DELAY_SECS,
    MAX_PROMOTION_GRACE_SECS,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_DATABASE: &str = "crucible.redb";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CrucibleConfig {
    /// Path of the redb floor database.
    pub database: PathBuf,
    pub server: ServerConfig,
    pub sweep: SweepConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allowed CORS origins. `None` means localhost only, `["*"]` allows all.
    pub cors_origins: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SweepConfig {
    pub interval_secs: u64,
    pub grace_secs: i64,
    pub startup_delay_secs: u64,
}

impl Default for CrucibleConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from(DEFAULT_DATABASE),
            server: ServerConfig::default(),
            sweep: SweepConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            cors_origins: None,
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            grace_secs: DEFAULT_PROMOTION_GRACE_SECS,
            startup_delay_secs: DEFAULT_SWEEP_STARTUP_DELAY_SECS,
        }
    }
}

impl SweepConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    #[must_use]
    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }

    /// Grace period, clamped to `0..=MAX_PROMOTION_GRACE_SECS`.
    #[must_use]
    pub fn grace(&self) -> chrono::TimeDelta {
        chrono::TimeDelta::try_seconds(self.grace_secs.clamp(0, MAX_PROMOTION_GRACE_SECS))
            .unwrap_or_default()
    }
}

impl CrucibleConfig {
    /// Read the file (if any), then apply the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, CrucibleError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, CrucibleError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CrucibleError::IoError(format!("cannot read config '{}': {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, CrucibleError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| CrucibleError::ValidationError(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `CRUCIBLE_*` variables found through `lookup`.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), CrucibleError> {
        if let Some(database) = lookup("CRUCIBLE_DATABASE") {
            self.database = PathBuf::from(database);
        }
        if let Some(host) = lookup("CRUCIBLE_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("CRUCIBLE_PORT") {
            self.server.port = parse_var("CRUCIBLE_PORT", &port)?;
        }
        if let Some(origins) = lookup("CRUCIBLE_CORS_ORIGINS") {
            self.server.cors_origins = Some(
                origins
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            );
        }
        if let Some(secs) = lookup("CRUCIBLE_SWEEP_INTERVAL_SECS") {
            self.sweep.interval_secs = parse_var("CRUCIBLE_SWEEP_INTERVAL_SECS", &secs)?;
        }
        if let Some(secs) = lookup("CRUCIBLE_PROMOTION_GRACE_SECS") {
            self.sweep.grace_secs = parse_var("CRUCIBLE_PROMOTION_GRACE_SECS", &secs)?;
        }
        if let Some(secs) = lookup("CRUCIBLE_SWEEP_STARTUP_DELAY_SECS") {
            self.sweep.startup_delay_secs = parse_var("CRUCIBLE_SWEEP_STARTUP_DELAY_SECS", &secs)?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), CrucibleError> {
        if self.sweep.interval_secs == 0 {
            return Err(CrucibleError::ValidationError(
                "sweep.interval_secs must be at least 1".to_string(),
            ));
        }
        if !(0..=MAX_PROMOTION_GRACE_SECS).contains(&self.sweep.grace_secs) {
            return Err(CrucibleError::ValidationError(format!(
                "sweep.grace_secs must be between 0 and {MAX_PROMOTION_GRACE_SECS}"
            )));
        }
        if self.server.host.trim().is_empty() {
            return Err(CrucibleError::ValidationError(
                "server.host must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn parse_var<T: FromStr>(key: &str, raw: &str) -> Result<T, CrucibleError> {
    raw.trim()
        .parse()
        .map_err(|_| CrucibleError::ValidationError(format!("{key}: cannot parse '{raw}'")))
}
