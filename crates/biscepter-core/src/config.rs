//! YAML job configuration.
//!
//! The on-disk schema mirrors the [`Job`] fields, with a couple of
//! conveniences: a scalar `port` that overrides the `ports` list, a
//! literal `dockerfile` that takes precedence over `dockerfilePath`, and
//! healthcheck retry fields in milliseconds with the documented defaults
//! (25 retries, 1000 ms base, 250 ms increment, 3000 ms cap).
//!
//! ```yaml
//! repository: https://github.com/example/service.git
//! goodCommit: 8ee0e2a3c12e324c1b5c41f7861e341d91692efb
//! badCommit: 9b70eda4f3e48d5d906f99b570a16d5a979b0a99
//! port: 3333
//! buildCost: 50
//! dockerfilePath: ./Dockerfile.bisect
//! healthcheck:
//!   - port: 3333
//!     type: http
//!     data: /health
//!     retries: 30
//! ```

use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{BisectError, BisectResult};
use crate::healthcheck::{Healthcheck, HealthcheckKind, RetryPolicy};
use crate::job::Job;

/// The YAML job schema.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfig {
    /// Repository URL to bisect.
    pub repository: String,
    /// The known-good commit hash.
    pub good_commit: String,
    /// The known-bad commit hash.
    pub bad_commit: String,
    /// Host to bind container ports to; defaults to `127.0.0.1`.
    #[serde(default)]
    pub host: Option<String>,
    /// Single exposed guest port; overrides `ports` when set.
    #[serde(default)]
    pub port: Option<u16>,
    /// Exposed guest ports.
    #[serde(default)]
    pub ports: Vec<u16>,
    /// Readiness checks.
    #[serde(default)]
    pub healthcheck: Vec<HealthcheckConfig>,
    /// Dockerfile literal; takes precedence over `dockerfilePath`.
    #[serde(default)]
    pub dockerfile: Option<String>,
    /// Path to a Dockerfile.
    #[serde(default)]
    pub dockerfile_path: Option<PathBuf>,
    /// Build-cost multiplier β.
    #[serde(default)]
    pub build_cost: f64,
}

/// One healthcheck entry in the YAML schema. Durations are milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthcheckConfig {
    /// Guest port the check targets.
    pub port: u16,
    /// Check kind: `http` or `script`.
    #[serde(rename = "type")]
    pub check_type: CheckType,
    /// URL path (`http`) or shell script (`script`).
    #[serde(default)]
    pub data: String,
    /// Attempts before the check fails.
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Initial backoff in milliseconds.
    #[serde(default = "default_backoff_ms")]
    pub backoff: u64,
    /// Backoff increment in milliseconds.
    #[serde(default = "default_backoff_increment_ms")]
    pub backoff_increment: u64,
    /// Backoff cap in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff: u64,
}

/// Healthcheck kinds accepted in YAML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckType {
    /// HTTP GET expecting status 200.
    Http,
    /// Shell script expecting exit status 0.
    Script,
}

const fn default_retries() -> u32 {
    25
}
const fn default_backoff_ms() -> u64 {
    1000
}
const fn default_backoff_increment_ms() -> u64 {
    250
}
const fn default_max_backoff_ms() -> u64 {
    3000
}

impl From<&HealthcheckConfig> for Healthcheck {
    fn from(config: &HealthcheckConfig) -> Self {
        Self {
            port: config.port,
            kind: match config.check_type {
                CheckType::Http => HealthcheckKind::HttpGet200,
                CheckType::Script => HealthcheckKind::Script,
            },
            data: config.data.clone(),
            policy: RetryPolicy {
                retries: config.retries,
                backoff: Duration::from_millis(config.backoff),
                backoff_increment: Duration::from_millis(config.backoff_increment),
                max_backoff: Duration::from_millis(config.max_backoff),
            },
        }
    }
}

impl JobConfig {
    /// Parse a config from YAML text.
    ///
    /// # Errors
    ///
    /// Returns [`BisectError::InvalidConfig`] for YAML that does not match
    /// the schema (including unknown healthcheck types).
    pub fn from_yaml_str(yaml: &str) -> BisectResult<Self> {
        serde_yaml::from_str(yaml).map_err(|err| BisectError::InvalidConfig {
            field: "job.yml".into(),
            value: "<yaml>".into(),
            reason: err.to_string(),
        })
    }

    /// Turn the parsed config into a runnable [`Job`].
    #[must_use]
    pub fn into_job(self) -> Job {
        let ports = match self.port {
            Some(port) => vec![port],
            None => self.ports,
        };
        let mut job = Job::default();
        job.repository = self.repository;
        job.good_commit = self.good_commit;
        job.bad_commit = self.bad_commit;
        job.host = self.host.unwrap_or_default();
        job.ports = ports;
        job.healthchecks = self.healthcheck.iter().map(Healthcheck::from).collect();
        job.dockerfile = self.dockerfile;
        job.dockerfile_path = self.dockerfile_path;
        job.build_cost = self.build_cost;
        job
    }
}

impl Job {
    /// Read a YAML job config from `reader` and build the job.
    ///
    /// # Errors
    ///
    /// Fails on unreadable input or schema mismatches.
    pub fn from_config_reader(mut reader: impl Read) -> BisectResult<Self> {
        let mut yaml = String::new();
        reader
            .read_to_string(&mut yaml)
            .map_err(|e| BisectError::io("<job config>", e))?;
        Ok(JobConfig::from_yaml_str(&yaml)?.into_job())
    }
}
