//! Readiness probes for freshly started probe containers.
//!
//! A container only becomes a [`RunningSystem`](crate::replica::RunningSystem)
//! after every configured healthcheck passes. Checks retry with a linearly
//! increasing, capped backoff; a check that exhausts its retries marks the
//! commit as broken, exactly like a failed build.
//!
//! Two kinds exist:
//!
//! - [`HealthcheckKind::HttpGet200`]: an HTTP GET (driven through `curl`)
//!   that must answer status 200. The check's `data` is appended verbatim
//!   to `http://<host>:<port>`, so it normally starts with `/`.
//! - [`HealthcheckKind::Script`]: a shell command run with `sh -c`. For
//!   every guest-to-host port mapping `G -> H`, the environment variable
//!   `PORT<G>=<H>` is injected (guest 443 on host 54321 becomes
//!   `PORT443=54321`). Exit status 0 means healthy.

use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::error::{BisectError, BisectResult};
use crate::repo::{run_tool, run_tool_with_env};

/// Retry policy for a healthcheck: `retries` attempts, sleeping `backoff`
/// between failures and adding `backoff_increment` each time up to
/// `max_backoff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts before the check is failed.
    pub retries: u32,
    /// Initial sleep after the first failed attempt.
    pub backoff: Duration,
    /// Added to the sleep after every failed attempt.
    pub backoff_increment: Duration,
    /// Upper bound on the sleep.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 25,
            backoff: Duration::from_millis(1000),
            backoff_increment: Duration::from_millis(250),
            max_backoff: Duration::from_millis(3000),
        }
    }
}

/// The kind of probe a healthcheck performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthcheckKind {
    /// HTTP GET that must return status 200. `data` holds the path.
    HttpGet200,
    /// Shell command run with `sh -c`. `data` holds the script.
    Script,
}

/// A single readiness probe against a running container.
#[derive(Debug, Clone)]
pub struct Healthcheck {
    /// Guest port the check targets (resolved through the port mapping).
    pub port: u16,
    /// What kind of probe to perform.
    pub kind: HealthcheckKind,
    /// Kind-specific payload: URL path or shell script.
    pub data: String,
    /// Retry policy.
    pub policy: RetryPolicy,
}

impl Healthcheck {
    /// Run the check against `ports` (guest to host) until it passes or the
    /// retry budget is exhausted.
    ///
    /// # Errors
    ///
    /// Returns the error of the final attempt once all retries failed.
    pub fn run(&self, host: &str, ports: &HashMap<u16, u16>) -> BisectResult<()> {
        let mut backoff = self.policy.backoff;
        let mut last_err: Option<BisectError> = None;
        for attempt in 1..=self.policy.retries {
            match self.probe_once(host, ports) {
                Ok(()) => {
                    debug!(
                        target: "biscepter.healthcheck",
                        port = self.port,
                        attempt,
                        "healthcheck passed"
                    );
                    return Ok(());
                }
                Err(err) => {
                    if attempt != self.policy.retries {
                        trace!(
                            target: "biscepter.healthcheck",
                            port = self.port,
                            attempt,
                            retries = self.policy.retries,
                            error = %err,
                            backoff_ms = backoff.as_millis() as u64,
                            "healthcheck attempt failed, backing off"
                        );
                        thread::sleep(backoff);
                        backoff = (backoff + self.policy.backoff_increment)
                            .min(self.policy.max_backoff);
                    }
                    last_err = Some(err);
                }
            }
        }
        warn!(
            target: "biscepter.healthcheck",
            port = self.port,
            mapped = ports.get(&self.port).copied().unwrap_or(0),
            retries = self.policy.retries,
            "healthcheck failed after exhausting retries"
        );
        Err(last_err.unwrap_or_else(|| BisectError::InvalidConfig {
            field: "healthcheck.retries".into(),
            value: self.policy.retries.to_string(),
            reason: "retry budget of zero attempts".into(),
        }))
    }

    /// A single probe attempt, without retries.
    pub(crate) fn probe_once(&self, host: &str, ports: &HashMap<u16, u16>) -> BisectResult<()> {
        match self.kind {
            HealthcheckKind::HttpGet200 => {
                let mapped = ports.get(&self.port).copied().unwrap_or(self.port);
                let url = format!("http://{host}:{mapped}{}", self.data);
                let code = run_tool(
                    "curl",
                    &[
                        "-s",
                        "-o",
                        "/dev/null",
                        "-w",
                        "%{http_code}",
                        "--max-time",
                        "10",
                        &url,
                    ],
                    None,
                )?;
                if code.trim() == "200" {
                    Ok(())
                } else {
                    Err(BisectError::ToolFailed {
                        tool: "curl",
                        args: vec![url],
                        status: "status mismatch".into(),
                        stderr: format!("expected HTTP 200, got {}", code.trim()),
                    })
                }
            }
            HealthcheckKind::Script => {
                let env: HashMap<String, String> = ports
                    .iter()
                    .map(|(guest, host_port)| {
                        (format!("PORT{guest}"), host_port.to_string())
                    })
                    .collect();
                run_tool_with_env("sh", &["-c", &self.data], None, &env)?;
                Ok(())
            }
        }
    }
}
