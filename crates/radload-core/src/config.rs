use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::client::{ClientFactory, MockClientFactory, TransportSettings, UdpClientFactory};
use crate::profile::ProfileConfig;
use crate::radius::{Credentials, SharedSecret};
use crate::ramp::{RampConfig, RampStep};
use crate::retry::{RetryConfig, RetryPolicy};
use crate::runner::RunnerSettings;

const MOCK_LATENCY_MS: u64 = 5;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub target: TargetConfig,
    pub credentials: Credentials,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub ramp: RampConfig,
    #[serde(default)]
    pub profile: ProfileConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {:?}", path))?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Checks shared by every binary. Ramp settings are only checked when a
    /// ramp is actually run.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.target.server.trim().is_empty() {
            anyhow::bail!("target.server must not be empty");
        }
        if self.target.secret.is_empty() {
            anyhow::bail!("target.secret must not be empty");
        }
        if self.target.timeout_ms == 0 {
            anyhow::bail!("target.timeout_ms must be greater than zero");
        }
        if self.pool.workers == 0 {
            anyhow::bail!("pool.workers must be greater than zero");
        }
        if self.pool.queue_factor == 0 {
            anyhow::bail!("pool.queue_factor must be greater than zero");
        }
        Ok(())
    }

    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(server) = &overrides.server {
            self.target.server = server.clone();
        }
        if let Some(secret) = &overrides.secret {
            self.target.secret = SharedSecret::from(secret.as_str());
        }
        if let Some(workers) = overrides.workers {
            self.pool.workers = workers;
        }
        if let Some(rps) = overrides.rps {
            self.run.rps = rps;
        }
        if let Some(secs) = overrides.duration_secs {
            self.run.duration_secs = secs;
        }
        if let Some(start_rps) = overrides.start_rps {
            self.ramp.start_rps = start_rps;
        }
        if let Some(step_rps) = overrides.step_rps {
            self.ramp.step_rps = step_rps;
        }
        if let Some(secs) = overrides.step_duration_secs {
            self.ramp.step_duration_secs = secs;
        }
        if let Some(max_rps) = overrides.max_rps {
            self.ramp.max_rps = max_rps;
        }
        if let Some(slo_ms) = overrides.slo_ms {
            self.ramp.slo_ms = slo_ms;
        }
    }

    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            server: self.target.server.clone(),
            timeout: Duration::from_millis(self.target.timeout_ms),
            retries: self.target.retries,
            nas_identifier: self.target.nas_identifier.clone(),
        }
    }

    /// `mock` answers every request after a fixed delay; `udp` talks to
    /// `target.server`.
    pub fn client_factory(&self, mode: &str) -> anyhow::Result<Arc<dyn ClientFactory>> {
        match mode {
            "mock" => Ok(Arc::new(MockClientFactory::new(Duration::from_millis(
                MOCK_LATENCY_MS,
            )))),
            "udp" => Ok(Arc::new(UdpClientFactory::new(
                self.transport_settings(),
                Arc::new(self.target.secret.clone()),
            ))),
            other => anyhow::bail!("Invalid mode: {}, must be 'mock' or 'udp'", other),
        }
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            workers: self.pool.workers,
            queue_factor: self.pool.queue_factor,
            retry: RetryPolicy::from_config(&self.retry),
            progress_every: self.output.progress_interval(),
        }
    }
}

/// Command-line values that replace what the config file says.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub server: Option<String>,
    pub secret: Option<String>,
    pub workers: Option<usize>,
    pub rps: Option<u64>,
    pub duration_secs: Option<u64>,
    pub start_rps: Option<u64>,
    pub step_rps: Option<u64>,
    pub step_duration_secs: Option<u64>,
    pub max_rps: Option<u64>,
    /// P95 SLO in milliseconds, may be fractional
    pub slo_ms: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    /// RADIUS authentication server as `host:port`
    pub server: String,
    pub secret: SharedSecret,
    /// Wait per transmission in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Retransmissions of the same datagram before the exchange times out
    #[serde(default = "default_transport_retries")]
    pub retries: u32,
    #[serde(default)]
    pub nas_identifier: Option<String>,
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_transport_retries() -> u32 {
    2
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Queue capacity as a multiple of the worker count
    #[serde(default = "default_queue_factor")]
    pub queue_factor: usize,
}

fn default_workers() -> usize {
    50
}

fn default_queue_factor() -> usize {
    2
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_factor: default_queue_factor(),
        }
    }
}

/// Single fixed-rate run.
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_rps")]
    pub rps: u64,
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,
}

fn default_rps() -> u64 {
    100
}

fn default_duration_secs() -> u64 {
    10
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            rps: default_rps(),
            duration_secs: default_duration_secs(),
        }
    }
}

impl RunConfig {
    pub fn step(&self) -> RampStep {
        RampStep::new(self.rps, self.duration_secs.saturating_mul(1000))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
    /// Progress log period in milliseconds; 0 turns it off
    #[serde(default = "default_progress_every_ms")]
    pub progress_every_ms: u64,
    /// Write the per-request CSV for every step
    #[serde(default = "default_write_results")]
    pub write_results: bool,
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

fn default_progress_every_ms() -> u64 {
    1000
}

fn default_write_results() -> bool {
    true
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            results_dir: default_results_dir(),
            progress_every_ms: default_progress_every_ms(),
            write_results: default_write_results(),
        }
    }
}

impl OutputConfig {
    pub fn progress_interval(&self) -> Option<Duration> {
        (self.progress_every_ms > 0).then(|| Duration::from_millis(self.progress_every_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ramp::RampPlanner;

    #[test]
    fn test_config_serde() {
        let config_str = r#"
[target]
server = "127.0.0.1:31812"
secret = "testing123"
timeout_ms = 2000
nas_identifier = "radload"

[credentials]
username = "testuser"
password = "testpassword"

[pool]
workers = 16

[retry]
max_retries = 3
backoff_ms = 50

[run]
rps = 250
duration_secs = 30

[ramp]
start_rps = 100
step_rps = 50
step_duration_secs = 20
max_rps = 400
slo_ms = 150

[[profile.steps]]
label = "night"
rps = 40
hold_secs = 60

[output]
results_dir = "out"
progress_every_ms = 0
        "#;

        let config: Config = toml::from_str(config_str).unwrap();
        assert_eq!(config.target.server, "127.0.0.1:31812");
        assert_eq!(config.target.secret.as_bytes(), b"testing123");
        assert_eq!(config.target.retries, 2);
        assert_eq!(config.credentials.username, "testuser");
        assert_eq!(config.pool.workers, 16);
        assert_eq!(config.pool.queue_factor, 2);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.run.step(), RampStep::new(250, 30_000));
        assert_eq!(config.ramp.slo_ms, 150.0);
        assert_eq!(config.ramp.slo(), Duration::from_millis(150));
        assert_eq!(config.profile.steps.len(), 1);
        assert_eq!(config.output.results_dir, PathBuf::from("out"));
        assert!(config.output.write_results);
        assert!(config.validate().is_ok());

        let transport = config.transport_settings();
        assert_eq!(transport.timeout, Duration::from_millis(2000));
        assert_eq!(transport.nas_identifier.as_deref(), Some("radload"));

        let settings = config.runner_settings();
        assert_eq!(settings.workers, 16);
        assert_eq!(settings.progress_every, None);
        assert_eq!(settings.retry.max_retries(), 3);
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
[target]
server = "radius.example:1812"
secret = "s3cret"

[credentials]
username = "u"
password = "p"
"#,
        )
        .unwrap();

        assert_eq!(config.target.timeout_ms, 5000);
        assert_eq!(config.pool.workers, 50);
        assert_eq!(config.run.rps, 100);
        assert_eq!(config.ramp, RampConfig::default());
        assert_eq!(config.output.progress_interval(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_client_factory_modes() {
        let config: Config = toml::from_str(
            r#"
[target]
server = "127.0.0.1:1812"
secret = "testing123"

[credentials]
username = "u"
password = "p"
"#,
        )
        .unwrap();
        assert_eq!(config.client_factory("mock").unwrap().name(), "mock");
        assert_eq!(config.client_factory("udp").unwrap().name(), "udp");
        assert!(config.client_factory("http").is_err());
    }

    #[test]
    fn test_validate_rejects_empty_secret() {
        let mut config: Config = toml::from_str(
            r#"
[target]
server = "127.0.0.1:1812"
secret = ""

[credentials]
username = "u"
password = "p"
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());

        config.apply_overrides(&Overrides {
            secret: Some("x".into()),
            ..Default::default()
        });
        assert!(config.validate().is_ok());

        config.apply_overrides(&Overrides {
            workers: Some(0),
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides_replace_file_values() {
        let mut config: Config = toml::from_str(
            r#"
[target]
server = "127.0.0.1:1812"
secret = "testing123"

[credentials]
username = "u"
password = "p"
"#,
        )
        .unwrap();
        config.apply_overrides(&Overrides {
            server: Some("10.0.0.5:1812".into()),
            rps: Some(300),
            duration_secs: Some(5),
            start_rps: Some(20),
            step_rps: Some(20),
            step_duration_secs: Some(3),
            max_rps: Some(60),
            slo_ms: Some(0.75),
            ..Default::default()
        });
        assert_eq!(config.target.server, "10.0.0.5:1812");
        assert_eq!(config.target.secret.as_bytes(), b"testing123");
        assert_eq!(config.pool.workers, 50);
        assert_eq!(config.run.step(), RampStep::new(300, 5_000));

        assert_eq!(config.ramp.start_rps, 20);
        assert_eq!(config.ramp.step_rps, 20);
        assert_eq!(config.ramp.step_duration_secs, 3);
        assert_eq!(config.ramp.max_rps, 60);
        assert_eq!(config.ramp.slo(), Duration::from_micros(750));
        assert!(config.ramp.validate().is_ok());

        let planner = RampPlanner::new(&config.ramp);
        assert_eq!(
            planner.steps().to_vec(),
            vec![
                RampStep::new(20, 3_000),
                RampStep::new(40, 3_000),
                RampStep::new(60, 3_000)
            ]
        );
    }

    #[test]
    fn test_unset_ramp_overrides_keep_file_values() {
        let mut config: Config = toml::from_str(
            r#"
[target]
server = "127.0.0.1:1812"
secret = "testing123"

[credentials]
username = "u"
password = "p"

[ramp]
start_rps = 10
max_rps = 90
slo_ms = 12.5
"#,
        )
        .unwrap();
        config.apply_overrides(&Overrides {
            max_rps: Some(50),
            ..Default::default()
        });
        assert_eq!(config.ramp.start_rps, 10);
        assert_eq!(config.ramp.step_rps, 100);
        assert_eq!(config.ramp.max_rps, 50);
        assert_eq!(config.ramp.slo_ms, 12.5);
    }

    #[test]
    fn test_example_config_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/example.local.toml");
        let config = Config::from_file(path).unwrap();
        assert!(config.validate().is_ok());
        assert!(config.ramp.validate().is_ok());
        assert!(!config.profile.resolve().unwrap().is_empty());
    }
}
