//! Environment-driven configuration, read once at start-up.
//!
//! Everything operational is an environment variable with a deployment
//! default; changing any of them requires a daemon restart.

use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ControlError, Result};
use crate::feature::TargetSet;

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Machine identity used to scope store documents (`NODE_NAME`).
    pub node_name: String,
    /// Measurement store connection string (`PAIRSCHED_STORE_URL`).
    pub store_url: String,
    /// Profiling server `host:port` (`PAIRSCHED_PROFILE_SERVER`).
    pub profile_server: (String, u16),
    /// Directory holding `prediction_model_<ts>.json` files
    /// (`PAIRSCHED_MODEL_DIR`).
    pub model_dir: PathBuf,
    /// Root directory of injector binaries (`PAIRSCHED_INJECTOR_DIR`).
    pub injector_dir: PathBuf,
    /// Directory of `workload_<job>` runner binaries used by combination
    /// measurement (`PAIRSCHED_RUNNER_DIR`).
    pub runner_dir: PathBuf,
    /// Active target features (`PAIRSCHED_TARGET_FEATURES`, comma list).
    pub target: TargetSet,
    /// Warmup windows before each measured window (`PAIRSCHED_WARMUP_COUNT`).
    pub warmup_count: u32,
    /// Length of one measured window in seconds (`PAIRSCHED_SAMPLING_SECS`).
    pub sampling_secs: u64,
    /// Utilization ceiling a profiling session waits under
    /// (`PAIRSCHED_MAX_UTIL`).
    pub max_util: f64,
    /// Job ids used for combination (training) measurement
    /// (`PAIRSCHED_TRAINING_JOBS`, comma list).
    pub training_jobs: Vec<i32>,
    /// Jobs that occupy both siblings of a core on their own
    /// (`PAIRSCHED_MULTI_THREADED_JOBS`, comma list).
    pub multi_threaded_jobs: HashSet<i32>,
    /// Seconds before the kernel flags a process group as long-running
    /// (`PAIRSCHED_LONG_RUNNING_SECS`).
    pub long_running_secs: i32,
    /// Telemetry window between shared-memory sweeps
    /// (`PAIRSCHED_TELEMETRY_SECS`).
    pub telemetry_secs: u64,
    /// Profile-request worker pool size (`PAIRSCHED_REQUEST_WORKERS`).
    pub request_workers: usize,
    /// Total timeout for one profiling request
    /// (`PAIRSCHED_REQUEST_TIMEOUT_SECS`).
    pub request_timeout: Duration,
    /// Quiescence window drained after a profile completion before the
    /// score table refreshes (`PAIRSCHED_BATCH_WINDOW_SECS`).
    pub batch_window: Duration,
}

impl Config {
    /// Read the full configuration from the environment.
    pub fn from_env() -> Result<Self> {
        let node_name = std::env::var("NODE_NAME")
            .map_err(|_| ControlError::Config("NODE_NAME is not set".into()))?;

        let profile_server = parse_host_port(&env_or(
            "PAIRSCHED_PROFILE_SERVER",
            "127.0.0.1:8080".to_string(),
        )?)?;

        let target = match std::env::var("PAIRSCHED_TARGET_FEATURES") {
            Ok(list) => TargetSet::from_names(&split_list(&list))?,
            Err(_) => TargetSet::default_set(),
        };

        Ok(Config {
            node_name,
            store_url: env_or("PAIRSCHED_STORE_URL", "mongodb://127.0.0.1:27017".to_string())?,
            profile_server,
            model_dir: PathBuf::from(env_or(
                "PAIRSCHED_MODEL_DIR",
                "trained_model".to_string(),
            )?),
            injector_dir: PathBuf::from(env_or(
                "PAIRSCHED_INJECTOR_DIR",
                "injector".to_string(),
            )?),
            runner_dir: PathBuf::from(env_or(
                "PAIRSCHED_RUNNER_DIR",
                "target_workload_runners".to_string(),
            )?),
            target,
            warmup_count: env_or("PAIRSCHED_WARMUP_COUNT", 6u32)?,
            sampling_secs: env_or("PAIRSCHED_SAMPLING_SECS", 10u64)?,
            max_util: env_or("PAIRSCHED_MAX_UTIL", 0.5f64)?,
            training_jobs: parse_job_list(&env_or(
                "PAIRSCHED_TRAINING_JOBS",
                String::new(),
            )?)?,
            multi_threaded_jobs: parse_job_list(&env_or(
                "PAIRSCHED_MULTI_THREADED_JOBS",
                String::new(),
            )?)?
            .into_iter()
            .collect(),
            long_running_secs: env_or("PAIRSCHED_LONG_RUNNING_SECS", 10i32)?,
            telemetry_secs: env_or("PAIRSCHED_TELEMETRY_SECS", 30u64)?,
            request_workers: env_or("PAIRSCHED_REQUEST_WORKERS", 32usize)?,
            request_timeout: Duration::from_secs(env_or(
                "PAIRSCHED_REQUEST_TIMEOUT_SECS",
                60u64,
            )?),
            batch_window: Duration::from_secs(env_or("PAIRSCHED_BATCH_WINDOW_SECS", 5u64)?),
        })
    }

    /// Warmup time in seconds before a measured window.
    pub fn warmup_secs(&self) -> u64 {
        self.sampling_secs * self.warmup_count as u64
    }
}

/// Read `key`, falling back to `default`, parsing into `T`.
fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ControlError::Config(format!("{key}={raw:?} does not parse"))),
        Err(_) => Ok(default),
    }
}

/// Split a comma list, dropping empty entries.
fn split_list(raw: &str) -> Vec<&str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty()).collect()
}

/// Parse a comma-separated job id list such as `"3,7,12"`.
pub fn parse_job_list(raw: &str) -> Result<Vec<i32>> {
    split_list(raw)
        .into_iter()
        .map(|tok| {
            tok.parse::<i32>()
                .map_err(|_| ControlError::Config(format!("bad job id {tok:?}")))
        })
        .collect()
}

/// Parse `host:port`.
pub fn parse_host_port(raw: &str) -> Result<(String, u16)> {
    let (host, port) = raw
        .rsplit_once(':')
        .ok_or_else(|| ControlError::Config(format!("expected host:port, got {raw:?}")))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| ControlError::Config(format!("bad port in {raw:?}")))?;
    if host.is_empty() {
        return Err(ControlError::Config(format!("empty host in {raw:?}")));
    }
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_list_parses() {
        assert_eq!(parse_job_list("").unwrap(), Vec::<i32>::new());
        assert_eq!(parse_job_list("3, 7,12").unwrap(), vec![3, 7, 12]);
        assert!(parse_job_list("3,x").is_err());
    }

    #[test]
    fn host_port_parses() {
        assert_eq!(
            parse_host_port("192.168.0.20:8080").unwrap(),
            ("192.168.0.20".to_string(), 8080)
        );
        assert!(parse_host_port("no-port").is_err());
        assert!(parse_host_port(":8080").is_err());
        assert!(parse_host_port("h:99999").is_err());
    }
}
