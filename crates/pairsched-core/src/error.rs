//! Error taxonomy for the co-scheduling controller.
//!
//! Runtime errors are almost all non-fatal: the daemon logs them and keeps
//! going, because the kernel re-raises events and the profiling pipeline is
//! retried on the next touch. The only fatal conditions are start-up ones
//! (no prediction model, bad configuration).

use std::io;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ControlError>;

/// All error kinds the controller distinguishes.
#[derive(Error, Debug)]
pub enum ControlError {
    /// The host ISA has no known `perf_event_open` syscall number.
    #[error("unsupported architecture '{0}' (no perf_event_open syscall number)")]
    UnsupportedArch(&'static str),

    /// Netlink recv error, ioctl EINTR, or similar kernel I/O hiccup.
    /// Loggable; the caller loops.
    #[error("transient kernel I/O: {0}")]
    TransientKernelIo(String),

    /// A netlink payload that does not parse as `"pgid,elapsed,jobid"`.
    #[error("malformed kernel event payload: {0:?}")]
    BadEvent(String),

    /// A measurement document required for characterization is absent.
    /// The job is skipped this pass; the next kernel touch retries.
    #[error("job {job}: missing measurement {what}")]
    MissingMeasurement { job: i32, what: String },

    /// No `prediction_model_<timestamp>.json` under the model directory.
    /// Fatal at start-up.
    #[error("no prediction model found under {0} (train and deploy a model first)")]
    ModelNotFound(String),

    /// A model file exists but its contents are unusable.
    #[error("prediction model rejected: {0}")]
    ModelInvalid(String),

    /// The measurement store cannot be reached. Characterization callers
    /// treat this like a missing measurement and retry later.
    #[error("measurement store unavailable: {0}")]
    StoreUnavailable(String),

    /// An out-of-band profiling request did not complete.
    #[error("profile request for job {job} failed: {reason}")]
    ProfileRequestFailed { job: i32, reason: String },

    /// A shared-memory slot kept tearing under the seqlock protocol.
    /// The slot is skipped for this telemetry cycle.
    #[error("slot {0} torn repeatedly during seqlock read")]
    SeqlockInconsistent(usize),

    /// CPU affinity could not be applied to a process group. Logged per
    /// PGID; never escalated.
    #[error("failed to apply affinity to pgid {pgid}: {reason}")]
    AffinityApplyFailed { pgid: i32, reason: String },

    /// Bad or missing environment configuration. Fatal at start-up.
    #[error("configuration: {0}")]
    Config(String),

    /// Plain I/O error (device files, sysfs, model files).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<mongodb::error::Error> for ControlError {
    fn from(err: mongodb::error::Error) -> Self {
        ControlError::StoreUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for ControlError {
    fn from(err: serde_json::Error) -> Self {
        ControlError::ModelInvalid(err.to_string())
    }
}
