//! Measurement store: document types and the client seam.
//!
//! Profiling results live in a node-scoped document service. Everything
//! above this seam talks to the [`ProfileStore`] trait; production uses the
//! MongoDB client in [`mongo`], tests use the in-memory store in [`memory`].
//!
//! Documents are never mutated in place: writes upsert on the identity key
//! `(node_name, feature, global_jobid, pressure, run_type)` so re-profiling
//! a workload replaces its rows instead of duplicating them.

pub mod memory;
pub mod mongo;

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::feature;

pub use memory::MemoryStore;
pub use mongo::MongoStore;

/// Synthetic job id for the injector-alone baseline run.
pub const JOB_INJECTOR_SINGLE: i32 = -1;
/// Synthetic job id for the injector-vs-low-injector baseline run.
pub const JOB_INJECTOR_LOW: i32 = -2;
/// Synthetic job id for the injector-vs-high-injector baseline run.
pub const JOB_INJECTOR_HIGH: i32 = -3;

/// `run_type` value for a measurement of the target workload.
pub const RUN_WORKLOAD: &str = "workload";
/// `run_type` value for a measurement of the co-running injector.
pub const RUN_INJECTOR: &str = "injector";

/// One immutable IPC measurement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Measurement {
    pub timestamp: i64,
    pub node_name: String,
    pub feature: String,
    pub feature_id: i32,
    pub feature_type: i32,
    pub global_jobid: i32,
    pub pressure: i32,
    pub run_type: String,
    #[serde(rename = "IPC")]
    pub ipc: f64,
}

impl Measurement {
    /// Build a document, filling catalogue id/type (-1 for synthetic or
    /// auxiliary features) and stamping the current time.
    pub fn new(
        node_name: &str,
        feature: &str,
        global_jobid: i32,
        pressure: i32,
        run_type: &str,
        ipc: f64,
    ) -> Self {
        Measurement {
            timestamp: unix_now(),
            node_name: node_name.to_string(),
            feature: feature.to_string(),
            feature_id: feature::catalogue_id(feature),
            feature_type: feature::type_code(feature),
            global_jobid,
            pressure,
            run_type: run_type.to_string(),
            ipc: (ipc * 1e6).round() / 1e6,
        }
    }

    /// Identity key: every field except `timestamp` and `IPC`.
    pub fn identity(&self) -> (String, String, i32, i32, i32, i32, String) {
        (
            self.node_name.clone(),
            self.feature.clone(),
            self.feature_id,
            self.feature_type,
            self.global_jobid,
            self.pressure,
            self.run_type.clone(),
        )
    }
}

/// Seconds since the epoch.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Per-base-job co-run IPC row from the combination document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CombinationEntry {
    /// IPC of the base job running solo.
    pub single: Option<f64>,
    /// IPC of the base job while the column job runs on the sibling CPU.
    pub pairs: HashMap<i32, f64>,
}

/// The whole per-node combination table: base job → co-run row.
pub type CombinationTable = HashMap<i32, CombinationEntry>;

/// Client seam over the measurement store.
pub trait ProfileStore: Send + Sync {
    /// All measurement documents for `(node, job)`, oldest first.
    fn fetch_profile_data(&self, global_jobid: i32) -> Result<Vec<Measurement>>;

    /// The node's pairwise co-run IPC table.
    fn fetch_combination_data(&self) -> Result<CombinationTable>;

    /// Insert-or-replace on the measurement identity key.
    fn upsert_measurement(&self, doc: &Measurement) -> Result<()>;

    /// Replace the node's combination table.
    fn push_combination(&self, table: &CombinationTable) -> Result<()>;

    /// Record that profiling for a job finished at `timestamp`.
    fn mark_done(&self, global_jobid: i32, timestamp: i64) -> Result<()>;

    /// Wipe the node's measurement and combination data (test tooling).
    fn clear_node(&self) -> Result<()>;
}
