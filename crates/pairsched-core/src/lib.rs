//! # pairsched-core
//!
//! **SMT-aware co-scheduling control plane.**
//!
//! `pairsched-core` is the controller behind the `pairsched` daemon: it
//! reacts to "workload became long-running" events from a kernel monitor,
//! drives out-of-band profiling of each workload under controlled
//! microarchitectural pressure, derives per-workload characteristic vectors,
//! scores every pair of workloads with a linear interference model, and pins
//! process groups to SMT sibling CPUs so that compatible workloads share a
//! physical core.
//!
//! ## Architecture
//!
//! kernel events → orchestrator → profiling server (TCP) → measurement
//! store → characterization → score table → affinity planner → `sched_setaffinity`
//!
//! Four long-lived roles run as plain threads over one event channel: the
//! netlink kernel reader, a bounded pool of profiling-request workers, the
//! completion drainer (the only writer of score state), and the telemetry
//! sweep over the kernel's shared-memory IPC slots.

pub mod affinity;
pub mod characterize;
pub mod config;
pub mod counters;
pub mod daemon;
pub mod error;
pub mod feature;
pub mod injector;
pub mod kctl;
pub mod model;
pub mod orchestrator;
pub mod profiler;
pub mod score;
pub mod shm;
pub mod store;
pub mod topology;

pub use config::Config;
pub use daemon::Controller;
pub use error::{ControlError, Result};
pub use feature::{FeatureKind, TargetSet};
pub use score::{ScoreSnapshot, ScoreTable};
pub use store::{MemoryStore, MongoStore, ProfileStore};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
