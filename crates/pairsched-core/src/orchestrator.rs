//! Profile orchestration: the first-touch state machine and the bounded
//! worker pool that performs out-of-band profiling requests.
//!
//! Contract with the kernel: the first detection event for a job submits a
//! profiling request and is deliberately *not* acknowledged. The kernel
//! re-raises on its next sampling window, so acknowledgements ride later
//! events: once the profile completed and its documents ingested, every
//! pending PGID is ACKed and may be registered with IPC monitoring. A
//! request that fails resets the job to untouched; the next event retries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use log::{debug, info, warn};

use crate::characterize::{Baselines, MeasurementIndex, characterize_job};
use crate::error::Result;
use crate::feature::TargetSet;
use crate::kctl::KernelEvent;
use crate::profiler::ProfileClient;
use crate::score::ScoreTable;
use crate::store::ProfileStore;

/// Fan-in event for the completion drainer: kernel detections and profile
/// request outcomes share one channel.
#[derive(Debug, Clone)]
pub enum ControlEvent {
    Kernel(KernelEvent),
    ProfileDone { job: i32 },
    ProfileFailed { job: i32, reason: String },
}

/// What one event handling produced; the caller wires these to the netlink
/// socket and the worker pool.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Step {
    /// PGIDs to acknowledge to the kernel.
    pub acks: Vec<i32>,
    /// Job to hand to the request pool.
    pub submit: Option<i32>,
    /// Job whose characteristics were ingested; the drainer batches a
    /// refresh after seeing one of these.
    pub ingested: Option<i32>,
}

#[derive(Debug, Default)]
struct TouchEntry {
    /// Kernel detection events seen for this job.
    touches: u32,
    /// The profiling request finished successfully.
    completed: bool,
    /// A request is on the worker pool right now.
    in_flight: bool,
    /// PGIDs awaiting acknowledgement, oldest first.
    pending: Vec<i32>,
}

/// The first-touch state machine. Shared between the kernel-event path and
/// the completion drainer, so the touch map sits behind one mutex.
pub struct Orchestrator {
    store: Arc<dyn ProfileStore>,
    target: TargetSet,
    table: Arc<RwLock<ScoreTable>>,
    touch: Mutex<HashMap<i32, TouchEntry>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ProfileStore>,
        target: TargetSet,
        table: Arc<RwLock<ScoreTable>>,
    ) -> Self {
        Orchestrator { store, target, table, touch: Mutex::new(HashMap::new()) }
    }

    pub fn table(&self) -> &Arc<RwLock<ScoreTable>> {
        &self.table
    }

    /// Apply one event to the state machine.
    pub fn handle(&self, event: ControlEvent) -> Step {
        match event {
            ControlEvent::Kernel(ev) => self.handle_kernel(ev),
            ControlEvent::ProfileDone { job } => self.handle_done(job),
            ControlEvent::ProfileFailed { job, reason } => {
                warn!("profile request for job {job} failed: {reason}");
                let mut touch = self.touch.lock().unwrap();
                if let Some(entry) = touch.get_mut(&job) {
                    entry.touches = 0;
                    entry.completed = false;
                    entry.in_flight = false;
                }
                Step::default()
            }
        }
    }

    fn handle_kernel(&self, ev: KernelEvent) -> Step {
        let job = ev.global_jobid;

        // Known job: this is an idempotent reregistration. ACK immediately so
        // the kernel can (re)attach the PGID to IPC monitoring; a profiling
        // request here would be a no-op, so none is made.
        if self.table.read().unwrap().is_active(job) {
            debug!("job {job}: reregistration of pgid {}", ev.pgid);
            return Step { acks: vec![ev.pgid], ..Step::default() };
        }

        let mut touch = self.touch.lock().unwrap();
        let entry = touch.entry(job).or_default();
        if !entry.pending.contains(&ev.pgid) {
            entry.pending.push(ev.pgid);
        }
        entry.touches += 1;

        if entry.touches == 1 {
            if entry.in_flight {
                return Step::default();
            }
            entry.in_flight = true;
            info!(
                "job {job}: first touch by pgid {} after {}s, requesting profile",
                ev.pgid, ev.elapsed
            );
            return Step { submit: Some(job), ..Step::default() };
        }

        if entry.completed {
            return self.finish_touch(&mut touch, job);
        }
        debug!("job {job}: touch {} while profile still pending", entry.touches);
        Step::default()
    }

    fn handle_done(&self, job: i32) -> Step {
        let mut touch = self.touch.lock().unwrap();
        let Some(entry) = touch.get_mut(&job) else {
            debug!("completion for job {job} with no touch state");
            return Step::default();
        };
        entry.completed = true;
        entry.in_flight = false;

        // The ACK rides a kernel event: stay silent until the kernel has
        // asked at least twice, which it will (it re-raises while unacked).
        if entry.touches >= 2 {
            return self.finish_touch(&mut touch, job);
        }
        debug!("job {job}: profile complete, awaiting next kernel touch");
        Step::default()
    }

    /// Ingest the profile documents and release the pending ACKs. On a
    /// missing or unreachable corpus the touch state stays put and the next
    /// kernel event retries.
    fn finish_touch(&self, touch: &mut HashMap<i32, TouchEntry>, job: i32) -> Step {
        match self.ingest(job) {
            Ok(()) => {
                let entry = touch.remove(&job).unwrap_or_default();
                info!(
                    "job {job}: characteristics ingested, acking {} pgid(s)",
                    entry.pending.len()
                );
                Step { acks: entry.pending, ingested: Some(job), ..Step::default() }
            }
            Err(err) => {
                warn!("job {job}: ingest deferred: {err}");
                Step::default()
            }
        }
    }

    fn ingest(&self, job: i32) -> Result<()> {
        let docs = self.store.fetch_profile_data(job)?;
        let index = MeasurementIndex::build(job, &docs);
        let baselines = Baselines::load(self.store.as_ref())?;
        let chars = characterize_job(&self.target, &index, &baselines)?;
        self.table.write().unwrap().add_job(chars);
        Ok(())
    }

    /// Explicit expiry: drop a job from scoring entirely.
    pub fn expire(&self, job: i32) {
        self.touch.lock().unwrap().remove(&job);
        self.table.write().unwrap().expire(job);
    }
}

// ---------------------------------------------------------------------------
// Request worker pool
// ---------------------------------------------------------------------------

/// Bounded pool of threads performing TCP profiling requests. The only part
/// of the controller allowed to block on the profiling server. Outcomes are
/// published onto the drainer's event channel.
pub struct RequestPool {
    job_tx: Option<Sender<i32>>,
    workers: Vec<JoinHandle<()>>,
    queued: Arc<AtomicUsize>,
}

impl RequestPool {
    pub fn new(size: usize, client: ProfileClient, events: Sender<ControlEvent>) -> Self {
        let (job_tx, job_rx) = channel::<i32>();
        let job_rx = Arc::new(Mutex::new(job_rx));
        let queued = Arc::new(AtomicUsize::new(0));

        let workers = (0..size.max(1))
            .map(|i| {
                let job_rx = Arc::clone(&job_rx);
                let queued = Arc::clone(&queued);
                let client = client.clone();
                let events = events.clone();
                std::thread::Builder::new()
                    .name(format!("profile-worker-{i}"))
                    .spawn(move || worker_loop(&job_rx, &queued, &client, &events))
                    .expect("spawn profile worker")
            })
            .collect();

        RequestPool { job_tx: Some(job_tx), workers, queued }
    }

    /// Queue a profiling request.
    pub fn submit(&self, job: i32) {
        if let Some(tx) = &self.job_tx {
            self.queued.fetch_add(1, Ordering::Relaxed);
            let _ = tx.send(job);
        }
    }

    /// Requests queued or running.
    pub fn outstanding(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }
}

fn worker_loop(
    job_rx: &Mutex<Receiver<i32>>,
    queued: &AtomicUsize,
    client: &ProfileClient,
    events: &Sender<ControlEvent>,
) {
    loop {
        // Hold the lock only while dequeuing so workers run requests in
        // parallel.
        let job = match job_rx.lock().unwrap().recv() {
            Ok(job) => job,
            Err(_) => break,
        };
        let outcome = match client.request(job) {
            Ok(()) => ControlEvent::ProfileDone { job },
            Err(err) => ControlEvent::ProfileFailed { job, reason: err.to_string() },
        };
        queued.fetch_sub(1, Ordering::Relaxed);
        if events.send(outcome).is_err() {
            break;
        }
    }
}

impl Drop for RequestPool {
    fn drop(&mut self) {
        // Closing the job channel drains the pool; workers finish their
        // current request and exit.
        self.job_tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::TargetSet;
    use crate::model::PredictionModel;
    use crate::store::{
        JOB_INJECTOR_HIGH, JOB_INJECTOR_LOW, JOB_INJECTOR_SINGLE, Measurement, MemoryStore,
        RUN_INJECTOR, RUN_WORKLOAD,
    };

    const NODE: &str = "test-node";

    fn kernel(pgid: i32, job: i32) -> ControlEvent {
        ControlEvent::Kernel(KernelEvent { pgid, elapsed: 61, global_jobid: job })
    }

    /// Seed a complete profiling corpus (plus injector baselines) for `job`.
    fn seed_profile(store: &MemoryStore, target: &TargetSet, job: i32) {
        let put = |feature: &str, jobid: i32, pressure: i32, run: &str, ipc: f64| {
            store
                .upsert_measurement(&Measurement::new(NODE, feature, jobid, pressure, run, ipc))
                .unwrap();
        };
        put("single", job, 0, RUN_WORKLOAD, 1.5);
        put("l3_cache", job, 1, RUN_WORKLOAD, 1.2);
        for spec in target.iter() {
            for (p, _) in spec.kind.levels().iter().enumerate() {
                let p = p as i32;
                put(spec.name, job, p, RUN_WORKLOAD, 1.4 - 0.2 * p as f64);
                put(spec.name, job, p, RUN_INJECTOR, 1.1 - 0.1 * p as f64);
                put(spec.name, JOB_INJECTOR_SINGLE, p, RUN_INJECTOR, 1.6);
                put(spec.name, JOB_INJECTOR_LOW, p, RUN_INJECTOR, 1.3);
                put(spec.name, JOB_INJECTOR_HIGH, p, RUN_INJECTOR, 0.7);
            }
        }
    }

    fn orchestrator(store: Arc<MemoryStore>) -> Orchestrator {
        let target = TargetSet::from_names(&["int_port", "int_isq", "l1_dcache"]).unwrap();
        let model = PredictionModel::from_parts(vec![0.5, 0.3, 0.3, 0.3], 0.0);
        let table = Arc::new(RwLock::new(ScoreTable::new(target.clone(), model)));
        Orchestrator::new(store, target, table)
    }

    #[test]
    fn first_touch_submits_without_ack() {
        let store = Arc::new(MemoryStore::new(NODE));
        let orch = orchestrator(Arc::clone(&store));
        let step = orch.handle(kernel(1234, 7));
        assert_eq!(step.submit, Some(7));
        assert!(step.acks.is_empty());
        assert!(step.ingested.is_none());

        // A duplicate event while the request is in flight neither resubmits
        // nor acks.
        let step = orch.handle(kernel(1234, 7));
        assert_eq!(step, Step::default());
    }

    #[test]
    fn completion_then_second_touch_ingests_and_acks() {
        let store = Arc::new(MemoryStore::new(NODE));
        let orch = orchestrator(Arc::clone(&store));
        let target = TargetSet::from_names(&["int_port", "int_isq", "l1_dcache"]).unwrap();
        seed_profile(&store, &target, 7);

        orch.handle(kernel(1234, 7));
        // Request completes: controller stays silent.
        let step = orch.handle(ControlEvent::ProfileDone { job: 7 });
        assert_eq!(step, Step::default());
        assert!(!orch.table.read().unwrap().is_active(7));

        // The kernel re-raises: now everything lands.
        let step = orch.handle(kernel(1234, 7));
        assert_eq!(step.acks, vec![1234]);
        assert_eq!(step.ingested, Some(7));
        let table = orch.table.read().unwrap();
        assert!(table.is_active(7));
        assert!((table.single_ipc(7).unwrap() - 1.5).abs() < 1e-12);
    }

    #[test]
    fn second_touch_before_completion_waits_for_completion() {
        let store = Arc::new(MemoryStore::new(NODE));
        let orch = orchestrator(Arc::clone(&store));
        let target = TargetSet::from_names(&["int_port", "int_isq", "l1_dcache"]).unwrap();
        seed_profile(&store, &target, 9);

        orch.handle(kernel(500, 9));
        assert_eq!(orch.handle(kernel(501, 9)), Step::default());
        // Completion arrives after the second touch: ingest fires from the
        // completion and both pgids are released.
        let step = orch.handle(ControlEvent::ProfileDone { job: 9 });
        assert_eq!(step.acks, vec![500, 501]);
        assert_eq!(step.ingested, Some(9));
    }

    #[test]
    fn active_job_events_are_idempotent_reregistrations() {
        let store = Arc::new(MemoryStore::new(NODE));
        let orch = orchestrator(Arc::clone(&store));
        let target = TargetSet::from_names(&["int_port", "int_isq", "l1_dcache"]).unwrap();
        seed_profile(&store, &target, 7);
        orch.handle(kernel(1234, 7));
        orch.handle(ControlEvent::ProfileDone { job: 7 });
        orch.handle(kernel(1234, 7));

        // New PGID of an already-profiled job: immediate ACK, no submission,
        // no state change.
        let step = orch.handle(kernel(4321, 7));
        assert_eq!(step.acks, vec![4321]);
        assert!(step.submit.is_none());
        assert!(step.ingested.is_none());
    }

    #[test]
    fn failed_request_resets_for_retry() {
        let store = Arc::new(MemoryStore::new(NODE));
        let orch = orchestrator(Arc::clone(&store));

        orch.handle(kernel(1234, 7));
        orch.handle(ControlEvent::ProfileFailed { job: 7, reason: "refused".into() });
        // Next kernel event starts over with a fresh submission.
        let step = orch.handle(kernel(1234, 7));
        assert_eq!(step.submit, Some(7));
        assert!(step.acks.is_empty());
    }

    #[test]
    fn missing_documents_defer_ingest_until_seeded() {
        let store = Arc::new(MemoryStore::new(NODE));
        let orch = orchestrator(Arc::clone(&store));
        let target = TargetSet::from_names(&["int_port", "int_isq", "l1_dcache"]).unwrap();

        orch.handle(kernel(1234, 7));
        orch.handle(ControlEvent::ProfileDone { job: 7 });
        // Store has no documents: the touch is consumed but nothing acks.
        let step = orch.handle(kernel(1234, 7));
        assert_eq!(step, Step::default());

        seed_profile(&store, &target, 7);
        let step = orch.handle(kernel(1234, 7));
        assert_eq!(step.acks, vec![1234]);
        assert_eq!(step.ingested, Some(7));
    }

    #[test]
    fn expire_drops_job_from_scoring() {
        let store = Arc::new(MemoryStore::new(NODE));
        let orch = orchestrator(Arc::clone(&store));
        let target = TargetSet::from_names(&["int_port", "int_isq", "l1_dcache"]).unwrap();
        seed_profile(&store, &target, 7);
        orch.handle(kernel(1234, 7));
        orch.handle(ControlEvent::ProfileDone { job: 7 });
        orch.handle(kernel(1234, 7));
        orch.table.write().unwrap().refresh();

        orch.expire(7);
        let table = orch.table.read().unwrap();
        assert!(!table.is_active(7));
        assert!(table.score(7, 7).is_none());
    }

    #[test]
    fn pool_reports_outcomes_on_the_event_channel() {
        // No server listening: every request fails, which is exactly what
        // the drainer should hear about.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let client =
            ProfileClient::new("127.0.0.1", port, std::time::Duration::from_millis(500));
        let (tx, rx) = channel();
        let pool = RequestPool::new(4, client, tx);
        pool.submit(3);
        pool.submit(4);

        let mut failed = Vec::new();
        for _ in 0..2 {
            match rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap() {
                ControlEvent::ProfileFailed { job, .. } => failed.push(job),
                other => panic!("unexpected event {other:?}"),
            }
        }
        failed.sort_unstable();
        assert_eq!(failed, vec![3, 4]);
        assert_eq!(pool.outstanding(), 0);
        drop(pool);
    }
}
