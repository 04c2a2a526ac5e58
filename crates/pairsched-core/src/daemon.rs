//! The long-running controller: thread wiring, batching, telemetry, and
//! rescheduling.
//!
//! Roles (all plain threads, coordinated over one mpsc channel):
//! - *kernel reader*: blocks on netlink receive, forwards detection events;
//! - *request workers*: the bounded pool in [`crate::orchestrator`], the
//!   only place that blocks on the profiling server;
//! - *completion drainer*: this thread. It applies the first-touch state
//!   machine, batches a quiescence window after ingests, refreshes the
//!   score table, and replans affinity;
//! - *telemetry*: folded into the drainer; periodic shared-memory sweeps
//!   with a counter reset at the end of each window.
//!
//! All score state is written by the drainer only; everything else reads
//! snapshots. Nothing suspends while holding the score-table lock.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, channel};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::affinity;
use crate::config::Config;
use crate::error::Result;
use crate::kctl::{NetlinkSocket, RuntimeMonitor};
use crate::model::PredictionModel;
use crate::orchestrator::{ControlEvent, Orchestrator, RequestPool};
use crate::profiler::ProfileClient;
use crate::score::ScoreTable;
use crate::shm::ShmReader;
use crate::store::{MongoStore, ProfileStore};
use crate::topology::Topology;

/// How often the drainer wakes to poll shutdown and the telemetry clock.
const DRAIN_TICK: Duration = Duration::from_millis(200);

/// Netlink receive timeout; bounds reader-thread shutdown latency.
const NETLINK_POLL: Duration = Duration::from_secs(1);

/// The daemon context: owns every component for its whole lifetime.
pub struct Controller {
    cfg: Config,
    topology: Topology,
    orchestrator: Arc<Orchestrator>,
    table: Arc<RwLock<ScoreTable>>,
    netlink: Arc<NetlinkSocket>,
    monitor: RuntimeMonitor,
    shm: Mutex<ShmReader>,
    pool: RequestPool,
    events_tx: Sender<ControlEvent>,
    events_rx: Receiver<ControlEvent>,
}

impl Controller {
    /// Bring up every component. Fatal on missing model, unreachable store,
    /// or absent kernel devices.
    pub fn new(cfg: Config) -> Result<Self> {
        let (model, model_path) = PredictionModel::load_latest(&cfg.model_dir, &cfg.target)?;
        info!("loaded prediction model {}", model_path.display());

        let topology = Topology::detect()?;
        info!(
            "topology: {} logical cpus, {} SMT pairs",
            topology.cpus().len(),
            topology.smt_pairs().len()
        );

        let store: Arc<dyn ProfileStore> =
            Arc::new(MongoStore::connect(&cfg.store_url, &cfg.node_name)?);
        let table = Arc::new(RwLock::new(ScoreTable::new(cfg.target.clone(), model)));
        let orchestrator =
            Arc::new(Orchestrator::new(store, cfg.target.clone(), Arc::clone(&table)));

        let monitor = RuntimeMonitor::open()?;
        monitor.set_long_running_threshold(cfg.long_running_secs)?;
        monitor.set_data_loader(std::process::id() as i32)?;
        let netlink = Arc::new(NetlinkSocket::open(NETLINK_POLL)?);
        let shm = Mutex::new(ShmReader::open()?);

        let (events_tx, events_rx) = channel();
        let client = ProfileClient::new(
            &cfg.profile_server.0,
            cfg.profile_server.1,
            cfg.request_timeout,
        );
        let pool = RequestPool::new(cfg.request_workers, client, events_tx.clone());

        Ok(Controller {
            cfg,
            topology,
            orchestrator,
            table,
            netlink,
            monitor,
            shm,
            pool,
            events_tx,
            events_rx,
        })
    }

    /// Run until `shutdown` flips. Blocks the calling thread (it becomes the
    /// completion drainer).
    pub fn run(self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let reader = self.spawn_kernel_reader(Arc::clone(&shutdown));
        info!(
            "controller up: node {}, threshold {}s, {} request workers",
            self.cfg.node_name, self.cfg.long_running_secs, self.cfg.request_workers
        );

        let mut next_sweep = Instant::now() + Duration::from_secs(self.cfg.telemetry_secs);
        let mut population: HashSet<i32> = HashSet::new();

        while !shutdown.load(Ordering::Relaxed) {
            match self.events_rx.recv_timeout(DRAIN_TICK) {
                Ok(event) => {
                    if self.dispatch(event) {
                        self.drain_batch(&shutdown);
                        self.refresh_and_reschedule();
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if Instant::now() >= next_sweep {
                self.telemetry_sweep(&mut population);
                next_sweep = Instant::now() + Duration::from_secs(self.cfg.telemetry_secs);
            }
        }

        info!("controller shutting down");
        drop(self.pool); // joins request workers
        let _ = reader.join();
        Ok(())
    }

    fn spawn_kernel_reader(&self, shutdown: Arc<AtomicBool>) -> JoinHandle<()> {
        let netlink = Arc::clone(&self.netlink);
        let tx = self.events_tx.clone();
        std::thread::Builder::new()
            .name("kernel-reader".into())
            .spawn(move || {
                while !shutdown.load(Ordering::Relaxed) {
                    match netlink.recv_event() {
                        Ok(Some(event)) => {
                            debug!("kernel event: {event:?}");
                            if tx.send(ControlEvent::Kernel(event)).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {} // poll timeout
                        Err(err) => {
                            // Transient by policy: log and keep listening.
                            warn!("kernel reader: {err}");
                        }
                    }
                }
            })
            .expect("spawn kernel reader")
    }

    /// Apply one event; returns whether a profile was ingested (and a batch
    /// window should open).
    fn dispatch(&self, event: ControlEvent) -> bool {
        let step = self.orchestrator.handle(event);
        if let Some(job) = step.submit {
            self.pool.submit(job);
        }
        for pgid in &step.acks {
            self.netlink.send_ack(*pgid);
        }
        step.ingested.is_some()
    }

    /// Quiescence window: keep draining events for `batch_window` so a burst
    /// of completions lands in one refresh.
    fn drain_batch(&self, shutdown: &AtomicBool) {
        let deadline = Instant::now() + self.cfg.batch_window;
        while !shutdown.load(Ordering::Relaxed) {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                break;
            };
            match self.events_rx.recv_timeout(remaining.min(DRAIN_TICK)) {
                Ok(event) => {
                    self.dispatch(event);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if Instant::now() >= deadline {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn refresh_and_reschedule(&self) {
        let recomputed = self.table.write().unwrap().refresh();
        debug!("refresh recomputed {recomputed} pair(s)");
        self.reschedule();
    }

    /// Plan and apply sibling affinity from the current telemetry and score
    /// snapshot. Best-effort end to end.
    pub fn reschedule(&self) {
        let slots = self.shm.lock().unwrap().active_slots();
        let snapshot = self.table.read().unwrap().snapshot();
        let groups = affinity::eligible_groups(&slots, &snapshot);
        if groups.is_empty() {
            debug!("reschedule: no eligible process groups");
            return;
        }
        let plan = affinity::plan(
            &groups,
            &snapshot,
            &self.topology,
            &self.cfg.multi_threaded_jobs,
        );
        info!("reschedule: {} group(s), {} placement(s)", groups.len(), plan.len());
        affinity::apply(&plan);
    }

    /// One telemetry window: sample live IPCs, replan if the population
    /// shifted, then zero the kernel counters for the next window.
    fn telemetry_sweep(&self, population: &mut HashSet<i32>) {
        let slots = self.shm.lock().unwrap().active_slots();
        for (idx, slot) in &slots {
            debug!(
                "slot {idx}: pgid {} job {} ipc {:.3}",
                slot.pgid,
                slot.global_jobid,
                slot.ipc()
            );
        }

        let current: HashSet<i32> =
            slots.iter().filter(|(_, s)| s.pgid > 0).map(|(_, s)| s.pgid).collect();
        if current != *population {
            debug!(
                "population shifted ({} -> {} groups), replanning",
                population.len(),
                current.len()
            );
            *population = current;
            self.reschedule();
        }

        if let Err(err) = self.shm.lock().unwrap().reset_counters() {
            warn!("telemetry counter reset: {err}");
        }
    }

    /// Drop a job from scoring and stop watching a PGID of it.
    pub fn expire_job(&self, job: i32, pgids: &[i32]) -> Result<()> {
        self.orchestrator.expire(job);
        for &pgid in pgids {
            self.monitor.remove_pgid(pgid)?;
        }
        Ok(())
    }
}
