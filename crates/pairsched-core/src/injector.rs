//! Injector control: driving controlled-pressure helpers during a profiling
//! session, and the combination (training) measurement.
//!
//! This code runs on the profiling host. The target workload itself is
//! launched by the profiling server's worker; this module owns everything
//! around it: warmup pacing, windowed IPC sampling on both siblings,
//! injector child processes pinned to the sibling CPU, and the resulting
//! measurement documents.
//!
//! Injector binaries live under `<root>/<feature>/<feature>.<level>.injector`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::config::Config;
use crate::counters::CounterSet;
use crate::error::{ControlError, Result};
use crate::feature::{self, FeatureKind, Level};
use crate::store::{
    CombinationEntry, CombinationTable, Measurement, ProfileStore, RUN_INJECTOR, RUN_WORKLOAD,
    unix_now,
};

fn level_name(level: Level) -> &'static str {
    match level {
        Level::Low => "low",
        Level::Medium => "medium",
        Level::High => "high",
    }
}

/// The on-disk set of injector binaries.
#[derive(Debug, Clone)]
pub struct InjectorSet {
    root: PathBuf,
}

impl InjectorSet {
    pub fn new(root: &Path) -> Self {
        InjectorSet { root: root.to_path_buf() }
    }

    /// Path of the injector producing `level` pressure on `feature_name`.
    pub fn binary(&self, feature_name: &str, level: Level) -> PathBuf {
        self.root
            .join(feature_name)
            .join(format!("{feature_name}.{}.injector", level_name(level)))
    }
}

/// Spawn `binary` pinned to `cpu`, output discarded.
fn launch_pinned(binary: &Path, cpu: u32) -> Result<Child> {
    use std::os::unix::process::CommandExt;
    let mut cmd = Command::new(binary);
    cmd.stdout(Stdio::null()).stderr(Stdio::null());
    // SAFETY: the pre_exec hook only calls the async-signal-safe
    // sched_setaffinity on the child itself.
    unsafe {
        cmd.pre_exec(move || {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            libc::CPU_SET(cpu as usize, &mut set);
            if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    cmd.spawn().map_err(ControlError::Io)
}

fn terminate(mut child: Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Enable-reset the counters on `cpus`, hold the window, disable, and read
/// one IPC per CPU (in `cpus` order).
fn sample_window(counters: &CounterSet, cpus: &[u32], secs: u64) -> Result<Vec<f64>> {
    for &cpu in cpus {
        counters
            .get(cpu)
            .ok_or_else(|| ControlError::Config(format!("no counter open on cpu {cpu}")))?
            .enable_reset()?;
    }
    sleep(Duration::from_secs(secs));
    let mut ipcs = Vec::with_capacity(cpus.len());
    for &cpu in cpus {
        let counter = counters.get(cpu).expect("checked above");
        counter.disable()?;
        ipcs.push(counter.ipc()?);
    }
    Ok(ipcs)
}

/// Block until 1-minute load over `cpu_count` drops under `max_util`, up to
/// `timeout`. Profiling under a loaded machine measures the load, not the
/// workload.
pub fn wait_for_utilization(max_util: f64, cpu_count: usize, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        match current_utilization(cpu_count) {
            Some(util) if util <= max_util => return,
            Some(util) if Instant::now() >= deadline => {
                warn!("proceeding at utilization {util:.2} > {max_util:.2} (timed out)");
                return;
            }
            None => return,
            _ => sleep(Duration::from_secs(1)),
        }
    }
}

fn current_utilization(cpu_count: usize) -> Option<f64> {
    let raw = fs::read_to_string("/proc/loadavg").ok()?;
    parse_loadavg(&raw).map(|load1| load1 / cpu_count.max(1) as f64)
}

fn parse_loadavg(raw: &str) -> Option<f64> {
    raw.split_whitespace().next()?.parse().ok()
}

// ---------------------------------------------------------------------------
// Profiling session
// ---------------------------------------------------------------------------

/// One out-of-band profiling session for a single target workload that is
/// already running on `cpus[0]`; injectors run on `cpus[1]`.
pub struct ProfileSession<'a> {
    cfg: &'a Config,
    store: &'a dyn ProfileStore,
    counters: &'a CounterSet,
    injectors: InjectorSet,
    cpus: [u32; 2],
}

impl<'a> ProfileSession<'a> {
    pub fn new(
        cfg: &'a Config,
        store: &'a dyn ProfileStore,
        counters: &'a CounterSet,
        cpus: [u32; 2],
    ) -> Self {
        ProfileSession {
            cfg,
            store,
            counters,
            injectors: InjectorSet::new(&cfg.injector_dir),
            cpus,
        }
    }

    fn upsert(&self, feature_name: &str, job: i32, pressure: i32, run: &str, ipc: f64) -> Result<()> {
        self.store.upsert_measurement(&Measurement::new(
            &self.cfg.node_name,
            feature_name,
            job,
            pressure,
            run,
            ipc,
        ))
    }

    /// Run the full measurement choreography for `job`.
    pub fn run(&self, job: i32) -> Result<()> {
        let t = self.cfg.sampling_secs;
        wait_for_utilization(
            self.cfg.max_util,
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            Duration::from_secs(self.cfg.warmup_secs().max(60)),
        );

        info!("job {job}: profiling on cpus {:?}, warmup {}s", self.cpus, self.cfg.warmup_secs());
        sleep(Duration::from_secs(self.cfg.warmup_secs()));

        // Solo IPC first: everything downstream normalizes against it.
        let solo = sample_window(self.counters, &self.cpus[..1], t)?[0];
        self.upsert(feature::SINGLE_FEATURE, job, 0, RUN_WORKLOAD, solo)?;

        for spec in self.cfg.target.iter() {
            for &level in spec.kind.levels() {
                let binary = self.injectors.binary(spec.name, level);
                if !binary.exists() {
                    warn!("job {job}: injector {} missing, skipping", binary.display());
                    continue;
                }
                let pressure = spec.kind.encode(level);
                let child = launch_pinned(&binary, self.cpus[1])?;
                let ipcs = sample_window(self.counters, &self.cpus, t);
                terminate(child);
                let ipcs = ipcs?;
                self.upsert(spec.name, job, pressure, RUN_WORKLOAD, ipcs[0])?;
                self.upsert(spec.name, job, pressure, RUN_INJECTOR, ipcs[1])?;
            }
        }

        // LLC ceiling run: establishes the job's scale factor.
        let l3 = self.injectors.binary(feature::SCALE_FACTOR_FEATURE, Level::High);
        if l3.exists() {
            let pressure = FeatureKind::Parallel.encode(Level::High);
            let child = launch_pinned(&l3, self.cpus[1])?;
            let ipcs = sample_window(self.counters, &self.cpus, t);
            terminate(child);
            let ipcs = ipcs?;
            self.upsert(feature::SCALE_FACTOR_FEATURE, job, pressure, RUN_WORKLOAD, ipcs[0])?;
            self.upsert(feature::SCALE_FACTOR_FEATURE, job, pressure, RUN_INJECTOR, ipcs[1])?;
        } else {
            warn!("job {job}: LLC injector missing, scale factor will be absent");
        }

        self.store.mark_done(job, unix_now())?;
        info!("job {job}: profiling session complete");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Combination (training) measurement
// ---------------------------------------------------------------------------

/// File written by a combination measurement run.
pub const COMBINATION_RESULT_FILE: &str = "combination_measurement_result.json";
/// File read by the push step: the *reviewed* copy of the measured result.
/// Renaming the measured file to this name is a deliberate deploy-time gate.
pub const COMBINATION_TEMP_FILE: &str = "combination_measurement_result_temp.json";

/// Measure solo, self-pair, and cross-pair IPC for every training job on one
/// SMT core. Workload runners are `<runner_dir>/workload_<job>` executables.
pub fn measure_combinations(
    cfg: &Config,
    counters: &CounterSet,
    cpus: [u32; 2],
) -> Result<CombinationTable> {
    let mut table = CombinationTable::new();
    let t = cfg.sampling_secs;
    let warmup = Duration::from_secs(cfg.warmup_secs());
    let runner = |job: i32| cfg.runner_dir.join(format!("workload_{job}"));

    for &job in &cfg.training_jobs {
        info!("combination: measuring job {job} alone");
        let child = launch_pinned(&runner(job), cpus[0])?;
        sleep(warmup);
        let solo = sample_window(counters, &cpus[..1], t);
        terminate(child);
        table.entry(job).or_insert_with(CombinationEntry::default).single = Some(solo?[0]);

        // Same workload on both siblings; multi-threaded jobs spread one
        // process over the core instead of running twice.
        let children = if cfg.multi_threaded_jobs.contains(&job) {
            vec![launch_pinned_wide(&runner(job), cpus)?]
        } else {
            vec![launch_pinned(&runner(job), cpus[0])?, launch_pinned(&runner(job), cpus[1])?]
        };
        sleep(warmup);
        let ipcs = sample_window(counters, &cpus, t);
        for child in children {
            terminate(child);
        }
        let ipcs = ipcs?;
        let mean = (ipcs[0] + ipcs[1]) / 2.0;
        table.entry(job).or_default().pairs.insert(job, mean);
    }

    for (i, &base) in cfg.training_jobs.iter().enumerate() {
        for &col in &cfg.training_jobs[i + 1..] {
            if cfg.multi_threaded_jobs.contains(&base) && cfg.multi_threaded_jobs.contains(&col) {
                // Two wide jobs never share a core; nothing to measure.
                continue;
            }
            info!("combination: measuring jobs {base} and {col} together");
            let a = launch_pinned(&runner(base), cpus[0])?;
            let b = launch_pinned(&runner(col), cpus[1])?;
            sleep(warmup);
            let ipcs = sample_window(counters, &cpus, t);
            terminate(a);
            terminate(b);
            let ipcs = ipcs?;
            table.entry(base).or_default().pairs.insert(col, ipcs[0]);
            table.entry(col).or_default().pairs.insert(base, ipcs[1]);
        }
    }

    Ok(table)
}

fn launch_pinned_wide(binary: &Path, cpus: [u32; 2]) -> Result<Child> {
    use std::os::unix::process::CommandExt;
    let mut cmd = Command::new(binary);
    cmd.stdout(Stdio::null()).stderr(Stdio::null());
    // SAFETY: as in launch_pinned; both siblings land in the mask.
    unsafe {
        cmd.pre_exec(move || {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            for &cpu in &cpus {
                libc::CPU_SET(cpu as usize, &mut set);
            }
            if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    cmd.spawn().map_err(ControlError::Io)
}

/// Serialize a combination table into the store's wire shape: job ids as
/// string keys, solo IPC under `"single"`.
pub fn combination_to_json(table: &CombinationTable) -> serde_json::Value {
    let mut root = serde_json::Map::new();
    let mut bases: Vec<&i32> = table.keys().collect();
    bases.sort();
    for base in bases {
        let entry = &table[base];
        let mut row = serde_json::Map::new();
        if let Some(single) = entry.single {
            row.insert("single".to_string(), single.into());
        }
        let mut cols: Vec<&i32> = entry.pairs.keys().collect();
        cols.sort();
        for col in cols {
            row.insert(col.to_string(), entry.pairs[col].into());
        }
        root.insert(base.to_string(), serde_json::Value::Object(row));
    }
    serde_json::Value::Object(root)
}

/// Parse the wire shape back into a table. Unknown keys are skipped.
pub fn combination_from_json(value: &serde_json::Value) -> Result<CombinationTable> {
    let root = value
        .as_object()
        .ok_or_else(|| ControlError::Config("combination file is not an object".into()))?;
    let mut table = CombinationTable::new();
    for (base_key, row) in root {
        let Ok(base) = base_key.parse::<i32>() else {
            continue;
        };
        let Some(row) = row.as_object() else {
            continue;
        };
        let entry = table.entry(base).or_default();
        for (col_key, ipc) in row {
            let Some(ipc) = ipc.as_f64() else { continue };
            if col_key == "single" {
                entry.single = Some(ipc);
            } else if let Ok(col) = col_key.parse::<i32>() {
                entry.pairs.insert(col, ipc);
            }
        }
    }
    Ok(table)
}

/// Read the reviewed `_temp` result file and push it to the store. Refuses
/// to run when the reviewed copy is absent; writing the `_temp` name is the
/// operator's sign-off.
pub fn push_combination_file(dir: &Path, store: &dyn ProfileStore) -> Result<()> {
    let path = dir.join(COMBINATION_TEMP_FILE);
    let raw = fs::read_to_string(&path).map_err(|_| {
        ControlError::Config(format!(
            "{} not found; review {} and rename it to sign off",
            path.display(),
            COMBINATION_RESULT_FILE
        ))
    })?;
    let table = combination_from_json(&serde_json::from_str(&raw)?)?;
    if table.is_empty() {
        return Err(ControlError::Config("combination file is empty".into()));
    }
    store.push_combination(&table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn injector_paths_follow_layout() {
        let set = InjectorSet::new(Path::new("/opt/injector"));
        assert_eq!(
            set.binary("l1_dcache", Level::High),
            PathBuf::from("/opt/injector/l1_dcache/l1_dcache.high.injector")
        );
        assert_eq!(
            set.binary("int_isq", Level::Medium),
            PathBuf::from("/opt/injector/int_isq/int_isq.medium.injector")
        );
    }

    #[test]
    fn loadavg_parses() {
        assert_eq!(parse_loadavg("0.52 0.58 0.59 1/467 2026\n"), Some(0.52));
        assert_eq!(parse_loadavg(""), None);
    }

    #[test]
    fn combination_json_round_trips_wire_shape() {
        let mut table = CombinationTable::new();
        let entry = table.entry(7).or_default();
        entry.single = Some(1.5);
        entry.pairs.insert(8, 0.9);
        entry.pairs.insert(7, 1.1);
        table.entry(8).or_default().single = Some(2.0);

        let value = combination_to_json(&table);
        assert_eq!(value["7"]["single"], 1.5);
        assert_eq!(value["7"]["8"], 0.9);
        assert_eq!(value["8"]["single"], 2.0);

        let parsed = combination_from_json(&value).unwrap();
        assert_eq!(parsed, table);
    }

    #[test]
    fn push_requires_reviewed_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new("n");
        // Only the raw result exists: push must refuse.
        fs::write(dir.path().join(COMBINATION_RESULT_FILE), "{}").unwrap();
        assert!(push_combination_file(dir.path(), &store).is_err());

        fs::write(
            dir.path().join(COMBINATION_TEMP_FILE),
            r#"{"7": {"single": 1.5, "8": 0.9}}"#,
        )
        .unwrap();
        push_combination_file(dir.path(), &store).unwrap();
        let table = store.fetch_combination_data().unwrap();
        assert_eq!(table[&7].single, Some(1.5));
        assert_eq!(table[&7].pairs[&8], 0.9);
    }

    #[test]
    fn empty_temp_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new("n");
        fs::write(dir.path().join(COMBINATION_TEMP_FILE), "{}").unwrap();
        assert!(push_combination_file(dir.path(), &store).is_err());
    }
}
