//! Affinity planning: which PGIDs share which physical core.
//!
//! The planner pairs live process groups onto SMT sibling CPUs so that the
//! summed symbiotic score of the chosen pairs is high. Greedy matching on
//! descending pair score is used: deterministic, O(n² log n), and within a
//! factor two of the optimum, which is well inside the noise of the
//! prediction model. Multi-threaded jobs take both siblings of a core for
//! themselves and are placed first.
//!
//! Applying a plan is strictly best-effort: affinity failures on individual
//! tasks are logged and skipped, since racing against process exit is
//! routine here.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;

use log::{debug, warn};

use crate::error::{ControlError, Result};
use crate::score::ScoreSnapshot;
use crate::shm::SlotSample;
use crate::topology::Topology;

/// One live process group eligible for placement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiveGroup {
    pub pgid: i32,
    pub job: i32,
    /// Live IPC from the kernel's shared-memory slot.
    pub ipc: f64,
}

/// A planned placement: pin every task of `pgid` to `cpus`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub pgid: i32,
    pub cpus: Vec<u32>,
}

/// Select the live groups worth planning: positive PGID and a job the score
/// table knows. Groups with unknown jobs are left wherever they run.
pub fn eligible_groups(slots: &[(usize, SlotSample)], scores: &ScoreSnapshot) -> Vec<LiveGroup> {
    let mut seen = HashSet::new();
    slots
        .iter()
        .filter(|(_, s)| s.pgid > 0 && scores.is_active(s.global_jobid))
        .filter(|(_, s)| seen.insert(s.pgid))
        .map(|(_, s)| LiveGroup { pgid: s.pgid, job: s.global_jobid, ipc: s.ipc() })
        .collect()
}

/// Compute a sibling-pair assignment for `groups` over the machine's SMT
/// cores, maximising summed pair scores greedily.
pub fn plan(
    groups: &[LiveGroup],
    scores: &ScoreSnapshot,
    topology: &Topology,
    multi_threaded: &HashSet<i32>,
) -> Vec<Assignment> {
    let mut cores: Vec<[u32; 2]> = topology.smt_pairs().iter().map(|(_, cpus)| *cpus).collect();
    cores.reverse(); // pop() hands cores out in ascending order
    let mut assignments = Vec::new();

    // Multi-threaded jobs cannot share a core with anyone: give each group a
    // whole core first, busiest first.
    let (mut wide, mut narrow): (Vec<LiveGroup>, Vec<LiveGroup>) = groups
        .iter()
        .copied()
        .partition(|g| multi_threaded.contains(&g.job));
    wide.sort_by(|a, b| b.ipc.total_cmp(&a.ipc).then(a.pgid.cmp(&b.pgid)));
    for group in wide {
        let Some(core) = cores.pop() else {
            debug!("no core left for multi-threaded pgid {}", group.pgid);
            continue;
        };
        assignments.push(Assignment { pgid: group.pgid, cpus: core.to_vec() });
    }

    // Candidate pairs among the rest, best score first; live IPC breaks ties
    // toward keeping busy groups together.
    narrow.sort_by(|a, b| a.pgid.cmp(&b.pgid));
    let mut pairs = Vec::new();
    for i in 0..narrow.len() {
        for j in (i + 1)..narrow.len() {
            if let Some(score) = scores.score(narrow[i].job, narrow[j].job) {
                pairs.push((score, narrow[i].ipc + narrow[j].ipc, i, j));
            }
        }
    }
    pairs.sort_by(|a, b| {
        b.0.total_cmp(&a.0)
            .then(b.1.total_cmp(&a.1))
            .then((a.2, a.3).cmp(&(b.2, b.3)))
    });

    let mut placed = vec![false; narrow.len()];
    for (_, _, i, j) in pairs {
        if placed[i] || placed[j] || cores.is_empty() {
            continue;
        }
        let Some(core) = cores.pop() else { break };
        placed[i] = true;
        placed[j] = true;
        assignments.push(Assignment { pgid: narrow[i].pgid, cpus: vec![core[0]] });
        assignments.push(Assignment { pgid: narrow[j].pgid, cpus: vec![core[1]] });
    }

    // Leftovers get a core to themselves (both siblings), busiest first.
    let mut rest: Vec<&LiveGroup> = narrow
        .iter()
        .enumerate()
        .filter(|(i, _)| !placed[*i])
        .map(|(_, g)| g)
        .collect();
    rest.sort_by(|a, b| b.ipc.total_cmp(&a.ipc).then(a.pgid.cmp(&b.pgid)));
    for group in rest {
        let Some(core) = cores.pop() else {
            debug!("no core left for pgid {}", group.pgid);
            break;
        };
        assignments.push(Assignment { pgid: group.pgid, cpus: core.to_vec() });
    }

    assignments
}

// ---------------------------------------------------------------------------
// Applying a plan
// ---------------------------------------------------------------------------

/// Pin every member task of each assignment's PGID. Failures are logged per
/// PGID and never escalate.
pub fn apply(assignments: &[Assignment]) {
    for assignment in assignments {
        if let Err(err) = apply_one(assignment) {
            warn!("{err}");
        }
    }
}

fn apply_one(assignment: &Assignment) -> Result<()> {
    let pids = pgid_members(assignment.pgid)?;
    if pids.is_empty() {
        return Err(ControlError::AffinityApplyFailed {
            pgid: assignment.pgid,
            reason: "no member processes".into(),
        });
    }
    let mut applied = 0usize;
    for pid in &pids {
        for tid in tasks_of(*pid) {
            match set_affinity(tid, &assignment.cpus) {
                Ok(()) => applied += 1,
                // Tasks exit under us all the time; note it and move on.
                Err(err) => debug!("pgid {}: tid {tid}: {err}", assignment.pgid),
            }
        }
    }
    debug!(
        "pgid {}: pinned {applied} task(s) to cpus {:?}",
        assignment.pgid, assignment.cpus
    );
    Ok(())
}

/// PIDs whose process group is `pgid`, from a `/proc` walk.
pub fn pgid_members(pgid: i32) -> Result<Vec<i32>> {
    members_under(Path::new("/proc"), pgid)
}

fn members_under(proc_root: &Path, pgid: i32) -> Result<Vec<i32>> {
    let mut members = Vec::new();
    for entry in fs::read_dir(proc_root)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(pid) = name.to_string_lossy().parse::<i32>().ok() else {
            continue;
        };
        let Ok(stat) = fs::read_to_string(entry.path().join("stat")) else {
            continue; // exited while we walked
        };
        if stat_pgrp(&stat) == Some(pgid) {
            members.push(pid);
        }
    }
    members.sort_unstable();
    Ok(members)
}

/// The `pgrp` field of `/proc/<pid>/stat`. The comm field may contain spaces
/// and parentheses, so fields are counted from after the last `)`.
fn stat_pgrp(stat: &str) -> Option<i32> {
    let rest = &stat[stat.rfind(')')? + 1..];
    // rest = " <state> <ppid> <pgrp> ..."
    rest.split_whitespace().nth(2)?.parse().ok()
}

/// Thread ids of one process.
fn tasks_of(pid: i32) -> Vec<i32> {
    let Ok(entries) = fs::read_dir(format!("/proc/{pid}/task")) else {
        return vec![pid];
    };
    let mut tids: Vec<i32> = entries
        .flatten()
        .filter_map(|e| e.file_name().to_string_lossy().parse().ok())
        .collect();
    if tids.is_empty() {
        tids.push(pid);
    }
    tids.sort_unstable();
    tids
}

fn set_affinity(tid: i32, cpus: &[u32]) -> Result<()> {
    // SAFETY: cpu_set_t is POD; zeroed then populated through libc helpers.
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    unsafe { libc::CPU_ZERO(&mut set) };
    for &cpu in cpus {
        // SAFETY: CPU_SET bounds-checks against the set size internally.
        unsafe { libc::CPU_SET(cpu as usize, &mut set) };
    }
    // SAFETY: set is initialized and its size is passed.
    let rc = unsafe {
        libc::sched_setaffinity(tid, std::mem::size_of::<libc::cpu_set_t>(), &set)
    };
    if rc != 0 {
        return Err(ControlError::AffinityApplyFailed {
            pgid: tid,
            reason: io::Error::last_os_error().to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn topo(cores: u32) -> Topology {
        let dir = tempfile::tempdir().unwrap();
        for core in 0..cores {
            for thread in 0..2u32 {
                let cpu = core + thread * cores;
                let path = dir.path().join(format!("cpu{cpu}")).join("topology");
                fs::create_dir_all(&path).unwrap();
                fs::write(path.join("core_id"), core.to_string()).unwrap();
                fs::write(path.join("physical_package_id"), "0").unwrap();
            }
        }
        Topology::from_sysfs(dir.path()).unwrap()
    }

    fn group(pgid: i32, job: i32, ipc: f64) -> LiveGroup {
        LiveGroup { pgid, job, ipc }
    }

    fn cpus_of(assignments: &[Assignment], pgid: i32) -> Vec<u32> {
        assignments.iter().find(|a| a.pgid == pgid).map(|a| a.cpus.clone()).unwrap()
    }

    #[test]
    fn empty_population_plans_nothing() {
        let plan = plan(
            &[],
            &ScoreSnapshot::default(),
            &topo(2),
            &HashSet::new(),
        );
        assert!(plan.is_empty());
    }

    #[test]
    fn best_scoring_pair_shares_a_core() {
        let scores = ScoreSnapshot::from_scores(&[
            (1, 2, 0.4),
            (1, 3, 1.6),
            (2, 3, 0.9),
        ]);
        let groups = [group(100, 1, 1.0), group(200, 2, 1.0), group(300, 3, 1.0)];
        let out = plan(&groups, &scores, &topo(2), &HashSet::new());

        // Jobs 1 and 3 score highest: they take core 0's two siblings.
        assert_eq!(cpus_of(&out, 100), vec![0]);
        assert_eq!(cpus_of(&out, 300), vec![2]);
        // The leftover gets the next core whole.
        assert_eq!(cpus_of(&out, 200), vec![1, 3]);
    }

    #[test]
    fn multi_threaded_jobs_own_both_siblings() {
        let scores = ScoreSnapshot::from_scores(&[(1, 2, 2.0), (1, 1, 2.0), (2, 2, 2.0)]);
        let groups = [group(100, 1, 3.0), group(200, 2, 1.0)];
        let mt: HashSet<i32> = [1].into_iter().collect();
        let out = plan(&groups, &scores, &topo(2), &mt);

        // Job 1 is multi-threaded: a whole core, never paired despite the
        // high pair score.
        assert_eq!(cpus_of(&out, 100), vec![0, 2]);
        assert_eq!(cpus_of(&out, 200), vec![1, 3]);
    }

    #[test]
    fn capacity_limits_are_respected() {
        let scores = ScoreSnapshot::from_scores(&[(1, 2, 1.0), (3, 4, 0.9), (5, 6, 0.8)]);
        let groups: Vec<LiveGroup> =
            (1..=6).map(|j| group(100 + j, j, 1.0)).collect();
        // One SMT core: only the best pair lands.
        let out = plan(&groups, &scores, &topo(1), &HashSet::new());
        assert_eq!(out.len(), 2);
        assert_eq!(cpus_of(&out, 101), vec![0]);
        assert_eq!(cpus_of(&out, 102), vec![1]);
    }

    #[test]
    fn self_pairs_allow_same_job_groups_to_share() {
        let scores = ScoreSnapshot::from_scores(&[(4, 4, 1.9)]);
        let groups = [group(10, 4, 1.0), group(20, 4, 1.0)];
        let out = plan(&groups, &scores, &topo(1), &HashSet::new());
        assert_eq!(cpus_of(&out, 10), vec![0]);
        assert_eq!(cpus_of(&out, 20), vec![1]);
    }

    #[test]
    fn eligibility_filters_dead_and_unknown() {
        let scores = ScoreSnapshot::from_scores(&[(1, 1, 1.0)]);
        let sample = |pgid: i32, job: i32| SlotSample {
            pgid,
            global_jobid: job,
            worker_num: 1,
            cycles: 100,
            instructions: 150,
        };
        let slots = vec![
            (0, sample(100, 1)),
            (1, sample(-1, 1)),  // cleared slot
            (2, sample(200, 9)), // job not scored
            (3, sample(100, 1)), // duplicate pgid
        ];
        let eligible = eligible_groups(&slots, &scores);
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].pgid, 100);
        assert!((eligible[0].ipc - 1.5).abs() < 1e-12);
    }

    #[test]
    fn stat_parsing_survives_hostile_comm() {
        let stat = "1234 (weird name) with) S 1 5678 9999 0 -1";
        assert_eq!(stat_pgrp(stat), Some(5678));
        assert_eq!(stat_pgrp("bogus"), None);
    }

    #[test]
    fn proc_walk_finds_group_members() {
        let dir = tempfile::tempdir().unwrap();
        let write_stat = |pid: i32, pgrp: i32| {
            let p = dir.path().join(pid.to_string());
            fs::create_dir_all(&p).unwrap();
            fs::write(p.join("stat"), format!("{pid} (w) S 1 {pgrp} 1 0 -1")).unwrap();
        };
        write_stat(100, 100);
        write_stat(101, 100);
        write_stat(200, 200);
        fs::create_dir_all(dir.path().join("not-a-pid")).unwrap();
        assert_eq!(members_under(dir.path(), 100).unwrap(), vec![100, 101]);
        assert_eq!(members_under(dir.path(), 999).unwrap(), Vec::<i32>::new());
    }
}
