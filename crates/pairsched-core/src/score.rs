//! The symbiotic score table over active jobs.
//!
//! Characteristics are ingested per job; pair scores are recomputed in
//! batches. Jobs whose characteristics changed since the last refresh sit in
//! the stale set, and `refresh()` re-evaluates exactly the pairs that touch
//! it, so model evaluation is amortised over a completion wave instead of
//! running per event.

use std::collections::{HashMap, HashSet};

use log::debug;

use crate::characterize::JobCharacteristics;
use crate::feature::TargetSet;
use crate::model::{PredictionModel, symbiotic};

/// Unordered pair key: `(min, max)`.
fn pair_key(a: i32, b: i32) -> (i32, i32) {
    if a <= b { (a, b) } else { (b, a) }
}

/// Mutable score state. One writer (the completion drainer); readers take
/// [`ScoreSnapshot`]s.
#[derive(Debug)]
pub struct ScoreTable {
    target: TargetSet,
    model: PredictionModel,
    chars: HashMap<i32, JobCharacteristics>,
    stale: HashSet<i32>,
    sym: HashMap<(i32, i32), f64>,
}

impl ScoreTable {
    pub fn new(target: TargetSet, model: PredictionModel) -> Self {
        ScoreTable {
            target,
            model,
            chars: HashMap::new(),
            stale: HashSet::new(),
            sym: HashMap::new(),
        }
    }

    /// Install (or replace) a job's characteristics and mark it stale.
    pub fn add_job(&mut self, chars: JobCharacteristics) {
        let job = chars.job;
        self.chars.insert(job, chars);
        self.stale.insert(job);
    }

    /// Drop a job and its row/column from the score map.
    pub fn expire(&mut self, job: i32) {
        self.chars.remove(&job);
        self.stale.remove(&job);
        self.sym.retain(|(a, b), _| *a != job && *b != job);
    }

    pub fn is_active(&self, job: i32) -> bool {
        self.chars.contains_key(&job)
    }

    /// Active job ids, unordered.
    pub fn active_jobs(&self) -> Vec<i32> {
        self.chars.keys().copied().collect()
    }

    pub fn stale_count(&self) -> usize {
        self.stale.len()
    }

    pub fn single_ipc(&self, job: i32) -> Option<f64> {
        self.chars.get(&job).map(|c| c.single_ipc)
    }

    pub fn scale_factor(&self, job: i32) -> Option<f64> {
        self.chars.get(&job).map(|c| c.scale_factor)
    }

    /// Recompute every pair (self-pairs included) touching the stale set,
    /// then clear it. Returns the number of pairs recomputed.
    pub fn refresh(&mut self) -> usize {
        if self.stale.is_empty() {
            return 0;
        }
        let mut jobs: Vec<i32> = self.chars.keys().copied().collect();
        jobs.sort_unstable();

        let mut recomputed = 0;
        for (i, &a) in jobs.iter().enumerate() {
            for &b in &jobs[i..] {
                if !self.stale.contains(&a) && !self.stale.contains(&b) {
                    continue;
                }
                let score = symbiotic(
                    &self.model,
                    &self.target,
                    &self.chars[&a],
                    &self.chars[&b],
                );
                self.sym.insert(pair_key(a, b), score);
                recomputed += 1;
            }
        }
        debug!("score refresh: {recomputed} pairs over {} jobs", jobs.len());
        self.stale.clear();
        recomputed
    }

    /// Current score of an unordered pair.
    pub fn score(&self, a: i32, b: i32) -> Option<f64> {
        self.sym.get(&pair_key(a, b)).copied()
    }

    /// Read-only copy for the affinity planner.
    pub fn snapshot(&self) -> ScoreSnapshot {
        ScoreSnapshot {
            active: self.chars.keys().copied().collect(),
            sym: self.sym.clone(),
        }
    }
}

/// Immutable view of the score table taken outside the writer lock.
#[derive(Debug, Clone, Default)]
pub struct ScoreSnapshot {
    active: HashSet<i32>,
    sym: HashMap<(i32, i32), f64>,
}

impl ScoreSnapshot {
    pub fn is_active(&self, job: i32) -> bool {
        self.active.contains(&job)
    }

    pub fn score(&self, a: i32, b: i32) -> Option<f64> {
        self.sym.get(&pair_key(a, b)).copied()
    }

    /// Build a snapshot directly (planner tests).
    pub fn from_scores(pairs: &[(i32, i32, f64)]) -> Self {
        let mut snapshot = ScoreSnapshot::default();
        for &(a, b, score) in pairs {
            snapshot.active.insert(a);
            snapshot.active.insert(b);
            snapshot.sym.insert(pair_key(a, b), score);
        }
        snapshot
    }
}
