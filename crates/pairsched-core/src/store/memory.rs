//! In-memory [`ProfileStore`] used by tests and dry runs.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::Result;

use super::{CombinationTable, Measurement, ProfileStore};

/// A store that keeps everything in process memory. Upsert semantics match
/// the document service: identity-keyed replacement, never duplication.
#[derive(Debug, Default)]
pub struct MemoryStore {
    node_name: String,
    measurements: Mutex<Vec<Measurement>>,
    combination: Mutex<CombinationTable>,
    done: Mutex<HashMap<i32, i64>>,
}

impl MemoryStore {
    pub fn new(node_name: &str) -> Self {
        MemoryStore { node_name: node_name.to_string(), ..Default::default() }
    }

    /// Number of stored measurement documents (for assertions).
    pub fn measurement_count(&self) -> usize {
        self.measurements.lock().unwrap().len()
    }

    /// Completion stamp for a job, if recorded.
    pub fn done_stamp(&self, global_jobid: i32) -> Option<i64> {
        self.done.lock().unwrap().get(&global_jobid).copied()
    }
}

impl ProfileStore for MemoryStore {
    fn fetch_profile_data(&self, global_jobid: i32) -> Result<Vec<Measurement>> {
        let mut docs: Vec<Measurement> = self
            .measurements
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.node_name == self.node_name && m.global_jobid == global_jobid)
            .cloned()
            .collect();
        docs.sort_by_key(|m| m.timestamp);
        Ok(docs)
    }

    fn fetch_combination_data(&self) -> Result<CombinationTable> {
        Ok(self.combination.lock().unwrap().clone())
    }

    fn upsert_measurement(&self, doc: &Measurement) -> Result<()> {
        let mut docs = self.measurements.lock().unwrap();
        match docs.iter_mut().find(|m| m.identity() == doc.identity()) {
            Some(existing) => *existing = doc.clone(),
            None => docs.push(doc.clone()),
        }
        Ok(())
    }

    fn push_combination(&self, table: &CombinationTable) -> Result<()> {
        *self.combination.lock().unwrap() = table.clone();
        Ok(())
    }

    fn mark_done(&self, global_jobid: i32, timestamp: i64) -> Result<()> {
        self.done.lock().unwrap().insert(global_jobid, timestamp);
        Ok(())
    }

    fn clear_node(&self) -> Result<()> {
        self.measurements
            .lock()
            .unwrap()
            .retain(|m| m.node_name != self.node_name);
        self.combination.lock().unwrap().clear();
        self.done.lock().unwrap().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(feature: &str, job: i32, pressure: i32, run: &str, ipc: f64) -> Measurement {
        Measurement::new("node-a", feature, job, pressure, run, ipc)
    }

    #[test]
    fn upsert_replaces_on_identity() {
        let store = MemoryStore::new("node-a");
        let first = doc("int_isq", 7, 0, "workload", 1.2);
        store.upsert_measurement(&first).unwrap();
        store.upsert_measurement(&first).unwrap();
        assert_eq!(store.measurement_count(), 1);

        // Same identity, new IPC: replaced, not appended.
        let mut second = first.clone();
        second.ipc = 0.9;
        store.upsert_measurement(&second).unwrap();
        assert_eq!(store.measurement_count(), 1);
        assert_eq!(store.fetch_profile_data(7).unwrap()[0].ipc, 0.9);

        // Different pressure: new document.
        store.upsert_measurement(&doc("int_isq", 7, 1, "workload", 1.0)).unwrap();
        assert_eq!(store.measurement_count(), 2);
    }

    #[test]
    fn fetch_scopes_by_job() {
        let store = MemoryStore::new("node-a");
        store.upsert_measurement(&doc("single", 7, 0, "workload", 1.5)).unwrap();
        store.upsert_measurement(&doc("single", 8, 0, "workload", 1.1)).unwrap();
        let docs = store.fetch_profile_data(7).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].global_jobid, 7);
    }

    #[test]
    fn clear_node_wipes_everything() {
        let store = MemoryStore::new("node-a");
        store.upsert_measurement(&doc("single", 7, 0, "workload", 1.5)).unwrap();
        store.mark_done(7, 1234).unwrap();
        store.clear_node().unwrap();
        assert_eq!(store.measurement_count(), 0);
        assert!(store.done_stamp(7).is_none());
    }
}
