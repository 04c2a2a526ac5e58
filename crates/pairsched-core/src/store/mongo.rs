//! MongoDB-backed [`ProfileStore`].
//!
//! Layout on the wire (database `profile_data`):
//! - `measurement` — one document per IPC sample, upserted on the identity
//!   key so re-profiling replaces rows.
//! - `combination` — one document per node: `{node_name, data: {base:
//!   {"single": ipc, col: ipc, …}}}` with job ids as string keys.
//! - `timestamp` — `{global_jobid, timestamp}` completion stamps, keyed by
//!   job id. Stamps are global (not node-scoped) and survive `clear_node`.

use mongodb::bson::{Bson, Document, doc, to_document};
use mongodb::sync::{Client, Collection};

use crate::error::{ControlError, Result};

use super::{CombinationTable, Measurement, ProfileStore};

pub struct MongoStore {
    node_name: String,
    measurement: Collection<Measurement>,
    combination: Collection<Document>,
    timestamp: Collection<Document>,
}

impl MongoStore {
    /// Connect and bind the node's collections.
    pub fn connect(url: &str, node_name: &str) -> Result<Self> {
        let client = Client::with_uri_str(url)?;
        let db = client.database("profile_data");
        Ok(MongoStore {
            node_name: node_name.to_string(),
            measurement: db.collection("measurement"),
            combination: db.collection("combination"),
            timestamp: db.collection("timestamp"),
        })
    }

    fn identity_filter(doc_: &Measurement) -> Document {
        doc! {
            "node_name": &doc_.node_name,
            "feature": &doc_.feature,
            "feature_id": doc_.feature_id,
            "feature_type": doc_.feature_type,
            "global_jobid": doc_.global_jobid,
            "pressure": doc_.pressure,
            "run_type": &doc_.run_type,
        }
    }
}

fn bson_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Double(f) => Some(*f),
        Bson::Int32(i) => Some(*i as f64),
        Bson::Int64(i) => Some(*i as f64),
        _ => None,
    }
}

impl ProfileStore for MongoStore {
    fn fetch_profile_data(&self, global_jobid: i32) -> Result<Vec<Measurement>> {
        let cursor = self
            .measurement
            .find(doc! { "node_name": &self.node_name, "global_jobid": global_jobid })
            .sort(doc! { "timestamp": 1 })
            .run()?;
        let mut docs = Vec::new();
        for item in cursor {
            docs.push(item?);
        }
        Ok(docs)
    }

    fn fetch_combination_data(&self) -> Result<CombinationTable> {
        let mut table = CombinationTable::new();
        let Some(found) = self
            .combination
            .find_one(doc! { "node_name": &self.node_name })
            .run()?
        else {
            return Ok(table);
        };
        let Ok(data) = found.get_document("data") else {
            return Ok(table);
        };
        for (base_key, value) in data {
            let Ok(base) = base_key.parse::<i32>() else {
                continue;
            };
            let Bson::Document(row) = value else {
                continue;
            };
            let entry = table.entry(base).or_default();
            for (col_key, raw) in row {
                let Some(ipc) = bson_f64(raw) else {
                    continue;
                };
                if col_key == "single" {
                    entry.single = Some(ipc);
                } else if let Ok(col) = col_key.parse::<i32>() {
                    entry.pairs.insert(col, ipc);
                }
            }
        }
        Ok(table)
    }

    fn upsert_measurement(&self, doc_: &Measurement) -> Result<()> {
        let body =
            to_document(doc_).map_err(|e| ControlError::StoreUnavailable(e.to_string()))?;
        self.measurement
            .update_one(Self::identity_filter(doc_), doc! { "$set": body })
            .upsert(true)
            .run()?;
        Ok(())
    }

    fn push_combination(&self, table: &CombinationTable) -> Result<()> {
        let mut data = Document::new();
        for (base, entry) in table {
            let mut row = Document::new();
            if let Some(single) = entry.single {
                row.insert("single", single);
            }
            for (col, ipc) in &entry.pairs {
                row.insert(col.to_string(), *ipc);
            }
            data.insert(base.to_string(), row);
        }
        self.combination
            .update_one(
                doc! { "node_name": &self.node_name },
                doc! { "$set": { "node_name": &self.node_name, "data": data } },
            )
            .upsert(true)
            .run()?;
        Ok(())
    }

    fn mark_done(&self, global_jobid: i32, timestamp: i64) -> Result<()> {
        self.timestamp
            .update_one(
                doc! { "global_jobid": global_jobid },
                doc! { "$set": { "global_jobid": global_jobid, "timestamp": timestamp } },
            )
            .upsert(true)
            .run()?;
        Ok(())
    }

    fn clear_node(&self) -> Result<()> {
        self.measurement
            .delete_many(doc! { "node_name": &self.node_name })
            .run()?;
        self.combination
            .delete_many(doc! { "node_name": &self.node_name })
            .run()?;
        Ok(())
    }
}
