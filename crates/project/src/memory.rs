use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::{check_put, ProjectId, ProjectRecord, ProjectStore, ProjectSummary};

/// Non-durable store for tests and throwaway sessions.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<ProjectId, (ProjectRecord, i64)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl ProjectStore for MemoryStore {
    fn put(&self, id: &ProjectId, record: &ProjectRecord) -> Result<()> {
        check_put(id, record)?;
        let now = chrono::Utc::now().timestamp_millis();
        self.records
            .lock()
            .insert(id.clone(), (record.clone(), now));
        Ok(())
    }

    fn get(&self, id: &ProjectId) -> Result<Option<ProjectRecord>> {
        Ok(self.records.lock().get(id).map(|(r, _)| r.clone()))
    }

    fn delete(&self, id: &ProjectId) -> Result<bool> {
        Ok(self.records.lock().remove(id).is_some())
    }

    fn list(&self) -> Result<Vec<ProjectSummary>> {
        let records = self.records.lock();
        let mut out: Vec<ProjectSummary> = records
            .iter()
            .map(|(id, (r, updated_at))| ProjectSummary {
                id: id.clone(),
                name: r.name.clone(),
                frame_count: r.frame_count,
                last_success_frame: r.last_success_frame,
                updated_at: *updated_at,
            })
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ImageBlob;

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        let mut record = ProjectRecord {
            name: "loop".to_string(),
            frame_count: 2,
            frames: vec![ImageBlob::from_bytes(vec![1])],
            last_success_frame: 1,
            ..Default::default()
        };
        let id = record.ensure_id().clone();
        store.put(&id, &record).unwrap();
        assert_eq!(store.get(&id).unwrap(), Some(record));
        assert_eq!(store.list().unwrap()[0].name, "loop");
        assert!(store.delete(&id).unwrap());
        assert!(store.is_empty());
    }

    #[test]
    fn test_memory_store_rejects_gaps() {
        let store = MemoryStore::new();
        let mut record = ProjectRecord {
            frame_count: 2,
            last_success_frame: 2,
            ..Default::default()
        };
        let id = record.ensure_id().clone();
        assert!(store.put(&id, &record).is_err());
        assert_eq!(store.len(), 0);
    }
}
