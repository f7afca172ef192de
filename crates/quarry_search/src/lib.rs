//! Adapter to the external search index.
//!
//! The index is a projection of the durable records and can always be
//! rebuilt from them; the core only performs per-entry upserts keyed by
//! entry id and bulk deletes keyed by upload id. Index failures are logged
//! and retried at the next refresh barrier, never fatal to processing.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use quarry_protocol::{EntryId, Result, UploadId};
use tracing::debug;

/// One indexed entry document: the pruned projection of an entry archive.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchDocument {
    pub entry_id: EntryId,
    pub upload_id: UploadId,
    pub payload: serde_json::Value,
}

/// The operations the core issues against the search index.
pub trait SearchGateway: Send + Sync {
    /// Upsert one entry document. `update_materials` keeps the derived
    /// material aggregates consistent with the entry.
    fn index_entry(&self, document: SearchDocument, update_materials: bool) -> Result<()>;

    fn delete_entry(&self, entry_id: &EntryId) -> Result<()>;

    /// Bulk delete of every document of an upload.
    fn delete_upload(&self, upload_id: &UploadId) -> Result<()>;

    /// Barrier: writes submitted before a refresh are observable after it.
    fn refresh(&self) -> Result<()>;
}

/// In-memory index used by tests and single-node deployments.
#[derive(Debug, Default)]
pub struct MemorySearchIndex {
    state: Mutex<MemoryIndexState>,
}

#[derive(Debug, Default)]
struct MemoryIndexState {
    /// Documents visible to queries (past the last refresh).
    visible: HashMap<EntryId, SearchDocument>,
    /// Writes submitted since the last refresh.
    pending: Vec<IndexOp>,
    refresh_count: usize,
    material_updates: usize,
}

#[derive(Debug, Clone)]
enum IndexOp {
    Upsert(SearchDocument),
    DeleteEntry(EntryId),
    DeleteUpload(UploadId),
}

impl MemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryIndexState> {
        self.state.lock().expect("search index lock poisoned")
    }

    /// Entry ids currently visible for an upload.
    pub fn entry_ids(&self, upload_id: &UploadId) -> Vec<EntryId> {
        let state = self.lock();
        let mut ids: Vec<EntryId> = state
            .visible
            .values()
            .filter(|doc| doc.upload_id == *upload_id)
            .map(|doc| doc.entry_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn get(&self, entry_id: &EntryId) -> Option<SearchDocument> {
        self.lock().visible.get(entry_id).cloned()
    }

    pub fn visible_count(&self) -> usize {
        self.lock().visible.len()
    }

    pub fn refresh_count(&self) -> usize {
        self.lock().refresh_count
    }

    pub fn material_updates(&self) -> usize {
        self.lock().material_updates
    }
}

impl SearchGateway for MemorySearchIndex {
    fn index_entry(&self, document: SearchDocument, update_materials: bool) -> Result<()> {
        let mut state = self.lock();
        if update_materials {
            state.material_updates += 1;
        }
        debug!(entry_id = %document.entry_id, "index entry");
        state.pending.push(IndexOp::Upsert(document));
        Ok(())
    }

    fn delete_entry(&self, entry_id: &EntryId) -> Result<()> {
        let mut state = self.lock();
        state.pending.push(IndexOp::DeleteEntry(entry_id.clone()));
        Ok(())
    }

    fn delete_upload(&self, upload_id: &UploadId) -> Result<()> {
        let mut state = self.lock();
        state.pending.push(IndexOp::DeleteUpload(upload_id.clone()));
        Ok(())
    }

    fn refresh(&self) -> Result<()> {
        let mut state = self.lock();
        let pending: Vec<IndexOp> = state.pending.drain(..).collect();
        for op in pending {
            match op {
                IndexOp::Upsert(document) => {
                    state.visible.insert(document.entry_id.clone(), document);
                }
                IndexOp::DeleteEntry(entry_id) => {
                    state.visible.remove(&entry_id);
                }
                IndexOp::DeleteUpload(upload_id) => {
                    state.visible.retain(|_, doc| doc.upload_id != upload_id);
                }
            }
        }
        state.refresh_count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_protocol::generate_entry_id;

    fn document(upload_id: &UploadId, mainfile: &str) -> SearchDocument {
        SearchDocument {
            entry_id: generate_entry_id(upload_id, mainfile),
            upload_id: upload_id.clone(),
            payload: serde_json::json!({"mainfile": mainfile}),
        }
    }

    #[test]
    fn test_writes_visible_after_refresh() {
        let index = MemorySearchIndex::new();
        let upload_id = UploadId::generate();
        let doc = document(&upload_id, "a/template.json");

        index.index_entry(doc.clone(), true).unwrap();
        assert_eq!(index.visible_count(), 0, "not visible before refresh");

        index.refresh().unwrap();
        assert_eq!(index.visible_count(), 1);
        assert_eq!(index.get(&doc.entry_id).unwrap().payload, doc.payload);
        assert_eq!(index.material_updates(), 1);
    }

    #[test]
    fn test_delete_upload_is_bulk() {
        let index = MemorySearchIndex::new();
        let upload_id = UploadId::generate();
        let other_upload = UploadId::generate();

        index.index_entry(document(&upload_id, "a/1.json"), false).unwrap();
        index.index_entry(document(&upload_id, "a/2.json"), false).unwrap();
        index.index_entry(document(&other_upload, "b/1.json"), false).unwrap();
        index.refresh().unwrap();
        assert_eq!(index.visible_count(), 3);

        index.delete_upload(&upload_id).unwrap();
        index.refresh().unwrap();
        assert_eq!(index.visible_count(), 1);
        assert!(index.entry_ids(&upload_id).is_empty());
        assert_eq!(index.entry_ids(&other_upload).len(), 1);
    }

    #[test]
    fn test_upsert_overwrites() {
        let index = MemorySearchIndex::new();
        let upload_id = UploadId::generate();
        let mut doc = document(&upload_id, "a/template.json");

        index.index_entry(doc.clone(), false).unwrap();
        index.refresh().unwrap();

        doc.payload = serde_json::json!({"mainfile": "a/template.json", "processed": true});
        index.index_entry(doc.clone(), false).unwrap();
        index.refresh().unwrap();

        assert_eq!(index.visible_count(), 1);
        assert_eq!(index.get(&doc.entry_id).unwrap().payload["processed"], true);
    }
}
