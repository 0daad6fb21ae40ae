//! File list store
//!
//! The single owner of the visible file set and the UI-facing bookkeeping
//! around it (selection, loading markers, per-operation errors, pagination
//! and quota). Every change goes through [`FileState::dispatch`].

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tracing::trace;

use crate::api::{FileRecord, FileUpdate, ListQuery, OperationError, Pagination, StorageQuota};

/// State transitions of the file store
#[derive(Debug, Clone)]
pub enum FileAction {
    /// A listing arrived from the server
    Loaded {
        files: Vec<FileRecord>,
        pagination: Option<Pagination>,
    },
    /// Listing failed; nothing is shown
    Cleared,
    /// Insert a record, replacing any record with the same id
    Upsert(FileRecord),
    /// Merge a sparse update into one record
    Update { id: String, update: FileUpdate },
    MarkDeleted { id: String, at: DateTime<Utc> },
    MarkRestored { id: String },
    Remove { id: String },
    IncrementDownloads { id: String },
    SetQuery(ListQuery),
    SetStorage(StorageQuota),
    SetLoading { key: String, loading: bool },
    RecordError { key: String, error: OperationError },
    ClearError { key: String },
    ToggleSelect { id: String },
    SelectAll { ids: Vec<String> },
    ClearSelection,
}

/// Prior state of a set of records, used to undo an optimistic change
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    entries: Vec<SnapshotEntry>,
}

#[derive(Debug, Clone, PartialEq)]
struct SnapshotEntry {
    id: String,
    /// Position in the list, if the record existed
    index: Option<usize>,
    record: Option<FileRecord>,
    selected: bool,
}

impl Snapshot {
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.id.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Split off the entries whose id matches `predicate`
    pub fn take_where(&mut self, predicate: impl Fn(&str) -> bool) -> Snapshot {
        let (taken, kept) = self
            .entries
            .drain(..)
            .partition(|entry| predicate(&entry.id));
        self.entries = kept;
        Snapshot { entries: taken }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FileState {
    files: Vec<FileRecord>,
    selected: BTreeSet<String>,
    loading: BTreeSet<String>,
    errors: BTreeMap<String, OperationError>,
    pagination: Pagination,
    storage: Option<StorageQuota>,
    query: ListQuery,
}

impl FileState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatch(&mut self, action: FileAction) {
        trace!(action = action_name(&action), "Dispatching file action");
        match action {
            FileAction::Loaded { files, pagination } => {
                self.files = files;
                if let Some(pagination) = pagination {
                    self.pagination = pagination;
                }
                let ids: BTreeSet<&str> = self.files.iter().map(|f| f.id.as_str()).collect();
                self.selected.retain(|id| ids.contains(id.as_str()));
            }
            FileAction::Cleared => {
                self.files.clear();
                self.selected.clear();
            }
            FileAction::Upsert(record) => match self.position(&record.id) {
                Some(index) => self.files[index] = record,
                None => self.files.insert(0, record),
            },
            FileAction::Update { id, update } => {
                if let Some(record) = self.file_mut(&id) {
                    update.apply_to(record);
                }
            }
            FileAction::MarkDeleted { id, at } => {
                if let Some(record) = self.file_mut(&id) {
                    record.deleted_at = Some(at);
                }
                self.selected.remove(&id);
            }
            FileAction::MarkRestored { id } => {
                if let Some(record) = self.file_mut(&id) {
                    record.deleted_at = None;
                }
            }
            FileAction::Remove { id } => {
                self.files.retain(|f| f.id != id);
                self.selected.remove(&id);
            }
            FileAction::IncrementDownloads { id } => {
                if let Some(record) = self.file_mut(&id) {
                    record.download_count += 1;
                }
            }
            FileAction::SetQuery(query) => self.query = query,
            FileAction::SetStorage(storage) => self.storage = Some(storage),
            FileAction::SetLoading { key, loading } => {
                if loading {
                    self.loading.insert(key);
                } else {
                    self.loading.remove(&key);
                }
            }
            FileAction::RecordError { key, error } => {
                self.errors.insert(key, error);
            }
            FileAction::ClearError { key } => {
                self.errors.remove(&key);
            }
            FileAction::ToggleSelect { id } => {
                if !self.selected.remove(&id) && self.position(&id).is_some() {
                    self.selected.insert(id);
                }
            }
            FileAction::SelectAll { ids } => {
                let all_selected = !ids.is_empty() && ids.iter().all(|id| self.selected.contains(id));
                if all_selected {
                    self.selected.clear();
                } else {
                    self.selected = ids.into_iter().collect();
                }
            }
            FileAction::ClearSelection => self.selected.clear(),
        }
    }

    /// Capture the current records for `ids`
    pub fn snapshot<S: AsRef<str>>(&self, ids: &[S]) -> Snapshot {
        let entries = ids
            .iter()
            .map(|id| {
                let id = id.as_ref();
                let index = self.position(id);
                SnapshotEntry {
                    id: id.to_string(),
                    index,
                    record: index.map(|i| self.files[i].clone()),
                    selected: self.selected.contains(id),
                }
            })
            .collect();
        Snapshot { entries }
    }

    /// Put every captured record back exactly as it was
    ///
    /// Records removed since the snapshot are re-inserted at their old
    /// position; records that did not exist are removed again. Selection
    /// is restored along with the record.
    pub fn restore(&mut self, snapshot: Snapshot) {
        let mut entries = snapshot.entries;
        entries.sort_by_key(|e| e.index);

        for entry in entries {
            if entry.selected && entry.record.is_some() {
                self.selected.insert(entry.id.clone());
            }
            match (entry.record, self.position(&entry.id)) {
                (Some(record), Some(current)) => self.files[current] = record,
                (Some(record), None) => {
                    let index = entry.index.unwrap_or(0).min(self.files.len());
                    self.files.insert(index, record);
                }
                (None, Some(current)) => {
                    self.files.remove(current);
                }
                (None, None) => {}
            }
        }
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.files.iter().position(|f| f.id == id)
    }

    fn file_mut(&mut self, id: &str) -> Option<&mut FileRecord> {
        self.files.iter_mut().find(|f| f.id == id)
    }

    pub fn file(&self, id: &str) -> Option<&FileRecord> {
        self.files.iter().find(|f| f.id == id)
    }

    pub fn files(&self) -> &[FileRecord] {
        &self.files
    }

    /// Records to show, hiding soft-deleted ones unless asked for
    pub fn visible_files(&self, show_deleted: bool) -> Vec<&FileRecord> {
        self.files
            .iter()
            .filter(|f| show_deleted || !f.is_deleted())
            .collect()
    }

    /// Bytes held by active, non-deleted files
    pub fn active_bytes(&self) -> u64 {
        self.files
            .iter()
            .filter(|f| !f.is_deleted())
            .map(|f| f.size_bytes)
            .sum()
    }

    /// Active file count per folder; `None` is the root folder
    pub fn folder_counts(&self) -> BTreeMap<Option<String>, usize> {
        let mut counts = BTreeMap::new();
        for file in self.files.iter().filter(|f| !f.is_deleted()) {
            *counts.entry(file.folder_id.clone()).or_insert(0) += 1;
        }
        counts
    }

    pub fn selected(&self) -> &BTreeSet<String> {
        &self.selected
    }

    pub fn is_loading(&self, key: &str) -> bool {
        self.loading.contains(key)
    }

    pub fn loading(&self) -> &BTreeSet<String> {
        &self.loading
    }

    pub fn errors(&self) -> &BTreeMap<String, OperationError> {
        &self.errors
    }

    pub fn pagination(&self) -> Pagination {
        self.pagination
    }

    pub fn storage(&self) -> Option<StorageQuota> {
        self.storage
    }

    pub fn query(&self) -> &ListQuery {
        &self.query
    }
}

fn action_name(action: &FileAction) -> &'static str {
    match action {
        FileAction::Loaded { .. } => "loaded",
        FileAction::Cleared => "cleared",
        FileAction::Upsert(_) => "upsert",
        FileAction::Update { .. } => "update",
        FileAction::MarkDeleted { .. } => "mark_deleted",
        FileAction::MarkRestored { .. } => "mark_restored",
        FileAction::Remove { .. } => "remove",
        FileAction::IncrementDownloads { .. } => "increment_downloads",
        FileAction::SetQuery(_) => "set_query",
        FileAction::SetStorage(_) => "set_storage",
        FileAction::SetLoading { .. } => "set_loading",
        FileAction::RecordError { .. } => "record_error",
        FileAction::ClearError { .. } => "clear_error",
        FileAction::ToggleSelect { .. } => "toggle_select",
        FileAction::SelectAll { .. } => "select_all",
        FileAction::ClearSelection => "clear_selection",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RawFileRecord;

    fn record(id: &str, size: u64, folder: Option<&str>) -> FileRecord {
        FileRecord::from(RawFileRecord {
            id: id.to_string(),
            name: Some(format!("{id}.pdf")),
            size_bytes: size,
            folder_id: folder.map(str::to_string),
            ..Default::default()
        })
    }

    fn state(ids: &[&str]) -> FileState {
        let mut state = FileState::new();
        state.dispatch(FileAction::Loaded {
            files: ids.iter().map(|id| record(id, 100, None)).collect(),
            pagination: None,
        });
        state
    }

    #[test]
    fn test_upsert_replaces_by_id() {
        let mut state = state(&["a"]);
        let mut renamed = record("a", 100, None);
        renamed.name = "renamed".into();

        state.dispatch(FileAction::Upsert(renamed));
        state.dispatch(FileAction::Upsert(record("b", 1, None)));

        assert_eq!(state.files().len(), 2);
        assert_eq!(state.file("a").unwrap().name, "renamed");
        assert_eq!(state.files()[0].id, "b");
    }

    #[test]
    fn test_restore_reinserts_removed_record_in_place() {
        let mut state = state(&["a", "b", "c"]);
        let before = state.files().to_vec();
        let snapshot = state.snapshot(&["b"]);

        state.dispatch(FileAction::Remove { id: "b".into() });
        assert_eq!(state.files().len(), 2);

        state.restore(snapshot);
        assert_eq!(state.files(), before.as_slice());
    }

    #[test]
    fn test_restore_removes_records_that_did_not_exist() {
        let mut state = state(&["a"]);
        let snapshot = state.snapshot(&["new"]);
        state.dispatch(FileAction::Upsert(record("new", 1, None)));

        state.restore(snapshot);
        assert!(state.file("new").is_none());
        assert_eq!(state.files().len(), 1);
    }

    #[test]
    fn test_restore_reselects_rolled_back_records() {
        let mut state = state(&["a", "b"]);
        state.dispatch(FileAction::ToggleSelect { id: "b".into() });
        let snapshot = state.snapshot(&["a", "b"]);

        for id in ["a", "b"] {
            state.dispatch(FileAction::MarkDeleted {
                id: id.into(),
                at: Utc::now(),
            });
        }
        assert!(state.selected().is_empty());

        state.restore(snapshot);
        assert_eq!(state.selected().iter().collect::<Vec<_>>(), vec!["b"]);
        assert!(!state.file("b").unwrap().is_deleted());
    }

    #[test]
    fn test_take_where_splits_snapshot() {
        let state = state(&["a", "b", "c"]);
        let mut snapshot = state.snapshot(&["a", "b", "c"]);
        let failed = snapshot.take_where(|id| id == "c");

        assert_eq!(failed.ids().collect::<Vec<_>>(), vec!["c"]);
        assert_eq!(snapshot.ids().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_accounting_ignores_deleted_files() {
        let mut state = FileState::new();
        state.dispatch(FileAction::Loaded {
            files: vec![
                record("a", 100, None),
                record("b", 50, Some("docs")),
                record("c", 25, Some("docs")),
            ],
            pagination: None,
        });
        state.dispatch(FileAction::MarkDeleted {
            id: "c".into(),
            at: Utc::now(),
        });

        assert_eq!(state.active_bytes(), 150);
        let counts = state.folder_counts();
        assert_eq!(counts.get(&None), Some(&1));
        assert_eq!(counts.get(&Some("docs".to_string())), Some(&1));
        assert_eq!(state.visible_files(false).len(), 2);
        assert_eq!(state.visible_files(true).len(), 3);
    }

    #[test]
    fn test_selection() {
        let mut state = state(&["a", "b"]);
        state.dispatch(FileAction::ToggleSelect { id: "a".into() });
        state.dispatch(FileAction::ToggleSelect { id: "missing".into() });
        assert_eq!(state.selected().len(), 1);

        let all = vec!["a".to_string(), "b".to_string()];
        state.dispatch(FileAction::SelectAll { ids: all.clone() });
        assert_eq!(state.selected().len(), 2);
        state.dispatch(FileAction::SelectAll { ids: all });
        assert!(state.selected().is_empty());

        state.dispatch(FileAction::ToggleSelect { id: "b".into() });
        state.dispatch(FileAction::MarkDeleted {
            id: "b".into(),
            at: Utc::now(),
        });
        assert!(state.selected().is_empty());
    }

    #[test]
    fn test_reload_drops_stale_selection() {
        let mut state = state(&["a", "b"]);
        state.dispatch(FileAction::ToggleSelect { id: "b".into() });
        state.dispatch(FileAction::Loaded {
            files: vec![record("a", 1, None)],
            pagination: None,
        });
        assert!(state.selected().is_empty());
    }
}
