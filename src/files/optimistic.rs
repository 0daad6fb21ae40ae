//! Optimistic updates with rollback
//!
//! Every mutation of the file list follows the same three phases: snapshot
//! the affected records, apply the change locally, then run the remote call
//! and restore the snapshot if it fails.

use std::future::Future;
use std::sync::{PoisonError, RwLock};

use tracing::{debug, warn};

use super::state::{FileState, Snapshot};
use crate::api::ApiError;

/// A locally applied change that has not been confirmed yet
///
/// Dropping an unresolved update rolls it back, so an abandoned remote call
/// never leaves unconfirmed state behind.
pub struct OptimisticUpdate<'a> {
    state: &'a RwLock<FileState>,
    snapshot: Option<Snapshot>,
}

impl<'a> OptimisticUpdate<'a> {
    /// Snapshot the records for `ids`, then apply `change`
    pub fn apply<S, F>(state: &'a RwLock<FileState>, ids: &[S], change: F) -> Self
    where
        S: AsRef<str>,
        F: FnOnce(&mut FileState),
    {
        let mut guard = state.write().unwrap_or_else(PoisonError::into_inner);
        let snapshot = guard.snapshot(ids);
        change(&mut guard);
        Self {
            state,
            snapshot: Some(snapshot),
        }
    }

    /// Keep the optimistic change
    pub fn commit(mut self) {
        self.snapshot = None;
    }

    /// Undo the whole change
    pub fn rollback(mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            self.restore(snapshot);
        }
    }

    /// Undo the change for the records matching `predicate` and keep the rest
    pub fn rollback_where(mut self, predicate: impl Fn(&str) -> bool) {
        if let Some(mut snapshot) = self.snapshot.take() {
            let failed = snapshot.take_where(predicate);
            if !failed.is_empty() {
                self.restore(failed);
            }
        }
    }

    fn restore(&self, snapshot: Snapshot) {
        let ids: Vec<&str> = snapshot.ids().collect();
        debug!(ids = ?ids, "Rolling back optimistic update");
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .restore(snapshot);
    }
}

impl Drop for OptimisticUpdate<'_> {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            warn!("Unresolved optimistic update dropped, rolling back");
            self.restore(snapshot);
        }
    }
}

/// Apply `change` to the records in `ids`, run `remote`, and roll back on error
pub async fn optimistic<S, F, Fut, T>(
    state: &RwLock<FileState>,
    ids: &[S],
    change: F,
    remote: Fut,
) -> Result<T, ApiError>
where
    S: AsRef<str>,
    F: FnOnce(&mut FileState),
    Fut: Future<Output = Result<T, ApiError>>,
{
    let update = OptimisticUpdate::apply(state, ids, change);
    match remote.await {
        Ok(value) => {
            update.commit();
            Ok(value)
        }
        Err(e) => {
            update.rollback();
            Err(e)
        }
    }
}
