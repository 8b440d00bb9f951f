//! Logspace handles, collections, and future-request holding
//!
//! Per-logspace state lives behind a read/write-lockable handle. A
//! collection maps logspace ids to handles under its own short-lived lock:
//! callers fetch the handle, release the collection lock, then lock the
//! handle for the duration of one operation. Operations never block on I/O
//! while holding a handle lock.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::warn;

use crate::error::{Result, SharedLogError};
use crate::protocol::SharedLogMessage;
use crate::types::{logspace_id_to_view_id, LogSpaceId, ViewId};

/// Lifecycle state of a logspace at any participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogSpaceState {
    /// Accepting progress and cuts
    #[default]
    Normal,
    /// No longer accepting cuts; still serving reads
    Frozen,
    /// Sealed at a definite boundary
    Finalized,
}

/// Shared, lockable handle to per-logspace state
pub type LogSpaceHandle<T> = Arc<RwLock<T>>;

/// A map of logspaces keyed by id, lock-protected independently of the
/// logspaces themselves
#[derive(Debug)]
pub struct LogSpaceCollection<T> {
    inner: Mutex<HashMap<LogSpaceId, LogSpaceHandle<T>>>,
}

impl<T> LogSpaceCollection<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Install a logspace, returning its handle. Installing an id twice is
    /// a caller bug.
    pub fn install(&self, logspace_id: LogSpaceId, logspace: T) -> LogSpaceHandle<T> {
        let handle = Arc::new(RwLock::new(logspace));
        let previous = self
            .inner
            .lock()
            .insert(logspace_id, Arc::clone(&handle));
        if previous.is_some() {
            warn!(logspace_id = format_args!("{logspace_id:#010x}"), "logspace reinstalled");
        }
        handle
    }

    pub fn get(&self, logspace_id: LogSpaceId) -> Option<LogSpaceHandle<T>> {
        self.inner.lock().get(&logspace_id).cloned()
    }

    /// Fetch a handle that must exist (traffic for it was already admitted)
    pub fn get_checked(&self, logspace_id: LogSpaceId) -> Result<LogSpaceHandle<T>> {
        self.get(logspace_id)
            .ok_or(SharedLogError::LogSpaceNotFound(logspace_id))
    }

    /// Handles of the logspaces belonging to one view
    pub fn for_view(&self, view_id: ViewId) -> Vec<(LogSpaceId, LogSpaceHandle<T>)> {
        self.inner
            .lock()
            .iter()
            .filter(|(id, _)| logspace_id_to_view_id(**id) == view_id)
            .map(|(id, handle)| (*id, Arc::clone(handle)))
            .collect()
    }
}

impl<T> Default for LogSpaceCollection<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A message held for a view that is not installed yet
#[derive(Debug, Clone)]
pub struct SharedLogRequest {
    pub message: SharedLogMessage,
    pub payload: Bytes,
}

impl SharedLogRequest {
    pub fn new(message: SharedLogMessage, payload: Bytes) -> Self {
        Self { message, payload }
    }
}

/// Requests on hold for future views, keyed by view id and replayed when
/// that view is installed
#[derive(Debug, Default)]
pub struct FutureRequests {
    next_view_id: ViewId,
    onhold: HashMap<ViewId, Vec<SharedLogRequest>>,
}

impl FutureRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a view. Requests held for it move into `ready`; passing
    /// `None` asserts that nothing was on hold (the caller does not
    /// participate in this view) and fails otherwise.
    pub fn on_new_view(
        &mut self,
        view_id: ViewId,
        ready: Option<&mut Vec<SharedLogRequest>>,
    ) -> Result<()> {
        if view_id < self.next_view_id {
            return Err(SharedLogError::violation(format!(
                "view {} installed after view {}",
                view_id, self.next_view_id
            )));
        }
        self.next_view_id = view_id + 1;
        let held = self.onhold.remove(&view_id).unwrap_or_default();
        match ready {
            Some(ready) => ready.extend(held),
            None => {
                if !held.is_empty() {
                    return Err(SharedLogError::violation(format!(
                        "{} requests on hold for view {} with no handler",
                        held.len(),
                        view_id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Hold a request until its view is installed
    pub fn on_hold_request(&mut self, request: SharedLogRequest) {
        let view_id = request.message.view_id;
        if view_id < self.next_view_id {
            warn!(
                view_id,
                current = self.next_view_id.saturating_sub(1),
                "dropping on-hold request for installed view"
            );
            return;
        }
        self.onhold.entry(view_id).or_default().push(request);
    }

    /// Number of requests currently on hold
    pub fn held(&self) -> usize {
        self.onhold.values().map(Vec::len).sum()
    }
}
