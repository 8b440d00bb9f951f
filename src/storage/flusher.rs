//! Background flusher: live tail → backing database
//!
//! The flusher is the only blocking stage of the storage pipeline and it
//! never holds the logspace lock across adapter I/O: it grabs the live
//! tail under a read lock, writes through the adapter, then re-acquires
//! the write lock only to advance the persisted watermark.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error};

use crate::error::Result;
use crate::logspace::LogSpaceHandle;
use crate::storage::db::PersistenceAdapter;
use crate::storage::log_storage::LogStorage;

/// Run one flush round: persist the unpersisted live tail, if any.
/// Returns the number of entries persisted.
pub fn flush_once(
    storage: &LogSpaceHandle<LogStorage>,
    db: &dyn PersistenceAdapter,
) -> Result<usize> {
    let grabbed = storage.read().grab_for_persistence();
    let Some((entries, new_position)) = grabbed else {
        return Ok(0);
    };
    for entry in &entries {
        db.put(entry.metadata.seqnum, entry)?;
    }
    storage.write().log_entries_persisted(new_position);
    debug!(count = entries.len(), new_position, "flushed live tail");
    Ok(entries.len())
}

/// Drive [`flush_once`] on an interval until `shutdown` flips to `true`.
/// Adapter failures are transient: the round is retried next tick and the
/// logspace state is unaffected.
pub async fn run_flusher(
    storage: LogSpaceHandle<LogStorage>,
    db: Arc<dyn PersistenceAdapter>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = flush_once(&storage, db.as_ref()) {
                    error!(%err, "flush round failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    // Final round so a clean shutdown leaves nothing behind.
                    if let Err(err) = flush_once(&storage, db.as_ref()) {
                        error!(%err, "final flush round failed");
                    }
                    return;
                }
            }
        }
    }
}
