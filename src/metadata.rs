//! Metadata service contract
//!
//! Views and their freeze/finalize markers travel through a Zookeeper-like
//! watched key/value primitive: sequenced ephemeral children under a
//! parent path, with notifications delivered in sequence order on a single
//! task per session. No ordering is assumed across parent paths.
//!
//! [`MemoryMetadataStore`] implements the contract in-process for tests
//! and embedded deployments.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Result, SharedLogError};

/// A sequenced child notification
#[derive(Debug, Clone)]
pub struct ChildEvent {
    /// Full path of the created child
    pub path: String,
    pub value: Bytes,
    /// Creation sequence, strictly increasing per parent
    pub sequence: u64,
}

/// The operations the log core expects from the metadata service
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Create a sequenced ephemeral child under `parent`, returning its
    /// full path
    async fn create_ephemeral(&self, parent: &str, value: Bytes) -> Result<String>;

    /// Read a node's value
    async fn get(&self, path: &str) -> Result<Option<Bytes>>;

    /// Watch `parent` for created children. Existing children are replayed
    /// first, then live notifications follow, all in sequence order.
    async fn watch_children(&self, parent: &str) -> Result<mpsc::UnboundedReceiver<ChildEvent>>;
}

#[derive(Debug, Default)]
struct MemoryState {
    /// Children per parent, keyed by sequence
    children: HashMap<String, BTreeMap<u64, (String, Bytes)>>,
    watchers: HashMap<String, Vec<mpsc::UnboundedSender<ChildEvent>>>,
    next_sequence: u64,
}

/// In-process metadata store
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    state: Mutex<MemoryState>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn create_ephemeral(&self, parent: &str, value: Bytes) -> Result<String> {
        if parent.is_empty() || !parent.starts_with('/') {
            return Err(SharedLogError::metadata(format!(
                "invalid parent path: {parent:?}"
            )));
        }
        let mut state = self.state.lock();
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let path = format!("{parent}/n{sequence:010}");
        state
            .children
            .entry(parent.to_string())
            .or_default()
            .insert(sequence, (path.clone(), value.clone()));
        if let Some(watchers) = state.watchers.get_mut(parent) {
            let event = ChildEvent {
                path: path.clone(),
                value,
                sequence,
            };
            watchers.retain(|sender| sender.send(event.clone()).is_ok());
        }
        Ok(path)
    }

    async fn get(&self, path: &str) -> Result<Option<Bytes>> {
        let state = self.state.lock();
        for children in state.children.values() {
            for (child_path, value) in children.values() {
                if child_path == path {
                    return Ok(Some(value.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn watch_children(&self, parent: &str) -> Result<mpsc::UnboundedReceiver<ChildEvent>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        if let Some(children) = state.children.get(parent) {
            for (&sequence, (path, value)) in children {
                // Replay is best-effort: a receiver dropped mid-replay just
                // stops caring.
                let _ = sender.send(ChildEvent {
                    path: path.clone(),
                    value: value.clone(),
                    sequence,
                });
            }
        }
        state
            .watchers
            .entry(parent.to_string())
            .or_default()
            .push(sender);
        Ok(receiver)
    }
}
