//! View manager: publishing views and driving transitions
//!
//! The view manager is a logical function over the metadata service. It
//! publishes view descriptors and freeze/finalize markers as sequenced
//! children of one parent path; subscribers decode the marker stream in
//! sequence order into `Created → Frozen → Finalized` events.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::error::Result;
use crate::metadata::MetadataStore;
use crate::protocol::frames::MetaLogRecord;
use crate::types::{LogSpaceId, ViewId};
use crate::view::{FinalizedView, View, ViewDescriptor};

/// Default parent path for view markers
pub const DEFAULT_VIEWS_PATH: &str = "/sharedlog/views";

/// Serialized finalization marker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizedRecord {
    pub view_id: ViewId,
    pub final_metalog_positions: BTreeMap<LogSpaceId, u32>,
    pub tail_metalogs: BTreeMap<LogSpaceId, Vec<MetaLogRecord>>,
}

/// A marker published under the views path
#[derive(Debug, Clone, Serialize, Deserialize)]
enum ViewMarker {
    Create(ViewDescriptor),
    Freeze { view_id: ViewId },
    Finalize(FinalizedRecord),
}

/// A view transition delivered to subscribers
#[derive(Debug, Clone)]
pub enum ViewEvent {
    Created(Arc<View>),
    Frozen(Arc<View>),
    Finalized(Arc<FinalizedView>),
}

/// Publishes view markers and turns the marker stream into events
pub struct ViewManager {
    store: Arc<dyn MetadataStore>,
    views_path: String,
}

impl ViewManager {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self::with_path(store, DEFAULT_VIEWS_PATH)
    }

    pub fn with_path(store: Arc<dyn MetadataStore>, views_path: impl Into<String>) -> Self {
        Self {
            store,
            views_path: views_path.into(),
        }
    }

    /// Publish a new view descriptor
    pub async fn publish_view(&self, descriptor: &ViewDescriptor) -> Result<()> {
        self.publish(&ViewMarker::Create(descriptor.clone())).await
    }

    /// Publish the freeze marker for a view
    pub async fn freeze_view(&self, view_id: ViewId) -> Result<()> {
        self.publish(&ViewMarker::Freeze { view_id }).await
    }

    /// Publish the authoritative finalization record for a view
    pub async fn finalize_view(&self, record: FinalizedRecord) -> Result<()> {
        self.publish(&ViewMarker::Finalize(record)).await
    }

    async fn publish(&self, marker: &ViewMarker) -> Result<()> {
        let value = Bytes::from(serde_json::to_vec(marker)?);
        self.store.create_ephemeral(&self.views_path, value).await?;
        Ok(())
    }

    /// Subscribe to view transitions. Markers are decoded on a dedicated
    /// task, in sequence order; malformed or out-of-order markers are
    /// logged and skipped so one bad publisher cannot wedge the watcher.
    pub async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<ViewEvent>> {
        let mut children = self.store.watch_children(&self.views_path).await?;
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut known: HashMap<ViewId, Arc<View>> = HashMap::new();
            while let Some(event) = children.recv().await {
                let marker: ViewMarker = match serde_json::from_slice(&event.value) {
                    Ok(marker) => marker,
                    Err(err) => {
                        error!(%err, path = %event.path, "malformed view marker");
                        continue;
                    }
                };
                let view_event = match marker {
                    ViewMarker::Create(descriptor) => match View::new(descriptor) {
                        Ok(view) => {
                            let view = Arc::new(view);
                            known.insert(view.id(), Arc::clone(&view));
                            ViewEvent::Created(view)
                        }
                        Err(err) => {
                            error!(%err, "invalid view descriptor");
                            continue;
                        }
                    },
                    ViewMarker::Freeze { view_id } => match known.get(&view_id) {
                        Some(view) => ViewEvent::Frozen(Arc::clone(view)),
                        None => {
                            warn!(view_id, "freeze marker for unknown view");
                            continue;
                        }
                    },
                    ViewMarker::Finalize(record) => match known.get(&record.view_id) {
                        Some(view) => ViewEvent::Finalized(Arc::new(FinalizedView::new(
                            Arc::clone(view),
                            record.final_metalog_positions.into_iter().collect(),
                            record.tail_metalogs.into_iter().collect(),
                        ))),
                        None => {
                            warn!(view_id = record.view_id, "finalize marker for unknown view");
                            continue;
                        }
                    },
                };
                if sender.send(view_event).is_err() {
                    return;
                }
            }
        });
        Ok(receiver)
    }
}
