#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # sharedlog
//!
//! The replication and ordering core of a shared, totally-ordered log for
//! serverless function platforms. Functions append tagged records at
//! engine nodes; a primary sequencer turns replication progress into
//! metalog cuts that assign dense global seqnums; storage nodes persist
//! bodies and serve reads; a view manager reconfigures the node set
//! through immutable views.
//!
//! ## Roles
//!
//! - [`sequencer::SequencerNode`] hosts the primary metalog of the active
//!   view and backup replicas of it
//! - [`engine::EngineCore`] owns the client-facing append paths, pending
//!   record bookkeeping, and the tag index
//! - [`storage::StorageNode`] holds record bodies, applies committed cuts,
//!   and serves `read_at` with a live cache over a pluggable
//!   [`storage::PersistenceAdapter`]
//! - [`view::manager::ViewManager`] publishes views and drives the
//!   `Created → Frozen → Finalized` lifecycle over the metadata service
//!
//! Transport is out of scope: node drivers return typed outbound actions
//! and the embedding process delivers them.
//!
//! ## Embedded usage
//!
//! ```no_run
//! use bytes::Bytes;
//! use sharedlog::{EmbeddedSharedLog, Result};
//!
//! fn main() -> Result<()> {
//!     let log = EmbeddedSharedLog::single_node()?;
//!     let local_id = log.append(5, Bytes::from_static(b"hello"))?;
//!     log.tick()?; // progress reports flow, the sequencer cuts
//!     let entry = log.read_at(0)?;
//!     println!("appended {local_id:#x}, read back {:?}", entry.data);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod embedded;
pub mod engine;
pub mod error;
pub mod fsm;
pub mod logspace;
pub mod metadata;
pub mod protocol;
pub mod sequencer;
pub mod storage;
pub mod types;
pub mod util;
pub mod view;

pub use config::SharedLogConfig;
pub use embedded::EmbeddedSharedLog;
pub use error::{Result, SharedLogError};
