//! Sequencer role: metalog assembly and replication
//!
//! The primary sequencer of a view owns the active logspace and turns
//! replication progress into metalog cuts; replica sequencers replay the
//! metalog and acknowledge positions. The node driver routes messages and
//! view transitions to the hosted logspaces.

mod backup;
mod metalog;
mod node;
mod primary;

pub use backup::MetaLogBackup;
pub use metalog::MetaLogStore;
pub use node::{run_cut_timer, HandlerOutcome, Outbound, SequencerNode};
pub use primary::MetaLogPrimary;
