//! Default constants for shared log configuration
//!
//! These constants define the values used when a setting is not supplied by
//! the config file or command line.

/// Default primary-sequencer local-cut tick period, in microseconds
pub const DEFAULT_LOCAL_CUT_INTERVAL_US: u64 = 1000;

/// Default high-water cap on live (in-memory) entries per storage logspace
pub const DEFAULT_STORAGE_MAX_LIVE_ENTRIES: usize = 65536;

/// Default cap on engine pending entries before appends are rejected
pub const DEFAULT_ENGINE_MAX_PENDING_ENTRIES: usize = 65536;

/// Default storage flusher period, in milliseconds
pub const DEFAULT_STORAGE_FLUSH_INTERVAL_MS: u64 = 100;

/// Default Raft election timeout for the metalog channel, in milliseconds
pub const DEFAULT_RAFT_ELECTION_TIMEOUT_MS: u64 = 1000;

/// Default Raft heartbeat timeout for the metalog channel, in milliseconds
pub const DEFAULT_RAFT_HEARTBEAT_TIMEOUT_MS: u64 = 100;

/// Default number of metalog entries between Raft snapshots
pub const DEFAULT_RAFT_SNAPSHOT_THRESHOLD: u64 = 8192;

/// Default number of trailing entries kept behind a Raft snapshot
pub const DEFAULT_RAFT_SNAPSHOT_TRAILING: u64 = 1024;

/// Default Raft pre-vote setting
pub const DEFAULT_RAFT_PRE_VOTE: bool = true;
