//! Cross-Node Reputation Replication
//!
//! Every node journals its own reputation events and replicates them to its
//! peers. Each node also keeps one view of a user per origin node, which is
//! what consensus reads and conflict resolution reconcile.
//!
//! ```text
//!  ReputationManager ──record_event──► DistributedReputationManager
//!                                        │ journal (hash dedup)
//!                                        │ buffer ──push──► peers
//!                                        │ ◄──pull── peers
//!                                        ▼
//!                        per-node views ──► consensus / resolve
//! ```
//!
//! Replication is eventually consistent. Admission decisions only ever use
//! the local node's state.

pub mod config;
pub mod error;
pub mod manager;
pub mod resolver;
pub mod transport;

pub use config::{PeerConfig, ReplicationConfig};
pub use error::ReplicationError;
pub use manager::{
    Consensus, DistributedReputationManager, DistributedReputationManagerBuilder, NodeReputation,
    PeerStatus, PeerSync, ReplicationStats, SyncRound, SyncStatus,
};
pub use resolver::{ConflictResolver, ConservativeResolver, ResolverRegistry, TimestampResolver};
pub use transport::{
    EventBatch, HttpTransport, IngestReport, LoopbackTransport, PeerTransport, PullResponse, EVENTS_PATH,
};
