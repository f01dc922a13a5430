//! Herald - Leader Election over etcd
//!
//! Each Herald process campaigns for a single well-known key in an etcd
//! cluster. The process that holds the key is the leader; every other
//! process follows and tracks who the leader is. Any process answers
//! HTTP requests with its current view: "I am the leader", or "I am a
//! follower and the leader is on port N".
//!
//! # Architecture
//!
//! The election controller runs one cycle at a time: open a session,
//! campaign, then lead or follow until something changes. Mutual
//! exclusion comes entirely from the store's atomic conditional write,
//! so a timed out campaign is always treated as lost.
//!
//! # Features
//!
//! - Session backend: etcd v3 leases, election service and watches
//! - Poll backend: etcd v2 keys with TTL, compare-and-swap and polling
//! - In-process store for tests and simulations
//! - Plain-text HTTP status endpoint on any path
//! - Graceful handoff on shutdown

pub mod config;
pub mod error;
pub mod state;
pub mod store;
pub mod election;
pub mod api;

pub use config::HeraldConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Backend, HeraldConfig};
    pub use crate::error::{Error, Result};
    pub use crate::state::{LeaderAddress, Role, RoleSnapshot, RoleState};
    pub use crate::store::{CoordinationStore, MemoryStore, PollStore, SessionStore};
    pub use crate::election::{CandidateRecord, ElectionController, ElectionTimings};
    pub use crate::api::StatusServer;
}
