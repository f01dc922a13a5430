//! State Management Module
//!
//! Holds the role/leader fact base shared between the election
//! controller and the status endpoint.

mod role;

pub use role::{LeaderAddress, LeaderInfo, Role, RoleSnapshot, RoleState};
