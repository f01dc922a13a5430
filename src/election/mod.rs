//! Leader Election Module
//!
//! Drives the campaign / lead / follow cycle against a coordination
//! store and publishes the outcome through [`RoleState`](crate::state::RoleState).

mod controller;
mod observer;
mod renewal;

use std::fmt;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::Result;
use crate::state::LeaderAddress;

pub use controller::{ElectionController, ElectionHandle};
pub use observer::{ObservationEnd, ObservationLoop};
pub use renewal::{RenewalEnd, RenewalLoop};

/// Timings that shape one election cycle
#[derive(Debug, Clone)]
pub struct ElectionTimings {
    /// Lease TTL of each per-cycle session
    pub session_ttl: Duration,
    /// Backoff after a failed session creation
    pub session_retry: Duration,
    /// Upper bound on one campaign attempt
    pub campaign_timeout: Duration,
    /// How long a follower observes before campaigning again
    pub follower_window: Duration,
    /// Pause between cycles
    pub cycle_delay: Duration,
    /// Poll backend read interval
    pub poll_interval: Duration,
    /// Poll backend refresh interval
    pub renew_interval: Duration,
}

impl Default for ElectionTimings {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(5),
            session_retry: Duration::from_secs(5),
            campaign_timeout: Duration::from_secs(2),
            follower_window: Duration::from_secs(5),
            cycle_delay: Duration::from_secs(1),
            poll_interval: Duration::from_secs(10),
            renew_interval: Duration::from_secs(10),
        }
    }
}

/// What this process writes under the election key when it leads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateRecord {
    /// Well-known election key
    pub key: String,
    /// Advertised value, as written to the store
    pub value: String,
    /// Parsed form of `value`
    pub address: LeaderAddress,
    /// Lease TTL
    pub ttl: Duration,
}

impl CandidateRecord {
    /// Build a record; `value` must parse as a leader address
    pub fn new(key: impl Into<String>, value: impl Into<String>, ttl: Duration) -> Result<Self> {
        let value = value.into();
        let address = value.parse()?;
        Ok(Self {
            key: key.into(),
            value,
            address,
            ttl,
        })
    }
}

/// Controller lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionPhase {
    Initializing,
    Campaigning,
    Leader,
    Follower,
    Stopped,
}

impl fmt::Display for ElectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElectionPhase::Initializing => write!(f, "initializing"),
            ElectionPhase::Campaigning => write!(f, "campaigning"),
            ElectionPhase::Leader => write!(f, "leader"),
            ElectionPhase::Follower => write!(f, "follower"),
            ElectionPhase::Stopped => write!(f, "stopped"),
        }
    }
}

/// Resolve once shutdown has been requested (or its sender dropped)
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    crate::store::flag_raised(shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_record() {
        let record = CandidateRecord::new("leader", "9001", Duration::from_secs(15)).unwrap();
        assert_eq!(record.address, LeaderAddress::Port(9001));

        let remote = CandidateRecord::new("leader", "node-a:9001", Duration::from_secs(15)).unwrap();
        assert_eq!(remote.address.port(), 9001);

        assert!(CandidateRecord::new("leader", "not-a-port", Duration::from_secs(15)).is_err());
    }

    #[tokio::test]
    async fn test_shutdown_requested() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { shutdown_requested(&mut rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        // Dropped sender counts as shutdown
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        shutdown_requested(&mut rx).await;
    }
}
