//! Observation Loop
//!
//! Follows the election key and keeps the role state's leader address
//! current. Runs for followers (bounded by the follower window) and for
//! the leader itself, where a foreign value means it was evicted.
//!
//! A leader whose record is refreshed explicitly resubscribes after a lost
//! observation instead of returning; its renewal loop decides when the
//! record has expired.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use crate::state::{LeaderAddress, RoleState};
use crate::store::{CoordinationStore, Observed};

/// Why an observation loop returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservationEnd {
    /// The key was deleted or expired
    Vacated,
    /// Another process's value replaced ours (leader only)
    Superseded(LeaderAddress),
    /// The observation stream ended (connection or session lost)
    Closed,
    /// The subscription could not be established
    Unavailable,
}

/// Consumes `observe(key)` and mirrors it into the role state
pub struct ObservationLoop {
    store: Arc<dyn CoordinationStore>,
    key: String,
    state: Arc<RoleState>,
    /// Our own address when observing as leader
    own: Option<LeaderAddress>,
    /// Retry period after the stream closes or cannot be opened
    resubscribe: Option<Duration>,
}

impl ObservationLoop {
    /// Observe as a follower
    pub fn follower(store: Arc<dyn CoordinationStore>, key: &str, state: Arc<RoleState>) -> Self {
        Self {
            store,
            key: key.to_string(),
            state,
            own: None,
            resubscribe: None,
        }
    }

    /// Observe as the leader advertising `own`
    pub fn leader(
        store: Arc<dyn CoordinationStore>,
        key: &str,
        state: Arc<RoleState>,
        own: LeaderAddress,
    ) -> Self {
        Self {
            store,
            key: key.to_string(),
            state,
            own: Some(own),
            resubscribe: None,
        }
    }

    /// Observe again every `interval` while the store is unreachable,
    /// rather than ending on the first failure
    pub fn resubscribe_every(mut self, interval: Duration) -> Self {
        self.resubscribe = Some(interval);
        self
    }

    /// Run until the key is vacated, superseded or the stream ends.
    /// The role state is demoted on every exit.
    pub async fn run(&self) -> ObservationEnd {
        let end = loop {
            match (self.observe().await, self.resubscribe) {
                (ObservationEnd::Closed | ObservationEnd::Unavailable, Some(interval)) => {
                    tracing::debug!("Resubscribing to {} in {:?}", self.key, interval);
                    tokio::time::sleep(interval).await;
                }
                (end, _) => break end,
            }
        };
        if self.state.demote() {
            tracing::info!("Demoted to follower ({:?})", end);
        }
        end
    }

    async fn observe(&self) -> ObservationEnd {
        let mut observation = match self.store.observe(&self.key).await {
            Ok(observation) => observation,
            Err(e) => {
                tracing::warn!("Failed to observe {}: {}", self.key, e);
                return ObservationEnd::Unavailable;
            }
        };

        while let Some(item) = observation.next().await {
            let raw = match item {
                Observed::Value(raw) => raw,
                Observed::Vacant => {
                    tracing::info!("Election key {} is vacant", self.key);
                    return ObservationEnd::Vacated;
                }
            };

            let address = match raw.parse::<LeaderAddress>() {
                Ok(address) => address,
                Err(e) => {
                    tracing::warn!("Ignoring leader value: {}", e);
                    continue;
                }
            };

            match &self.own {
                Some(own) if *own != address => {
                    tracing::warn!("Leadership lost: {} now holds {}", address, self.key);
                    self.state.record_leader(address.clone());
                    return ObservationEnd::Superseded(address);
                }
                Some(_) => {}
                None => {
                    if self.state.record_leader(address.clone()) {
                        tracing::info!("Leader is on {}", address);
                    }
                }
            }
        }

        tracing::debug!("Observation of {} ended", self.key);
        ObservationEnd::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::state::Role;
    use crate::store::MemoryStore;

    const KEY: &str = "/leader-election/";

    async fn wait_for_leader(state: &RoleState, expected: LeaderAddress) {
        let mut rx = state.subscribe();
        tokio::time::timeout(
            Duration::from_secs(2),
            rx.wait_for(|s| s.leader.as_ref().map(|l| &l.address) == Some(&expected)),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn test_malformed_value_keeps_last_leader() {
        let store = MemoryStore::session_backed();
        let state = Arc::new(RoleState::new());
        store.put_raw(KEY, "9001").await;

        let observer = ObservationLoop::follower(Arc::new(store.clone()), KEY, Arc::clone(&state));
        let task = tokio::spawn(async move { observer.run().await });
        wait_for_leader(&state, LeaderAddress::Port(9001)).await;

        store.put_raw(KEY, "garbage").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(state.leader_address(), Some(LeaderAddress::Port(9001)));
        assert!(!task.is_finished());

        store.put_raw(KEY, "9003").await;
        wait_for_leader(&state, LeaderAddress::Port(9003)).await;
        task.abort();
    }

    #[tokio::test]
    async fn test_vacancy_ends_observation() {
        let store = MemoryStore::session_backed();
        let session = store.create_session(Duration::from_secs(5)).await.unwrap();
        store
            .campaign(Some(&session), KEY, "9001", Duration::from_millis(100))
            .await
            .unwrap();

        let state = Arc::new(RoleState::new());
        let observer = ObservationLoop::follower(Arc::new(store.clone()), KEY, Arc::clone(&state));
        let task = tokio::spawn(async move { observer.run().await });
        wait_for_leader(&state, LeaderAddress::Port(9001)).await;

        store.close_session(&session).await.unwrap();
        let end = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(end, ObservationEnd::Vacated);

        // Demotion keeps the last known leader
        assert_eq!(state.role(), Role::Follower);
        assert_eq!(state.leader_address(), Some(LeaderAddress::Port(9001)));
    }

    #[tokio::test]
    async fn test_leader_superseded() {
        let store = MemoryStore::session_backed();
        let state = Arc::new(RoleState::new());
        state.promote(LeaderAddress::Port(9001));
        store.put_raw(KEY, "9001").await;

        let observer = ObservationLoop::leader(
            Arc::new(store.clone()),
            KEY,
            Arc::clone(&state),
            LeaderAddress::Port(9001),
        );
        let task = tokio::spawn(async move { observer.run().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(state.role(), Role::Leader);

        store.put_raw(KEY, "9002").await;
        let end = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(end, ObservationEnd::Superseded(LeaderAddress::Port(9002)));
        assert_eq!(state.role(), Role::Follower);
        assert_eq!(state.leader_address(), Some(LeaderAddress::Port(9002)));
    }

    #[tokio::test]
    async fn test_leader_resubscribes_across_partition() {
        let store = MemoryStore::poll_backed(Duration::from_millis(30));
        let state = Arc::new(RoleState::new());
        state.promote(LeaderAddress::Port(9001));
        store.put_raw(KEY, "9001").await;

        let observer = ObservationLoop::leader(
            Arc::new(store.clone()),
            KEY,
            Arc::clone(&state),
            LeaderAddress::Port(9001),
        )
        .resubscribe_every(Duration::from_millis(20));
        let task = tokio::spawn(async move { observer.run().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        store.partition();
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.heal();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());
        assert_eq!(state.role(), Role::Leader);

        store.put_raw(KEY, "9002").await;
        let end = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(end, ObservationEnd::Superseded(LeaderAddress::Port(9002)));
    }

    #[tokio::test]
    async fn test_unreachable_store() {
        let store = MemoryStore::session_backed();
        store.partition();
        let state = Arc::new(RoleState::new());
        state.promote(LeaderAddress::Port(9001));

        let observer = ObservationLoop::follower(Arc::new(store), KEY, Arc::clone(&state));
        assert_eq!(observer.run().await, ObservationEnd::Unavailable);
        assert_eq!(state.role(), Role::Follower);
    }
}
