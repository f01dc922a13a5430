//! Leader Record Renewal
//!
//! Explicit refresh of the leader record for stores whose records
//! expire unless rewritten (the poll backend).

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};

use super::CandidateRecord;
use crate::error::Result;
use crate::state::RoleState;
use crate::store::{CoordinationStore, RenewOutcome, Session};

/// Why a renewal loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalEnd {
    /// The store refused the refresh: the record is gone or not ours
    Rejected,
    /// No successful refresh for a full TTL; the record has expired
    Expired,
}

/// Periodically refreshes this process's leader record
pub struct RenewalLoop {
    store: Arc<dyn CoordinationStore>,
    session: Session,
    candidate: CandidateRecord,
    state: Arc<RoleState>,
    interval: Duration,
}

impl RenewalLoop {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        session: Session,
        candidate: CandidateRecord,
        state: Arc<RoleState>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            session,
            candidate,
            state,
            interval,
        }
    }

    /// Refresh the record once. Idempotent while the record is ours.
    pub async fn renew_once(&self) -> Result<RenewOutcome> {
        let outcome = self
            .store
            .renew(&self.session, &self.candidate.key, &self.candidate.value)
            .await?;
        if outcome == RenewOutcome::Lost && self.state.demote() {
            tracing::warn!("Leader record {} was not renewed, demoted", self.candidate.key);
        }
        Ok(outcome)
    }

    /// Refresh every interval until the store rejects us or the record
    /// must have expired
    pub async fn run(&self) -> RenewalEnd {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The campaign just wrote the record
        ticker.tick().await;
        let mut last_success = Instant::now();

        loop {
            // The store drops the record a full TTL after the last refresh
            let deadline = last_success + self.session.ttl();
            tokio::select! {
                _ = ticker.tick() => {}
                _ = tokio::time::sleep_until(deadline) => return self.expired(),
            }

            let sent = Instant::now();
            match tokio::time::timeout_at(deadline, self.renew_once()).await {
                Ok(Ok(RenewOutcome::Renewed)) => {
                    tracing::debug!("Renewed leader record {}", self.candidate.key);
                    last_success = sent;
                }
                Ok(Ok(RenewOutcome::Lost)) => return RenewalEnd::Rejected,
                Ok(Err(e)) => {
                    tracing::warn!("Renewal of {} failed, retrying: {}", self.candidate.key, e);
                }
                Err(_) => return self.expired(),
            }
        }
    }

    fn expired(&self) -> RenewalEnd {
        tracing::warn!(
            "No renewal of {} for a full TTL, giving up leadership",
            self.candidate.key
        );
        self.state.demote();
        RenewalEnd::Expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::state::{LeaderAddress, Role};
    use crate::store::{CampaignOutcome, MemoryStore};

    async fn leading(store: &MemoryStore, ttl: Duration) -> (RenewalLoop, Arc<RoleState>) {
        let candidate = CandidateRecord::new("leader", "9001", ttl).unwrap();
        let session = store.create_session(ttl).await.unwrap();
        let outcome = store
            .campaign(Some(&session), &candidate.key, &candidate.value, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(outcome, CampaignOutcome::Won);

        let state = Arc::new(RoleState::new());
        state.promote(candidate.address.clone());
        let renewal = RenewalLoop::new(
            Arc::new(store.clone()),
            session,
            candidate,
            Arc::clone(&state),
            Duration::from_millis(30),
        );
        (renewal, state)
    }

    #[tokio::test]
    async fn test_renew_is_idempotent() {
        let store = MemoryStore::poll_backed(Duration::from_millis(30));
        let (renewal, state) = leading(&store, Duration::from_secs(1)).await;
        let before = state.snapshot();

        assert_eq!(renewal.renew_once().await.unwrap(), RenewOutcome::Renewed);
        assert_eq!(renewal.renew_once().await.unwrap(), RenewOutcome::Renewed);

        assert_eq!(state.snapshot(), before);
        assert_eq!(state.leader_address(), Some(LeaderAddress::Port(9001)));
    }

    #[tokio::test]
    async fn test_renewal_keeps_record_past_ttl() {
        let store = MemoryStore::poll_backed(Duration::from_millis(30));
        let (renewal, state) = leading(&store, Duration::from_millis(150)).await;

        let task = tokio::spawn(async move { renewal.run().await });
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(store.read("leader").await.unwrap().as_deref(), Some("9001"));
        assert_eq!(state.role(), Role::Leader);
        task.abort();
    }

    #[tokio::test]
    async fn test_foreign_record_is_rejected() {
        let store = MemoryStore::poll_backed(Duration::from_millis(30));
        let (renewal, state) = leading(&store, Duration::from_secs(1)).await;

        store.put_raw("leader", "9002").await;
        let end = tokio::time::timeout(Duration::from_secs(1), renewal.run()).await.unwrap();
        assert_eq!(end, RenewalEnd::Rejected);
        assert_eq!(state.role(), Role::Follower);
    }

    #[tokio::test]
    async fn test_brief_outage_is_tolerated() {
        let store = MemoryStore::poll_backed(Duration::from_millis(30));
        let (renewal, state) = leading(&store, Duration::from_millis(300)).await;

        let task = tokio::spawn(async move { renewal.run().await });
        store.partition();
        tokio::time::sleep(Duration::from_millis(80)).await;
        store.heal();
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert!(!task.is_finished());
        assert_eq!(state.role(), Role::Leader);
        assert_eq!(store.read("leader").await.unwrap().as_deref(), Some("9001"));
        task.abort();
    }

    #[tokio::test]
    async fn test_unreachable_store_expires_after_ttl() {
        let store = MemoryStore::poll_backed(Duration::from_millis(30));
        let (renewal, state) = leading(&store, Duration::from_millis(100)).await;

        store.partition();
        let end = tokio::time::timeout(Duration::from_secs(1), renewal.run()).await.unwrap();
        assert_eq!(end, RenewalEnd::Expired);
        assert_eq!(state.role(), Role::Follower);
    }
}
