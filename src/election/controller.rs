//! Election Controller
//!
//! One task per process runs the election cycle:
//!
//! 1. open a per-cycle session (retrying with a fixed backoff)
//! 2. campaign for the election key within the campaign timeout
//! 3. lead (observe + renew) or follow (observe within the follower window)
//! 4. close the session, pause, and start over
//!
//! Ties are broken only by the store's conditional write. A timed out
//! campaign is never treated as won.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{
    shutdown_requested, CandidateRecord, ElectionPhase, ElectionTimings, ObservationLoop,
    RenewalLoop,
};
use crate::state::{LeaderAddress, RoleState};
use crate::store::{CampaignOutcome, CoordinationStore, RenewalMode, Session};

/// Drives campaign / lead / follow cycles until shutdown
pub struct ElectionController {
    store: Arc<dyn CoordinationStore>,
    candidate: CandidateRecord,
    timings: ElectionTimings,
    state: Arc<RoleState>,
    shutdown: watch::Receiver<bool>,
    phase: ElectionPhase,
}

/// A running controller with its own shutdown switch
pub struct ElectionHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    state: Arc<RoleState>,
}

impl ElectionHandle {
    /// Role state the controller publishes to
    pub fn state(&self) -> &Arc<RoleState> {
        &self.state
    }

    /// Request shutdown and wait for the controller to resign and stop
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::error!("Election task failed: {}", e);
        }
    }
}

impl ElectionController {
    /// Create a controller stopped by `shutdown` turning true
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        candidate: CandidateRecord,
        timings: ElectionTimings,
        state: Arc<RoleState>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            candidate,
            timings,
            state,
            shutdown,
            phase: ElectionPhase::Initializing,
        }
    }

    /// Spawn a controller with its own shutdown channel
    pub fn start(
        store: Arc<dyn CoordinationStore>,
        candidate: CandidateRecord,
        timings: ElectionTimings,
        state: Arc<RoleState>,
    ) -> ElectionHandle {
        let (shutdown, rx) = watch::channel(false);
        let task = Self::new(store, candidate, timings, Arc::clone(&state), rx).spawn();
        ElectionHandle {
            shutdown,
            task,
            state,
        }
    }

    /// Run the controller on its own task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run election cycles until shutdown
    pub async fn run(mut self) {
        tracing::info!(
            "Starting election on {} as {} ({} store)",
            self.candidate.key,
            self.candidate.value,
            self.store.backend()
        );

        loop {
            self.set_phase(ElectionPhase::Initializing);
            let Some(session) = self.open_session().await else {
                break;
            };

            self.set_phase(ElectionPhase::Campaigning);
            let stop = match self.campaign(&session).await {
                CampaignOutcome::Won if self.stopping() => {
                    // Won while shutting down: give the key straight back
                    self.resign().await;
                    true
                }
                CampaignOutcome::Won => self.lead(&session).await,
                CampaignOutcome::Lost | CampaignOutcome::TimedOut => self.follow().await,
            };

            if let Err(e) = self.store.close_session(&session).await {
                tracing::debug!("Failed to close session {:x}: {}", session.id(), e);
            }

            if stop || self.pause(self.timings.cycle_delay).await {
                break;
            }
        }

        if self.state.demote() {
            tracing::info!("Stepped down on shutdown");
        }
        self.set_phase(ElectionPhase::Stopped);
        tracing::info!("Election on {} stopped", self.candidate.key);
    }

    fn set_phase(&mut self, phase: ElectionPhase) {
        if self.phase != phase {
            tracing::debug!("Election phase {} -> {}", self.phase, phase);
            self.phase = phase;
        }
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleep for `delay`; returns true if shutdown cut it short
    async fn pause(&self, delay: Duration) -> bool {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(delay) => self.stopping(),
            _ = shutdown_requested(&mut shutdown) => true,
        }
    }

    /// Create the per-cycle session, retrying until it succeeds or
    /// shutdown is requested
    async fn open_session(&self) -> Option<Session> {
        loop {
            if self.stopping() {
                return None;
            }
            match self.store.create_session(self.timings.session_ttl).await {
                Ok(session) => {
                    tracing::debug!("Opened session {:x}", session.id());
                    return Some(session);
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to create session: {}, retrying in {:?}",
                        e,
                        self.timings.session_retry
                    );
                    if self.pause(self.timings.session_retry).await {
                        return None;
                    }
                }
            }
        }
    }

    /// One bounded registration attempt; errors count as lost
    async fn campaign(&self, session: &Session) -> CampaignOutcome {
        let result = self
            .store
            .campaign(
                Some(session),
                &self.candidate.key,
                &self.candidate.value,
                self.timings.campaign_timeout,
            )
            .await;

        match result {
            Ok(outcome) => {
                tracing::debug!("Campaign for {} {}", self.candidate.key, outcome);
                outcome
            }
            Err(e) => {
                tracing::warn!("Campaign for {} failed: {}", self.candidate.key, e);
                CampaignOutcome::Lost
            }
        }
    }

    /// Hold leadership until it is lost or shutdown is requested.
    /// Returns true on shutdown.
    async fn lead(&mut self, session: &Session) -> bool {
        self.set_phase(ElectionPhase::Leader);
        if self.state.promote(self.candidate.address.clone()) {
            tracing::info!("Became leader of {} as {}", self.candidate.key, self.candidate.value);
        }

        let mut observer = ObservationLoop::leader(
            Arc::clone(&self.store),
            &self.candidate.key,
            Arc::clone(&self.state),
            self.candidate.address.clone(),
        );
        let renewal = match self.store.renewal() {
            RenewalMode::Explicit(interval) => {
                // Read failures are the renewal loop's to judge
                observer = observer.resubscribe_every(interval);
                Some(RenewalLoop::new(
                    Arc::clone(&self.store),
                    session.clone(),
                    self.candidate.clone(),
                    Arc::clone(&self.state),
                    interval,
                ))
            }
            RenewalMode::Implicit => None,
        };
        let renew = async {
            match &renewal {
                Some(renewal) => renewal.run().await,
                None => std::future::pending().await,
            }
        };

        let mut shutdown = self.shutdown.clone();
        let stop = tokio::select! {
            end = observer.run() => {
                tracing::info!("Leadership of {} ended: {:?}", self.candidate.key, end);
                false
            }
            end = renew => {
                tracing::info!("Leadership of {} ended: renewal {:?}", self.candidate.key, end);
                false
            }
            _ = self.store.session_lost(session) => {
                tracing::warn!(
                    "Session {:x} lapsed, leadership of {} is gone",
                    session.id(),
                    self.candidate.key
                );
                false
            }
            _ = shutdown_requested(&mut shutdown) => true,
        };

        if stop {
            self.resign().await;
        }
        if self.state.demote() {
            tracing::info!("Stepped down from {}", self.candidate.key);
        }
        stop
    }

    /// Best-effort removal of our leader record
    async fn resign(&self) {
        match self.store.delete(&self.candidate.key).await {
            Ok(()) => tracing::info!("Released leadership of {}", self.candidate.key),
            Err(e) => tracing::warn!("Failed to release {}: {}", self.candidate.key, e),
        }
    }

    /// Track the current leader for one follower window.
    /// Returns true on shutdown.
    async fn follow(&mut self) -> bool {
        self.set_phase(ElectionPhase::Follower);
        self.state.demote();
        self.seed_leader().await;

        let observer = ObservationLoop::follower(
            Arc::clone(&self.store),
            &self.candidate.key,
            Arc::clone(&self.state),
        );
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            end = tokio::time::timeout(self.timings.follower_window, observer.run()) => {
                match end {
                    Ok(end) => tracing::debug!("Observation of {} ended: {:?}", self.candidate.key, end),
                    Err(_) => tracing::debug!("Follower window on {} elapsed", self.candidate.key),
                }
                false
            }
            _ = shutdown_requested(&mut shutdown) => true,
        }
    }

    /// One read of the key so followers know the leader right away
    async fn seed_leader(&self) {
        match self.store.read(&self.candidate.key).await {
            Ok(Some(raw)) => match raw.parse::<LeaderAddress>() {
                Ok(address) => {
                    if self.state.record_leader(address.clone()) {
                        tracing::info!("Following leader on {}", address);
                    }
                }
                Err(e) => tracing::warn!("Ignoring leader value: {}", e),
            },
            Ok(None) => tracing::debug!("No leader recorded under {}", self.candidate.key),
            Err(e) => tracing::warn!("Failed to read {}: {}", self.candidate.key, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::state::{Role, RoleSnapshot};
    use crate::store::MemoryStore;

    const KEY: &str = "/leader-election/";

    fn fast_timings() -> ElectionTimings {
        ElectionTimings {
            session_ttl: Duration::from_millis(200),
            session_retry: Duration::from_millis(50),
            campaign_timeout: Duration::from_millis(100),
            follower_window: Duration::from_millis(300),
            cycle_delay: Duration::from_millis(20),
            poll_interval: Duration::from_millis(20),
            renew_interval: Duration::from_millis(50),
        }
    }

    fn start(store: &MemoryStore, port: u16, timings: &ElectionTimings) -> ElectionHandle {
        let candidate = CandidateRecord::new(KEY, port.to_string(), timings.session_ttl).unwrap();
        ElectionController::start(
            Arc::new(store.handle()),
            candidate,
            timings.clone(),
            Arc::new(RoleState::new()),
        )
    }

    async fn wait_until(state: &RoleState, condition: impl FnMut(&RoleSnapshot) -> bool) {
        let mut rx = state.subscribe();
        tokio::time::timeout(Duration::from_secs(3), rx.wait_for(condition))
            .await
            .expect("role state did not converge")
            .unwrap();
    }

    fn follows(port: u16) -> impl FnMut(&RoleSnapshot) -> bool {
        move |s: &RoleSnapshot| {
            s.role == Role::Follower
                && s.leader.as_ref().map(|l| l.address.clone()) == Some(LeaderAddress::Port(port))
        }
    }

    #[tokio::test]
    async fn test_two_process_scenario() {
        let store = MemoryStore::session_backed();
        let timings = fast_timings();

        let p1 = start(&store, 9001, &timings);
        wait_until(p1.state(), |s| s.role == Role::Leader).await;
        assert_eq!(p1.state().status_line(), "I am the leader");

        let p2 = start(&store, 9002, &timings);
        wait_until(p2.state(), follows(9001)).await;
        assert_eq!(
            p2.state().status_line(),
            "I am a follower and the leader is on port 9001"
        );
        assert_eq!(p1.state().role(), Role::Leader);

        let p1_state = Arc::clone(p1.state());
        p1.shutdown().await;
        assert_eq!(p1_state.role(), Role::Follower);

        wait_until(p2.state(), |s| s.role == Role::Leader).await;
        assert_eq!(p2.state().status_line(), "I am the leader");
        assert_eq!(store.read(KEY).await.unwrap().as_deref(), Some("9002"));
        p2.shutdown().await;
        assert_eq!(store.read(KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_follower_reports_unknown_before_any_leader() {
        let store = MemoryStore::session_backed();
        store.partition();
        let p1 = ElectionController::start(
            Arc::new(store.clone()),
            CandidateRecord::new(KEY, "9001", Duration::from_millis(200)).unwrap(),
            fast_timings(),
            Arc::new(RoleState::new()),
        );

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(
            p1.state().status_line(),
            "I am a follower and the leader is on port unknown"
        );

        // Session creation is retried until the store is reachable
        store.heal();
        wait_until(p1.state(), |s| s.role == Role::Leader).await;
        p1.shutdown().await;
    }

    #[tokio::test]
    async fn test_converges_after_session_expiry() {
        let store = MemoryStore::session_backed();
        let timings = fast_timings();

        let p1 = start(&store, 9001, &timings);
        wait_until(p1.state(), |s| s.role == Role::Leader).await;
        let p2 = start(&store, 9002, &timings);
        wait_until(p2.state(), follows(9001)).await;

        store.expire_holder(KEY).await;

        // Exactly one leader again, and the other side follows it
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            let (a, b) = (p1.state().snapshot(), p2.state().snapshot());
            let converged = match (a.role, b.role) {
                (Role::Leader, Role::Follower) => {
                    b.leader.map(|l| l.address) == Some(LeaderAddress::Port(9001))
                }
                (Role::Follower, Role::Leader) => {
                    a.leader.map(|l| l.address) == Some(LeaderAddress::Port(9002))
                }
                _ => false,
            };
            if converged {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "no convergence");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        p1.shutdown().await;
        p2.shutdown().await;
    }

    #[tokio::test]
    async fn test_partitioned_session_leader_is_replaced() {
        let store = MemoryStore::session_backed();
        let timings = fast_timings();

        let leader_store = store.handle();
        let p1 = ElectionController::start(
            Arc::new(leader_store.clone()),
            CandidateRecord::new(KEY, "9001", timings.session_ttl).unwrap(),
            timings.clone(),
            Arc::new(RoleState::new()),
        );
        wait_until(p1.state(), |s| s.role == Role::Leader).await;
        let p2 = start(&store, 9002, &timings);
        wait_until(p2.state(), follows(9001)).await;

        // The lease lapses after its TTL and the other process takes over
        leader_store.partition();
        wait_until(p1.state(), |s| s.role == Role::Follower).await;
        wait_until(p2.state(), |s| s.role == Role::Leader).await;
        assert_eq!(store.read(KEY).await.unwrap().as_deref(), Some("9002"));

        leader_store.heal();
        wait_until(p1.state(), follows(9002)).await;

        p1.shutdown().await;
        p2.shutdown().await;
    }

    #[tokio::test]
    async fn test_follower_keeps_leader_across_malformed_value() {
        let store = MemoryStore::session_backed();
        let timings = fast_timings();
        store.put_raw(KEY, "9001").await;

        let p2 = start(&store, 9002, &timings);
        wait_until(p2.state(), follows(9001)).await;

        // Seen both by the running observation and by the next cycle's seed read
        store.put_raw(KEY, "garbage").await;
        tokio::time::sleep(timings.follower_window + timings.campaign_timeout * 3).await;
        assert_eq!(p2.state().role(), Role::Follower);
        assert_eq!(p2.state().leader_address(), Some(LeaderAddress::Port(9001)));
        assert_eq!(
            p2.state().status_line(),
            "I am a follower and the leader is on port 9001"
        );

        p2.shutdown().await;
    }

    #[tokio::test]
    async fn test_brief_partition_keeps_poll_leader() {
        let timings = ElectionTimings {
            session_ttl: Duration::from_secs(1),
            ..fast_timings()
        };
        let store = MemoryStore::poll_backed(timings.renew_interval);

        let leader_store = store.handle();
        let p1 = ElectionController::start(
            Arc::new(leader_store.clone()),
            CandidateRecord::new(KEY, "9001", timings.session_ttl).unwrap(),
            timings.clone(),
            Arc::new(RoleState::new()),
        );
        wait_until(p1.state(), |s| s.role == Role::Leader).await;
        let mut changes = p1.state().subscribe();
        changes.borrow_and_update();

        leader_store.partition();
        tokio::time::sleep(Duration::from_millis(30)).await;
        leader_store.heal();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(p1.state().role(), Role::Leader);
        assert_eq!(p1.state().status_line(), "I am the leader");
        assert!(!changes.has_changed().unwrap());
        assert_eq!(store.read(KEY).await.unwrap().as_deref(), Some("9001"));

        p1.shutdown().await;
    }

    #[tokio::test]
    async fn test_poll_mode_renewal_and_handoff() {
        let timings = fast_timings();
        let store = MemoryStore::poll_backed(timings.renew_interval);

        let p1 = start(&store, 9001, &timings);
        wait_until(p1.state(), |s| s.role == Role::Leader).await;
        let p2 = start(&store, 9002, &timings);
        wait_until(p2.state(), follows(9001)).await;

        // Renewal keeps the record alive well past its TTL
        tokio::time::sleep(timings.session_ttl * 3).await;
        assert_eq!(p1.state().role(), Role::Leader);
        assert_eq!(p2.state().role(), Role::Follower);

        // Graceful handoff: the record is deleted, not left to expire
        let p1_state = Arc::clone(p1.state());
        p1.shutdown().await;
        assert_eq!(p1_state.role(), Role::Follower);

        wait_until(p2.state(), |s| s.role == Role::Leader).await;
        assert_eq!(store.read(KEY).await.unwrap().as_deref(), Some("9002"));
        p2.shutdown().await;
    }

    #[tokio::test]
    async fn test_partitioned_leader_record_expires() {
        let timings = fast_timings();
        let store = MemoryStore::poll_backed(timings.renew_interval);

        let leader_store = store.handle();
        let candidate = CandidateRecord::new(KEY, "9001", timings.session_ttl).unwrap();
        let p1 = ElectionController::start(
            Arc::new(leader_store.clone()),
            candidate,
            timings.clone(),
            Arc::new(RoleState::new()),
        );
        wait_until(p1.state(), |s| s.role == Role::Leader).await;

        let p2 = start(&store, 9002, &timings);
        wait_until(p2.state(), follows(9001)).await;

        leader_store.partition();
        wait_until(p1.state(), |s| s.role == Role::Follower).await;
        wait_until(p2.state(), |s| s.role == Role::Leader).await;

        leader_store.heal();
        wait_until(p1.state(), follows(9002)).await;

        p1.shutdown().await;
        p2.shutdown().await;
    }
}
