//! In-Process Coordination Store
//!
//! Honors the full store contract without a network: atomic
//! register-if-absent, lease-bound records, TTL expiry and push
//! observation. Handles created with [`MemoryStore::handle`] share the
//! same data but can be partitioned independently, which lets one test
//! run several simulated processes against one store. In session mode a
//! partitioned handle's sessions lapse once their TTL passes, the way an
//! unreachable client's leases do.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{future, StreamExt};
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tokio_stream::wrappers::WatchStream;

use super::{
    flag_raised, CampaignOutcome, CoordinationStore, Observation, Observed, RenewOutcome,
    RenewalMode, Session,
};
use crate::error::{Error, Result};

/// A candidate record held by the store
struct Record {
    value: String,
    session: Option<i64>,
    expires_at: Option<Instant>,
    revision: u64,
}

/// A live session; `lost` is raised when it ends
struct SessionEntry {
    lost: watch::Sender<bool>,
}

#[derive(Default)]
struct Inner {
    next_session: i64,
    revision: u64,
    sessions: HashMap<i64, SessionEntry>,
    records: HashMap<String, Record>,
    channels: HashMap<String, watch::Sender<Option<String>>>,
}

impl Inner {
    fn channel(&mut self, key: &str) -> &watch::Sender<Option<String>> {
        self.channels
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(None).0)
    }

    /// Push the current value of `key` to observers
    fn publish(&mut self, key: &str) {
        let value = self.records.get(key).map(|r| r.value.clone());
        self.channel(key).send_if_modified(|current| {
            if *current == value {
                return false;
            }
            *current = value;
            true
        });
    }

    fn purge_expired(&mut self, key: &str, now: Instant) {
        let expired = self
            .records
            .get(key)
            .and_then(|r| r.expires_at)
            .map_or(false, |at| at <= now);
        if expired {
            self.records.remove(key);
            self.publish(key);
        }
    }

    fn remove_session(&mut self, id: i64) {
        if let Some(entry) = self.sessions.remove(&id) {
            entry.lost.send_replace(true);
        }
        let bound: Vec<String> = self
            .records
            .iter()
            .filter(|(_, r)| r.session == Some(id))
            .map(|(k, _)| k.clone())
            .collect();
        for key in bound {
            self.records.remove(&key);
            self.publish(&key);
        }
    }

    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }
}

/// In-process store usable in session or poll mode
#[derive(Clone)]
pub struct MemoryStore {
    mode: RenewalMode,
    inner: Arc<Mutex<Inner>>,
    reachable: Arc<watch::Sender<bool>>,
}

impl MemoryStore {
    /// Session+watch semantics: records live as long as their session,
    /// campaigns wait for the key to become free until their timeout.
    pub fn session_backed() -> Self {
        Self::with_mode(RenewalMode::Implicit)
    }

    /// Poll+CAS semantics: records expire after the session TTL unless
    /// renewed, campaigns fail immediately when the key is held.
    pub fn poll_backed(renew_interval: Duration) -> Self {
        Self::with_mode(RenewalMode::Explicit(renew_interval))
    }

    fn with_mode(mode: RenewalMode) -> Self {
        let (reachable, _) = watch::channel(true);
        Self {
            mode,
            inner: Arc::new(Mutex::new(Inner::default())),
            reachable: Arc::new(reachable),
        }
    }

    /// Another client of the same store with its own connectivity
    pub fn handle(&self) -> Self {
        let (reachable, _) = watch::channel(true);
        Self {
            mode: self.mode,
            inner: Arc::clone(&self.inner),
            reachable: Arc::new(reachable),
        }
    }

    /// Cut this handle off from the store; open observations end
    pub fn partition(&self) {
        self.reachable.send_replace(false);
    }

    /// Reconnect this handle
    pub fn heal(&self) {
        self.reachable.send_replace(true);
    }

    /// Expire a session as if its keepalive had stopped
    pub async fn expire_session(&self, session: &Session) {
        self.inner.lock().await.remove_session(session.id());
    }

    /// Expire whichever session holds `key`
    pub async fn expire_holder(&self, key: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(id) = inner.records.get(key).and_then(|r| r.session) {
            inner.remove_session(id);
        }
    }

    /// Write a value directly, bypassing campaign rules
    pub async fn put_raw(&self, key: &str, value: &str) {
        let mut inner = self.inner.lock().await;
        let revision = inner.next_revision();
        inner.records.insert(
            key.to_string(),
            Record {
                value: value.to_string(),
                session: None,
                expires_at: None,
                revision,
            },
        );
        inner.publish(key);
    }

    fn ensure_reachable(&self) -> Result<()> {
        if *self.reachable.borrow() {
            Ok(())
        } else {
            Err(Error::ConnectionFailed {
                endpoint: "memory".to_string(),
                reason: "partitioned".to_string(),
            })
        }
    }

    fn expiring(&self) -> bool {
        matches!(self.mode, RenewalMode::Explicit(_))
    }

    /// Simulated keepalive: lapse session `id` if this handle stays
    /// partitioned for a full `ttl`
    fn spawn_lapse(&self, id: i64, ttl: Duration, mut lost: watch::Receiver<bool>) {
        let inner = Arc::clone(&self.inner);
        let mut reachable = self.reachable.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = flag_raised(&mut lost) => return,
                    cut = reachable.wait_for(|up| !*up) => {
                        if cut.is_err() {
                            return;
                        }
                    }
                }

                let healed = tokio::select! {
                    _ = flag_raised(&mut lost) => return,
                    healed = tokio::time::timeout(ttl, reachable.wait_for(|up| *up)) => {
                        healed.map(|r| r.is_ok())
                    }
                };
                match healed {
                    Ok(true) => continue,
                    Ok(false) => return,
                    Err(_) => {
                        inner.lock().await.remove_session(id);
                        tracing::debug!("Session {:x} lapsed while partitioned", id);
                        return;
                    }
                }
            }
        });
    }

    /// Drop the record at `key` once `ttl` passes, unless it was rewritten
    fn schedule_expiry(&self, key: &str, revision: u64, ttl: Duration) {
        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let mut inner = inner.lock().await;
            if inner.records.get(&key).map(|r| r.revision) == Some(revision) {
                inner.records.remove(&key);
                inner.publish(&key);
                tracing::debug!("Record {} expired", key);
            }
        });
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    fn backend(&self) -> &'static str {
        match self.mode {
            RenewalMode::Implicit => "memory-session",
            RenewalMode::Explicit(_) => "memory-poll",
        }
    }

    fn renewal(&self) -> RenewalMode {
        self.mode
    }

    async fn create_session(&self, ttl: Duration) -> Result<Session> {
        self.ensure_reachable()?;
        let mut inner = self.inner.lock().await;
        inner.next_session += 1;
        let id = inner.next_session;
        let (lost, watcher) = watch::channel(false);
        inner.sessions.insert(id, SessionEntry { lost });
        drop(inner);

        if !self.expiring() {
            self.spawn_lapse(id, ttl, watcher);
        }
        Ok(Session::new(id, ttl))
    }

    async fn close_session(&self, session: &Session) -> Result<()> {
        self.ensure_reachable()?;
        self.inner.lock().await.remove_session(session.id());
        Ok(())
    }

    async fn session_lost(&self, session: &Session) {
        if self.expiring() {
            return std::future::pending().await;
        }
        let lost = self
            .inner
            .lock()
            .await
            .sessions
            .get(&session.id())
            .map(|entry| entry.lost.subscribe());
        if let Some(mut lost) = lost {
            flag_raised(&mut lost).await;
        }
    }

    async fn campaign(
        &self,
        session: Option<&Session>,
        key: &str,
        value: &str,
        timeout: Duration,
    ) -> Result<CampaignOutcome> {
        self.ensure_reachable()?;
        if session.is_none() && !self.expiring() {
            return Err(Error::Store("campaign on a session store requires a session".into()));
        }

        let deadline = Instant::now() + timeout;
        loop {
            let mut changes = {
                let mut inner = self.inner.lock().await;
                let now = Instant::now();
                inner.purge_expired(key, now);

                if let Some(s) = session {
                    if !self.expiring() && !inner.sessions.contains_key(&s.id()) {
                        return Err(Error::SessionExpired(s.id()));
                    }
                }

                let holder = inner.records.get(key).map(|r| r.session);
                match holder {
                    None => {
                        let revision = inner.next_revision();
                        let ttl = session.map(Session::ttl).filter(|_| self.expiring());
                        inner.records.insert(
                            key.to_string(),
                            Record {
                                value: value.to_string(),
                                session: session.map(Session::id),
                                expires_at: ttl.map(|t| now + t),
                                revision,
                            },
                        );
                        inner.publish(key);
                        drop(inner);

                        if let Some(ttl) = ttl {
                            self.schedule_expiry(key, revision, ttl);
                        }
                        return Ok(CampaignOutcome::Won);
                    }
                    Some(owner) if session.is_some() && owner == session.map(Session::id) => {
                        return Ok(CampaignOutcome::Won);
                    }
                    Some(_) if self.expiring() => return Ok(CampaignOutcome::Lost),
                    Some(_) => inner.channel(key).subscribe(),
                }
            };

            if tokio::time::timeout_at(deadline, changes.changed()).await.is_err() {
                return Ok(CampaignOutcome::TimedOut);
            }
            self.ensure_reachable()?;
        }
    }

    async fn read(&self, key: &str) -> Result<Option<String>> {
        self.ensure_reachable()?;
        let mut inner = self.inner.lock().await;
        inner.purge_expired(key, Instant::now());
        Ok(inner.records.get(key).map(|r| r.value.clone()))
    }

    async fn observe(&self, key: &str) -> Result<Observation> {
        self.ensure_reachable()?;
        let values = {
            let mut inner = self.inner.lock().await;
            inner.purge_expired(key, Instant::now());
            inner.channel(key).subscribe()
        };

        let mut reachable = self.reachable.subscribe();
        let cut = async move {
            loop {
                let up = *reachable.borrow_and_update();
                if !up || reachable.changed().await.is_err() {
                    break;
                }
            }
        };

        let stream = WatchStream::new(values)
            .take_until(cut)
            .scan(false, |ended, value| {
                let item = if *ended {
                    None
                } else {
                    match value {
                        Some(v) => Some(Observed::Value(v)),
                        None => {
                            *ended = true;
                            Some(Observed::Vacant)
                        }
                    }
                };
                future::ready(item)
            });
        Ok(stream.boxed())
    }

    async fn renew(&self, session: &Session, key: &str, value: &str) -> Result<RenewOutcome> {
        self.ensure_reachable()?;
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner.purge_expired(key, now);

        if !self.expiring() && !inner.sessions.contains_key(&session.id()) {
            return Ok(RenewOutcome::Lost);
        }

        let owned = match inner.records.get(key) {
            Some(record) => {
                record.value == value
                    && (self.expiring() || record.session == Some(session.id()))
            }
            None => false,
        };
        if !owned {
            return Ok(RenewOutcome::Lost);
        }

        if self.expiring() {
            let revision = inner.next_revision();
            if let Some(record) = inner.records.get_mut(key) {
                record.revision = revision;
                record.expires_at = Some(now + session.ttl());
            }
            drop(inner);
            self.schedule_expiry(key, revision, session.ttl());
        }
        Ok(RenewOutcome::Renewed)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.ensure_reachable()?;
        let mut inner = self.inner.lock().await;
        if inner.records.remove(key).is_some() {
            inner.publish(key);
        }
        Ok(())
    }
}
