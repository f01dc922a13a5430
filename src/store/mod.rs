//! Coordination Store Module
//!
//! Uniform contract over the external coordination store (etcd) used by
//! the election controller. Two wire backends are provided, a
//! session+watch backend over the etcd v3 JSON gateway and a poll+CAS
//! backend over the etcd v2 keys API, plus an in-process store used by
//! tests and simulations.

mod memory;
mod poll;
mod session;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::watch;

use crate::config::{Backend, StoreConfig};
use crate::election::ElectionTimings;
use crate::error::{Error, Result};

pub use memory::MemoryStore;
pub use poll::PollStore;
pub use session::SessionStore;

/// Handle to a store-side lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    id: i64,
    ttl: Duration,
}

impl Session {
    pub(crate) fn new(id: i64, ttl: Duration) -> Self {
        Self { id, ttl }
    }

    /// Store-assigned lease identifier
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Lease time-to-live
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// Result of a registration attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignOutcome {
    /// The record was written; this process leads
    Won,
    /// Another record is present
    Lost,
    /// No answer within the campaign timeout
    TimedOut,
}

impl fmt::Display for CampaignOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CampaignOutcome::Won => write!(f, "won"),
            CampaignOutcome::Lost => write!(f, "lost"),
            CampaignOutcome::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Result of a compare-and-swap refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewOutcome {
    /// The record is still ours and its TTL was extended
    Renewed,
    /// The record is gone or owned by someone else
    Lost,
}

/// How a leader's record is kept alive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalMode {
    /// The store keeps the lease alive in the background
    Implicit,
    /// The controller must call `renew` on this interval
    Explicit(Duration),
}

/// One item of an observation sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observed {
    /// Current (or changed) value of the key
    Value(String),
    /// The key was deleted or expired; the sequence ends after this
    Vacant,
}

/// Lazy sequence of value changes for one key.
///
/// Yields the current value first. Ends after `Observed::Vacant`, or
/// without an item when the connection or session is lost.
pub type Observation = BoxStream<'static, Observed>;

/// Contract every coordination backend satisfies
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Backend name for logs
    fn backend(&self) -> &'static str;

    /// How leaders keep their record alive on this backend
    fn renewal(&self) -> RenewalMode;

    /// Acquire a lease with the given TTL
    async fn create_session(&self, ttl: Duration) -> Result<Session>;

    /// Release a lease and everything bound to it
    async fn close_session(&self, session: &Session) -> Result<()>;

    /// Resolve once the session's lease has lapsed, i.e. no keepalive
    /// succeeded for a full TTL or the store reported it expired.
    /// Never resolves on backends whose leaders renew explicitly.
    async fn session_lost(&self, session: &Session);

    /// Atomically register `value` under `key` if nobody holds it.
    ///
    /// Returns within `timeout`. A timed out attempt must never be
    /// treated as won.
    async fn campaign(
        &self,
        session: Option<&Session>,
        key: &str,
        value: &str,
        timeout: Duration,
    ) -> Result<CampaignOutcome>;

    /// Read the current value of `key`
    async fn read(&self, key: &str) -> Result<Option<String>>;

    /// Subscribe to value changes of `key`
    async fn observe(&self, key: &str) -> Result<Observation>;

    /// Refresh the record if the caller still owns it
    async fn renew(&self, session: &Session, key: &str, value: &str) -> Result<RenewOutcome>;

    /// Remove this process's record (best effort)
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Build the configured store backend
pub fn connect(
    config: &StoreConfig,
    timings: &ElectionTimings,
) -> Result<Arc<dyn CoordinationStore>> {
    let request_timeout = config.request_timeout();
    let store: Arc<dyn CoordinationStore> = match config.backend {
        Backend::Session => Arc::new(SessionStore::new(&config.endpoints, request_timeout)?),
        Backend::Poll => Arc::new(PollStore::new(
            &config.endpoints,
            request_timeout,
            timings.poll_interval,
            timings.renew_interval,
        )?),
    };

    tracing::info!(
        "Using {} coordination store at {}",
        store.backend(),
        config.endpoints.join(",")
    );
    Ok(store)
}

/// Normalize an endpoint to a base URL without trailing slash
pub(crate) fn normalize_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}

/// Store endpoints with failover to the next one on connection errors
pub(crate) struct EndpointPool {
    urls: Vec<String>,
    current: AtomicUsize,
}

impl EndpointPool {
    pub(crate) fn new(endpoints: &[String]) -> Result<Self> {
        let urls: Vec<String> = endpoints
            .iter()
            .filter(|e| !e.trim().is_empty())
            .map(|e| normalize_endpoint(e))
            .collect();
        if urls.is_empty() {
            return Err(Error::Config("at least one store endpoint is required".into()));
        }
        Ok(Self {
            urls,
            current: AtomicUsize::new(0),
        })
    }

    /// Endpoint requests should currently go to
    pub(crate) fn current(&self) -> &str {
        let idx = self.current.load(Ordering::Relaxed) % self.urls.len();
        &self.urls[idx]
    }

    /// Move on from `failed` if it is still the current endpoint
    pub(crate) fn failover(&self, failed: &str) {
        if self.urls.len() < 2 {
            return;
        }
        let idx = self.current.load(Ordering::Relaxed) % self.urls.len();
        if self.urls[idx] == failed {
            let next = (idx + 1) % self.urls.len();
            if self
                .current
                .compare_exchange(idx, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                tracing::warn!("Store endpoint {} unreachable, switching to {}", failed, self.urls[next]);
            }
        }
    }

    /// Fail over when `err` says the endpoint could not be reached.
    /// Timeouts do not count: a blocked campaign times out on a healthy
    /// endpoint.
    pub(crate) fn note_error(&self, endpoint: &str, err: &Error) {
        if matches!(err, Error::ConnectionFailed { .. }) {
            self.failover(endpoint);
        }
    }
}

/// Resolve once `flag` is raised or its sender is gone
pub(crate) async fn flag_raised(flag: &mut watch::Receiver<bool>) {
    loop {
        if *flag.borrow_and_update() {
            return;
        }
        if flag.changed().await.is_err() {
            return;
        }
    }
}

/// Whole seconds for store TTL fields, rounded up, at least one
pub(crate) fn whole_secs(ttl: Duration) -> u64 {
    let millis = ttl.as_millis() as u64;
    ((millis + 999) / 1000).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(normalize_endpoint("127.0.0.1:2379"), "http://127.0.0.1:2379");
        assert_eq!(normalize_endpoint(" http://etcd:2379/ "), "http://etcd:2379");
        assert_eq!(normalize_endpoint("https://etcd:2379"), "https://etcd:2379");
    }

    #[test]
    fn test_endpoint_pool_failover() {
        let pool = EndpointPool::new(&["a:2379".to_string(), "b:2379".to_string()]).unwrap();
        assert_eq!(pool.current(), "http://a:2379");

        // Only the current endpoint can be failed over
        pool.failover("http://b:2379");
        assert_eq!(pool.current(), "http://a:2379");

        pool.failover("http://a:2379");
        assert_eq!(pool.current(), "http://b:2379");

        pool.note_error("http://b:2379", &Error::Timeout("http://b:2379".into()));
        assert_eq!(pool.current(), "http://b:2379");

        let refused = Error::ConnectionFailed {
            endpoint: "http://b:2379".into(),
            reason: "refused".into(),
        };
        pool.note_error("http://b:2379", &refused);
        assert_eq!(pool.current(), "http://a:2379");

        assert!(EndpointPool::new(&[" ".to_string()]).is_err());
    }

    #[test]
    fn test_whole_secs() {
        assert_eq!(whole_secs(Duration::from_secs(15)), 15);
        assert_eq!(whole_secs(Duration::from_millis(1500)), 2);
        assert_eq!(whole_secs(Duration::from_millis(10)), 1);
    }

    #[test]
    fn test_campaign_outcome_display() {
        assert_eq!(CampaignOutcome::TimedOut.to_string(), "timed out");
        assert_eq!(CampaignOutcome::Won.to_string(), "won");
    }
}
