//! Poll Backend (etcd v2 keys API)
//!
//! No server-side keepalive exists: the leader re-asserts ownership with
//! a compare-and-swap PUT on every renew tick, and observers poll the key.
//!
//! Wire summary:
//! - claim:  `PUT /v2/keys/<key>?prevExist=false` form `value=..&ttl=..`
//! - renew:  `PUT /v2/keys/<key>?prevExist=true&prevValue=..` same form
//! - read:   `GET /v2/keys/<key>`
//! - delete: `DELETE /v2/keys/<key>?prevValue=..`

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::{Interval, MissedTickBehavior};

use super::{
    whole_secs, CampaignOutcome, CoordinationStore, EndpointPool, Observation, Observed,
    RenewOutcome, RenewalMode, Session,
};
use crate::error::{Error, Result};

/// etcd v2 error codes
const KEY_NOT_FOUND: u32 = 100;
const COMPARE_FAILED: u32 = 101;
const NODE_EXIST: u32 = 105;

/// TTL used when a campaign carries no session
const DEFAULT_TTL: Duration = Duration::from_secs(15);

/// Body of a successful keys request
#[derive(Debug, Deserialize)]
pub(crate) struct KeysResponse {
    pub action: String,
    pub node: Node,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Node {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub created_index: u64,
    #[serde(default)]
    pub modified_index: u64,
}

/// Body of a failed keys request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ErrorBody {
    pub error_code: u32,
    #[serde(default)]
    pub message: String,
}

/// What a conditional write must find
#[derive(Debug, Clone, Copy)]
enum Precondition<'a> {
    Absent,
    Owned(&'a str),
}

/// Outcome of a conditional write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Write {
    Accepted,
    Rejected,
}

fn key_url(base: &str, key: &str) -> String {
    format!("{}/v2/keys/{}", base, key.trim_matches('/'))
}

fn classify_write(status: StatusCode, body: &str) -> Result<Write> {
    if status.is_success() {
        return Ok(Write::Accepted);
    }

    match serde_json::from_str::<ErrorBody>(body) {
        Ok(err) if matches!(err.error_code, KEY_NOT_FOUND | COMPARE_FAILED | NODE_EXIST) => {
            tracing::debug!("Conditional write rejected: {} ({})", err.message, err.error_code);
            Ok(Write::Rejected)
        }
        _ if status == StatusCode::PRECONDITION_FAILED || status == StatusCode::NOT_FOUND => {
            Ok(Write::Rejected)
        }
        _ => Err(Error::UnexpectedResponse {
            status: status.as_u16(),
            body: body.to_string(),
        }),
    }
}

async fn fetch(client: &reqwest::Client, base: &str, url: &str) -> Result<Option<Node>> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| Error::from_request(base, e))?;

    match response.status() {
        StatusCode::NOT_FOUND => Ok(None),
        status if status.is_success() => {
            let body: KeysResponse = response.json().await?;
            tracing::trace!(
                "{} {} (modified index {})",
                body.action,
                body.node.key,
                body.node.modified_index
            );
            Ok(Some(body.node))
        }
        status => Err(Error::UnexpectedResponse {
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        }),
    }
}

struct PollState {
    client: reqwest::Client,
    base: String,
    url: String,
    ticker: Interval,
    last: Option<String>,
    done: bool,
}

async fn poll_next(mut state: PollState) -> Option<(Observed, PollState)> {
    if state.done {
        return None;
    }

    loop {
        state.ticker.tick().await;
        match fetch(&state.client, &state.base, &state.url).await {
            Ok(Some(node)) => match node.value.filter(|v| !v.is_empty()) {
                Some(value) if state.last.as_deref() == Some(value.as_str()) => continue,
                Some(value) => {
                    state.last = Some(value.clone());
                    return Some((Observed::Value(value), state));
                }
                None => {
                    state.done = true;
                    return Some((Observed::Vacant, state));
                }
            },
            Ok(None) => {
                state.done = true;
                return Some((Observed::Vacant, state));
            }
            Err(e) => {
                tracing::warn!("Polling {} failed: {}", state.url, e);
                return None;
            }
        }
    }
}

/// Poll+CAS coordination store over the etcd v2 keys API
pub struct PollStore {
    client: reqwest::Client,
    endpoints: EndpointPool,
    request_timeout: Duration,
    poll_interval: Duration,
    renew_interval: Duration,
    next_session: AtomicI64,
    /// Values this process successfully claimed, by key
    claims: Mutex<HashMap<String, String>>,
}

impl PollStore {
    /// Create a new poll store
    pub fn new(
        endpoints: &[String],
        request_timeout: Duration,
        poll_interval: Duration,
        renew_interval: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            endpoints: EndpointPool::new(endpoints)?,
            request_timeout,
            poll_interval,
            renew_interval,
            next_session: AtomicI64::new(1),
            claims: Mutex::new(HashMap::new()),
        })
    }

    async fn put(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        precondition: Precondition<'_>,
        timeout: Duration,
    ) -> Result<Write> {
        let base = self.endpoints.current().to_string();
        let url = key_url(&base, key);

        let mut query = Vec::with_capacity(2);
        match precondition {
            Precondition::Absent => query.push(("prevExist", "false")),
            Precondition::Owned(current) => {
                query.push(("prevExist", "true"));
                query.push(("prevValue", current));
            }
        }
        let ttl = whole_secs(ttl).to_string();

        let response = match self
            .client
            .put(&url)
            .query(&query)
            .form(&[("value", value), ("ttl", ttl.as_str())])
            .timeout(timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let err = Error::from_request(&base, e);
                self.endpoints.note_error(&base, &err);
                return Err(err);
            }
        };

        let status = response.status();
        let body = response.text().await?;
        classify_write(status, &body)
    }
}

#[async_trait]
impl CoordinationStore for PollStore {
    fn backend(&self) -> &'static str {
        "etcd-v2-poll"
    }

    fn renewal(&self) -> RenewalMode {
        RenewalMode::Explicit(self.renew_interval)
    }

    async fn create_session(&self, ttl: Duration) -> Result<Session> {
        // No leases on this API; probing the server keeps connectivity
        // failures on the session path.
        let base = self.endpoints.current().to_string();
        let response = match self.client.get(format!("{}/version", base)).send().await {
            Ok(response) => response,
            Err(e) => {
                let err = Error::from_request(&base, e);
                self.endpoints.note_error(&base, &err);
                return Err(err);
            }
        };
        if !response.status().is_success() {
            return Err(Error::UnexpectedResponse {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        Ok(Session::new(id, ttl))
    }

    async fn close_session(&self, _session: &Session) -> Result<()> {
        Ok(())
    }

    async fn session_lost(&self, _session: &Session) {
        // Records carry their own TTL; the renewal loop notices expiry
        std::future::pending().await
    }

    async fn campaign(
        &self,
        session: Option<&Session>,
        key: &str,
        value: &str,
        timeout: Duration,
    ) -> Result<CampaignOutcome> {
        let ttl = session.map(Session::ttl).unwrap_or(DEFAULT_TTL);
        match self.put(key, value, ttl, Precondition::Absent, timeout).await {
            Ok(Write::Accepted) => {
                self.claims
                    .lock()
                    .await
                    .insert(key.to_string(), value.to_string());
                Ok(CampaignOutcome::Won)
            }
            Ok(Write::Rejected) => Ok(CampaignOutcome::Lost),
            Err(Error::Timeout(_)) => Ok(CampaignOutcome::TimedOut),
            Err(e) => Err(e),
        }
    }

    async fn read(&self, key: &str) -> Result<Option<String>> {
        let base = self.endpoints.current().to_string();
        match fetch(&self.client, &base, &key_url(&base, key)).await {
            Ok(node) => Ok(node.and_then(|n| n.value).filter(|v| !v.is_empty())),
            Err(e) => {
                self.endpoints.note_error(&base, &e);
                Err(e)
            }
        }
    }

    async fn observe(&self, key: &str) -> Result<Observation> {
        let base = self.endpoints.current().to_string();
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let state = PollState {
            client: self.client.clone(),
            url: key_url(&base, key),
            base,
            ticker,
            last: None,
            done: false,
        };
        Ok(futures::stream::unfold(state, poll_next).boxed())
    }

    async fn renew(&self, session: &Session, key: &str, value: &str) -> Result<RenewOutcome> {
        match self
            .put(key, value, session.ttl(), Precondition::Owned(value), self.request_timeout)
            .await?
        {
            Write::Accepted => Ok(RenewOutcome::Renewed),
            Write::Rejected => {
                self.claims.lock().await.remove(key);
                Ok(RenewOutcome::Lost)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let Some(value) = self.claims.lock().await.remove(key) else {
            tracing::debug!("No claim on {} to delete", key);
            return Ok(());
        };

        let base = self.endpoints.current().to_string();
        let response = self
            .client
            .delete(key_url(&base, key))
            .query(&[("prevValue", value.as_str())])
            .send()
            .await
            .map_err(|e| Error::from_request(&base, e))?;

        let status = response.status();
        let body = response.text().await?;
        match classify_write(status, &body)? {
            Write::Accepted => tracing::info!("Deleted leader record {}", key),
            Write::Rejected => tracing::info!("Leader record {} was already gone", key),
        }
        Ok(())
    }
}
