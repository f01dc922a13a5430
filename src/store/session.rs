//! Session Backend (etcd v3 JSON gateway)
//!
//! Leases are kept alive by a background task per session, so a leader
//! never renews explicitly: if the process dies or is partitioned the
//! lease lapses and etcd removes the leader key. Leadership uses the
//! v3 election service; observation re-reads the leader whenever a watch
//! on the election prefix reports a change.
//!
//! The keepalive task raises a per-session loss flag once no keepalive
//! has succeeded for a full TTL, so a partitioned leader steps down at
//! the same time etcd would drop its key.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::BytesMut;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{
    flag_raised, whole_secs, CampaignOutcome, CoordinationStore, EndpointPool, Observation, Observed,
    RenewOutcome, RenewalMode, Session,
};
use crate::error::{Error, Result};

/// Shortest keepalive period, whatever the lease TTL
const MIN_KEEPALIVE: Duration = Duration::from_millis(500);

// ============ Gateway Payloads ============

/// The gateway renders int64 fields as strings; accept either form
fn de_i64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Int64 {
        Number(i64),
        Text(String),
    }

    match Int64::deserialize(deserializer)? {
        Int64::Number(n) => Ok(n),
        Int64::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Default, Deserialize)]
struct Header {
    #[serde(default, deserialize_with = "de_i64")]
    revision: i64,
}

#[derive(Debug, Serialize)]
struct LeaseGrantRequest {
    #[serde(rename = "TTL")]
    ttl: u64,
}

#[derive(Debug, Serialize)]
struct LeaseRequest {
    #[serde(rename = "ID")]
    id: i64,
}

#[derive(Debug, Deserialize)]
struct LeaseResponse {
    #[serde(rename = "ID", default, deserialize_with = "de_i64")]
    id: i64,
    #[serde(rename = "TTL", default, deserialize_with = "de_i64")]
    ttl: i64,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KeepAliveMessage {
    result: Option<LeaseResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeaderKey {
    name: String,
    key: String,
    #[serde(default, deserialize_with = "de_i64")]
    rev: i64,
    #[serde(default, deserialize_with = "de_i64")]
    lease: i64,
}

#[derive(Debug, Serialize)]
struct CampaignRequest {
    name: String,
    lease: i64,
    value: String,
}

#[derive(Debug, Deserialize)]
struct CampaignResponse {
    leader: Option<LeaderKey>,
}

#[derive(Debug, Serialize)]
struct LeaderRequest {
    name: String,
}

#[derive(Debug, Deserialize)]
struct KeyValue {
    key: String,
    #[serde(default)]
    value: String,
    #[serde(default, deserialize_with = "de_i64")]
    lease: i64,
}

#[derive(Debug, Deserialize)]
struct LeaderResponse {
    #[serde(default)]
    header: Header,
    kv: Option<KeyValue>,
}

#[derive(Debug, Serialize)]
struct ResignRequest {
    leader: LeaderKey,
}

#[derive(Debug, Serialize)]
struct WatchCreate {
    key: String,
    range_end: String,
    start_revision: i64,
}

#[derive(Debug, Serialize)]
struct WatchRequest {
    create_request: WatchCreate,
}

#[derive(Debug, Deserialize)]
struct WatchEvent {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    kv: Option<KeyValue>,
}

#[derive(Debug, Default, Deserialize)]
struct WatchResult {
    #[serde(default)]
    created: bool,
    #[serde(default)]
    canceled: bool,
    #[serde(default)]
    events: Vec<WatchEvent>,
}

#[derive(Debug, Deserialize)]
struct WatchMessage {
    result: Option<WatchResult>,
    error: Option<serde_json::Value>,
}

fn encode(raw: &str) -> String {
    STANDARD.encode(raw.as_bytes())
}

fn decode(encoded: &str) -> Result<String> {
    let bytes = STANDARD.decode(encoded)?;
    String::from_utf8(bytes).map_err(|e| Error::Store(format!("non-UTF-8 value: {}", e)))
}

/// Smallest key greater than every key starting with `prefix`
fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    // All 0xff: range to the end of the keyspace
    vec![0]
}

/// Newline-delimited JSON messages from a streaming gateway response
struct JsonLines {
    response: reqwest::Response,
    buffer: BytesMut,
}

impl JsonLines {
    fn new(response: reqwest::Response) -> Self {
        Self {
            response,
            buffer: BytesMut::new(),
        }
    }

    async fn next<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line = self.buffer.split_to(pos + 1);
                let line = &line[..pos];
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Ok(Some(serde_json::from_slice(line)?));
            }

            match self.response.chunk().await? {
                Some(chunk) => self.buffer.extend_from_slice(&chunk),
                None if self.buffer.iter().all(u8::is_ascii_whitespace) => return Ok(None),
                None => {
                    let rest = self.buffer.split();
                    return Ok(Some(serde_json::from_slice(&rest)?));
                }
            }
        }
    }
}

// ============ Gateway Client ============

/// Current leader as seen by the election service
struct Leadership {
    value: String,
    revision: i64,
}

struct Gateway {
    client: reqwest::Client,
    endpoints: EndpointPool,
    request_timeout: Duration,
}

impl Gateway {
    async fn send<Req: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &Req,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response> {
        let base = self.endpoints.current().to_string();
        let mut request = self.client.post(format!("{}{}", base, path)).json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                let err = Error::from_request(&base, e);
                self.endpoints.note_error(&base, &err);
                return Err(err);
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Err(Error::UnexpectedResponse {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response)
    }

    async fn call<Req: Serialize + ?Sized, Resp: DeserializeOwned>(
        &self,
        path: &str,
        body: &Req,
        timeout: Duration,
    ) -> Result<Resp> {
        let response = self.send(path, body, Some(timeout)).await?;
        Ok(response.json().await?)
    }

    async fn keep_alive(&self, id: i64) -> Result<i64> {
        let response = self
            .send("/v3/lease/keepalive", &LeaseRequest { id }, Some(self.request_timeout))
            .await?;
        let message: Option<KeepAliveMessage> = JsonLines::new(response).next().await?;
        match message.and_then(|m| m.result).map_or(0, |r| r.ttl) {
            ttl if ttl > 0 => Ok(ttl),
            _ => Err(Error::SessionExpired(id)),
        }
    }

    async fn leader(&self, name: &str) -> Result<Option<Leadership>> {
        let request = LeaderRequest { name: encode(name) };
        let response: LeaderResponse = match self
            .call("/v3/election/leader", &request, self.request_timeout)
            .await
        {
            Ok(response) => response,
            Err(Error::UnexpectedResponse { status, body })
                if status == 404 || body.contains("no leader") =>
            {
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let Some(kv) = response.kv else {
            return Ok(None);
        };
        let value = decode(&kv.value)?;
        if value.is_empty() {
            return Ok(None);
        }
        tracing::trace!("Leader key {} (lease {:x})", decode(&kv.key)?, kv.lease);
        Ok(Some(Leadership {
            value,
            revision: response.header.revision,
        }))
    }

    async fn watch_prefix(&self, prefix: &str, start_revision: i64) -> Result<JsonLines> {
        let request = WatchRequest {
            create_request: WatchCreate {
                key: encode(prefix),
                range_end: STANDARD.encode(prefix_range_end(prefix.as_bytes())),
                start_revision,
            },
        };
        // No timeout: the watch streams until the caller drops it
        let response = self.send("/v3/watch", &request, None).await?;
        Ok(JsonLines::new(response))
    }
}

struct WatchState {
    gateway: Arc<Gateway>,
    name: String,
    lines: JsonLines,
    current: String,
    first: Option<Observed>,
    done: bool,
}

async fn watch_next(mut state: WatchState) -> Option<(Observed, WatchState)> {
    if state.done {
        return None;
    }
    if let Some(first) = state.first.take() {
        return Some((first, state));
    }

    loop {
        let message: WatchMessage = match state.lines.next().await {
            Ok(Some(message)) => message,
            Ok(None) => {
                tracing::debug!("Watch on {} closed", state.name);
                return None;
            }
            Err(e) => {
                tracing::warn!("Watch on {} failed: {}", state.name, e);
                return None;
            }
        };

        if let Some(err) = message.error {
            tracing::warn!("Watch on {} returned error: {}", state.name, err);
            return None;
        }
        let result = message.result.unwrap_or_default();
        if result.canceled {
            tracing::warn!("Watch on {} was cancelled by the server", state.name);
            return None;
        }
        if result.created || result.events.is_empty() {
            continue;
        }

        for event in &result.events {
            tracing::debug!(
                "Election event {} on {}",
                event.kind.as_deref().unwrap_or("PUT"),
                event.kv.as_ref().map(|kv| kv.key.as_str()).unwrap_or("?")
            );
        }

        // Something under the election prefix changed; ask who leads now
        match state.gateway.leader(&state.name).await {
            Ok(Some(leader)) if leader.value == state.current => continue,
            Ok(Some(leader)) => {
                state.current = leader.value.clone();
                return Some((Observed::Value(leader.value), state));
            }
            Ok(None) => {
                state.done = true;
                return Some((Observed::Vacant, state));
            }
            Err(e) => {
                tracing::warn!("Leader lookup for {} failed: {}", state.name, e);
                return None;
            }
        }
    }
}

// ============ Store ============

/// Background keepalive of one lease
struct Keepalive {
    handle: JoinHandle<()>,
    /// Raised when the lease is known or presumed expired
    lost: watch::Receiver<bool>,
}

/// Session+watch coordination store over the etcd v3 JSON gateway
pub struct SessionStore {
    gateway: Arc<Gateway>,
    keepalives: Mutex<HashMap<i64, Keepalive>>,
    leaderships: Mutex<HashMap<String, LeaderKey>>,
}

impl SessionStore {
    /// Create a new session store
    pub fn new(endpoints: &[String], request_timeout: Duration) -> Result<Self> {
        // No client-wide timeout: watch responses stream indefinitely
        let client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()?;
        Ok(Self {
            gateway: Arc::new(Gateway {
                client,
                endpoints: EndpointPool::new(endpoints)?,
                request_timeout,
            }),
            keepalives: Mutex::new(HashMap::new()),
            leaderships: Mutex::new(HashMap::new()),
        })
    }

    fn spawn_keepalive(&self, id: i64, ttl: Duration) -> Keepalive {
        let gateway = Arc::clone(&self.gateway);
        let period = (ttl / 3).max(MIN_KEEPALIVE);
        let (lost_tx, lost) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            let mut last_success = Instant::now();
            loop {
                // Past this point etcd has dropped the lease
                let deadline = last_success + ttl;
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = tokio::time::sleep_until(deadline) => {
                        tracing::warn!("Lease {:x} lapsed: no keepalive within {:?}", id, ttl);
                        break;
                    }
                }

                let sent = Instant::now();
                match tokio::time::timeout_at(deadline, gateway.keep_alive(id)).await {
                    Ok(Ok(remaining)) => {
                        tracing::trace!("Lease {:x} kept alive ({}s left)", id, remaining);
                        last_success = sent;
                    }
                    Ok(Err(Error::SessionExpired(_))) => {
                        tracing::warn!("Lease {:x} expired", id);
                        break;
                    }
                    Ok(Err(e)) => tracing::warn!("Keepalive for lease {:x} failed: {}", id, e),
                    Err(_) => {
                        tracing::warn!("Lease {:x} lapsed: no keepalive within {:?}", id, ttl);
                        break;
                    }
                }
            }
            lost_tx.send_replace(true);
        });
        Keepalive { handle, lost }
    }
}

#[async_trait]
impl CoordinationStore for SessionStore {
    fn backend(&self) -> &'static str {
        "etcd-v3-session"
    }

    fn renewal(&self) -> RenewalMode {
        RenewalMode::Implicit
    }

    async fn create_session(&self, ttl: Duration) -> Result<Session> {
        let request = LeaseGrantRequest {
            ttl: whole_secs(ttl),
        };
        let granted: LeaseResponse = self
            .gateway
            .call("/v3/lease/grant", &request, self.gateway.request_timeout)
            .await?;
        if let Some(err) = granted.error.filter(|e| !e.is_empty()) {
            return Err(Error::Store(format!("lease grant failed: {}", err)));
        }

        let keepalive = self.spawn_keepalive(granted.id, ttl);
        self.keepalives.lock().await.insert(granted.id, keepalive);
        tracing::debug!("Granted lease {:x} with TTL {}s", granted.id, granted.ttl);
        Ok(Session::new(granted.id, ttl))
    }

    async fn close_session(&self, session: &Session) -> Result<()> {
        if let Some(keepalive) = self.keepalives.lock().await.remove(&session.id()) {
            keepalive.handle.abort();
        }
        self.leaderships
            .lock()
            .await
            .retain(|_, leader| leader.lease != session.id());

        let request = LeaseRequest { id: session.id() };
        match self
            .gateway
            .call::<_, serde_json::Value>("/v3/lease/revoke", &request, self.gateway.request_timeout)
            .await
        {
            Ok(_) => Ok(()),
            // Lease already expired
            Err(Error::UnexpectedResponse { status: 404, .. }) => Ok(()),
            Err(Error::UnexpectedResponse { body, .. }) if body.contains("lease not found") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn session_lost(&self, session: &Session) {
        let lost = self
            .keepalives
            .lock()
            .await
            .get(&session.id())
            .map(|keepalive| keepalive.lost.clone());
        // No keepalive task: the session was closed or never granted
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
        let Some(session) = session else {
            return Err(Error::Store("campaign on a session store requires a session".into()));
        };

        let request = CampaignRequest {
            name: encode(key),
            lease: session.id(),
            value: encode(value),
        };
        match self
            .gateway
            .call::<_, CampaignResponse>("/v3/election/campaign", &request, timeout)
            .await
        {
            Ok(CampaignResponse {
                leader: Some(leader),
            }) => {
                self.leaderships.lock().await.insert(key.to_string(), leader);
                Ok(CampaignOutcome::Won)
            }
            Ok(CampaignResponse { leader: None }) => {
                Err(Error::Store("campaign response carried no leader key".into()))
            }
            Err(Error::Timeout(_)) => Ok(CampaignOutcome::TimedOut),
            Err(e) => Err(e),
        }
    }

    async fn read(&self, key: &str) -> Result<Option<String>> {
        Ok(self.gateway.leader(key).await?.map(|l| l.value))
    }

    async fn observe(&self, key: &str) -> Result<Observation> {
        let Some(leader) = self.gateway.leader(key).await? else {
            return Ok(futures::stream::iter([Observed::Vacant]).boxed());
        };

        let lines = self.gateway.watch_prefix(key, leader.revision + 1).await?;
        let state = WatchState {
            gateway: Arc::clone(&self.gateway),
            name: key.to_string(),
            lines,
            current: leader.value.clone(),
            first: Some(Observed::Value(leader.value)),
            done: false,
        };
        Ok(futures::stream::unfold(state, watch_next).boxed())
    }

    async fn renew(&self, session: &Session, key: &str, value: &str) -> Result<RenewOutcome> {
        let held = self
            .leaderships
            .lock()
            .await
            .get(key)
            .map_or(false, |leader| leader.lease == session.id());
        if !held {
            return Ok(RenewOutcome::Lost);
        }

        let lease: LeaseResponse = self
            .gateway
            .call(
                "/v3/lease/timetolive",
                &LeaseRequest { id: session.id() },
                self.gateway.request_timeout,
            )
            .await?;
        // Expired leases report a TTL of -1
        if lease.ttl <= 0 {
            return Ok(RenewOutcome::Lost);
        }

        match self.gateway.leader(key).await? {
            Some(leader) if leader.value == value => Ok(RenewOutcome::Renewed),
            _ => Ok(RenewOutcome::Lost),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let Some(leader) = self.leaderships.lock().await.remove(key) else {
            tracing::debug!("No leadership on {} to resign", key);
            return Ok(());
        };

        self.gateway
            .call::<_, serde_json::Value>(
                "/v3/election/resign",
                &ResignRequest { leader },
                self.gateway.request_timeout,
            )
            .await?;
        tracing::info!("Resigned leadership of {}", key);
        Ok(())
    }
}
