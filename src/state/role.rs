//! Role State
//!
//! The process-wide `{role, leader}` fact base. Writers swap whole
//! snapshots through a watch channel, so readers never observe a torn
//! pair and never wait on election I/O.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::error::{Error, Result};

/// Role of this process in the election
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Role {
    /// This process holds the election key
    Leader,
    /// Another process (or nobody) holds the election key
    Follower,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Leader => write!(f, "LEADER"),
            Role::Follower => write!(f, "FOLLOWER"),
        }
    }
}

/// Where the leader can be reached, as advertised in its candidate record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum LeaderAddress {
    /// Bare port, the default advertised value
    Port(u16),
    /// Explicit `host:port`
    HostPort { host: String, port: u16 },
}

impl LeaderAddress {
    /// Port component of the address
    pub fn port(&self) -> u16 {
        match self {
            LeaderAddress::Port(port) => *port,
            LeaderAddress::HostPort { port, .. } => *port,
        }
    }
}

impl FromStr for LeaderAddress {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        let value = raw.trim();
        if let Ok(port) = value.parse::<u16>() {
            return Ok(LeaderAddress::Port(port));
        }

        match value.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && !host.contains(char::is_whitespace) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::MalformedLeader(raw.to_string()))?;
                Ok(LeaderAddress::HostPort {
                    host: host.to_string(),
                    port,
                })
            }
            _ => Err(Error::MalformedLeader(raw.to_string())),
        }
    }
}

impl fmt::Display for LeaderAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaderAddress::Port(port) => write!(f, "{}", port),
            LeaderAddress::HostPort { host, port } => write!(f, "{}:{}", host, port),
        }
    }
}

/// Best current knowledge of who leads
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderInfo {
    pub address: LeaderAddress,
    pub observed_at: DateTime<Utc>,
}

/// Immutable view of the role state at one instant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoleSnapshot {
    pub role: Role,
    pub leader: Option<LeaderInfo>,
}

impl RoleSnapshot {
    /// Human-readable answer to "who leads"
    pub fn status_line(&self) -> String {
        match self.role {
            Role::Leader => "I am the leader".to_string(),
            Role::Follower => {
                let leader = self
                    .leader
                    .as_ref()
                    .map(|l| l.address.port().to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                format!("I am a follower and the leader is on port {}", leader)
            }
        }
    }
}

impl Default for RoleSnapshot {
    fn default() -> Self {
        Self {
            role: Role::Follower,
            leader: None,
        }
    }
}

/// Shared, synchronized role state
pub struct RoleState {
    tx: watch::Sender<RoleSnapshot>,
}

impl RoleState {
    /// Create a new role state (Follower, no known leader)
    pub fn new() -> Self {
        let (tx, _) = watch::channel(RoleSnapshot::default());
        Self { tx }
    }

    /// Copy of the current snapshot
    pub fn snapshot(&self) -> RoleSnapshot {
        self.tx.borrow().clone()
    }

    /// Current role
    pub fn role(&self) -> Role {
        self.tx.borrow().role
    }

    /// Last known leader address
    pub fn leader_address(&self) -> Option<LeaderAddress> {
        self.tx.borrow().leader.as_ref().map(|l| l.address.clone())
    }

    /// Status line for the current snapshot
    pub fn status_line(&self) -> String {
        self.tx.borrow().status_line()
    }

    /// Subscribe to snapshot changes
    pub fn subscribe(&self) -> watch::Receiver<RoleSnapshot> {
        self.tx.subscribe()
    }

    /// Become leader, advertising `own` as the leader address
    pub(crate) fn promote(&self, own: LeaderAddress) -> bool {
        self.tx.send_if_modified(|snapshot| {
            let changed = snapshot.role != Role::Leader
                || snapshot.leader.as_ref().map(|l| &l.address) != Some(&own);
            if changed {
                snapshot.role = Role::Leader;
                snapshot.leader = Some(LeaderInfo {
                    address: own,
                    observed_at: Utc::now(),
                });
            }
            changed
        })
    }

    /// Become follower; the last known leader address is kept
    pub(crate) fn demote(&self) -> bool {
        self.tx.send_if_modified(|snapshot| {
            if snapshot.role == Role::Follower {
                return false;
            }
            snapshot.role = Role::Follower;
            true
        })
    }

    /// Record the current leader's address. Returns true if it changed.
    pub(crate) fn record_leader(&self, address: LeaderAddress) -> bool {
        self.tx.send_if_modified(|snapshot| {
            if snapshot.leader.as_ref().map(|l| &l.address) == Some(&address) {
                return false;
            }
            snapshot.leader = Some(LeaderInfo {
                address,
                observed_at: Utc::now(),
            });
            true
        })
    }
}

impl Default for RoleState {
    fn default() -> Self {
        Self::new()
    }
}
