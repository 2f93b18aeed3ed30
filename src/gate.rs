//! Single-owner control gate
//!
//! Many browsers may watch the daemon but only one connection, the owner,
//! may change it. Who wins when a second connection arrives is decided by
//! [`TakeoverPolicy`].

use crate::config::TakeoverPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of one control connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of an ownership operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerChange {
    /// Owner after the operation
    pub owner: Option<ConnectionId>,
    /// Previous owner that lost control and must be told so
    pub displaced: Option<ConnectionId>,
    /// Whether the owner differs from before
    pub changed: bool,
}

#[derive(Debug, Clone)]
pub struct OwnerGate {
    owner: Option<ConnectionId>,
    policy: TakeoverPolicy,
}

impl OwnerGate {
    pub fn new(policy: TakeoverPolicy) -> Self {
        Self {
            owner: None,
            policy,
        }
    }

    pub fn owner(&self) -> Option<ConnectionId> {
        self.owner
    }

    pub fn is_owner(&self, conn: ConnectionId) -> bool {
        self.owner == Some(conn)
    }

    /// A connection opened
    pub fn connect(&mut self, conn: ConnectionId) -> OwnerChange {
        match (self.owner, self.policy) {
            (None, _) => self.assign(conn),
            (Some(owner), _) if owner == conn => self.unchanged(),
            (Some(_), TakeoverPolicy::LastConnected) => self.assign(conn),
            (Some(_), TakeoverPolicy::FirstKeeps) => self.unchanged(),
        }
    }

    /// Explicit request to become the owner; always granted
    pub fn takeover(&mut self, conn: ConnectionId) -> OwnerChange {
        if self.is_owner(conn) {
            return self.unchanged();
        }
        self.assign(conn)
    }

    /// A connection closed
    pub fn disconnect(&mut self, conn: ConnectionId) -> OwnerChange {
        if !self.is_owner(conn) {
            return self.unchanged();
        }
        tracing::info!("Owner {} disconnected, control is free", conn);
        self.owner = None;
        OwnerChange {
            owner: None,
            displaced: None,
            changed: true,
        }
    }

    fn assign(&mut self, conn: ConnectionId) -> OwnerChange {
        let displaced = self.owner.replace(conn);
        match displaced {
            Some(previous) => tracing::info!("Control moved from {} to {}", previous, conn),
            None => tracing::info!("{} has control", conn),
        }
        OwnerChange {
            owner: Some(conn),
            displaced,
            changed: true,
        }
    }

    fn unchanged(&self) -> OwnerChange {
        OwnerChange {
            owner: self.owner,
            displaced: None,
            changed: false,
        }
    }
}
