//! Value types shared across the daemon.
//!
//! Peer addresses are exchanged through the shared directory and end up
//! in the rendered route list, so they are kept as opaque strings and
//! ordered lexically.  That ordering is what makes rendering
//! deterministic regardless of the order in which peers were read.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of one peer (one running instance of the managed server).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(String);

impl UnitId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A network-reachable address (IP or hostname) published by a peer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerAddress(String);

impl PeerAddress {
    /// Returns `None` for blank input; an empty address is never published.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a reconciliation pass was requested.
///
/// The reconciler treats every kind the same way; the kind is only
/// carried for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    /// The daemon (and its supervisor) just became ready.
    Ready,
    /// Configuration was reloaded.
    ConfigChanged,
    /// A peer joined, changed its address or departed.
    MembershipChanged,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TriggerKind::Ready => "ready",
            TriggerKind::ConfigChanged => "config-changed",
            TriggerKind::MembershipChanged => "membership-changed",
        };
        f.write_str(name)
    }
}

/// Externally visible outcome of the last reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "lowercase")]
pub enum Status {
    /// The service runs with the configuration rendered for the full
    /// expected membership.
    Active,
    /// The service is configured but fewer peers than expected are known.
    Waiting(String),
    /// Rendering or applying the configuration failed.
    Blocked(String),
}

impl Status {
    pub fn is_active(&self) -> bool {
        matches!(self, Status::Active)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Active => f.write_str("active"),
            Status::Waiting(msg) => write!(f, "waiting: {}", msg),
            Status::Blocked(msg) => write!(f, "blocked: {}", msg),
        }
    }
}
