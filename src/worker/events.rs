//! Events delivered to the worker and what handling them produced.

use crate::cache::CacheResult;
use crate::http::{Request, Response};

use super::lifecycle::WorkerState;
use super::sync::SyncOutcome;

/// Kind tag of a worker event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
  Install,
  Activate,
  Fetch,
  Message,
  Sync,
}

impl EventKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Install => "install",
      Self::Activate => "activate",
      Self::Fetch => "fetch",
      Self::Message => "message",
      Self::Sync => "sync",
    }
  }
}

/// An event delivered to the worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
  Install,
  Activate,
  /// A page issued a request
  Fetch(Request),
  /// A page posted a message (raw JSON, validated by the handler)
  Message(serde_json::Value),
  /// Connectivity returned for a registered sync tag
  Sync { tag: String },
}

impl WorkerEvent {
  pub fn kind(&self) -> EventKind {
    match self {
      Self::Install => EventKind::Install,
      Self::Activate => EventKind::Activate,
      Self::Fetch(_) => EventKind::Fetch,
      Self::Message(_) => EventKind::Message,
      Self::Sync { .. } => EventKind::Sync,
    }
  }
}

/// What an activation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
  /// Caches from other versions that were deleted
  pub pruned: Vec<String>,
  /// Pages newly taken under control
  pub claimed: usize,
}

/// Result of handling a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
  /// A waiting worker was activated
  Activated(ActivationReport),
  /// skipWaiting arrived while nothing was waiting
  NothingWaiting,
  /// Malformed or unknown message
  Ignored,
}

/// Result of handling one event.
#[derive(Debug, Clone)]
pub enum EventOutcome {
  Installed {
    precached: usize,
    /// Set when install went straight on to activation
    activation: Option<ActivationReport>,
  },
  Activated(ActivationReport),
  /// Install or activate for a stage the worker is already at or past
  Unchanged { kind: EventKind, state: WorkerState },
  Fetched(CacheResult<Response>),
  Message(MessageOutcome),
  Sync(SyncOutcome),
}
