//! Messages exchanged with client pages.

use serde::{Deserialize, Serialize};

/// Command sent by a page to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ClientCommand {
  /// Activate a waiting worker immediately
  SkipWaiting,
}

/// Notification posted by the worker to every page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
  SyncComplete { message: String },
}
