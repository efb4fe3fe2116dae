//! Worker lifecycle state machine.

use color_eyre::{eyre::eyre, Result};
use tracing::info;

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Created, nothing installed yet
  Parsed,
  /// Precaching the static assets
  Installing,
  /// Installed and waiting to take over
  Installed,
  /// Pruning old caches and claiming clients
  Activating,
  /// In control of fetches
  Activated,
  /// Install or activation failed
  Redundant,
}

impl WorkerState {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Parsed => "parsed",
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Activated => "activated",
      Self::Redundant => "redundant",
    }
  }

  fn can_transition_to(self, next: WorkerState) -> bool {
    use WorkerState::*;
    matches!(
      (self, next),
      (Parsed | Redundant, Installing)
        | (Parsed, Installed)
        | (Installing, Installed | Redundant)
        | (Installed, Activating)
        | (Activating, Activated | Redundant)
    )
  }
}

impl std::fmt::Display for WorkerState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Tracks the current state and rejects transitions the lifecycle does not allow.
#[derive(Debug)]
pub struct Lifecycle {
  state: WorkerState,
}

impl Lifecycle {
  pub fn new() -> Self {
    Self {
      state: WorkerState::Parsed,
    }
  }

  pub fn state(&self) -> WorkerState {
    self.state
  }

  /// Move to `next`, returning the previous state.
  pub fn transition(&mut self, next: WorkerState) -> Result<WorkerState> {
    let previous = self.state;
    if !previous.can_transition_to(next) {
      return Err(eyre!("Cannot move worker from {} to {}", previous, next));
    }
    self.state = next;
    info!(from = %previous, to = %next, "Worker state changed");
    Ok(previous)
  }
}

impl Default for Lifecycle {
  fn default() -> Self {
    Self::new()
  }
}
