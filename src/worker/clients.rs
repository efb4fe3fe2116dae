//! Registry of connected client pages.

use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

use super::messages::WorkerMessage;

pub type ClientId = u64;

struct ClientHandle {
  tx: mpsc::UnboundedSender<WorkerMessage>,
  controlled: bool,
}

/// Connected clients, each reachable through its own channel.
pub struct Clients {
  next_id: AtomicU64,
  clients: Mutex<BTreeMap<ClientId, ClientHandle>>,
}

impl Clients {
  pub fn new() -> Self {
    Self {
      next_id: AtomicU64::new(1),
      clients: Mutex::new(BTreeMap::new()),
    }
  }

  fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<ClientId, ClientHandle>>> {
    self
      .clients
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Register a new page. It stays uncontrolled until the next claim.
  pub fn connect(&self) -> Result<(ClientId, mpsc::UnboundedReceiver<WorkerMessage>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
    self.lock()?.insert(
      id,
      ClientHandle {
        tx,
        controlled: false,
      },
    );
    debug!(client = id, "Client connected");
    Ok((id, rx))
  }

  pub fn disconnect(&self, id: ClientId) -> Result<bool> {
    Ok(self.lock()?.remove(&id).is_some())
  }

  /// Take control of every connected page. Returns how many were newly claimed.
  pub fn claim(&self) -> Result<usize> {
    let mut clients = self.lock()?;
    let mut claimed = 0;
    for handle in clients.values_mut() {
      if !handle.controlled {
        handle.controlled = true;
        claimed += 1;
      }
    }
    Ok(claimed)
  }

  #[cfg(test)]
  pub fn is_controlled(&self, id: ClientId) -> Result<bool> {
    Ok(
      self
        .lock()?
        .get(&id)
        .map(|h| h.controlled)
        .unwrap_or(false),
    )
  }

  /// Deliver a message to every page; closed channels are dropped.
  pub fn post_all(&self, message: &WorkerMessage) -> Result<usize> {
    let mut clients = self.lock()?;
    clients.retain(|id, handle| {
      let open = handle.tx.send(message.clone()).is_ok();
      if !open {
        debug!(client = *id, "Dropping disconnected client");
      }
      open
    });
    Ok(clients.len())
  }

  #[cfg(test)]
  pub fn len(&self) -> Result<usize> {
    Ok(self.lock()?.len())
  }
}

impl Default for Clients {
  fn default() -> Self {
    Self::new()
  }
}
