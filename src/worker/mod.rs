//! The offline worker: lifecycle, fetch interception and background sync.
//!
//! Every event goes through [`ServiceWorker::dispatch`], which maps the event
//! kind to exactly one handler. Handlers for independent events may run
//! concurrently; each one's failure stays scoped to its own event.

mod clients;
mod events;
mod fetch;
mod lifecycle;
mod messages;
mod settings;
mod sync;

pub use clients::Clients;
pub use events::{ActivationReport, EventKind, EventOutcome, MessageOutcome, WorkerEvent};
pub use lifecycle::WorkerState;
pub use messages::{ClientCommand, WorkerMessage};
pub use settings::WorkerSettings;
pub use sync::{SyncOutcome, SyncReport};

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, CacheLayer, CacheStorage};
use crate::http::{Request, Response};
use crate::network::Network;

use lifecycle::Lifecycle;

struct Inner<N: Network, S: CacheStorage> {
  settings: WorkerSettings,
  cache: CacheLayer<S>,
  network: N,
  clients: Clients,
  lifecycle: Mutex<Lifecycle>,
}

/// Offline cache and sync worker.
///
/// Cheap to clone; clones share state, so one clone per event handler task
/// is the expected usage.
pub struct ServiceWorker<N: Network, S: CacheStorage> {
  inner: Arc<Inner<N, S>>,
}

impl<N: Network, S: CacheStorage> Clone for ServiceWorker<N, S> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<N: Network, S: CacheStorage> ServiceWorker<N, S> {
  pub fn new(settings: WorkerSettings, network: N, storage: Arc<S>) -> Self {
    let cache = CacheLayer::new(storage, settings.names.clone());
    Self {
      inner: Arc::new(Inner {
        settings,
        cache,
        network,
        clients: Clients::new(),
        lifecycle: Mutex::new(Lifecycle::new()),
      }),
    }
  }

  pub fn settings(&self) -> &WorkerSettings {
    &self.inner.settings
  }

  pub fn clients(&self) -> &Clients {
    &self.inner.clients
  }

  pub fn cache(&self) -> &CacheLayer<S> {
    &self.inner.cache
  }

  fn lifecycle(&self) -> Result<MutexGuard<'_, Lifecycle>> {
    self
      .inner
      .lifecycle
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  pub fn state(&self) -> Result<WorkerState> {
    Ok(self.lifecycle()?.state())
  }

  fn transition(&self, next: WorkerState) -> Result<WorkerState> {
    self.lifecycle()?.transition(next)
  }

  /// Route an event to its handler.
  pub async fn dispatch(&self, event: WorkerEvent) -> Result<EventOutcome> {
    let kind = event.kind();
    debug!(event = kind.as_str(), "Dispatching event");

    match event {
      WorkerEvent::Install => match self.state()? {
        WorkerState::Parsed | WorkerState::Redundant => self.on_install().await,
        state => Ok(EventOutcome::Unchanged { kind, state }),
      },
      WorkerEvent::Activate => match self.state()? {
        state @ (WorkerState::Activating | WorkerState::Activated) => {
          Ok(EventOutcome::Unchanged { kind, state })
        }
        _ => self.on_activate().await.map(EventOutcome::Activated),
      },
      WorkerEvent::Fetch(request) => self.on_fetch(request).await.map(EventOutcome::Fetched),
      WorkerEvent::Message(data) => self.on_message(data).await.map(EventOutcome::Message),
      WorkerEvent::Sync { tag } => Ok(EventOutcome::Sync(self.on_sync(&tag).await)),
    }
  }

  /// Bring a freshly started worker into service.
  ///
  /// If this version's static cache already exists the worker is restored as
  /// installed and activated without refetching; otherwise it is installed.
  pub async fn register(&self) -> Result<EventOutcome> {
    if self.state()? != WorkerState::Parsed {
      return Err(eyre!("Worker is already registered ({})", self.state()?));
    }

    if self.inner.cache.is_precached()? {
      debug!(cache = %self.inner.settings.names.static_name, "Static cache present, skipping install");
      self.transition(WorkerState::Installed)?;
      return self.dispatch(WorkerEvent::Activate).await;
    }

    self.dispatch(WorkerEvent::Install).await
  }

  async fn on_install(&self) -> Result<EventOutcome> {
    self.transition(WorkerState::Installing)?;

    let precached = match self.precache().await {
      Ok(count) => count,
      Err(e) => {
        self.transition(WorkerState::Redundant)?;
        return Err(e);
      }
    };
    self.transition(WorkerState::Installed)?;
    info!(assets = precached, "Worker installed");

    let activation = if self.inner.settings.skip_waiting {
      Some(self.on_activate().await?)
    } else {
      info!("Worker waiting for skipWaiting");
      None
    };

    Ok(EventOutcome::Installed {
      precached,
      activation,
    })
  }

  /// Fetch every install asset and store them all, or none on any failure.
  async fn precache(&self) -> Result<usize> {
    let requests: Vec<Request> = self
      .inner
      .settings
      .install_urls()
      .into_iter()
      .map(Request::get)
      .collect();

    let results = join_all(requests.iter().map(|r| self.inner.network.fetch(r))).await;

    let mut entries: Vec<(CacheKey, Response)> = Vec::with_capacity(requests.len());
    for (request, result) in requests.iter().zip(results) {
      let response = result.map_err(|e| eyre!("Precache of {} failed: {}", request.url, e))?;
      if response.status != 200 {
        return Err(eyre!(
          "Precache of {} failed: status {}",
          request.url,
          response.status
        ));
      }
      entries.push((request.cache_key(), response));
    }

    self.inner.cache.precache(&entries)?;
    Ok(entries.len())
  }

  async fn on_activate(&self) -> Result<ActivationReport> {
    self.transition(WorkerState::Activating)?;

    let pruned = match self.inner.cache.prune() {
      Ok(pruned) => pruned,
      Err(e) => {
        self.transition(WorkerState::Redundant)?;
        return Err(e);
      }
    };
    let claimed = self.inner.clients.claim()?;
    self.transition(WorkerState::Activated)?;

    info!(pruned = pruned.len(), claimed, "Worker activated");
    Ok(ActivationReport { pruned, claimed })
  }

  async fn on_message(&self, data: serde_json::Value) -> Result<MessageOutcome> {
    let command: ClientCommand = match serde_json::from_value(data) {
      Ok(command) => command,
      Err(e) => {
        warn!("Ignoring unrecognised message: {}", e);
        return Ok(MessageOutcome::Ignored);
      }
    };

    match command {
      ClientCommand::SkipWaiting => {
        if self.state()? != WorkerState::Installed {
          debug!("skipWaiting received with no waiting worker");
          return Ok(MessageOutcome::NothingWaiting);
        }
        self.on_activate().await.map(MessageOutcome::Activated)
      }
    }
  }
}


#[cfg(test)]
mod tests {
  use super::test_support::*;
  use super::*;
  use crate::cache::{CacheStorage, SqliteStorage};
  use crate::config::Config;
  use crate::http::ResponseKind;
  use crate::network::testing::FakeNetwork;

  #[tokio::test]
  async fn test_install_precaches_and_activates() {
    let worker = worker(shell_network());

    let outcome = worker.dispatch(WorkerEvent::Install).await.unwrap();

    match outcome {
      EventOutcome::Installed {
        precached,
        activation,
      } => {
        assert_eq!(precached, 6);
        assert_eq!(activation, Some(ActivationReport::default()));
      }
      other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(worker.state().unwrap(), WorkerState::Activated);
    assert_eq!(
      worker
        .cache()
        .storage()
        .entry_count("edition-static-v1")
        .unwrap(),
      6
    );
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing() {
    let network = shell_network();
    network.fail_path("/icons/icon-512x512.png");
    let worker = worker(network);

    assert!(worker.dispatch(WorkerEvent::Install).await.is_err());
    assert_eq!(worker.state().unwrap(), WorkerState::Redundant);
    assert!(worker.cache().storage().keys().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_install_rejects_non_200_asset() {
    let network = shell_network();
    network.route(
      "GET",
      "/manifest.json",
      Response::new(404, ResponseKind::Basic, Vec::new()),
    );
    let worker = worker(network);

    assert!(worker.dispatch(WorkerEvent::Install).await.is_err());
    assert_eq!(worker.state().unwrap(), WorkerState::Redundant);
  }

  #[tokio::test]
  async fn test_activation_prunes_previous_version() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());

    let v1 = worker_with(&Config::default(), shell_network(), Arc::clone(&storage));
    v1.dispatch(WorkerEvent::Install).await.unwrap();
    network(&v1).route(
      "GET",
      "/api/tasks/1",
      Response::new(200, ResponseKind::Basic, b"{\"id\":1}".to_vec()),
    );
    v1.dispatch(WorkerEvent::Fetch(get(&v1, "/api/tasks/1")))
      .await
      .unwrap();
    settle(&v1).await;
    assert!(storage.has("edition-dynamic-v1").unwrap());

    let mut config = Config::default();
    config.cache.version = "v2".to_string();
    let v2 = worker_with(&config, shell_network(), Arc::clone(&storage));
    let outcome = v2.dispatch(WorkerEvent::Install).await.unwrap();

    match outcome {
      EventOutcome::Installed {
        activation: Some(report),
        ..
      } => assert_eq!(
        report.pruned,
        vec![
          "edition-static-v1".to_string(),
          "edition-dynamic-v1".to_string()
        ]
      ),
      other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(storage.keys().unwrap(), vec!["edition-static-v2".to_string()]);
    let old_key = get(&v2, "/api/tasks/1").cache_key();
    assert!(storage.match_any(&old_key).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_activation_claims_clients() {
    let worker = worker(shell_network());
    let (id, _rx) = worker.clients().connect().unwrap();

    worker.dispatch(WorkerEvent::Install).await.unwrap();

    assert!(worker.clients().is_controlled(id).unwrap());
  }

  #[tokio::test]
  async fn test_waiting_worker_activates_on_skip_waiting() {
    let mut config = Config::default();
    config.lifecycle.skip_waiting = false;
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let worker = worker_with(&config, shell_network(), storage);

    worker.dispatch(WorkerEvent::Install).await.unwrap();
    assert_eq!(worker.state().unwrap(), WorkerState::Installed);

    let outcome = worker
      .dispatch(WorkerEvent::Message(
        serde_json::json!({"action": "skipWaiting"}),
      ))
      .await
      .unwrap();
    assert!(matches!(
      outcome,
      EventOutcome::Message(MessageOutcome::Activated(_))
    ));
    assert_eq!(worker.state().unwrap(), WorkerState::Activated);
  }

  #[tokio::test]
  async fn test_skip_waiting_without_waiting_worker() {
    let worker = worker(shell_network());
    worker.dispatch(WorkerEvent::Install).await.unwrap();

    let outcome = worker
      .dispatch(WorkerEvent::Message(
        serde_json::json!({"action": "skipWaiting"}),
      ))
      .await
      .unwrap();
    assert!(matches!(
      outcome,
      EventOutcome::Message(MessageOutcome::NothingWaiting)
    ));
  }

  #[tokio::test]
  async fn test_unknown_message_is_ignored() {
    let worker = worker(shell_network());

    let outcome = worker
      .dispatch(WorkerEvent::Message(serde_json::json!({"action": "explode"})))
      .await
      .unwrap();
    assert!(matches!(outcome, EventOutcome::Message(MessageOutcome::Ignored)));
    assert_eq!(worker.state().unwrap(), WorkerState::Parsed);
  }

  #[tokio::test]
  async fn test_repeated_lifecycle_events_are_unchanged() {
    let worker = worker(shell_network());
    worker.register().await.unwrap();
    let fetched = network(&worker).requests().len();

    let install = worker.dispatch(WorkerEvent::Install).await.unwrap();
    assert!(matches!(
      install,
      EventOutcome::Unchanged {
        kind: EventKind::Install,
        state: WorkerState::Activated
      }
    ));
    let activate = worker.dispatch(WorkerEvent::Activate).await.unwrap();
    assert!(matches!(
      activate,
      EventOutcome::Unchanged {
        kind: EventKind::Activate,
        state: WorkerState::Activated
      }
    ));
    assert_eq!(network(&worker).requests().len(), fetched);
  }

  #[tokio::test]
  async fn test_activate_before_install_fails() {
    let worker = worker(shell_network());
    assert!(worker.dispatch(WorkerEvent::Activate).await.is_err());
  }

  #[tokio::test]
  async fn test_register_restores_installed_version() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let first = worker_with(&Config::default(), shell_network(), Arc::clone(&storage));
    first.register().await.unwrap();

    let second = worker_with(&Config::default(), FakeNetwork::new(), Arc::clone(&storage));
    let outcome = second.register().await.unwrap();

    assert!(matches!(outcome, EventOutcome::Activated(_)));
    assert_eq!(second.state().unwrap(), WorkerState::Activated);
    assert!(network(&second).requests().is_empty());
  }

  #[tokio::test]
  async fn test_register_twice_fails() {
    let worker = worker(shell_network());
    worker.register().await.unwrap();
    assert!(worker.register().await.is_err());
  }
}
