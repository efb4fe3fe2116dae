use color_eyre::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheResult, CacheStorage, SqliteStorage};
use crate::config::Config;
use crate::event::{build_request, Event, EventHandler};
use crate::http::Response;
use crate::network::ReqwestNetwork;
use crate::worker::{
  ActivationReport, EventKind, EventOutcome, MessageOutcome, ServiceWorker, SyncOutcome,
  SyncReport, WorkerEvent, WorkerMessage,
};

type Worker = ServiceWorker<ReqwestNetwork, SqliteStorage>;

/// Main application state
pub struct App {
  worker: Worker,
}

impl App {
  pub fn new(config: &Config) -> Result<Self> {
    let settings = config.worker_settings()?;
    let db_path = config.database_path()?;
    let storage = SqliteStorage::open(&db_path)?;
    let network = ReqwestNetwork::new(&settings.origin)?;

    info!(
      origin = %settings.origin,
      cache = %settings.names.static_name,
      db = %db_path.display(),
      "Worker configured"
    );

    Ok(Self {
      worker: ServiceWorker::new(settings, network, Arc::new(storage)),
    })
  }

  /// Register the worker, keeping going uncontrolled if that fails.
  async fn ensure_registered(&self) {
    match self.worker.register().await {
      Ok(outcome) => emit(&outcome_json(&outcome)),
      Err(e) => warn!("Worker registration failed, requests go straight to network: {}", e),
    }
  }

  /// Fetch the shell for this version and activate.
  pub async fn install(&self) -> Result<()> {
    let outcome = self.worker.dispatch(WorkerEvent::Install).await?;
    emit(&outcome_json(&outcome));
    Ok(())
  }

  /// Restore or install, then activate.
  pub async fn activate(&self) -> Result<()> {
    let outcome = self.worker.register().await?;
    emit(&outcome_json(&outcome));
    Ok(())
  }

  pub async fn fetch(
    &self,
    url: &str,
    method: Option<&str>,
    accept: Option<&str>,
    body: Option<&Value>,
  ) -> Result<()> {
    let request = build_request(self.worker.settings(), url, method, accept, body)?;
    self.ensure_registered().await;

    let outcome = self.worker.dispatch(WorkerEvent::Fetch(request)).await?;
    emit(&outcome_json(&outcome));
    Ok(())
  }

  pub async fn sync(&self, tag: Option<&str>) -> Result<()> {
    let (client, mut client_rx) = self.worker.clients().connect()?;
    self.ensure_registered().await;

    let tag = tag.unwrap_or(&self.worker.settings().sync_tag).to_string();
    let outcome = self.worker.dispatch(WorkerEvent::Sync { tag }).await?;
    emit(&outcome_json(&outcome));
    drain_client_messages(&mut client_rx);
    self.worker.clients().disconnect(client)?;
    Ok(())
  }

  pub async fn message(&self, data: Value) -> Result<()> {
    self.ensure_registered().await;

    let outcome = self.worker.dispatch(WorkerEvent::Message(data)).await?;
    emit(&outcome_json(&outcome));
    Ok(())
  }

  /// List cache namespaces and their sizes.
  pub fn caches(&self) -> Result<()> {
    let storage = self.worker.cache().storage();
    let names = self.worker.cache().names();
    for name in storage.keys()? {
      emit(&json!({
        "cache": name,
        "entries": storage.entry_count(&name)?,
        "current": names.is_current(&name),
      }));
    }
    Ok(())
  }

  /// Wait for cache writes started by earlier commands.
  pub async fn flush(&self) {
    let written = self.worker.cache().flush().await;
    if written > 0 {
      debug!(written, "Flushed background cache writes");
    }
  }

  /// Event loop: one JSON event per stdin line, handled concurrently.
  pub async fn run(&self) -> Result<()> {
    let (client, mut client_rx) = self.worker.clients().connect()?;
    self.ensure_registered().await;

    let mut events = EventHandler::stdin();
    let mut tasks = JoinSet::new();
    let mut eof = false;

    loop {
      if eof && tasks.is_empty() {
        break;
      }

      tokio::select! {
        event = events.next(), if !eof => match event {
          Some(Event::Input { line, event }) => {
            match event.into_worker_event(self.worker.settings()) {
              Ok(event) => {
                let worker = self.worker.clone();
                tasks.spawn(async move {
                  let kind = event.kind();
                  (line, kind, worker.dispatch(event).await)
                });
              }
              Err(e) => emit(&json!({ "line": line, "error": e.to_string() })),
            }
          }
          Some(Event::Invalid { line, error }) => {
            emit(&json!({ "line": line, "error": error }));
          }
          Some(Event::Eof) | None => eof = true,
        },
        Some(joined) = tasks.join_next(), if !tasks.is_empty() => match joined {
          Ok((line, kind, result)) => emit(&handled_json(line, kind, result)),
          Err(e) => error!("Event handler panicked: {}", e),
        },
        Some(message) = client_rx.recv() => emit(&client_json(&message)),
      }
    }

    self.flush().await;
    drain_client_messages(&mut client_rx);
    self.worker.clients().disconnect(client)?;
    Ok(())
  }
}

fn emit(value: &Value) {
  println!("{}", value);
}

fn drain_client_messages(rx: &mut mpsc::UnboundedReceiver<WorkerMessage>) {
  while let Ok(message) = rx.try_recv() {
    emit(&client_json(&message));
  }
}

fn client_json(message: &WorkerMessage) -> Value {
  json!({ "client": message })
}

fn handled_json(line: usize, kind: EventKind, result: Result<EventOutcome>) -> Value {
  match result {
    Ok(outcome) => {
      let mut value = outcome_json(&outcome);
      value["line"] = json!(line);
      value
    }
    Err(e) => {
      warn!(line, event = kind.as_str(), "Event failed: {}", e);
      json!({ "line": line, "event": kind.as_str(), "error": e.to_string() })
    }
  }
}

fn activation_json(report: &ActivationReport) -> Value {
  json!({ "pruned": report.pruned, "claimed": report.claimed })
}

fn response_json(result: &CacheResult<Response>) -> Value {
  let response = &result.data;
  json!({
    "event": "fetch",
    "source": result.source.as_str(),
    "cachedAt": result.cached_at.map(|t| t.to_rfc3339()),
    "status": response.status,
    "statusText": response.status_text,
    "kind": response.kind,
    "contentType": response.headers.get("content-type"),
    "body": response.text(),
  })
}

fn sync_report_json(report: &SyncReport) -> Value {
  json!({
    "event": "sync",
    "outcome": "completed",
    "replayed": report.replayed,
    "succeeded": report.succeeded,
    "failed": report.failed,
    "notified": report.notified,
  })
}

fn outcome_json(outcome: &EventOutcome) -> Value {
  match outcome {
    EventOutcome::Installed {
      precached,
      activation,
    } => json!({
      "event": "install",
      "precached": precached,
      "activation": activation.as_ref().map(activation_json),
    }),
    EventOutcome::Activated(report) => {
      let mut value = activation_json(report);
      value["event"] = json!("activate");
      value
    }
    EventOutcome::Unchanged { kind, state } => json!({
      "event": kind.as_str(),
      "outcome": "unchanged",
      "state": state.as_str(),
    }),
    EventOutcome::Fetched(result) => response_json(result),
    EventOutcome::Message(outcome) => json!({
      "event": "message",
      "outcome": match outcome {
        MessageOutcome::Activated(_) => "activated",
        MessageOutcome::NothingWaiting => "nothing-waiting",
        MessageOutcome::Ignored => "ignored",
      },
    }),
    EventOutcome::Sync(outcome) => match outcome {
      SyncOutcome::Ignored { tag } => json!({ "event": "sync", "outcome": "ignored", "tag": tag }),
      SyncOutcome::Completed(report) => sync_report_json(report),
      SyncOutcome::Failed { reason } => {
        json!({ "event": "sync", "outcome": "failed", "reason": reason })
      }
    },
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSource;
  use crate::http::ResponseKind;

  #[test]
  fn test_fetch_outcome_json() {
    let response = Response::new(200, ResponseKind::Basic, b"[]".to_vec())
      .with_header("content-type", "application/json");
    let value = outcome_json(&EventOutcome::Fetched(CacheResult::from_network(response)));

    assert_eq!(value["event"], "fetch");
    assert_eq!(value["source"], CacheSource::Network.as_str());
    assert_eq!(value["status"], 200);
    assert_eq!(value["kind"], "basic");
    assert_eq!(value["contentType"], "application/json");
    assert_eq!(value["body"], "[]");
    assert!(value["cachedAt"].is_null());
  }

  #[test]
  fn test_sync_outcome_json() {
    let value = outcome_json(&EventOutcome::Sync(SyncOutcome::Completed(SyncReport {
      replayed: 2,
      succeeded: 1,
      failed: 1,
      notified: 1,
    })));
    assert_eq!(value["outcome"], "completed");
    assert_eq!(value["failed"], 1);
  }

  #[test]
  fn test_unchanged_outcome_json() {
    let value = outcome_json(&EventOutcome::Unchanged {
      kind: EventKind::Install,
      state: crate::worker::WorkerState::Activated,
    });
    assert_eq!(
      value,
      json!({"event": "install", "outcome": "unchanged", "state": "activated"})
    );
  }

  #[test]
  fn test_handled_error_json() {
    let value = handled_json(
      4,
      EventKind::Activate,
      Err(color_eyre::eyre::eyre!("Cannot move worker")),
    );
    assert_eq!(value["line"], 4);
    assert_eq!(value["event"], "activate");
    assert_eq!(value["error"], "Cannot move worker");
  }

  #[test]
  fn test_client_message_json() {
    let value = client_json(&WorkerMessage::SyncComplete {
      message: "done".to_string(),
    });
    assert_eq!(value, json!({"client": {"type": "SYNC_COMPLETE", "message": "done"}}));
  }
}
