//! Background sync: replays tasks created while offline.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use tracing::{debug, error, info, warn};

use super::messages::WorkerMessage;
use super::ServiceWorker;
use crate::cache::CacheStorage;
use crate::http::Request;
use crate::network::Network;

/// Counts from one replay run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
  /// Creation requests issued, one per pending task
  pub replayed: usize,
  /// Replays answered with a 2xx status
  pub succeeded: usize,
  /// Replays that failed at the transport level or with a non-2xx status
  pub failed: usize,
  /// Clients that received the completion message
  pub notified: usize,
}

/// Result of a sync event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
  /// The tag is not ours
  Ignored { tag: String },
  Completed(SyncReport),
  /// Pending tasks could not be fetched; left for the next trigger
  Failed { reason: String },
}

impl<N: Network, S: CacheStorage> ServiceWorker<N, S> {
  pub(super) async fn on_sync(&self, tag: &str) -> SyncOutcome {
    if tag != self.inner.settings.sync_tag {
      debug!(tag, "Ignoring sync for unknown tag");
      return SyncOutcome::Ignored {
        tag: tag.to_string(),
      };
    }

    match self.replay_pending().await {
      Ok(report) => {
        info!(
          replayed = report.replayed,
          succeeded = report.succeeded,
          failed = report.failed,
          "Background sync complete"
        );
        SyncOutcome::Completed(report)
      }
      Err(e) => {
        error!(tag, "Background sync failed: {}", e);
        SyncOutcome::Failed {
          reason: e.to_string(),
        }
      }
    }
  }

  async fn pending_tasks(&self) -> Result<Vec<serde_json::Value>> {
    let url = &self.inner.settings.pending_tasks;
    let response = self.inner.network.fetch(&Request::get(url.clone())).await?;

    if !response.is_ok() {
      return Err(eyre!(
        "Pending tasks endpoint {} returned {}",
        url,
        response.status
      ));
    }

    serde_json::from_slice(&response.body)
      .map_err(|e| eyre!("Pending tasks from {} are not a JSON list: {}", url, e))
  }

  /// Replay every pending task concurrently, then notify clients once all settled.
  async fn replay_pending(&self) -> Result<SyncReport> {
    let tasks = self.pending_tasks().await?;

    let requests = tasks
      .iter()
      .map(|task| Request::post_json(self.inner.settings.tasks.clone(), task))
      .collect::<Result<Vec<_>>>()?;

    let results = join_all(requests.iter().map(|r| self.inner.network.fetch(r))).await;

    let mut report = SyncReport {
      replayed: results.len(),
      ..SyncReport::default()
    };
    for (index, result) in results.into_iter().enumerate() {
      match result {
        Ok(response) if response.is_ok() => report.succeeded += 1,
        Ok(response) => {
          warn!(index, status = response.status, "Task replay rejected");
          report.failed += 1;
        }
        Err(e) => {
          warn!(index, "Task replay failed: {}", e);
          report.failed += 1;
        }
      }
    }

    report.notified = self.inner.clients.post_all(&WorkerMessage::SyncComplete {
      message: self.inner.settings.sync_complete_message.clone(),
    })?;

    Ok(report)
  }
}

#[cfg(test)]
mod tests {
  use super::super::test_support::*;
  use super::super::{EventOutcome, WorkerEvent};
  use super::*;
  use crate::http::{Response, ResponseKind};
  use crate::network::testing::FakeNetwork;

  async fn sync(worker: &TestWorker, tag: &str) -> SyncOutcome {
    match worker
      .dispatch(WorkerEvent::Sync {
        tag: tag.to_string(),
      })
      .await
      .unwrap()
    {
      EventOutcome::Sync(outcome) => outcome,
      other => panic!("unexpected outcome {:?}", other),
    }
  }

  fn pending(net: &FakeNetwork, tasks: serde_json::Value) {
    net.route(
      "GET",
      "/api/tasks/pending",
      Response::new(200, ResponseKind::Basic, tasks.to_string().into_bytes()),
    );
  }

  #[tokio::test]
  async fn test_replays_each_pending_task_and_broadcasts_once() {
    let net = FakeNetwork::new();
    pending(
      &net,
      serde_json::json!([{"title": "a"}, {"title": "b"}, {"title": "c"}]),
    );
    net.route(
      "POST",
      "/api/tasks",
      Response::new(201, ResponseKind::Basic, Vec::new()),
    );
    let worker = worker(net);
    let (_, mut rx1) = worker.clients().connect().unwrap();
    let (_, mut rx2) = worker.clients().connect().unwrap();

    let outcome = sync(&worker, "sync-tasks").await;

    assert_eq!(
      outcome,
      SyncOutcome::Completed(SyncReport {
        replayed: 3,
        succeeded: 3,
        failed: 0,
        notified: 2,
      })
    );
    assert_eq!(network(&worker).count("POST", "/api/tasks"), 3);

    let expected = WorkerMessage::SyncComplete {
      message: "Tasks synced successfully".to_string(),
    };
    assert_eq!(rx1.try_recv().unwrap(), expected);
    assert!(rx1.try_recv().is_err());
    assert_eq!(rx2.try_recv().unwrap(), expected);
  }

  #[tokio::test]
  async fn test_replay_sends_task_payload() {
    let net = FakeNetwork::new();
    pending(&net, serde_json::json!([{"title": "Week 2 quiz", "phase": 2}]));
    let worker = worker(net);

    sync(&worker, "sync-tasks").await;

    let posts: Vec<Request> = network(&worker)
      .requests()
      .into_iter()
      .filter(|r| r.method == reqwest::Method::POST)
      .collect();
    assert_eq!(posts.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(posts[0].body.as_deref().unwrap()).unwrap();
    assert_eq!(body, serde_json::json!({"title": "Week 2 quiz", "phase": 2}));
  }

  #[tokio::test]
  async fn test_failed_replays_still_settle_before_broadcast() {
    let net = FakeNetwork::new();
    pending(&net, serde_json::json!([{"title": "a"}, {"title": "b"}]));
    net.route(
      "POST",
      "/api/tasks",
      Response::new(500, ResponseKind::Basic, Vec::new()),
    );
    let worker = worker(net);
    let (_, mut rx) = worker.clients().connect().unwrap();

    let outcome = sync(&worker, "sync-tasks").await;

    assert_eq!(
      outcome,
      SyncOutcome::Completed(SyncReport {
        replayed: 2,
        succeeded: 0,
        failed: 2,
        notified: 1,
      })
    );
    assert!(rx.try_recv().is_ok());
  }

  #[tokio::test]
  async fn test_unreachable_replays_still_broadcast_once() {
    let net = FakeNetwork::new();
    pending(&net, serde_json::json!([{"title": "a"}, {"title": "b"}]));
    net.fail_path("/api/tasks");
    let worker = worker(net);
    let (_, mut rx) = worker.clients().connect().unwrap();

    let outcome = sync(&worker, "sync-tasks").await;

    assert_eq!(
      outcome,
      SyncOutcome::Completed(SyncReport {
        replayed: 2,
        succeeded: 0,
        failed: 2,
        notified: 1,
      })
    );
    assert_eq!(network(&worker).count("POST", "/api/tasks"), 2);
    assert!(rx.try_recv().is_ok());
    assert!(rx.try_recv().is_err());
  }

  #[tokio::test]
  async fn test_empty_pending_list_still_completes() {
    let net = FakeNetwork::new();
    pending(&net, serde_json::json!([]));
    let worker = worker(net);
    let (_, mut rx) = worker.clients().connect().unwrap();

    let outcome = sync(&worker, "sync-tasks").await;

    assert!(matches!(outcome, SyncOutcome::Completed(r) if r.replayed == 0));
    assert_eq!(network(&worker).count("POST", "/api/tasks"), 0);
    assert!(rx.try_recv().is_ok());
  }

  #[tokio::test]
  async fn test_unreachable_pending_endpoint_fails_without_broadcast() {
    let net = FakeNetwork::new();
    net.set_offline(true);
    let worker = worker(net);
    let (_, mut rx) = worker.clients().connect().unwrap();

    let outcome = sync(&worker, "sync-tasks").await;

    assert!(matches!(outcome, SyncOutcome::Failed { .. }));
    assert!(rx.try_recv().is_err());
  }

  #[tokio::test]
  async fn test_pending_endpoint_error_status_fails() {
    let net = FakeNetwork::new();
    net.route(
      "GET",
      "/api/tasks/pending",
      Response::new(500, ResponseKind::Basic, Vec::new()),
    );
    let worker = worker(net);

    assert!(matches!(
      sync(&worker, "sync-tasks").await,
      SyncOutcome::Failed { .. }
    ));
    assert_eq!(network(&worker).count("POST", "/api/tasks"), 0);
  }

  #[tokio::test]
  async fn test_pending_body_must_be_a_list() {
    let net = FakeNetwork::new();
    pending(&net, serde_json::json!({"tasks": []}));
    let worker = worker(net);

    assert!(matches!(
      sync(&worker, "sync-tasks").await,
      SyncOutcome::Failed { .. }
    ));
  }

  #[tokio::test]
  async fn test_other_tags_are_ignored() {
    let worker = worker(FakeNetwork::new());

    let outcome = sync(&worker, "sync-reactions").await;

    assert_eq!(
      outcome,
      SyncOutcome::Ignored {
        tag: "sync-reactions".to_string()
      }
    );
    assert!(network(&worker).requests().is_empty());
  }
}
