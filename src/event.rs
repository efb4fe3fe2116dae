//! JSON-lines event source standing in for the hosting page.

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::http::Request;
use crate::worker::{WorkerEvent, WorkerSettings};

/// One line of input, tagged by `event`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum InputEvent {
  Install,
  Activate,
  Fetch {
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    accept: Option<String>,
    #[serde(default)]
    body: Option<serde_json::Value>,
  },
  Message {
    data: serde_json::Value,
  },
  Sync {
    /// Defaults to the configured sync tag
    #[serde(default)]
    tag: Option<String>,
  },
}

impl InputEvent {
  pub fn into_worker_event(self, settings: &WorkerSettings) -> Result<WorkerEvent> {
    Ok(match self {
      Self::Install => WorkerEvent::Install,
      Self::Activate => WorkerEvent::Activate,
      Self::Fetch {
        url,
        method,
        accept,
        body,
      } => WorkerEvent::Fetch(build_request(
        settings,
        &url,
        method.as_deref(),
        accept.as_deref(),
        body.as_ref(),
      )?),
      Self::Message { data } => WorkerEvent::Message(data),
      Self::Sync { tag } => WorkerEvent::Sync {
        tag: tag.unwrap_or_else(|| settings.sync_tag.clone()),
      },
    })
  }
}

/// Build a request for a path (or absolute URL) relative to the origin.
pub fn build_request(
  settings: &WorkerSettings,
  url: &str,
  method: Option<&str>,
  accept: Option<&str>,
  body: Option<&serde_json::Value>,
) -> Result<Request> {
  let url = settings
    .resolve(url)
    .map_err(|e| eyre!("Invalid URL '{}': {}", url, e))?;
  let method = match method {
    Some(m) => Method::from_bytes(m.to_ascii_uppercase().as_bytes())
      .map_err(|e| eyre!("Invalid method '{}': {}", m, e))?,
    None => Method::GET,
  };

  let mut request = match body {
    Some(body) => {
      let mut request = Request::post_json(url, body)?;
      request.method = method;
      request
    }
    None => Request::new(method, url),
  };
  if let Some(accept) = accept {
    request = request.with_header("accept", accept);
  }

  Ok(request)
}

/// Events read from the input stream
#[derive(Debug)]
pub enum Event {
  /// A well-formed input line
  Input { line: usize, event: InputEvent },
  /// A line that could not be parsed
  Invalid { line: usize, error: String },
  /// Input exhausted
  Eof,
}

/// Event handler that produces events from a line-oriented reader
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Read events from stdin
  pub fn stdin() -> Self {
    Self::from_reader(BufReader::new(tokio::io::stdin()))
  }

  pub fn from_reader<R>(reader: R) -> Self
  where
    R: AsyncBufRead + Unpin + Send + 'static,
  {
    let (tx, rx) = mpsc::unbounded_channel();

    // Spawn input reader
    tokio::spawn(async move {
      let mut lines = reader.lines();
      let mut line_no = 0;
      loop {
        let event = match lines.next_line().await {
          Ok(Some(line)) => {
            line_no += 1;
            if line.trim().is_empty() {
              continue;
            }
            match serde_json::from_str::<InputEvent>(&line) {
              Ok(event) => Event::Input {
                line: line_no,
                event,
              },
              Err(e) => Event::Invalid {
                line: line_no,
                error: e.to_string(),
              },
            }
          }
          Ok(None) => Event::Eof,
          Err(e) => {
            line_no += 1;
            let invalid = Event::Invalid {
              line: line_no,
              error: format!("Failed to read input: {}", e),
            };
            // Undecodable lines are skipped, anything else ends the stream
            if e.kind() != std::io::ErrorKind::InvalidData {
              let _ = tx.send(invalid);
              let _ = tx.send(Event::Eof);
              break;
            }
            invalid
          }
        };

        let done = matches!(event, Event::Eof);
        if tx.send(event).is_err() || done {
          break;
        }
      }
    });

    Self { rx }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
