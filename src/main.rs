mod app;
mod cache;
mod config;
mod db;
mod event;
mod http;
mod logging;
mod network;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "edition-worker")]
#[command(about = "Offline cache and background sync worker for the training edition tracker")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/edition-worker/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Origin serving the app shell and API
  #[arg(short, long, global = true)]
  origin: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the shell for the configured version and activate
  Install,
  /// Activate the installed version, installing first if needed
  Activate,
  /// Send one request through the worker
  Fetch {
    /// Path or absolute URL
    url: String,
    #[arg(short = 'X', long)]
    method: Option<String>,
    /// Accept header, e.g. text/html for navigations
    #[arg(long)]
    accept: Option<String>,
    /// JSON request body
    #[arg(long)]
    body: Option<String>,
  },
  /// Replay tasks created while offline
  Sync {
    /// Sync tag (defaults to the configured one)
    #[arg(long)]
    tag: Option<String>,
  },
  /// Post a JSON message to the worker, e.g. '{"action":"skipWaiting"}'
  Message { data: String },
  /// List cache namespaces
  Caches,
  /// Read JSON events from stdin, one per line
  Run,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  // Override origin if specified on command line
  let config = if let Some(origin) = args.origin {
    config::Config { origin, ..config }
  } else {
    config
  };

  let _log_guard = logging::init(&config.logging)?;

  let app = app::App::new(&config)?;
  let result = run_command(&app, args.command).await;

  // Background cache writes must land before the runtime shuts down
  app.flush().await;

  result
}

async fn run_command(app: &app::App, command: Command) -> Result<()> {
  match command {
    Command::Install => app.install().await,
    Command::Activate => app.activate().await,
    Command::Fetch {
      url,
      method,
      accept,
      body,
    } => {
      let body: Option<serde_json::Value> = body
        .map(|b| serde_json::from_str(&b).map_err(|e| eyre!("--body is not valid JSON: {}", e)))
        .transpose()?;
      app
        .fetch(&url, method.as_deref(), accept.as_deref(), body.as_ref())
        .await
    }
    Command::Sync { tag } => app.sync(tag.as_deref()).await,
    Command::Message { data } => {
      let data: serde_json::Value =
        serde_json::from_str(&data).map_err(|e| eyre!("Message is not valid JSON: {}", e))?;
      app.message(data).await
    }
    Command::Caches => app.caches(),
    Command::Run => app.run().await,
  }
}
