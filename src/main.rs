mod app;
mod backend;
mod cache;
mod commands;
mod config;
mod event;
mod record;
mod store;
mod sync;
mod validate;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use commands::Command;

#[derive(Parser, Debug)]
#[command(name = "invsync")]
#[command(about = "Inventory client that keeps working while the backend is down")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/invsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Resource collection to work on (e.g. barang)
  #[arg(short, long)]
  resource: Option<String>,

  /// Backend base URL
  #[arg(short, long)]
  backend: Option<String>,

  /// Also log to stderr
  #[arg(short, long)]
  verbose: bool,

  /// Keep local state in memory only
  #[arg(long)]
  ephemeral: bool,

  #[command(subcommand)]
  command: Command,
}

/// Log to a daily file under the data directory, and to stderr when
/// `verbose`. `INVSYNC_LOG` takes an `EnvFilter` directive.
fn init_tracing(verbose: bool) -> Result<WorkerGuard> {
  let log_dir = cache::data_dir()?.join("logs");
  std::fs::create_dir_all(&log_dir)?;

  let (file_writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "invsync.log"));

  let default_level = if verbose { "invsync=debug" } else { "invsync=info" };
  let filter =
    EnvFilter::try_from_env("INVSYNC_LOG").unwrap_or_else(|_| EnvFilter::new(default_level));

  let stderr_layer = verbose.then(|| {
    fmt::layer()
      .with_writer(std::io::stderr)
      .with_target(false)
      .compact()
  });

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(file_writer).with_ansi(false))
    .with(stderr_layer)
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_tracing(args.verbose)?;

  // Load configuration
  let mut config = config::Config::load(args.config.as_deref())?;

  // Command line wins over the config file
  if let Some(resource) = args.resource {
    config.resource.name = resource;
  }
  if let Some(url) = args.backend {
    config.backend.url = url;
  }

  let mut app = app::App::new(config, args.ephemeral).await?;
  app.run(args.command).await?;

  Ok(())
}
