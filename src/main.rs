//! `stagewise` command line.
//!
//! ```text
//! stagewise [--pipelines FILE] [--log-level LEVEL] stdio LABEL [--set KEY=VALUE]... [--flush-marker LINE]
//! stagewise [--pipelines FILE] [--log-level LEVEL] tcp LABEL [--set KEY=VALUE]... [--bind ADDR]
//!           [--max-in-flight N] [--flush-marker LINE] [--finalize-on-close]
//! ```
//!
//! Logs go to stderr; stdout carries records only.

use clap::{Args, Parser, Subcommand};
use stagewise::config::{Settings, parse_pair};
use stagewise::server::{
  StdioConfig, StdioServer, TcpLineServer, TcpServerConfig, cancel_on_signal,
};
use stagewise::{DataflowFactory, PipelineBuilder, PipelineRegistry};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info};

#[derive(Parser, Debug)]
#[command(name = "stagewise", version, about = "Run line-oriented record pipelines")]
struct Cli {
  /// JSON file describing named pipelines.
  #[arg(long, global = true)]
  pipelines: Option<PathBuf>,

  /// Log level written to stderr.
  #[arg(long, global = true, default_value = "info")]
  log_level: Level,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Read records from stdin until it closes, write output to stdout.
  Stdio {
    #[command(flatten)]
    pipeline: PipelineArgs,

    /// Line that closes the current windows instead of being processed.
    #[arg(long)]
    flush_marker: Option<String>,
  },
  /// Serve one pipeline instance per TCP connection.
  Tcp {
    #[command(flatten)]
    pipeline: PipelineArgs,

    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:9000")]
    bind: String,

    /// Lines buffered per connection before reading pauses.
    #[arg(long, default_value_t = 64)]
    max_in_flight: usize,

    /// Line that closes the connection's current windows.
    #[arg(long)]
    flush_marker: Option<String>,

    /// Finalize a connection's pipeline when the client closes its side.
    #[arg(long)]
    finalize_on_close: bool,
  },
}

#[derive(Args, Debug)]
struct PipelineArgs {
  /// Pipeline label, or the name of a built-in stage.
  label: String,

  /// Setting passed to every stage, as KEY=VALUE (VALUE may be JSON).
  #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_setting)]
  settings: Vec<(String, serde_json::Value)>,
}

impl PipelineArgs {
  fn builder(&self, pipelines: Option<&PathBuf>) -> Result<PipelineBuilder, stagewise::ConfigError> {
    let mut registry = PipelineRegistry::default();
    if let Some(path) = pipelines {
      registry = registry.load_file(path)?;
    }
    let settings: Settings = self.settings.iter().cloned().collect();
    registry.builder(&self.label, settings)
  }
}

fn parse_setting(raw: &str) -> Result<(String, serde_json::Value), String> {
  parse_pair(raw).ok_or_else(|| format!("expected KEY=VALUE, got `{}`", raw))
}

/// How long blocking tasks get to finish once `run` has returned. A pending
/// stdin read never finishes on its own while the pipe stays open.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

fn main() -> ExitCode {
  let cli = Cli::parse();
  tracing_subscriber::fmt()
    .with_max_level(cli.log_level)
    .with_writer(std::io::stderr)
    .init();

  let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
    Ok(runtime) => runtime,
    Err(e) => {
      error!(error = %e, "Could not start the runtime");
      return ExitCode::FAILURE;
    }
  };
  let result = runtime.block_on(run(cli));
  runtime.shutdown_timeout(SHUTDOWN_GRACE);

  match result {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      error!(error = %e, "stagewise failed");
      ExitCode::FAILURE
    }
  }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
  let shutdown = CancellationToken::new();
  let _signals = cancel_on_signal(shutdown.clone());

  match cli.command {
    Command::Stdio {
      pipeline,
      flush_marker,
    } => {
      let builder = pipeline.builder(cli.pipelines.as_ref())?;
      info!(pipeline = builder.label(), "Processing stdin");
      let stats = StdioServer::new(builder.build()?)
        .with_config(StdioConfig::default().with_flush_marker(flush_marker))
        .with_shutdown(shutdown)
        .run(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await?;
      info!(
        records_in = stats.records_in,
        records_out = stats.records_out,
        "Input exhausted"
      );
    }
    Command::Tcp {
      pipeline,
      bind,
      max_in_flight,
      flush_marker,
      finalize_on_close,
    } => {
      let builder = pipeline.builder(cli.pipelines.as_ref())?;
      let config = TcpServerConfig::default()
        .with_bind_address(bind)
        .with_max_in_flight(max_in_flight)
        .with_flush_marker(flush_marker)
        .with_finalize_on_close(finalize_on_close);
      info!(pipeline = builder.label(), "Starting TCP server");
      TcpLineServer::new(builder, config)
        .with_shutdown(shutdown)
        .start()
        .await?;
    }
  }
  Ok(())
}
