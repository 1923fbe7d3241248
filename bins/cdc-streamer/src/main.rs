//! # cdc-streamer
//!
//! The command-line entry point: loads configuration, ensures the
//! upstream publication/replication slot exist, resolves a start LSN,
//! constructs the decoder source, offset store, and chosen sink, and
//! runs the apply loop until end-of-stream or `Ctrl-C`.
//!
//! ## Usage
//!
//! ```bash
//! cdc-streamer --config cdc-streamer.toml
//!
//! # Enable debug logging
//! RUST_LOG=debug cdc-streamer --config cdc-streamer.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use cdc_apply::ApplyLoop;
use cdc_core::config::{AppConfig, SinkKind};
use cdc_core::error::CdcError;
use cdc_core::traits::{OffsetStore as _, Sink};
use cdc_io::decoder_source::{DecoderArgs, DecoderSource};
use cdc_io::offset_store::SqliteOffsetStore;
use cdc_io::sink_postgres::PostgresSink;
use cdc_io::sink_stdout::StdoutSink;
use cdc_io::bootstrap;
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for the CDC streamer.
#[derive(Parser, Debug)]
#[command(name = "cdc-streamer")]
#[command(about = "Change-Data-Capture streamer for PostgreSQL logical replication")]
#[command(long_about = "
cdc-streamer tails a PostgreSQL logical replication slot via pg_recvlogical,
normalizes decoded transactions into row-level events, and delivers them to
a sink under an at-least-once contract, tracking progress in a durable
offset store so a restart resumes without loss or duplication visible at
the sink.

Examples:
  cdc-streamer --config cdc-streamer.toml
  RUST_LOG=debug cdc-streamer --config cdc-streamer.toml
")]
struct Args {
    /// Path to the TOML configuration file.
    ///
    /// See `AppConfig` for the full set of recognized keys.
    #[arg(short, long)]
    #[arg(help = "Configuration TOML file")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Config isn't loaded yet, so the env-filter default has to stand
    // on its own; the config's log_level only applies when RUST_LOG is
    // unset, which EnvFilter::from_default_env already honors via its
    // own default directive.
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::load(&args.config)
        .with_context(|| format!("loading config from {}", args.config.display()))?;

    tracing::info!(slot = %config.slot_name, sink = ?config.sink, "starting cdc-streamer");

    let primary_dsn = config.primary.connection_string();

    if config.demo_mode {
        bootstrap::ensure_demo_test_data_table(&primary_dsn)
            .await
            .map_err(|err| {
                CdcError::BootstrapFailed(format!("provisioning demo test_data table: {err}"))
            })?;
    }

    bootstrap::ensure_publication(&primary_dsn, &config.publication_name)
        .await
        .map_err(|err| CdcError::BootstrapFailed(format!("ensuring publication exists: {err}")))?;
    bootstrap::ensure_replication_slot(&primary_dsn, &config.slot_name, &config.plugin)
        .await
        .map_err(|err| {
            CdcError::BootstrapFailed(format!("ensuring replication slot exists: {err}"))
        })?;

    let offset_store = SqliteOffsetStore::open(&config.offsets_path)
        .await
        .context("opening offset store")?;

    let stored_lsn = offset_store
        .get(&config.slot_name)
        .await
        .context("reading stored offset")?;

    let start_lsn = match stored_lsn {
        Some(lsn) => Some(lsn),
        None if config.start_from_beginning => None,
        None => Some(
            bootstrap::current_wal_lsn(&primary_dsn)
                .await
                .map_err(|err| {
                    CdcError::BootstrapFailed(format!("resolving current WAL position: {err}"))
                })?,
        ),
    };

    let sink: Arc<dyn Sink> = match config.sink {
        SinkKind::Stdout => Arc::new(StdoutSink::new()),
        SinkKind::Postgres => {
            let dsn = config
                .sink_dsn
                .as_deref()
                .expect("AppConfig::load validates sink_dsn is present when sink = postgres");
            Arc::new(
                PostgresSink::connect(dsn)
                    .await
                    .context("connecting to sink database")?,
            )
        }
    };

    let decoder_args = DecoderArgs {
        host: config.primary.host.clone(),
        port: config.primary.port,
        user: config.primary.user.clone(),
        password: config.primary.password.clone(),
        dbname: config.primary.dbname.clone(),
        slot: config.slot_name.clone(),
        plugin: config.plugin.clone(),
        status_interval_seconds: config.status_interval_seconds,
        start_lsn,
    };

    // Shared with the apply loop below so shutdown terminates the
    // decoding helper even while it's idle (spec §4.C/§5: the child must
    // be signaled and awaited on consumer termination, not just on its
    // next line or EOF).
    let cancel = CancellationToken::new();

    let stream = DecoderSource::new(decoder_args)
        .stream(cancel.clone())
        .await
        .context("spawning decoding helper")?;

    let apply_loop = ApplyLoop::new(
        sink,
        Arc::new(offset_store),
        config.slot_name.clone(),
        config.batch_size,
        config.max_retries,
        config.backoff_seconds,
    );

    let run_cancel = cancel.clone();

    let run_handle = tokio::spawn(async move { apply_loop.run(stream, run_cancel).await });

    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            tracing::info!("received Ctrl-C, shutting down");
            cancel.cancel();
        }
    });

    run_handle
        .await
        .context("apply loop task panicked")??;

    tracing::info!("cdc-streamer exited cleanly");
    Ok(())
}
