//! # cdc-io
//!
//! Concrete implementations of the decoder source, the offset store, and
//! the sink adapters used by the CDC streamer.
//!
//! ## Features
//!
//! - **Decoder source** (`decoder_source`): supervises `pg_recvlogical`
//!   and yields a lazy stream of `(lsn, record)` pairs.
//! - **Offset store** (`offset_store`): durable `slot → last_applied_lsn`
//!   mapping backed by SQLite.
//! - **Sinks** (`sink_postgres`, `sink_stdout`): the reference idempotent
//!   Postgres staging sink, and a stdout sink for local development and
//!   tests.
//! - **Bootstrap** (`bootstrap`): the control-SQL helpers that ensure a
//!   publication and replication slot exist, and resolve the current WAL
//!   position.
//!
//! ## Example Usage
//!
//! ```no_run
//! use cdc_io::offset_store::SqliteOffsetStore;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let store = SqliteOffsetStore::open("offsets.sqlite").await?;
//! # Ok(())
//! # }
//! ```

/// Control-SQL helpers for ensuring publication/slot existence.
pub mod bootstrap;

/// The `pg_recvlogical` subprocess driver.
pub mod decoder_source;

/// SQLite-backed offset store.
pub mod offset_store;

/// Reference idempotent Postgres staging sink.
pub mod sink_postgres;

/// Stdout sink for local development and tests.
pub mod sink_stdout;
