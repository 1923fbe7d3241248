//! The reference idempotent Postgres staging sink (spec §4.B/§6).
//!
//! Mirrors `original_source/Sink_Postgres.py`'s `Apply_Postgres`: only
//! `insert` events are materialized into the staging relation;
//! `update`/`delete` events still pass through the pipeline (and are
//! delivered to `apply` in order) but are not written by this sink.
//! Alternate sinks may choose to handle them.

use async_trait::async_trait;
use cdc_core::error::SinkError;
use cdc_core::traits::Sink as SinkTrait;
use cdc_core::types::{ChangeKind, Event};
use tokio_postgres::{Error as PgError, NoTls};
use tracing::{debug, info};

/// Writes `insert` events to `cdc_events(table_fqn, pk, commit_lsn,
/// payload)`, `ON CONFLICT (table_fqn, pk, commit_lsn) DO NOTHING` —
/// the composite key that makes at-least-once delivery safe end to end
/// (spec §4.B).
pub struct PostgresSink {
    client: tokio_postgres::Client,
}

impl PostgresSink {
    /// Connect to the sink database and ensure the staging table
    /// exists. The connection task is spawned in the background, the
    /// way every `tokio_postgres` caller in this codebase family drives
    /// the connection future.
    pub async fn connect(dsn: &str) -> Result<Self, SinkError> {
        let (client, connection) = tokio_postgres::connect(dsn, NoTls)
            .await
            .map_err(classify_connect_error)?;

        tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::error!(%err, "sink postgres connection error");
            }
        });

        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS cdc_events (
                    table_fqn TEXT NOT NULL,
                    pk TEXT NOT NULL,
                    commit_lsn TEXT NOT NULL,
                    payload JSONB,
                    PRIMARY KEY (table_fqn, pk, commit_lsn)
                )",
            )
            .await
            .map_err(classify_execute_error)?;

        Ok(Self { client })
    }
}

#[async_trait]
impl SinkTrait for PostgresSink {
    async fn apply(&self, events: &[Event]) -> Result<(), SinkError> {
        for event in events {
            if event.kind != ChangeKind::Insert {
                debug!(table = %event.table, "skipping non-insert event at reference sink");
                continue;
            }

            let pk = event
                .pk
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_default();

            self.client
                .execute(
                    "INSERT INTO cdc_events(table_fqn, pk, commit_lsn, payload)
                     VALUES ($1, $2, $3, $4)
                     ON CONFLICT (table_fqn, pk, commit_lsn) DO NOTHING",
                    &[
                        &event.table,
                        &pk,
                        &event.commit_lsn.clone().unwrap_or_default(),
                        &event.payload,
                    ],
                )
                .await
                .map_err(classify_execute_error)?;
        }

        info!(count = events.len(), "applied batch to postgres sink");
        Ok(())
    }
}

fn classify_connect_error(err: PgError) -> SinkError {
    // Connection failures (network, auth) are retryable from the apply
    // loop's point of view at the batch level, except authentication
    // failures, which will never succeed on retry.
    if is_auth_failure(&err) {
        SinkError::Permanent(format!("authentication failed: {err}"))
    } else {
        SinkError::Transient(format!("connection failed: {err}"))
    }
}

fn classify_execute_error(err: PgError) -> SinkError {
    if let Some(db_error) = err.as_db_error() {
        match db_error.code() {
            // undefined_table, undefined_column, datatype_mismatch: a
            // schema problem no amount of retrying will fix.
            code if code.code() == "42P01"
                || code.code() == "42703"
                || code.code() == "42804" =>
            {
                SinkError::Permanent(format!("schema mismatch: {err}"))
            }
            _ => SinkError::Transient(err.to_string()),
        }
    } else {
        SinkError::Transient(err.to_string())
    }
}

fn is_auth_failure(err: &PgError) -> bool {
    err.as_db_error()
        .map(|db_error| db_error.code().code() == "28P01" || db_error.code().code() == "28000")
        .unwrap_or(false)
}
