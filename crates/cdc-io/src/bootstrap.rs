//! Control-SQL helpers that make startup idempotent (spec §4.F/§6).
//!
//! Mirrors `original_source/Source_Pg.py`'s `Get_Current_Lsn`,
//! `Check_Publication`, and `Check_Replication_Slot`: each runs a brief
//! control connection, checks catalog state, and creates what's missing.
//! None of these hold the connection open past their own call.

use cdc_core::types::Lsn;
use tokio_postgres::NoTls;
use tracing::info;

/// Open a short-lived control connection, spawning its driver task the
/// way every other `tokio_postgres` caller in this crate does.
async fn connect(dsn: &str) -> Result<tokio_postgres::Client, tokio_postgres::Error> {
    let (client, connection) = tokio_postgres::connect(dsn, NoTls).await?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            tracing::error!(%err, "bootstrap control connection error");
        }
    });
    Ok(client)
}

/// Ensure `publication` exists on the upstream database, creating a
/// `FOR ALL TABLES` publication if it doesn't (spec §4.F).
pub async fn ensure_publication(dsn: &str, publication: &str) -> Result<(), tokio_postgres::Error> {
    let client = connect(dsn).await?;

    let exists = client
        .query_opt(
            "SELECT 1 FROM pg_publication WHERE pubname = $1",
            &[&publication],
        )
        .await?
        .is_some();

    if !exists {
        info!(publication, "creating publication");
        // Publication names can't be bound as parameters; this path
        // only ever runs against an operator-supplied identifier from
        // the application's own config, not untrusted input.
        client
            .batch_execute(&format!("CREATE PUBLICATION {publication} FOR ALL TABLES"))
            .await?;
    }

    Ok(())
}

/// Ensure the logical replication slot exists, creating it with the
/// given decoding `plugin` if it doesn't (spec §4.F).
pub async fn ensure_replication_slot(
    dsn: &str,
    slot: &str,
    plugin: &str,
) -> Result<(), tokio_postgres::Error> {
    let client = connect(dsn).await?;

    let exists = client
        .query_opt(
            "SELECT 1 FROM pg_replication_slots WHERE slot_name = $1",
            &[&slot],
        )
        .await?
        .is_some();

    if !exists {
        info!(slot, plugin, "creating logical replication slot");
        client
            .query(
                "SELECT * FROM pg_create_logical_replication_slot($1, $2)",
                &[&slot, &plugin],
            )
            .await?;
    }

    Ok(())
}

/// The server's current WAL write position, used as the start LSN for
/// a slot created fresh (spec §4.F: "with no durable offset, start from
/// the current WAL position rather than replaying the whole slot").
pub async fn current_wal_lsn(dsn: &str) -> Result<Lsn, tokio_postgres::Error> {
    let client = connect(dsn).await?;
    let row = client
        .query_one("SELECT pg_current_wal_lsn()::text", &[])
        .await?;
    let lsn: String = row.get(0);
    Ok(Lsn(lsn))
}

/// Demo convenience (spec §4.F, gated behind `demo_mode`): provisions a
/// `test_data` table on the primary with one seed row, so the crate is
/// runnable end-to-end against a fresh Postgres without a separate
/// seeding step. Mirrors `original_source/Main.py`'s
/// `Check_Test_Data_Table` / `Sql_Commands.py`'s
/// `Create_Test_Data_Table_Sql`. Not part of the pipeline's correctness
/// contract.
pub async fn ensure_demo_test_data_table(dsn: &str) -> Result<(), tokio_postgres::Error> {
    let client = connect(dsn).await?;

    client
        .batch_execute(
            "CREATE TABLE IF NOT EXISTS test_data (
                id SERIAL PRIMARY KEY,
                counter INTEGER NOT NULL,
                message TEXT,
                value NUMERIC(10,2),
                created_at TIMESTAMP DEFAULT NOW(),
                updated_at TIMESTAMP DEFAULT NOW()
            )",
        )
        .await?;

    let row = client.query_one("SELECT COUNT(*) FROM test_data", &[]).await?;
    let count: i64 = row.get(0);

    if count == 0 {
        info!("seeding test_data with an initial row");
        client
            .execute(
                "INSERT INTO test_data (counter, message, value) VALUES (0, 'Initial row', 0.00)",
                &[],
            )
            .await?;
    }

    Ok(())
}
