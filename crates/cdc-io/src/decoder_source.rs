//! The `pg_recvlogical` subprocess driver (spec §4.C).
//!
//! Spawns and supervises the external logical-decoding helper, parsing
//! its newline-delimited JSON stdout into `(lsn, record)` pairs. This is
//! the Rust shape of `original_source/Source_Pg.py`'s
//! `Wal2Json_Via_Pg_Recvlogical` async generator: a lazy, finite-but-
//! unbounded sequence with a single consumer (spec §9).

use std::process::Stdio;

use cdc_core::error::SourceError;
use cdc_core::types::{DecodedRecord, Lsn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Arguments needed to launch the decoding helper (spec §4.C/§6).
#[derive(Debug, Clone)]
pub struct DecoderArgs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
    pub slot: String,
    pub plugin: String,
    pub status_interval_seconds: f64,
    /// Passed as `--startpos` when present; omitted entirely so the
    /// helper starts from the slot's consistent point when `None`
    /// (spec §4.F).
    pub start_lsn: Option<Lsn>,
}

/// One item the decoder source yields: the record's LSN (when
/// extractable) alongside the decoded record itself.
pub type DecodedItem = Result<(Option<Lsn>, DecodedRecord), SourceError>;

/// Supervises one `pg_recvlogical` invocation for the lifetime of the
/// returned stream.
pub struct DecoderSource {
    args: DecoderArgs,
    program: String,
}

impl DecoderSource {
    pub fn new(args: DecoderArgs) -> Self {
        Self {
            args,
            program: "pg_recvlogical".to_string(),
        }
    }

    /// Override the helper binary name (used in tests to point at a
    /// stub script instead of a real `pg_recvlogical`).
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn command(&self) -> Command {
        let a = &self.args;
        let mut cmd = Command::new(&self.program);
        cmd.args([
            "-h",
            &a.host,
            "-p",
            &a.port.to_string(),
            "-U",
            &a.user,
            "-d",
            &a.dbname,
            "-S",
            &a.slot,
            "-o",
            "pretty-print=0",
            "-o",
            "include-xids=1",
            "-o",
            "include-timestamp=1",
            "-o",
            "include-lsn=1",
            "--slot",
            &a.slot,
            "--plugin",
            &a.plugin,
            "--start",
            "--no-loop",
            "--status-interval",
            &(a.status_interval_seconds as u64).to_string(),
        ]);

        if let Some(start_lsn) = &a.start_lsn {
            cmd.args(["--startpos", start_lsn.as_str()]);
        }

        // Preserve the existing environment so the helper can be
        // located on PATH, and pass the password via a dedicated
        // env var rather than the command line (spec §4.C/§6).
        cmd.env("PGPASSWORD", &a.password);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }

    /// Spawn the helper and return a lazy stream of decoded items.
    ///
    /// Stderr is drained on its own task and forwarded to the log
    /// without blocking the data path. A crashed child is surfaced as a
    /// final `Err(SourceError::DecoderCrashed)` item before the stream
    /// ends. `cancel` ties the child's lifetime to the caller's shutdown
    /// signal: the reader task races the next line against
    /// `cancel.cancelled()` so an idle helper (no new WAL, no output) is
    /// still signaled and awaited on shutdown rather than leaking forever
    /// (spec §4.C/§5: "the child is signaled and awaited").
    pub async fn stream(
        self,
        cancel: CancellationToken,
    ) -> Result<ReceiverStream<DecodedItem>, SourceError> {
        let mut child: Child = self
            .command()
            .spawn()
            .map_err(SourceError::SpawnFailed)?;

        let stdout = child
            .stdout
            .take()
            .expect("decoder child spawned with piped stdout");
        let stderr = child
            .stderr
            .take()
            .expect("decoder child spawned with piped stderr");

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(target: "cdc_io::decoder_source", "pg_recvlogical: {line}");
            }
        });

        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut shutting_down = false;

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!(target: "cdc_io::decoder_source", "shutdown requested, terminating decoding helper");
                        shutting_down = true;
                        let _ = child.start_kill();
                        break;
                    }
                    line = lines.next_line() => {
                        match line {
                            Ok(Some(line)) => {
                                let line = line.trim();
                                if line.is_empty() {
                                    continue;
                                }
                                match serde_json::from_str::<DecodedRecord>(line) {
                                    Ok(record) => {
                                        let lsn = record.extract_lsn();
                                        if tx.send(Ok((lsn, record))).await.is_err() {
                                            shutting_down = true;
                                            let _ = child.start_kill();
                                            break;
                                        }
                                    }
                                    Err(err) => {
                                        // ParseSkipped: logged, not surfaced
                                        // (spec §7). The helper occasionally
                                        // emits non-JSON status lines.
                                        debug!(target: "cdc_io::decoder_source", %err, "skipping unparseable line");
                                    }
                                }
                            }
                            Ok(None) => break,
                            Err(err) => {
                                let _ = tx.send(Err(SourceError::Io(err))).await;
                                break;
                            }
                        }
                    }
                }
            }

            let wait_result = child.wait().await;
            if shutting_down {
                // Terminated by us, not a crash: nothing to surface.
                return;
            }

            match wait_result {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    let _ = tx
                        .send(Err(SourceError::DecoderCrashed(format!(
                            "pg_recvlogical exited with {status}"
                        ))))
                        .await;
                }
                Err(err) => {
                    let _ = tx
                        .send(Err(SourceError::DecoderCrashed(format!(
                            "failed to await pg_recvlogical: {err}"
                        ))))
                        .await;
                }
            }
        });

        Ok(ReceiverStream::new(rx))
    }
}
