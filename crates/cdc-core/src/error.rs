//! Error taxonomy (spec §7).
//!
//! Every component gets its own `thiserror`-derived enum so the
//! `Transient`/`Permanent` distinction (and friends) is explicit in the
//! type rather than implicit in an exception hierarchy — the
//! re-architecting direction spec §9 calls for under "Exceptions as
//! control flow".

use thiserror::Error;

/// Errors the decoder source can surface to the apply loop.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The helper subprocess exited (cleanly or not). The source's
    /// stream terminates; the apply loop surfaces this and exits.
    #[error("decoder subprocess crashed: {0}")]
    DecoderCrashed(String),

    /// Failed to spawn the helper subprocess at all.
    #[error("failed to spawn decoding helper: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("io error reading decoder output: {0}")]
    Io(#[from] std::io::Error),
}

/// The two failure classes a `Sink` can report (spec §4.B).
#[derive(Debug, Error)]
pub enum SinkError {
    /// Network, timeout, resource exhaustion: retryable.
    #[error("transient sink failure: {0}")]
    Transient(String),

    /// Schema mismatch, authorization: surfaced immediately and fatal.
    #[error("permanent sink failure: {0}")]
    Permanent(String),
}

impl SinkError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Transient(_))
    }
}

/// Errors from the offset store.
#[derive(Debug, Error)]
pub enum OffsetStoreError {
    /// The backing file/database is not writable. Fatal to the apply
    /// loop: it exits without advancing, and replays from the last
    /// durable LSN on restart.
    #[error("offset store unavailable: {0}")]
    StorageUnavailable(String),
}

/// Top-level error assembled at the binary boundary. Every leaf error
/// type converts into this via `#[from]`, mirroring the teacher's
/// `#[error(transparent)] Other(#[from] anyhow::Error)` fallback arm.
#[derive(Debug, Error)]
pub enum CdcError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    OffsetStore(#[from] OffsetStoreError),

    /// A batch's retries were exhausted; the batch was not committed.
    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: SinkError,
    },

    /// A sink reported a permanent failure.
    #[error(transparent)]
    SinkPermanent(#[from] SinkErrorPermanent),

    /// Bootstrap could not ensure publication/slot/start LSN.
    #[error("bootstrap failed: {0}")]
    BootstrapFailed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Newtype so a permanent `SinkError` converts unambiguously into
/// `CdcError` without colliding with the transient/retry path, which is
/// folded into `RetriesExhausted` by the apply loop instead.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct SinkErrorPermanent(pub String);
