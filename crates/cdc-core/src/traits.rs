//! Capability interfaces the apply loop is built against (spec §9:
//! "model as two small capability interfaces... passed in at
//! construction" instead of module-level handles or callbacks).

use async_trait::async_trait;

use crate::error::{OffsetStoreError, SinkError};
use crate::types::{Event, Lsn};

/// Idempotent bulk apply of an ordered event list (spec §4.B).
///
/// `apply` either succeeds (every event is visible at the sink) or fails
/// with a classified error; no partial success is observable to the
/// caller. Implementations must be idempotent keyed on
/// `(table, pk, commit_lsn)` so at-least-once delivery is safe.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn apply(&self, events: &[Event]) -> Result<(), SinkError>;
}

/// Durable `slot → last_applied_lsn` mapping (spec §4.A).
#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// Returns the stored LSN for `slot`, or `None` if the slot has
    /// never been committed.
    async fn get(&self, slot: &str) -> Result<Option<Lsn>, OffsetStoreError>;

    /// Upsert keyed on `slot`. Must commit synchronously (durably)
    /// before returning success.
    async fn set(&self, slot: &str, lsn: &Lsn) -> Result<(), OffsetStoreError>;
}

// Blanket impls so `Arc<dyn Sink>` / `Arc<dyn OffsetStore>` are usable
// directly wherever the trait is expected — the shape the binary's
// wiring needs, since the concrete sink is chosen at runtime.
#[async_trait]
impl<T: Sink + ?Sized> Sink for std::sync::Arc<T> {
    async fn apply(&self, events: &[Event]) -> Result<(), SinkError> {
        (**self).apply(events).await
    }
}

#[async_trait]
impl<T: OffsetStore + ?Sized> OffsetStore for std::sync::Arc<T> {
    async fn get(&self, slot: &str) -> Result<Option<Lsn>, OffsetStoreError> {
        (**self).get(slot).await
    }

    async fn set(&self, slot: &str, lsn: &Lsn) -> Result<(), OffsetStoreError> {
        (**self).set(slot, lsn).await
    }
}
