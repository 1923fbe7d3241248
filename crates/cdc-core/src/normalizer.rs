//! The normalizer: a pure function from one decoded record to a list of
//! events (spec §4.D).
//!
//! No I/O, no dependence on previous records or external state (spec
//! invariant 4) — `normalize(record)` returns the same events for the
//! same input regardless of call order.

use crate::types::{ChangeKind, DecodedRecord, Event};
use serde_json::Value;

/// Split one decoded transaction record into N row-level events.
///
/// `commit_lsn` is taken from the record's `lsn` if present, else
/// `commit_lsn`. For each change: `table` is `"schema.table"`, `pk` is
/// `oldkeys.keyvalues` when present else `columnvalues`, and `payload`
/// is the change verbatim — the raw `Value` itself, not a reconstruction
/// of it, so fields this core doesn't otherwise look at (`columnnames`,
/// `columntypes`, `oldkeys.keynames`, ...) still reach the sink. Order
/// within the batch is preserved. Never raises for shape variance —
/// absent fields propagate as null in the output event.
pub fn normalize(record: &DecodedRecord) -> Vec<Event> {
    let commit_lsn = record.commit_lsn();

    record
        .changes
        .iter()
        .map(|change| normalize_change(change, commit_lsn.clone()))
        .collect()
}

fn normalize_change(change: &Value, commit_lsn: Option<String>) -> Event {
    let schema = change.get("schema").and_then(Value::as_str).unwrap_or("");
    let table = change.get("table").and_then(Value::as_str).unwrap_or("");
    let pk = change
        .get("oldkeys")
        .and_then(|oldkeys| oldkeys.get("keyvalues"))
        .cloned()
        .or_else(|| change.get("columnvalues").cloned());

    Event {
        commit_lsn,
        kind: ChangeKind::from_change(change),
        table: format!("{schema}.{table}"),
        pk,
        payload: change.clone(),
    }
}
