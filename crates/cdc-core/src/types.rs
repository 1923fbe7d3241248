//! The decoded-record / event data model (spec §3).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An opaque, monotonically non-decreasing position in the upstream WAL.
///
/// The core treats this as ordered text: it is compared only for equality
/// against earlier/later values the upstream produced, never parsed or
/// reasoned about numerically. Sinks observe the value unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Lsn(pub String);

impl Lsn {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Lsn {
    fn from(s: String) -> Self {
        Lsn(s)
    }
}

impl From<&str> for Lsn {
    fn from(s: &str) -> Self {
        Lsn(s.to_string())
    }
}

/// The kind of row-level change a decoded change object represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    /// Any value the upstream plugin emits that isn't one of the three
    /// above. The normalizer never rejects a change for an unrecognized
    /// kind (spec §4.D: "never raises for shape variance").
    Other,
}

impl ChangeKind {
    /// Read `kind` out of a raw change `Value` without otherwise caring
    /// about the object's shape. Used for routing only — the `Value`
    /// itself, not this enum, becomes the event's payload, so nothing
    /// here needs to round-trip back to JSON.
    pub(crate) fn from_change(change: &Value) -> Self {
        match change.get("kind").and_then(Value::as_str) {
            Some("insert") => ChangeKind::Insert,
            Some("update") => ChangeKind::Update,
            Some("delete") => ChangeKind::Delete,
            _ => ChangeKind::Other,
        }
    }
}

/// One committed transaction as decoded by the upstream helper.
///
/// Deserialized directly from one line of the helper's newline-delimited
/// JSON output. Extra fields the helper emits (transaction metadata this
/// core doesn't care about) are ignored rather than rejected. `changes`
/// is kept as raw `Value`s rather than a narrowed struct: wal2json change
/// objects carry fields beyond `kind`/`schema`/`table`/`columnvalues`/
/// `oldkeys` (e.g. `columnnames`, `columntypes`, `oldkeys.keynames`), and
/// spec §3/§4.D require `payload` to preserve the change "verbatim" — a
/// round-trip through a narrower struct would silently drop them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecodedRecord {
    #[serde(default)]
    pub lsn: Option<String>,
    #[serde(default)]
    pub nextlsn: Option<String>,
    #[serde(default)]
    pub last_lsn: Option<String>,
    #[serde(default)]
    pub commit_lsn: Option<String>,
    #[serde(default)]
    pub xid: Option<Value>,
    #[serde(default)]
    pub changes: Vec<Value>,
}

impl DecodedRecord {
    /// Extract the record's LSN in the precedence order from spec §4.C:
    /// `lsn`, `nextlsn`, `last_lsn`, then the weaker fallback `commit_lsn`.
    ///
    /// A bare transaction id is deliberately *not* accepted here (spec §9
    /// open question, resolved): a xid is not an LSN and must never be
    /// compared against one in the offset store.
    pub fn extract_lsn(&self) -> Option<Lsn> {
        self.lsn
            .clone()
            .or_else(|| self.nextlsn.clone())
            .or_else(|| self.last_lsn.clone())
            .or_else(|| self.commit_lsn.clone())
            .map(Lsn)
    }

    /// The LSN used as `commit_lsn` on every event normalized from this
    /// record (spec §4.D: "the record's `lsn` if present, else
    /// `commit_lsn`").
    pub fn commit_lsn(&self) -> Option<String> {
        self.lsn.clone().or_else(|| self.commit_lsn.clone())
    }
}

/// The uniform unit the pipeline carries downstream (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// LSN of the enclosing transaction, copied from the decoded record.
    pub commit_lsn: Option<String>,
    /// `insert` / `update` / `delete` (or `other`, see `ChangeKind`).
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    /// Fully qualified `"schema.table"`.
    pub table: String,
    /// Primary-key values: `oldkeys.keyvalues` when present, else
    /// `columnvalues`. Non-null for deletes and updates (spec invariant 5).
    pub pk: Option<Value>,
    /// The original change object, preserved verbatim for the sink.
    pub payload: Value,
}

/// `(slot_name, last_applied_lsn)`, unique by `slot_name` (spec §3/§4.A).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetRow {
    pub slot_name: String,
    pub last_applied_lsn: Lsn,
}
