//! # cdc-core
//!
//! Core types, traits, configuration, and the normalizer for the CDC
//! streamer. This crate has no knowledge of Postgres wire protocols,
//! subprocesses, or SQLite — it defines the vocabulary the rest of the
//! workspace is built on.
//!
//! ## Key Components
//!
//! - **Data model** (`types`): the decoded record shape produced by the
//!   logical-decoding helper, and the normalized `Event` the pipeline
//!   carries downstream.
//! - **Capability traits** (`traits`): `Sink` and `OffsetStore`, the two
//!   small interfaces the apply loop is built against. Concrete
//!   implementations live in `cdc-io`.
//! - **Normalizer** (`normalizer`): the pure function that turns one
//!   decoded record into a list of events.
//! - **Configuration** (`config`): the immutable `AppConfig` loaded once
//!   at startup and passed down, instead of a global.
//! - **Error handling** (`error`): the error taxonomy shared by every
//!   component in the workspace.
//!
//! ## Example Usage
//!
//! ```rust
//! use cdc_core::{normalize, DecodedRecord};
//!
//! let record: DecodedRecord = serde_json::from_str(
//!     r#"{"lsn":"0/10","changes":[{"kind":"insert","schema":"s","table":"t","columnvalues":{"id":1}}]}"#
//! ).unwrap();
//! let events = normalize(&record);
//! assert_eq!(events.len(), 1);
//! ```

pub mod config;
pub mod error;
pub mod normalizer;
pub mod traits;
pub mod types;

pub use config::{AppConfig, PgConnInfo, SinkKind};
pub use error::{CdcError, OffsetStoreError, SinkError, SourceError};
pub use normalizer::normalize;
pub use traits::{OffsetStore, Sink};
pub use types::{ChangeKind, DecodedRecord, Event, Lsn};
