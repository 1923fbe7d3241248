//! A stdout sink for local development and tests (spec §4.B).
//!
//! Mirrors `original_source/Sink_Stdout.py`'s `Apply_Stdout`: print each
//! event and succeed. Useful for exercising the apply loop end to end
//! without a real downstream database.

use async_trait::async_trait;
use cdc_core::error::SinkError;
use cdc_core::traits::Sink as SinkTrait;
use cdc_core::types::Event;

pub struct StdoutSink;

impl StdoutSink {
    pub fn new() -> Self {
        Self
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SinkTrait for StdoutSink {
    async fn apply(&self, events: &[Event]) -> Result<(), SinkError> {
        for event in events {
            println!("{}", serde_json::to_string(event).unwrap_or_default());
        }
        Ok(())
    }
}
