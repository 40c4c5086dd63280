//! # Record Reading
//!
//! Turns one task's input gate into a stream of decoded records while
//! transparently running barrier alignment.
//!
//! ## Module Overview
//!
//! - [`gate`]: The `InputGate` contract and an in-process gate fed by
//!   per-channel writers
//! - [`decoder`]: Length-prefixed record framing that spans buffers
//! - [`event_handler`]: Handling of non-barrier control events (end of
//!   partition, end of superstep, task events)
//! - [`record_reader`]: The `RecordReader` that ties them together

pub mod decoder;
pub mod event_handler;
pub mod gate;
pub mod record_reader;

use serde::Deserialize;

use crate::checkpoint::AlignmentConfig;

pub use decoder::{
    DecodeError, DecodeResult, DecoderConfig, Record, RecordDecoder, RecordWriter,
    SpanningRecordDecoder,
};
pub use event_handler::{EventHandler, EventOutcome, ReaderEventHandler};
pub use gate::{ChannelInputGate, ChannelWriter, GateError, InputGate};
pub use record_reader::{ReadResult, RecordReader};

/// Configuration for a [`RecordReader`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Barrier alignment settings.
    pub alignment: AlignmentConfig,
    /// Record decoder settings, applied to every channel.
    pub decoder: DecoderConfig,
}
