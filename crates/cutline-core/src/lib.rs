//! # Cutline Core
//!
//! Task-side checkpointing primitives for a dataflow engine: barrier
//! alignment across input channels and a record reader that runs alignment
//! transparently while decoding records.
//!
//! ## Modules
//!
//! - [`checkpoint`]: Checkpoint barriers, channel events and the
//!   `BarrierBuffer` that aligns them
//! - [`reader`]: Input gates, record decoding and the `RecordReader`
//! - [`error_codes`]: Stable `CUT-NNNN` codes embedded in error messages

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod checkpoint;
pub mod error_codes;
pub mod reader;

pub use checkpoint::{
    AlignmentConfig, AlignmentError, AlignmentListener, BarrierBuffer, BufferOrEvent,
    ChannelEvent, CheckpointBarrier,
};
pub use reader::{ReadResult, ReaderConfig, RecordReader};

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Barrier alignment protocol violation.
    #[error("alignment error: {0}")]
    Alignment(#[from] AlignmentError),

    /// Input gate failure.
    #[error("input gate error: {0}")]
    Gate(#[from] reader::GateError),

    /// Record decoding failure.
    #[error("decode error: {0}")]
    Decode(#[from] reader::DecodeError),
}
