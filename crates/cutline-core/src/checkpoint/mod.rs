//! # Checkpoint Alignment
//!
//! Chandy-Lamport style barrier alignment for consistent snapshots.
//!
//! ## Module Overview
//!
//! - [`barrier`]: Checkpoint barrier type and the per-channel event model
//!   (`BufferOrEvent`, `ChannelEvent`)
//! - [`alignment`]: The `BarrierBuffer` state machine that blocks channels
//!   which delivered the current barrier and replays their traffic once
//!   every channel has

pub mod alignment;
pub mod barrier;

// Re-export key types
pub use alignment::{
    AbortReason, AlignmentConfig, AlignmentError, AlignmentListener, AlignmentStats,
    BarrierAction, BarrierBuffer, ClosedChannelPolicy, NoopListener,
};
pub use barrier::{flags, BufferOrEvent, ChannelEvent, CheckpointBarrier, Payload};
