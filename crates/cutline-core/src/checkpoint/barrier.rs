//! Checkpoint barriers and the per-channel event model.
//!
//! Barriers flow through every input channel alongside data buffers. A
//! barrier for checkpoint `K` splits its channel in two: everything before
//! it belongs to snapshot `<= K`, everything after it to snapshot `> K`.
//!
//! ## Channel Traffic
//!
//! Each item a task pulls from its input gate is a [`BufferOrEvent`]: a
//! channel index plus either an opaque data buffer (handed to the channel's
//! record decoder) or a typed [`ChannelEvent`]. Order within one channel is
//! preserved end-to-end; nothing is implied across channels.

use bytes::Bytes;

/// Bits of [`CheckpointBarrier::flags`].
pub mod flags {
    /// Plain checkpoint.
    pub const NONE: u64 = 0;
    /// Snapshot everything instead of only what changed.
    pub const FULL_SNAPSHOT: u64 = 1 << 0;
    /// Last checkpoint before the job stops.
    pub const DRAIN: u64 = 1 << 1;
    /// The coordinator abandoned this checkpoint; stop aligning it.
    pub const CANCEL: u64 = 1 << 2;
}

/// Cut marker injected by the checkpoint coordinator at every source and
/// forwarded on every channel.
///
/// Plain `Copy` data, 24 bytes, `#[repr(C)]`: id, trigger timestamp, then
/// the [`flags`] bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct CheckpointBarrier {
    /// Monotonically increasing checkpoint identifier.
    pub checkpoint_id: u64,
    /// Time the coordinator triggered the checkpoint (millis since epoch).
    pub timestamp: i64,
    /// Bitwise OR of [`flags`] constants.
    pub flags: u64,
}

const _: () = assert!(std::mem::size_of::<CheckpointBarrier>() == 24);

impl CheckpointBarrier {
    /// Barrier for `checkpoint_id` with no flags set.
    #[must_use]
    pub const fn new(checkpoint_id: u64, timestamp: i64) -> Self {
        Self {
            checkpoint_id,
            timestamp,
            flags: flags::NONE,
        }
    }

    /// Barrier carrying [`flags::FULL_SNAPSHOT`].
    #[must_use]
    pub const fn full_snapshot(checkpoint_id: u64, timestamp: i64) -> Self {
        Self {
            checkpoint_id,
            timestamp,
            flags: flags::FULL_SNAPSHOT,
        }
    }

    /// Whether [`flags::FULL_SNAPSHOT`] is set.
    #[must_use]
    pub const fn is_full_snapshot(&self) -> bool {
        self.flags & flags::FULL_SNAPSHOT != 0
    }

    /// Whether [`flags::DRAIN`] is set.
    #[must_use]
    pub const fn is_drain(&self) -> bool {
        self.flags & flags::DRAIN != 0
    }

    /// Whether [`flags::CANCEL`] is set.
    #[must_use]
    pub const fn is_cancel(&self) -> bool {
        self.flags & flags::CANCEL != 0
    }
}

/// A typed control event carried by a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A checkpoint barrier.
    Barrier(CheckpointBarrier),
    /// The producer of this channel has finished; nothing follows.
    EndOfPartition,
    /// The producer reached the end of the current superstep (epoch boundary
    /// of an iterative job).
    EndOfSuperstep,
    /// A task event for the generic event handler.
    Custom {
        /// Application-defined event kind.
        kind: u32,
        /// Opaque event body.
        payload: Bytes,
    },
}

impl ChannelEvent {
    /// Returns `true` if this is a barrier.
    #[must_use]
    pub const fn is_barrier(&self) -> bool {
        matches!(self, Self::Barrier(_))
    }

    /// Extracts the barrier if this is a [`ChannelEvent::Barrier`].
    #[must_use]
    pub const fn as_barrier(&self) -> Option<&CheckpointBarrier> {
        match self {
            Self::Barrier(b) => Some(b),
            _ => None,
        }
    }
}

/// Either a data buffer or a control event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Serialized record bytes, possibly holding partial records.
    Buffer(Bytes),
    /// A control event.
    Event(ChannelEvent),
}

/// One item pulled from an input gate, tagged with its channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferOrEvent {
    /// Index of the channel this item arrived on.
    pub channel_index: usize,
    /// The buffer or event itself.
    pub payload: Payload,
}

impl BufferOrEvent {
    /// Wrap a data buffer.
    #[must_use]
    pub fn buffer(channel_index: usize, buffer: Bytes) -> Self {
        Self {
            channel_index,
            payload: Payload::Buffer(buffer),
        }
    }

    /// Wrap a control event.
    #[must_use]
    pub fn event(channel_index: usize, event: ChannelEvent) -> Self {
        Self {
            channel_index,
            payload: Payload::Event(event),
        }
    }

    /// Wrap a barrier.
    #[must_use]
    pub fn barrier(channel_index: usize, barrier: CheckpointBarrier) -> Self {
        Self::event(channel_index, ChannelEvent::Barrier(barrier))
    }

    /// Returns `true` if this is a data buffer.
    #[must_use]
    pub const fn is_buffer(&self) -> bool {
        matches!(self.payload, Payload::Buffer(_))
    }

    /// Number of payload bytes this item occupies while buffered.
    ///
    /// Events are accounted at a flat size of the barrier struct so that a
    /// flood of control events still counts against buffer limits.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        match &self.payload {
            Payload::Buffer(b) => b.len(),
            Payload::Event(ChannelEvent::Custom { payload, .. }) => payload.len(),
            Payload::Event(_) => std::mem::size_of::<CheckpointBarrier>(),
        }
    }
}
