//! The record reader: input gate in, decoded records out.
//!
//! Each call to [`RecordReader::next_record`] loops until it can hand back a
//! record or a boundary:
//!
//! 1. Finish the record the current channel's decoder is assembling
//! 2. Take the next item from the alignment replay queue, or from the gate
//!    once the replay queue is empty
//! 3. Items of blocked channels are stored in the alignment buffer
//! 4. Buffers go to their channel's decoder; barriers go to the alignment
//!    buffer; other events go to the event handler
//!
//! A new item is only pulled once the current buffer is used up, so a barrier
//! can never overtake data that preceded it on its channel.

use std::marker::PhantomData;

use tracing::debug;

use crate::checkpoint::{
    AlignmentError, AlignmentListener, BarrierAction, BarrierBuffer, ChannelEvent, Payload,
};
use crate::reader::decoder::{Record, RecordDecoder, SpanningRecordDecoder};
use crate::reader::event_handler::{EventHandler, EventOutcome, ReaderEventHandler};
use crate::reader::gate::InputGate;
use crate::reader::ReaderConfig;
use crate::Result;

/// Result of [`RecordReader::next_record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResult<T> {
    /// A fully decoded record.
    Record(T),
    /// Soft boundary: every live channel finished the current superstep.
    /// Call [`RecordReader::start_next_superstep`] before reading on.
    EndOfSuperstep,
    /// The input is exhausted.
    Finished,
}

impl<T> ReadResult<T> {
    /// Take the record, if any.
    pub fn into_record(self) -> Option<T> {
        match self {
            Self::Record(r) => Some(r),
            Self::EndOfSuperstep | Self::Finished => None,
        }
    }
}

/// Reads records of type `T` from one task's input gate, aligning barriers
/// on the way.
pub struct RecordReader<T, G, D = SpanningRecordDecoder<T>, H = ReaderEventHandler> {
    gate: G,
    decoders: Vec<D>,
    /// Channel whose decoder holds an unfinished buffer.
    current: Option<usize>,
    barrier_buffer: BarrierBuffer,
    handler: H,
    finished: bool,
    _record: PhantomData<fn() -> T>,
}

impl<T, G> RecordReader<T, G>
where
    T: Record,
    G: InputGate,
{
    /// Create a reader with a spanning decoder per channel and the default
    /// event handler.
    ///
    /// # Errors
    ///
    /// Returns an error if the gate has no channels.
    pub fn new(gate: G, config: ReaderConfig) -> Result<Self> {
        let num_channels = gate.num_channels();
        let barrier_buffer = BarrierBuffer::with_config(num_channels, config.alignment)?;
        let decoders = (0..num_channels)
            .map(|_| SpanningRecordDecoder::new(config.decoder.clone()))
            .collect();
        Self::from_parts(
            gate,
            decoders,
            barrier_buffer,
            ReaderEventHandler::new(num_channels),
        )
    }
}

impl<T, G, D, H> RecordReader<T, G, D, H>
where
    G: InputGate,
    D: RecordDecoder<T>,
    H: EventHandler,
{
    /// Assemble a reader from explicit parts.
    ///
    /// # Errors
    ///
    /// Returns [`AlignmentError::ChannelOutOfRange`] if the decoder count or
    /// the barrier buffer's channel count differs from the gate's.
    pub fn from_parts(
        gate: G,
        decoders: Vec<D>,
        barrier_buffer: BarrierBuffer,
        handler: H,
    ) -> Result<Self> {
        let num_channels = gate.num_channels();
        for count in [decoders.len(), barrier_buffer.num_channels()] {
            if count != num_channels {
                return Err(AlignmentError::ChannelOutOfRange {
                    channel: count.min(num_channels),
                    num_channels: count.max(num_channels),
                }
                .into());
            }
        }
        Ok(Self {
            gate,
            decoders,
            current: None,
            barrier_buffer,
            handler,
            finished: false,
            _record: PhantomData,
        })
    }

    /// Install the listener notified when an alignment completes or aborts.
    #[must_use]
    pub fn with_alignment_listener(mut self, listener: Box<dyn AlignmentListener>) -> Self {
        self.barrier_buffer.set_listener(listener);
        self
    }

    /// Read the next record.
    ///
    /// # Errors
    ///
    /// Propagates gate, decode and protocol errors.
    pub fn next_record(&mut self) -> Result<ReadResult<T>> {
        if self.finished {
            return Ok(ReadResult::Finished);
        }

        loop {
            if let Some(channel) = self.current {
                let result = self.decoders[channel].next_record()?;
                if result.is_buffer_consumed() {
                    self.current = None;
                }
                if let Some(record) = result.into_record() {
                    return Ok(ReadResult::Record(record));
                }
            }

            let item = match self.barrier_buffer.get_non_processed() {
                Some(item) => item,
                None => match self.gate.next_buffer_or_event()? {
                    Some(item) => item,
                    None => {
                        if self.drain_exhausted_gate()? {
                            continue;
                        }
                        debug!("input gate exhausted");
                        self.finished = true;
                        return Ok(ReadResult::Finished);
                    }
                },
            };

            let channel = item.channel_index;
            if channel >= self.decoders.len() {
                return Err(AlignmentError::ChannelOutOfRange {
                    channel,
                    num_channels: self.decoders.len(),
                }
                .into());
            }
            if self.barrier_buffer.is_blocked(channel) {
                self.barrier_buffer.store(item);
                continue;
            }

            match item.payload {
                Payload::Buffer(buffer) => {
                    self.decoders[channel].set_next_buffer(buffer);
                    self.current = Some(channel);
                }
                Payload::Event(event) => {
                    if self.barrier_buffer.offer(channel, &event)? == BarrierAction::Consumed {
                        continue;
                    }
                    if matches!(event, ChannelEvent::EndOfPartition) {
                        self.barrier_buffer.on_channel_closed(channel)?;
                    }
                    match self.handler.handle_event(channel, &event)? {
                        EventOutcome::Continue => {}
                        EventOutcome::EndOfSuperstep => return Ok(ReadResult::EndOfSuperstep),
                        EventOutcome::Finished => {
                            self.finished = true;
                            return Ok(ReadResult::Finished);
                        }
                    }
                }
            }
        }
    }

    /// The gate ran dry. Channels that never delivered end of partition are
    /// closed so an in-flight alignment resolves and its traffic is released.
    /// Returns whether anything is left to replay.
    fn drain_exhausted_gate(&mut self) -> Result<bool> {
        if self.barrier_buffer.is_aligning() {
            for channel in 0..self.barrier_buffer.num_channels() {
                self.barrier_buffer.on_channel_closed(channel)?;
            }
        }
        Ok(self.barrier_buffer.contains_nonprocessed())
    }

    /// Re-arm after [`ReadResult::EndOfSuperstep`].
    pub fn start_next_superstep(&mut self) {
        self.handler.start_next_superstep();
    }

    /// Drop decoder state and buffered traffic, e.g. on cancellation.
    pub fn clear_buffers(&mut self) {
        for decoder in &mut self.decoders {
            decoder.clear();
        }
        self.current = None;
        self.barrier_buffer.cleanup();
    }

    /// Whether [`ReadResult::Finished`] was returned.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// The alignment buffer, for inspection.
    #[must_use]
    pub fn barrier_buffer(&self) -> &BarrierBuffer {
        &self.barrier_buffer
    }

    /// The event handler, e.g. to subscribe to task events.
    pub fn event_handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }
}
