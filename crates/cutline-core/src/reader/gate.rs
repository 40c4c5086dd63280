//! Input gates: where a task's channels meet its reader.
//!
//! An [`InputGate`] multiplexes all input channels of one task into a single
//! sequence of [`BufferOrEvent`]s. Per-channel order is preserved; there is
//! no ordering across channels.
//!
//! [`ChannelInputGate`] is the in-process implementation: each producer owns
//! a [`ChannelWriter`] and all writers share one bounded queue, so a slow
//! task back-pressures its producers. Reads and writes are blocking and must
//! not be called from inside an async runtime.

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use crate::checkpoint::{BufferOrEvent, ChannelEvent, CheckpointBarrier, Payload};
use crate::error_codes;

/// Errors raised by input gates.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// Every writer went away before closing its channel.
    #[error("[{code}] all writers disconnected with {open} channel(s) still open", code = error_codes::GATE_FAILURE)]
    Disconnected {
        /// Channels that never delivered end of partition.
        open: usize,
    },

    /// A channel delivered traffic after its end of partition.
    #[error("[{code}] channel {channel} delivered data after end of partition", code = error_codes::GATE_CHANNEL_CLOSED)]
    ChannelClosed {
        /// Offending channel.
        channel: usize,
    },

    /// The reading side of the gate was dropped.
    #[error("[{code}] input gate receiver dropped", code = error_codes::GATE_FAILURE)]
    ReceiverDropped,

    /// A gate needs at least one channel.
    #[error("[{code}] input gate requires at least one channel", code = error_codes::INVALID_CHANNEL_COUNT)]
    NoChannels,

    /// Transport failure reported by an external gate implementation.
    #[error("[{code}] I/O error: {0}", code = error_codes::GATE_FAILURE)]
    Io(#[from] std::io::Error),
}

/// Source of buffers and events for one task.
pub trait InputGate {
    /// Number of input channels, fixed at construction.
    fn num_channels(&self) -> usize;

    /// Block until the next buffer or event is available.
    ///
    /// Returns `Ok(None)` once every channel has finished.
    ///
    /// # Errors
    ///
    /// Returns [`GateError`] on transport failure.
    fn next_buffer_or_event(&mut self) -> Result<Option<BufferOrEvent>, GateError>;

    /// Whether every channel has delivered end of partition.
    fn is_finished(&self) -> bool;
}

/// In-process [`InputGate`] over a bounded queue.
#[derive(Debug)]
pub struct ChannelInputGate {
    rx: mpsc::Receiver<BufferOrEvent>,
    /// Channels whose end of partition has been delivered.
    finished: Vec<bool>,
}

impl ChannelInputGate {
    /// Create a gate with `num_channels` channels and one writer per channel.
    ///
    /// `capacity` bounds the number of in-flight items across all channels.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::NoChannels`] if `num_channels` is 0.
    pub fn new(
        num_channels: usize,
        capacity: usize,
    ) -> Result<(Self, Vec<ChannelWriter>), GateError> {
        if num_channels == 0 {
            return Err(GateError::NoChannels);
        }
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let writers = (0..num_channels)
            .map(|channel_index| ChannelWriter {
                channel_index,
                tx: tx.clone(),
            })
            .collect();
        let gate = Self {
            rx,
            finished: vec![false; num_channels],
        };
        Ok((gate, writers))
    }

    fn open_channels(&self) -> usize {
        self.finished.iter().filter(|f| !**f).count()
    }
}

impl InputGate for ChannelInputGate {
    fn num_channels(&self) -> usize {
        self.finished.len()
    }

    fn next_buffer_or_event(&mut self) -> Result<Option<BufferOrEvent>, GateError> {
        if self.is_finished() {
            return Ok(None);
        }
        let Some(item) = self.rx.blocking_recv() else {
            return Err(GateError::Disconnected {
                open: self.open_channels(),
            });
        };

        let channel = item.channel_index;
        if self.finished[channel] {
            return Err(GateError::ChannelClosed { channel });
        }
        if matches!(item.payload, Payload::Event(ChannelEvent::EndOfPartition)) {
            self.finished[channel] = true;
            debug!(channel, open = self.open_channels(), "end of partition");
        }
        Ok(Some(item))
    }

    fn is_finished(&self) -> bool {
        self.finished.iter().all(|f| *f)
    }
}

/// Producer side of one channel of a [`ChannelInputGate`].
#[derive(Debug)]
pub struct ChannelWriter {
    channel_index: usize,
    tx: mpsc::Sender<BufferOrEvent>,
}

impl ChannelWriter {
    /// Index of the channel this writer feeds.
    #[must_use]
    pub fn channel_index(&self) -> usize {
        self.channel_index
    }

    /// Send a data buffer, blocking while the gate is full.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::ReceiverDropped`] if the gate is gone.
    pub fn write_buffer(&self, buffer: Bytes) -> Result<(), GateError> {
        self.send(BufferOrEvent::buffer(self.channel_index, buffer))
    }

    /// Send a control event, blocking while the gate is full.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::ReceiverDropped`] if the gate is gone.
    pub fn write_event(&self, event: ChannelEvent) -> Result<(), GateError> {
        self.send(BufferOrEvent::event(self.channel_index, event))
    }

    /// Send a checkpoint barrier.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::ReceiverDropped`] if the gate is gone.
    pub fn write_barrier(&self, barrier: CheckpointBarrier) -> Result<(), GateError> {
        self.write_event(ChannelEvent::Barrier(barrier))
    }

    /// Deliver end of partition and give up the writer.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::ReceiverDropped`] if the gate is gone.
    pub fn close(self) -> Result<(), GateError> {
        self.write_event(ChannelEvent::EndOfPartition)
    }

    fn send(&self, item: BufferOrEvent) -> Result<(), GateError> {
        self.tx
            .blocking_send(item)
            .map_err(|_| GateError::ReceiverDropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_channels_rejected() {
        assert!(matches!(
            ChannelInputGate::new(0, 8),
            Err(GateError::NoChannels)
        ));
    }

    #[test]
    fn test_items_arrive_in_write_order() {
        let (mut gate, mut writers) = ChannelInputGate::new(2, 16).unwrap();
        let w1 = writers.pop().unwrap();
        let w0 = writers.pop().unwrap();
        assert_eq!(w0.channel_index(), 0);

        w0.write_buffer(Bytes::from_static(b"a")).unwrap();
        w1.write_barrier(CheckpointBarrier::new(1, 0)).unwrap();
        w0.write_buffer(Bytes::from_static(b"b")).unwrap();

        let first = gate.next_buffer_or_event().unwrap().unwrap();
        assert_eq!(first, BufferOrEvent::buffer(0, Bytes::from_static(b"a")));
        let second = gate.next_buffer_or_event().unwrap().unwrap();
        assert_eq!(second.channel_index, 1);
        assert!(!second.is_buffer());
        let third = gate.next_buffer_or_event().unwrap().unwrap();
        assert_eq!(third, BufferOrEvent::buffer(0, Bytes::from_static(b"b")));
    }

    #[test]
    fn test_finished_after_all_channels_close() {
        let (mut gate, writers) = ChannelInputGate::new(2, 16).unwrap();
        for w in writers {
            w.close().unwrap();
        }
        assert!(!gate.is_finished());
        gate.next_buffer_or_event().unwrap().unwrap();
        assert!(!gate.is_finished());
        gate.next_buffer_or_event().unwrap().unwrap();
        assert!(gate.is_finished());
        assert!(gate.next_buffer_or_event().unwrap().is_none());
    }

    #[test]
    fn test_disconnect_without_close_is_error() {
        let (mut gate, writers) = ChannelInputGate::new(3, 4).unwrap();
        drop(writers);
        let err = gate.next_buffer_or_event().unwrap_err();
        assert!(matches!(err, GateError::Disconnected { open: 3 }));
        assert!(err.to_string().contains(error_codes::GATE_FAILURE));
    }

    #[test]
    fn test_writer_sees_dropped_gate() {
        let (gate, mut writers) = ChannelInputGate::new(1, 4).unwrap();
        drop(gate);
        let w = writers.pop().unwrap();
        assert!(matches!(
            w.write_buffer(Bytes::new()),
            Err(GateError::ReceiverDropped)
        ));
    }

    #[test]
    fn test_writer_thread_backpressure() {
        let (mut gate, mut writers) = ChannelInputGate::new(1, 1).unwrap();
        let w = writers.pop().unwrap();
        let producer = std::thread::spawn(move || {
            for i in 0..10u8 {
                w.write_buffer(Bytes::from(vec![i])).unwrap();
            }
            w.close().unwrap();
        });

        let mut seen = Vec::new();
        while let Some(item) = gate.next_buffer_or_event().unwrap() {
            if let Payload::Buffer(b) = item.payload {
                seen.push(b[0]);
            }
        }
        producer.join().unwrap();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }
}
