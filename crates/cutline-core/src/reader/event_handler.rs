//! Handling of non-barrier control events.
//!
//! Barriers are absorbed by the alignment buffer; everything else reaches an
//! [`EventHandler`]. The handler decides whether the reader keeps going,
//! has hit a soft epoch boundary, or is done for good.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use tracing::debug;

use crate::checkpoint::{AlignmentError, ChannelEvent};

/// What the reader should do after an event was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// Keep reading.
    Continue,
    /// Every live channel reached the end of the current superstep.
    EndOfSuperstep,
    /// Every channel reached end of partition; no more records will come.
    Finished,
}

/// Generic handler for control events other than barriers.
pub trait EventHandler {
    /// Handle `event` from `channel`.
    ///
    /// # Errors
    ///
    /// Returns an error if the event violates the channel protocol.
    fn handle_event(&mut self, channel: usize, event: &ChannelEvent) -> crate::Result<EventOutcome>;

    /// Re-arm superstep tracking after an [`EventOutcome::EndOfSuperstep`].
    fn start_next_superstep(&mut self) {}
}

type TaskEventCallback = Box<dyn FnMut(usize, &Bytes) + Send>;

/// Default [`EventHandler`].
///
/// Tracks end of partition and end of superstep per channel and dispatches
/// custom task events to subscribers by event kind.
pub struct ReaderEventHandler {
    end_of_partition: Vec<bool>,
    end_of_superstep: Vec<bool>,
    superstep: u64,
    subscribers: HashMap<u32, Vec<TaskEventCallback>>,
}

impl ReaderEventHandler {
    /// Create a handler for `num_channels` channels.
    #[must_use]
    pub fn new(num_channels: usize) -> Self {
        Self {
            end_of_partition: vec![false; num_channels],
            end_of_superstep: vec![false; num_channels],
            superstep: 0,
            subscribers: HashMap::new(),
        }
    }

    /// Call `callback` with `(channel, payload)` for every custom event of
    /// the given kind.
    pub fn subscribe<F>(&mut self, kind: u32, callback: F)
    where
        F: FnMut(usize, &Bytes) + Send + 'static,
    {
        self.subscribers
            .entry(kind)
            .or_default()
            .push(Box::new(callback));
    }

    /// Number of completed supersteps.
    #[must_use]
    pub fn superstep(&self) -> u64 {
        self.superstep
    }

    /// Whether every channel reached end of partition.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.end_of_partition.iter().all(|e| *e)
    }

    fn reached_end_of_superstep(&self) -> bool {
        let any = self.end_of_superstep.iter().any(|e| *e);
        any && self
            .end_of_superstep
            .iter()
            .zip(&self.end_of_partition)
            .all(|(eos, eop)| *eos || *eop)
    }
}

impl EventHandler for ReaderEventHandler {
    fn handle_event(&mut self, channel: usize, event: &ChannelEvent) -> crate::Result<EventOutcome> {
        if channel >= self.end_of_partition.len() {
            return Err(AlignmentError::ChannelOutOfRange {
                channel,
                num_channels: self.end_of_partition.len(),
            }
            .into());
        }

        let outcome = match event {
            ChannelEvent::EndOfPartition => {
                self.end_of_partition[channel] = true;
                if self.is_finished() {
                    EventOutcome::Finished
                } else if self.reached_end_of_superstep() {
                    EventOutcome::EndOfSuperstep
                } else {
                    EventOutcome::Continue
                }
            }
            ChannelEvent::EndOfSuperstep => {
                self.end_of_superstep[channel] = true;
                if self.reached_end_of_superstep() {
                    debug!(superstep = self.superstep, "end of superstep reached");
                    EventOutcome::EndOfSuperstep
                } else {
                    EventOutcome::Continue
                }
            }
            ChannelEvent::Custom { kind, payload } => {
                match self.subscribers.get_mut(kind) {
                    Some(callbacks) => {
                        for callback in callbacks {
                            callback(channel, payload);
                        }
                    }
                    None => debug!(kind, channel, "no subscriber for task event"),
                }
                EventOutcome::Continue
            }
            ChannelEvent::Barrier(_) => EventOutcome::Continue,
        };
        Ok(outcome)
    }

    fn start_next_superstep(&mut self) {
        self.end_of_superstep.fill(false);
        self.superstep += 1;
    }
}

impl fmt::Debug for ReaderEventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderEventHandler")
            .field("end_of_partition", &self.end_of_partition)
            .field("end_of_superstep", &self.end_of_superstep)
            .field("superstep", &self.superstep)
            .field("subscribed_kinds", &self.subscribers.len())
            .finish()
    }
}
