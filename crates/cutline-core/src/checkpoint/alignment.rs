//! Barrier alignment for multi-channel task inputs.
//!
//! A task with several input channels may only snapshot its state for
//! checkpoint `K` once every channel has delivered the barrier for `K`.
//! Between a channel's barrier and that moment, the channel's traffic
//! belongs to the *next* snapshot and must not be processed yet.
//!
//! ## Algorithm
//!
//! 1. Barrier `K` arrives on channel `i` → mark `i` blocked
//! 2. Every later item from a blocked channel is [`store`](BarrierBuffer::store)d
//!    in arrival order (one queue across all channels)
//! 3. Once all live channels are blocked → notify the listener, unblock
//!    everything and release the queue for replay
//! 4. The reader drains the replay queue before pulling from its gate again
//!
//! ## Out-of-order Barriers
//!
//! - A barrier for a checkpoint *newer* than the one being aligned aborts the
//!   in-flight alignment (the older checkpoint is reported as aborted) and
//!   starts aligning the newer one.
//! - A barrier at or below the newest checkpoint seen so far is stale and is
//!   swallowed.
//!
//! Aborting never drops buffered traffic: the queue is released for replay
//! exactly as on completion.
//!
//! ## Replay Order
//!
//! A released queue is placed *in front of* whatever is still waiting in the
//! replay queue. The gate is only polled once the replay queue is empty, so
//! any item stored while a replay was in progress was itself taken from the
//! front of that replay queue and is older than everything behind it.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, info, warn};

use super::barrier::{BufferOrEvent, ChannelEvent, CheckpointBarrier};
use crate::error_codes;

/// What to do with an in-flight alignment when a channel closes and every
/// remaining live channel is already blocked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosedChannelPolicy {
    /// Treat the closed channel as aligned and complete the checkpoint.
    #[default]
    CompleteAlignment,
    /// Abort the checkpoint and release the buffered traffic.
    AbortAlignment,
}

/// Configuration for a [`BarrierBuffer`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlignmentConfig {
    /// Maximum bytes buffered for a single alignment.
    ///
    /// When storing an item pushes the alignment queue past this limit the
    /// alignment is aborted and its queue released for replay. `None`
    /// (default) means unbounded.
    pub max_buffered_bytes: Option<usize>,
    /// How to resolve an alignment whose last missing channel closed.
    pub closed_channel_policy: ClosedChannelPolicy,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            max_buffered_bytes: None,
            closed_channel_policy: ClosedChannelPolicy::CompleteAlignment,
        }
    }
}

/// Result of [`BarrierBuffer::offer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierAction {
    /// Not a barrier; the caller handles the event itself.
    Forward,
    /// The barrier was absorbed by the alignment protocol.
    Consumed,
}

/// Why an alignment ended without completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// A channel delivered a barrier for a newer checkpoint.
    NewerCheckpoint(u64),
    /// The alignment queue exceeded `max_buffered_bytes`.
    BufferLimitExceeded,
    /// A channel closed and the policy is [`ClosedChannelPolicy::AbortAlignment`].
    ChannelClosed(usize),
    /// A barrier carrying the `CANCEL` flag arrived.
    Cancelled,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NewerCheckpoint(id) => write!(f, "superseded by checkpoint {id}"),
            Self::BufferLimitExceeded => write!(f, "alignment buffer limit exceeded"),
            Self::ChannelClosed(ch) => write!(f, "channel {ch} closed"),
            Self::Cancelled => write!(f, "cancelled by barrier"),
        }
    }
}

/// Receives alignment outcomes.
///
/// Called synchronously on the task thread, before any replayed traffic is
/// handed back to the reader. This is where a task snapshots its state.
pub trait AlignmentListener: Send {
    /// Every live channel delivered the barrier.
    fn on_alignment_complete(&mut self, barrier: &CheckpointBarrier);

    /// The checkpoint was abandoned by this task.
    fn on_alignment_aborted(&mut self, checkpoint_id: u64, reason: AbortReason) {
        let _ = (checkpoint_id, reason);
    }
}

/// Listener that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl AlignmentListener for NoopListener {
    fn on_alignment_complete(&mut self, _barrier: &CheckpointBarrier) {}
}

/// Errors raised by [`BarrierBuffer`]. All of them are protocol violations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AlignmentError {
    /// The channel index is outside `0..num_channels`.
    #[error("[{code}] channel index {channel} out of range for {num_channels} channels", code = error_codes::CHANNEL_OUT_OF_RANGE)]
    ChannelOutOfRange {
        /// Offending channel index.
        channel: usize,
        /// Configured channel count.
        num_channels: usize,
    },

    /// The channel already delivered the barrier being aligned.
    #[error("[{code}] channel {channel} delivered barrier {checkpoint_id} twice", code = error_codes::DUPLICATE_BARRIER)]
    DuplicateBarrier {
        /// Offending channel index.
        channel: usize,
        /// Checkpoint being aligned.
        checkpoint_id: u64,
    },

    /// An alignment buffer needs at least one channel.
    #[error("[{code}] barrier buffer requires at least one channel", code = error_codes::INVALID_CHANNEL_COUNT)]
    NoChannels,
}

/// Counters describing alignment history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlignmentStats {
    /// Alignments that completed.
    pub completed: u64,
    /// Alignments that were aborted.
    pub aborted: u64,
    /// Stale barriers that were swallowed.
    pub stale_barriers: u64,
    /// Duration of the most recently completed alignment.
    pub last_alignment_duration: Option<Duration>,
}

/// An in-flight alignment.
#[derive(Debug)]
struct Alignment {
    barrier: CheckpointBarrier,
    blocked: Vec<bool>,
    barriers_received: usize,
    queue: VecDeque<BufferOrEvent>,
    queued_bytes: usize,
    started_at: Instant,
}

#[derive(Debug)]
enum State {
    Idle,
    Aligning(Alignment),
}

/// Aligns checkpoint barriers across the input channels of one task.
///
/// Owned and driven by the task thread only; there is no internal locking.
/// Alignment never stalls the thread: blocked channels are *buffered*, not
/// waited on.
pub struct BarrierBuffer {
    num_channels: usize,
    /// Channels that delivered end-of-partition.
    closed: Vec<bool>,
    state: State,
    /// Traffic released by the last completed or aborted alignment.
    replay: VecDeque<BufferOrEvent>,
    /// Newest checkpoint ID seen on any channel.
    latest_checkpoint_id: Option<u64>,
    config: AlignmentConfig,
    listener: Box<dyn AlignmentListener>,
    stats: AlignmentStats,
}

impl BarrierBuffer {
    /// Create a buffer for `num_channels` channels with default config.
    ///
    /// # Errors
    ///
    /// Returns [`AlignmentError::NoChannels`] if `num_channels` is 0.
    pub fn new(num_channels: usize) -> Result<Self, AlignmentError> {
        Self::with_config(num_channels, AlignmentConfig::default())
    }

    /// Create a buffer with an explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns [`AlignmentError::NoChannels`] if `num_channels` is 0.
    pub fn with_config(num_channels: usize, config: AlignmentConfig) -> Result<Self, AlignmentError> {
        if num_channels == 0 {
            return Err(AlignmentError::NoChannels);
        }
        Ok(Self {
            num_channels,
            closed: vec![false; num_channels],
            state: State::Idle,
            replay: VecDeque::new(),
            latest_checkpoint_id: None,
            config,
            listener: Box::new(NoopListener),
            stats: AlignmentStats::default(),
        })
    }

    /// Install the listener notified on alignment outcomes.
    #[must_use]
    pub fn with_listener(mut self, listener: Box<dyn AlignmentListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Replace the listener.
    pub fn set_listener(&mut self, listener: Box<dyn AlignmentListener>) {
        self.listener = listener;
    }

    /// Offer a control event that arrived on `channel`.
    ///
    /// Non-barrier events are returned as [`BarrierAction::Forward`]; barriers
    /// drive the alignment state machine and are always consumed.
    ///
    /// # Errors
    ///
    /// Returns [`AlignmentError::ChannelOutOfRange`] for a bad channel index
    /// and [`AlignmentError::DuplicateBarrier`] if a blocked channel delivers
    /// the aligned barrier again.
    pub fn offer(
        &mut self,
        channel: usize,
        event: &ChannelEvent,
    ) -> Result<BarrierAction, AlignmentError> {
        self.check_channel(channel)?;
        match event {
            ChannelEvent::Barrier(barrier) => {
                self.process_barrier(channel, *barrier)?;
                Ok(BarrierAction::Consumed)
            }
            _ => Ok(BarrierAction::Forward),
        }
    }

    /// Whether `channel` delivered the barrier being aligned and must have
    /// its traffic stored.
    #[must_use]
    pub fn is_blocked(&self, channel: usize) -> bool {
        match &self.state {
            State::Aligning(a) => a.blocked.get(channel).copied().unwrap_or(false),
            State::Idle => false,
        }
    }

    /// Store an item from a blocked channel.
    ///
    /// Items are kept in arrival order across all channels. Storing while
    /// idle appends to the replay queue, so the item is never lost.
    pub fn store(&mut self, item: BufferOrEvent) {
        let limit = self.config.max_buffered_bytes;
        match &mut self.state {
            State::Aligning(a) => {
                a.queued_bytes += item.size_bytes();
                a.queue.push_back(item);
                if limit.is_some_and(|max| a.queued_bytes > max) {
                    let checkpoint_id = a.barrier.checkpoint_id;
                    warn!(
                        checkpoint_id,
                        buffered = a.queued_bytes,
                        "alignment buffer limit exceeded"
                    );
                    self.abort(AbortReason::BufferLimitExceeded);
                }
            }
            State::Idle => self.replay.push_back(item),
        }
    }

    /// Whether released traffic is waiting to be replayed.
    #[must_use]
    pub fn contains_nonprocessed(&self) -> bool {
        !self.replay.is_empty()
    }

    /// Pop the oldest released item.
    pub fn get_non_processed(&mut self) -> Option<BufferOrEvent> {
        self.replay.pop_front()
    }

    /// Record that `channel` reached end of partition.
    ///
    /// The channel stops counting towards future alignments. If an alignment
    /// is in flight and every remaining live channel is blocked, it is
    /// resolved immediately according to [`ClosedChannelPolicy`].
    ///
    /// # Errors
    ///
    /// Returns [`AlignmentError::ChannelOutOfRange`] for a bad channel index.
    pub fn on_channel_closed(&mut self, channel: usize) -> Result<(), AlignmentError> {
        self.check_channel(channel)?;
        if self.closed[channel] {
            return Ok(());
        }
        self.closed[channel] = true;
        debug!(channel, open = self.open_channels(), "channel closed");

        if let State::Aligning(a) = &self.state {
            if a.barriers_received >= required_channels(&self.closed, &a.blocked) {
                match self.config.closed_channel_policy {
                    ClosedChannelPolicy::CompleteAlignment => self.complete(),
                    ClosedChannelPolicy::AbortAlignment => {
                        self.abort(AbortReason::ChannelClosed(channel));
                    }
                }
            }
        }
        Ok(())
    }

    /// Drop all buffered traffic and return to idle.
    ///
    /// Used on task cancellation; nothing is replayed and no listener is
    /// notified.
    pub fn cleanup(&mut self) {
        let dropped = match std::mem::replace(&mut self.state, State::Idle) {
            State::Aligning(a) => a.queue.len(),
            State::Idle => 0,
        } + self.replay.len();
        self.replay.clear();
        if dropped > 0 {
            debug!(dropped, "barrier buffer cleaned up");
        }
    }

    /// Whether an alignment is in flight.
    #[must_use]
    pub fn is_aligning(&self) -> bool {
        matches!(self.state, State::Aligning(_))
    }

    /// Checkpoint currently being aligned.
    #[must_use]
    pub fn current_checkpoint_id(&self) -> Option<u64> {
        match &self.state {
            State::Aligning(a) => Some(a.barrier.checkpoint_id),
            State::Idle => None,
        }
    }

    /// Newest checkpoint ID observed on any channel.
    #[must_use]
    pub fn latest_checkpoint_id(&self) -> Option<u64> {
        self.latest_checkpoint_id
    }

    /// Number of channels that delivered the current barrier.
    #[must_use]
    pub fn aligned_count(&self) -> usize {
        match &self.state {
            State::Aligning(a) => a.barriers_received,
            State::Idle => 0,
        }
    }

    /// Total number of channels.
    #[must_use]
    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    /// Channels that have not reached end of partition.
    #[must_use]
    pub fn open_channels(&self) -> usize {
        self.closed.iter().filter(|c| !**c).count()
    }

    /// Bytes held by the in-flight alignment queue.
    #[must_use]
    pub fn buffered_bytes(&self) -> usize {
        match &self.state {
            State::Aligning(a) => a.queued_bytes,
            State::Idle => 0,
        }
    }

    /// Alignment counters.
    #[must_use]
    pub fn stats(&self) -> &AlignmentStats {
        &self.stats
    }

    fn check_channel(&self, channel: usize) -> Result<(), AlignmentError> {
        if channel < self.num_channels {
            Ok(())
        } else {
            Err(AlignmentError::ChannelOutOfRange {
                channel,
                num_channels: self.num_channels,
            })
        }
    }

    fn process_barrier(
        &mut self,
        channel: usize,
        barrier: CheckpointBarrier,
    ) -> Result<(), AlignmentError> {
        let checkpoint_id = barrier.checkpoint_id;

        let current = match &self.state {
            State::Aligning(a) => Some(a.barrier.checkpoint_id),
            State::Idle => None,
        };

        match current {
            Some(current) if checkpoint_id == current => self.join(channel, barrier),
            Some(current) if checkpoint_id > current => {
                warn!(
                    checkpoint_id = current,
                    newer = checkpoint_id,
                    channel,
                    "barrier for newer checkpoint during alignment; aborting"
                );
                self.abort(AbortReason::NewerCheckpoint(checkpoint_id));
                self.begin(channel, barrier);
                Ok(())
            }
            Some(_) => {
                self.stats.stale_barriers += 1;
                debug!(checkpoint_id, channel, "ignoring stale barrier");
                Ok(())
            }
            None => {
                if self.latest_checkpoint_id.is_some_and(|latest| checkpoint_id <= latest) {
                    self.stats.stale_barriers += 1;
                    debug!(checkpoint_id, channel, "ignoring stale barrier");
                    return Ok(());
                }
                self.begin(channel, barrier);
                Ok(())
            }
        }
    }

    /// Add `channel` to the in-flight alignment of `barrier`.
    fn join(&mut self, channel: usize, barrier: CheckpointBarrier) -> Result<(), AlignmentError> {
        let checkpoint_id = barrier.checkpoint_id;
        if barrier.is_cancel() {
            self.abort(AbortReason::Cancelled);
            return Ok(());
        }

        let State::Aligning(a) = &mut self.state else {
            return Ok(());
        };
        if a.blocked[channel] {
            return Err(AlignmentError::DuplicateBarrier {
                channel,
                checkpoint_id,
            });
        }
        a.blocked[channel] = true;
        a.barriers_received += 1;
        debug!(checkpoint_id, channel, received = a.barriers_received, "barrier received");

        if a.barriers_received >= required_channels(&self.closed, &a.blocked) {
            self.complete();
        }
        Ok(())
    }

    /// Start aligning `barrier`, first delivered by `channel`. Caller
    /// guarantees the state is idle.
    fn begin(&mut self, channel: usize, barrier: CheckpointBarrier) {
        let checkpoint_id = barrier.checkpoint_id;
        self.latest_checkpoint_id = Some(checkpoint_id);

        if barrier.is_cancel() {
            debug!(checkpoint_id, "checkpoint cancelled before alignment started");
            self.stats.aborted += 1;
            self.listener
                .on_alignment_aborted(checkpoint_id, AbortReason::Cancelled);
            return;
        }

        let mut blocked = vec![false; self.num_channels];
        blocked[channel] = true;
        let alignment = Alignment {
            barrier,
            blocked,
            barriers_received: 1,
            queue: VecDeque::new(),
            queued_bytes: 0,
            started_at: Instant::now(),
        };

        if alignment.barriers_received >= required_channels(&self.closed, &alignment.blocked) {
            // Only one live channel: nothing to wait for.
            self.stats.completed += 1;
            self.stats.last_alignment_duration = Some(Duration::ZERO);
            debug!(checkpoint_id, channel, "single live channel; aligned on arrival");
            self.listener.on_alignment_complete(&barrier);
            return;
        }

        debug!(checkpoint_id, channel, "alignment started");
        self.state = State::Aligning(alignment);
    }

    fn complete(&mut self) {
        let State::Aligning(alignment) = std::mem::replace(&mut self.state, State::Idle) else {
            return;
        };
        let elapsed = alignment.started_at.elapsed();
        let barrier = alignment.barrier;
        let buffered = alignment.queue.len();
        self.release(alignment.queue);

        self.stats.completed += 1;
        self.stats.last_alignment_duration = Some(elapsed);
        info!(
            checkpoint_id = barrier.checkpoint_id,
            buffered,
            elapsed_us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
            "alignment complete"
        );
        self.listener.on_alignment_complete(&barrier);
    }

    fn abort(&mut self, reason: AbortReason) {
        let State::Aligning(alignment) = std::mem::replace(&mut self.state, State::Idle) else {
            return;
        };
        let checkpoint_id = alignment.barrier.checkpoint_id;
        let buffered = alignment.queue.len();
        self.release(alignment.queue);

        self.stats.aborted += 1;
        info!(checkpoint_id, buffered, %reason, "alignment aborted");
        self.listener.on_alignment_aborted(checkpoint_id, reason);
    }

    /// Put `queue` in front of the pending replay.
    fn release(&mut self, mut queue: VecDeque<BufferOrEvent>) {
        queue.append(&mut self.replay);
        self.replay = queue;
    }
}

/// Channels whose barrier an alignment still needs: every open channel, plus
/// closed ones that delivered it before closing.
fn required_channels(closed: &[bool], blocked: &[bool]) -> usize {
    closed
        .iter()
        .zip(blocked)
        .filter(|(closed, blocked)| !**closed || **blocked)
        .count()
}

impl fmt::Debug for BarrierBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BarrierBuffer")
            .field("num_channels", &self.num_channels)
            .field("closed", &self.closed)
            .field("state", &self.state)
            .field("replay_len", &self.replay.len())
            .field("latest_checkpoint_id", &self.latest_checkpoint_id)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use bytes::Bytes;

    use super::*;
    use crate::checkpoint::barrier::{flags, Payload};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Outcome {
        Complete(u64),
        Aborted(u64, AbortReason),
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Outcome>>>);

    impl Recorder {
        fn outcomes(&self) -> Vec<Outcome> {
            self.0.lock().unwrap().clone()
        }
    }

    impl AlignmentListener for Recorder {
        fn on_alignment_complete(&mut self, barrier: &CheckpointBarrier) {
            self.0
                .lock()
                .unwrap()
                .push(Outcome::Complete(barrier.checkpoint_id));
        }

        fn on_alignment_aborted(&mut self, checkpoint_id: u64, reason: AbortReason) {
            self.0
                .lock()
                .unwrap()
                .push(Outcome::Aborted(checkpoint_id, reason));
        }
    }

    fn buffer_with_recorder(n: usize, config: AlignmentConfig) -> (BarrierBuffer, Recorder) {
        let recorder = Recorder::default();
        let buffer = BarrierBuffer::with_config(n, config)
            .unwrap()
            .with_listener(Box::new(recorder.clone()));
        (buffer, recorder)
    }

    fn barrier(id: u64) -> ChannelEvent {
        ChannelEvent::Barrier(CheckpointBarrier::new(id, 0))
    }

    fn data(channel: usize, s: &'static str) -> BufferOrEvent {
        BufferOrEvent::buffer(channel, Bytes::from_static(s.as_bytes()))
    }

    fn drain(buffer: &mut BarrierBuffer) -> Vec<BufferOrEvent> {
        std::iter::from_fn(|| buffer.get_non_processed()).collect()
    }

    #[test]
    fn test_zero_channels_rejected() {
        assert_eq!(BarrierBuffer::new(0).unwrap_err(), AlignmentError::NoChannels);
    }

    #[test]
    fn test_non_barrier_is_forwarded() {
        let mut buffer = BarrierBuffer::new(2).unwrap();
        let action = buffer.offer(0, &ChannelEvent::EndOfSuperstep).unwrap();
        assert_eq!(action, BarrierAction::Forward);
        assert!(!buffer.is_aligning());
    }

    #[test]
    fn test_single_channel_immediate_alignment() {
        let (mut buffer, recorder) = buffer_with_recorder(1, AlignmentConfig::default());

        let action = buffer.offer(0, &barrier(1)).unwrap();
        assert_eq!(action, BarrierAction::Consumed);
        assert!(!buffer.is_aligning());
        assert!(!buffer.is_blocked(0));
        assert_eq!(recorder.outcomes(), vec![Outcome::Complete(1)]);
        assert_eq!(buffer.stats().completed, 1);
    }

    #[test]
    fn test_two_channel_alignment() {
        let (mut buffer, recorder) = buffer_with_recorder(2, AlignmentConfig::default());

        buffer.offer(0, &barrier(1)).unwrap();
        assert!(buffer.is_aligning());
        assert!(buffer.is_blocked(0));
        assert!(!buffer.is_blocked(1));
        assert_eq!(buffer.aligned_count(), 1);

        buffer.store(data(0, "e2"));
        assert_eq!(buffer.buffered_bytes(), 2);
        assert!(!buffer.contains_nonprocessed());

        buffer.offer(1, &barrier(1)).unwrap();
        assert!(!buffer.is_aligning());
        assert_eq!(recorder.outcomes(), vec![Outcome::Complete(1)]);

        assert!(buffer.contains_nonprocessed());
        assert_eq!(drain(&mut buffer), vec![data(0, "e2")]);
        assert!(!buffer.contains_nonprocessed());
    }

    #[test]
    fn test_queue_preserves_arrival_order_across_channels() {
        let mut buffer = BarrierBuffer::new(3).unwrap();
        buffer.offer(0, &barrier(4)).unwrap();
        buffer.offer(2, &barrier(4)).unwrap();

        buffer.store(data(2, "c"));
        buffer.store(data(0, "a"));
        buffer.store(data(2, "d"));
        buffer.offer(1, &barrier(4)).unwrap();

        assert_eq!(
            drain(&mut buffer),
            vec![data(2, "c"), data(0, "a"), data(2, "d")]
        );
    }

    #[test]
    fn test_duplicate_barrier_is_error() {
        let mut buffer = BarrierBuffer::new(3).unwrap();
        buffer.offer(1, &barrier(1)).unwrap();
        let err = buffer.offer(1, &barrier(1)).unwrap_err();
        assert_eq!(
            err,
            AlignmentError::DuplicateBarrier {
                channel: 1,
                checkpoint_id: 1
            }
        );
        assert!(err.to_string().contains(error_codes::DUPLICATE_BARRIER));
    }

    #[test]
    fn test_channel_out_of_range() {
        let mut buffer = BarrierBuffer::new(2).unwrap();
        let err = buffer.offer(5, &barrier(1)).unwrap_err();
        assert!(matches!(
            err,
            AlignmentError::ChannelOutOfRange {
                channel: 5,
                num_channels: 2
            }
        ));
        assert!(!buffer.is_blocked(5));
        assert!(buffer.on_channel_closed(2).is_err());
    }

    #[test]
    fn test_newer_barrier_aborts_and_restarts() {
        let (mut buffer, recorder) = buffer_with_recorder(3, AlignmentConfig::default());

        buffer.offer(0, &barrier(1)).unwrap();
        buffer.store(data(0, "x"));

        // Channel 1 skipped checkpoint 1.
        buffer.offer(1, &barrier(2)).unwrap();
        assert_eq!(buffer.current_checkpoint_id(), Some(2));
        assert!(buffer.is_blocked(1));
        assert!(!buffer.is_blocked(0));
        assert_eq!(
            recorder.outcomes(),
            vec![Outcome::Aborted(1, AbortReason::NewerCheckpoint(2))]
        );

        // Traffic buffered for the abandoned checkpoint is replayed, not lost.
        assert_eq!(drain(&mut buffer), vec![data(0, "x")]);

        // Late barrier for checkpoint 1 is ignored.
        assert_eq!(buffer.offer(2, &barrier(1)).unwrap(), BarrierAction::Consumed);
        assert_eq!(buffer.stats().stale_barriers, 1);
        assert_eq!(buffer.aligned_count(), 1);

        buffer.offer(0, &barrier(2)).unwrap();
        buffer.offer(2, &barrier(2)).unwrap();
        assert_eq!(
            recorder.outcomes(),
            vec![
                Outcome::Aborted(1, AbortReason::NewerCheckpoint(2)),
                Outcome::Complete(2)
            ]
        );
        assert_eq!(buffer.stats().aborted, 1);
        assert_eq!(buffer.stats().completed, 1);
    }

    #[test]
    fn test_stale_barrier_while_idle_is_ignored() {
        let (mut buffer, recorder) = buffer_with_recorder(2, AlignmentConfig::default());
        buffer.offer(0, &barrier(3)).unwrap();
        buffer.offer(1, &barrier(3)).unwrap();

        buffer.offer(0, &barrier(3)).unwrap();
        buffer.offer(1, &barrier(2)).unwrap();
        assert!(!buffer.is_aligning());
        assert_eq!(buffer.stats().stale_barriers, 2);
        assert_eq!(recorder.outcomes(), vec![Outcome::Complete(3)]);
    }

    #[test]
    fn test_cancel_barrier_aborts_alignment() {
        let (mut buffer, recorder) = buffer_with_recorder(2, AlignmentConfig::default());
        buffer.offer(0, &barrier(1)).unwrap();
        buffer.store(data(0, "a"));

        let cancel = CheckpointBarrier {
            checkpoint_id: 1,
            timestamp: 0,
            flags: flags::CANCEL,
        };
        buffer.offer(1, &ChannelEvent::Barrier(cancel)).unwrap();
        assert!(!buffer.is_aligning());
        assert_eq!(
            recorder.outcomes(),
            vec![Outcome::Aborted(1, AbortReason::Cancelled)]
        );
        assert_eq!(drain(&mut buffer), vec![data(0, "a")]);

        // The cancelled checkpoint's remaining barriers are stale now.
        buffer.offer(1, &barrier(1)).unwrap();
        assert!(!buffer.is_aligning());
    }

    #[test]
    fn test_buffer_limit_aborts_alignment() {
        let config = AlignmentConfig {
            max_buffered_bytes: Some(4),
            ..AlignmentConfig::default()
        };
        let (mut buffer, recorder) = buffer_with_recorder(2, config);
        buffer.offer(0, &barrier(1)).unwrap();
        buffer.store(data(0, "abc"));
        assert!(buffer.is_aligning());
        buffer.store(data(0, "de"));

        assert!(!buffer.is_aligning());
        assert_eq!(
            recorder.outcomes(),
            vec![Outcome::Aborted(1, AbortReason::BufferLimitExceeded)]
        );
        assert_eq!(drain(&mut buffer), vec![data(0, "abc"), data(0, "de")]);
    }

    #[test]
    fn test_closing_last_missing_channel_completes() {
        let (mut buffer, recorder) = buffer_with_recorder(3, AlignmentConfig::default());
        buffer.offer(0, &barrier(1)).unwrap();
        buffer.offer(1, &barrier(1)).unwrap();
        buffer.store(data(1, "held"));

        buffer.on_channel_closed(2).unwrap();
        assert!(!buffer.is_aligning());
        assert_eq!(recorder.outcomes(), vec![Outcome::Complete(1)]);
        assert_eq!(drain(&mut buffer), vec![data(1, "held")]);
        assert_eq!(buffer.open_channels(), 2);

        // Checkpoint 2 needs only the two open channels.
        buffer.offer(0, &barrier(2)).unwrap();
        buffer.offer(1, &barrier(2)).unwrap();
        assert_eq!(
            recorder.outcomes(),
            vec![Outcome::Complete(1), Outcome::Complete(2)]
        );
    }

    #[test]
    fn test_closing_channel_with_abort_policy() {
        let config = AlignmentConfig {
            closed_channel_policy: ClosedChannelPolicy::AbortAlignment,
            ..AlignmentConfig::default()
        };
        let (mut buffer, recorder) = buffer_with_recorder(2, config);
        buffer.offer(0, &barrier(1)).unwrap();
        buffer.on_channel_closed(1).unwrap();
        assert_eq!(
            recorder.outcomes(),
            vec![Outcome::Aborted(1, AbortReason::ChannelClosed(1))]
        );
    }

    #[test]
    fn test_closing_blocked_channel_keeps_its_barrier() {
        let (mut buffer, recorder) = buffer_with_recorder(3, AlignmentConfig::default());
        buffer.offer(0, &barrier(1)).unwrap();
        buffer.on_channel_closed(0).unwrap();
        assert!(buffer.is_aligning());

        buffer.offer(1, &barrier(1)).unwrap();
        buffer.offer(2, &barrier(1)).unwrap();
        assert_eq!(recorder.outcomes(), vec![Outcome::Complete(1)]);
    }

    #[test]
    fn test_one_open_channel_left_aligns_immediately() {
        let (mut buffer, recorder) = buffer_with_recorder(2, AlignmentConfig::default());
        buffer.on_channel_closed(1).unwrap();
        buffer.offer(0, &barrier(1)).unwrap();
        assert!(!buffer.is_aligning());
        assert_eq!(recorder.outcomes(), vec![Outcome::Complete(1)]);
    }

    #[test]
    fn test_released_queue_goes_before_pending_replay() {
        let mut buffer = BarrierBuffer::new(2).unwrap();
        buffer.offer(0, &barrier(1)).unwrap();
        buffer.store(data(0, "a"));
        buffer.store(BufferOrEvent::barrier(0, CheckpointBarrier::new(2, 0)));
        buffer.store(data(0, "b"));
        buffer.store(data(0, "c"));
        buffer.offer(1, &barrier(1)).unwrap();

        // Replay: a, barrier(2), b, c
        assert_eq!(buffer.get_non_processed(), Some(data(0, "a")));
        let replayed_barrier = buffer.get_non_processed().unwrap();
        let Payload::Event(event) = &replayed_barrier.payload else {
            panic!("expected barrier");
        };
        buffer.offer(0, event).unwrap();
        assert!(buffer.is_blocked(0));

        // "b" comes back blocked and is stored again; channel 1 aligns while
        // "c" is still waiting in the replay queue.
        let b = buffer.get_non_processed().unwrap();
        buffer.store(b);
        buffer.offer(1, &barrier(2)).unwrap();

        assert_eq!(drain(&mut buffer), vec![data(0, "b"), data(0, "c")]);
    }

    #[test]
    fn test_store_while_idle_is_replayed() {
        let mut buffer = BarrierBuffer::new(2).unwrap();
        buffer.store(data(1, "late"));
        assert!(buffer.contains_nonprocessed());
        assert_eq!(drain(&mut buffer), vec![data(1, "late")]);
    }

    #[test]
    fn test_cleanup_drops_buffered_traffic() {
        let (mut buffer, recorder) = buffer_with_recorder(2, AlignmentConfig::default());
        buffer.offer(0, &barrier(1)).unwrap();
        buffer.store(data(0, "a"));
        buffer.cleanup();
        assert!(!buffer.is_aligning());
        assert!(!buffer.contains_nonprocessed());
        assert!(recorder.outcomes().is_empty());
    }

    #[test]
    fn test_multiple_checkpoints() {
        let (mut buffer, recorder) = buffer_with_recorder(2, AlignmentConfig::default());

        buffer.offer(0, &barrier(1)).unwrap();
        buffer.store(data(0, "10"));
        buffer.offer(1, &barrier(1)).unwrap();
        assert_eq!(drain(&mut buffer).len(), 1);

        buffer.offer(1, &barrier(2)).unwrap();
        buffer.store(data(1, "30"));
        buffer.offer(0, &barrier(2)).unwrap();
        assert_eq!(drain(&mut buffer), vec![data(1, "30")]);

        assert_eq!(
            recorder.outcomes(),
            vec![Outcome::Complete(1), Outcome::Complete(2)]
        );
        assert_eq!(buffer.latest_checkpoint_id(), Some(2));
        assert!(buffer.stats().last_alignment_duration.is_some());
    }

    #[test]
    fn test_config_from_json_defaults() {
        let config: AlignmentConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_buffered_bytes, None);
        assert_eq!(
            config.closed_channel_policy,
            ClosedChannelPolicy::CompleteAlignment
        );

        let config: AlignmentConfig = serde_json::from_str(
            r#"{"max_buffered_bytes": 1024, "closed_channel_policy": "abort_alignment"}"#,
        )
        .unwrap();
        assert_eq!(config.max_buffered_bytes, Some(1024));
        assert_eq!(
            config.closed_channel_policy,
            ClosedChannelPolicy::AbortAlignment
        );
    }
}
