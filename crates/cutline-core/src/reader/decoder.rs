//! Length-prefixed record framing.
//!
//! Records are written as a 4-byte big-endian length followed by the record
//! bytes. Producers cut the framed stream into fixed-size buffers, so a
//! record (or even its length prefix) may span several buffers of the same
//! channel. [`SpanningRecordDecoder`] reassembles them; one decoder exists
//! per channel because partial records must never mix across channels.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Deserialize;

use crate::error_codes;

const LENGTH_PREFIX: usize = 4;

/// Errors raised while decoding records.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The length prefix exceeds [`DecoderConfig::max_record_size`].
    #[error("[{code}] record of {len} bytes exceeds maximum of {max}", code = error_codes::RECORD_TOO_LARGE)]
    TooLarge {
        /// Announced record length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The record bytes are not a valid value of the record type.
    #[error("[{code}] malformed record: {0}", code = error_codes::RECORD_DECODE_FAILED)]
    Malformed(String),
}

/// A typed record carried over channels.
pub trait Record: Sized {
    /// Decode one record from its (unframed) bytes.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Malformed`] if the bytes are invalid.
    fn decode(bytes: Bytes) -> Result<Self, DecodeError>;

    /// Append the record's (unframed) bytes to `out`.
    fn encode(&self, out: &mut BytesMut);
}

impl Record for Bytes {
    fn decode(bytes: Bytes) -> Result<Self, DecodeError> {
        Ok(bytes)
    }

    fn encode(&self, out: &mut BytesMut) {
        out.extend_from_slice(self);
    }
}

impl Record for Vec<u8> {
    fn decode(bytes: Bytes) -> Result<Self, DecodeError> {
        Ok(bytes.to_vec())
    }

    fn encode(&self, out: &mut BytesMut) {
        out.extend_from_slice(self);
    }
}

impl Record for String {
    fn decode(bytes: Bytes) -> Result<Self, DecodeError> {
        String::from_utf8(bytes.to_vec()).map_err(|e| DecodeError::Malformed(e.to_string()))
    }

    fn encode(&self, out: &mut BytesMut) {
        out.extend_from_slice(self.as_bytes());
    }
}

impl Record for u64 {
    fn decode(mut bytes: Bytes) -> Result<Self, DecodeError> {
        if bytes.len() != 8 {
            return Err(DecodeError::Malformed(format!(
                "expected 8 bytes for u64, got {}",
                bytes.len()
            )));
        }
        Ok(bytes.get_u64())
    }

    fn encode(&self, out: &mut BytesMut) {
        out.put_u64(*self);
    }
}

/// Outcome of one [`RecordDecoder::next_record`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeResult<T> {
    /// A record was completed; the current buffer has more bytes.
    FullRecord(T),
    /// A record was completed and it used up the current buffer.
    FullRecordBufferConsumed(T),
    /// The current buffer was used up in the middle of a record.
    BufferConsumed,
    /// No buffer is set.
    Neither,
}

impl<T> DecodeResult<T> {
    /// Whether a complete record was produced.
    #[must_use]
    pub fn is_full_record(&self) -> bool {
        matches!(self, Self::FullRecord(_) | Self::FullRecordBufferConsumed(_))
    }

    /// Whether the current buffer is exhausted and a new one is needed.
    #[must_use]
    pub fn is_buffer_consumed(&self) -> bool {
        matches!(self, Self::FullRecordBufferConsumed(_) | Self::BufferConsumed)
    }

    /// Take the record, if any.
    pub fn into_record(self) -> Option<T> {
        match self {
            Self::FullRecord(r) | Self::FullRecordBufferConsumed(r) => Some(r),
            Self::BufferConsumed | Self::Neither => None,
        }
    }
}

/// Per-channel decoder contract.
pub trait RecordDecoder<T> {
    /// Hand the decoder the next buffer of its channel.
    fn set_next_buffer(&mut self, buffer: Bytes);

    /// Try to complete the next record from the buffered bytes.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] for oversized or malformed records.
    fn next_record(&mut self) -> Result<DecodeResult<T>, DecodeError>;

    /// The unread part of the current buffer.
    fn current_buffer(&self) -> Option<&Bytes>;

    /// Drop the current buffer and any partially assembled record.
    fn clear(&mut self);

    /// Whether a record is partially assembled.
    fn has_unfinished_data(&self) -> bool;
}

/// Configuration for [`SpanningRecordDecoder`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Largest record accepted, in bytes. Default: 64 MiB.
    pub max_record_size: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            max_record_size: 64 * 1024 * 1024,
        }
    }
}

/// Decoder for length-prefixed records spanning buffers.
#[derive(Debug)]
pub struct SpanningRecordDecoder<T> {
    buffer: Option<Bytes>,
    /// Length prefix bytes collected so far.
    length_bytes: [u8; LENGTH_PREFIX],
    length_filled: usize,
    /// Length of the record being assembled, once its prefix is complete.
    pending_len: Option<usize>,
    /// Record bytes collected from earlier buffers.
    partial: BytesMut,
    config: DecoderConfig,
    _record: std::marker::PhantomData<fn() -> T>,
}

impl<T> SpanningRecordDecoder<T> {
    /// Create a decoder.
    #[must_use]
    pub fn new(config: DecoderConfig) -> Self {
        Self {
            buffer: None,
            length_bytes: [0; LENGTH_PREFIX],
            length_filled: 0,
            pending_len: None,
            partial: BytesMut::new(),
            config,
            _record: std::marker::PhantomData,
        }
    }
}

impl<T> Default for SpanningRecordDecoder<T> {
    fn default() -> Self {
        Self::new(DecoderConfig::default())
    }
}

impl<T: Record> RecordDecoder<T> for SpanningRecordDecoder<T> {
    fn set_next_buffer(&mut self, buffer: Bytes) {
        self.buffer = Some(buffer);
    }

    fn next_record(&mut self) -> Result<DecodeResult<T>, DecodeError> {
        let Some(buf) = self.buffer.as_mut() else {
            return Ok(DecodeResult::Neither);
        };

        if self.pending_len.is_none() {
            while self.length_filled < LENGTH_PREFIX && buf.has_remaining() {
                self.length_bytes[self.length_filled] = buf.get_u8();
                self.length_filled += 1;
            }
            if self.length_filled < LENGTH_PREFIX {
                self.buffer = None;
                return Ok(DecodeResult::BufferConsumed);
            }
            self.length_filled = 0;
            let len = u32::from_be_bytes(self.length_bytes) as usize;
            if len > self.config.max_record_size {
                return Err(DecodeError::TooLarge {
                    len,
                    max: self.config.max_record_size,
                });
            }
            self.pending_len = Some(len);
        }

        let len = self.pending_len.unwrap_or_default();
        let missing = len - self.partial.len();
        if buf.len() < missing {
            self.partial.extend_from_slice(&buf[..]);
            self.buffer = None;
            return Ok(DecodeResult::BufferConsumed);
        }

        let chunk = buf.split_to(missing);
        let consumed = buf.is_empty();
        let bytes = if self.partial.is_empty() {
            chunk
        } else {
            self.partial.extend_from_slice(&chunk);
            self.partial.split().freeze()
        };
        self.pending_len = None;
        if consumed {
            self.buffer = None;
        }

        let record = T::decode(bytes)?;
        Ok(if consumed {
            DecodeResult::FullRecordBufferConsumed(record)
        } else {
            DecodeResult::FullRecord(record)
        })
    }

    fn current_buffer(&self) -> Option<&Bytes> {
        self.buffer.as_ref()
    }

    fn clear(&mut self) {
        self.buffer = None;
        self.length_filled = 0;
        self.pending_len = None;
        self.partial.clear();
    }

    fn has_unfinished_data(&self) -> bool {
        self.length_filled > 0 || self.pending_len.is_some()
    }
}

/// Frames records and cuts them into buffers of a fixed size.
#[derive(Debug)]
pub struct RecordWriter {
    buffer_size: usize,
    current: BytesMut,
}

impl RecordWriter {
    /// Create a writer producing buffers of `buffer_size` bytes.
    #[must_use]
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            current: BytesMut::new(),
        }
    }

    /// Frame `record`, returning every buffer that filled up.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::TooLarge`] if the encoded record does not fit
    /// the 4-byte length prefix.
    pub fn write<T: Record>(&mut self, record: &T) -> Result<Vec<Bytes>, DecodeError> {
        let mut body = BytesMut::new();
        record.encode(&mut body);
        let len = u32::try_from(body.len()).map_err(|_| DecodeError::TooLarge {
            len: body.len(),
            max: u32::MAX as usize,
        })?;
        self.current.put_u32(len);
        self.current.extend_from_slice(&body);

        let mut full = Vec::new();
        while self.current.len() >= self.buffer_size {
            full.push(self.current.split_to(self.buffer_size).freeze());
        }
        Ok(full)
    }

    /// Emit the partially filled buffer, if any.
    pub fn flush(&mut self) -> Option<Bytes> {
        if self.current.is_empty() {
            None
        } else {
            Some(self.current.split().freeze())
        }
    }
}
