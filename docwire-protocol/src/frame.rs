//! Length-prefixed message framing.
//!
//! Every message on the wire starts with its total length (prefix included)
//! as a little-endian `i32`:
//!
//! ```text
//! +---------------+----------------------------------+
//! | messageLength | rest of message                  |
//! |    4 bytes    | messageLength - 4 bytes          |
//! +---------------+----------------------------------+
//! ```
//!
//! [`FrameParser`] reassembles messages from chunks with arbitrary boundaries.
//! It is fed by a single read loop and consumes each chunk completely before
//! the next one arrives.

use crate::error::ProtocolError;
use bytes::{Buf, Bytes, BytesMut};

/// Size of the length prefix.
const LENGTH_PREFIX_SIZE: usize = 4;

/// Snapshot of the parser's state, attached to parse errors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseState {
    /// Declared size of the message in progress (0 when idle).
    pub size_of_message: usize,
    /// Bytes already accumulated for the message in progress.
    pub bytes_read: usize,
    /// Bytes held back because a length prefix was incomplete.
    pub stub_len: usize,
}

/// Output of [`FrameParser::push`].
#[derive(Debug)]
pub enum FrameEvent {
    /// A complete message, length prefix included.
    Message(Bytes),
    /// A bad length prefix. The rest of the chunk was discarded.
    ParseError {
        error: ProtocolError,
        state: ParseState,
    },
}

/// Incremental message parser.
#[derive(Debug)]
pub struct FrameParser {
    max_message_size: usize,
    /// Fewer than four bytes left over from the previous chunk.
    stub: BytesMut,
    /// Message being accumulated across chunks.
    buffer: Option<BytesMut>,
    size_of_message: usize,
    bytes_read: usize,
}

impl FrameParser {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            stub: BytesMut::new(),
            buffer: None,
            size_of_message: 0,
            bytes_read: 0,
        }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Returns the current parse state.
    pub fn state(&self) -> ParseState {
        ParseState {
            size_of_message: self.size_of_message,
            bytes_read: self.bytes_read,
            stub_len: self.stub.len(),
        }
    }

    /// Returns whether no partial message is held.
    pub fn is_idle(&self) -> bool {
        self.buffer.is_none() && self.stub.is_empty()
    }

    /// Drops any partial message.
    pub fn reset(&mut self) {
        self.stub.clear();
        self.buffer = None;
        self.size_of_message = 0;
        self.bytes_read = 0;
    }

    /// Copies `chunk` and feeds it to the parser.
    pub fn push_slice(&mut self, chunk: &[u8]) -> Vec<FrameEvent> {
        self.push(Bytes::copy_from_slice(chunk))
    }

    /// Feeds one inbound chunk and returns every event it produced, in order.
    ///
    /// A message contained entirely in the chunk is returned as a slice of it
    /// without copying.
    pub fn push(&mut self, chunk: Bytes) -> Vec<FrameEvent> {
        let mut events = Vec::new();
        let mut data = chunk;

        while !data.is_empty() {
            // Continue a message in progress
            if self.buffer.is_some() {
                let needed = self.size_of_message - self.bytes_read;
                let take = needed.min(data.len());
                if let Some(buffer) = self.buffer.as_mut() {
                    buffer.extend_from_slice(&data[..take]);
                }
                self.bytes_read += take;
                data.advance(take);

                if self.bytes_read < self.size_of_message {
                    break;
                }

                if let Some(buffer) = self.buffer.take() {
                    events.push(FrameEvent::Message(buffer.freeze()));
                }
                self.size_of_message = 0;
                self.bytes_read = 0;
                continue;
            }

            // Join a held-back partial length prefix
            if !self.stub.is_empty() {
                let mut joined = std::mem::take(&mut self.stub);
                joined.extend_from_slice(&data);
                data = joined.freeze();
            }

            if data.len() < LENGTH_PREFIX_SIZE {
                self.stub.extend_from_slice(&data);
                break;
            }

            let declared = i32::from_le_bytes([data[0], data[1], data[2], data[3]]) as i64;
            if declared <= LENGTH_PREFIX_SIZE as i64 || declared > self.max_message_size as i64 {
                let state = self.state();
                self.reset();
                events.push(FrameEvent::ParseError {
                    error: ProtocolError::InvalidMessageLength {
                        size: declared,
                        max: self.max_message_size,
                    },
                    state,
                });
                break;
            }

            let size = declared as usize;
            if data.len() == size {
                events.push(FrameEvent::Message(data));
                break;
            }

            if data.len() > size {
                events.push(FrameEvent::Message(data.split_to(size)));
                continue;
            }

            let mut buffer = BytesMut::with_capacity(size);
            buffer.extend_from_slice(&data);
            self.size_of_message = size;
            self.bytes_read = data.len();
            self.buffer = Some(buffer);
            break;
        }

        events
    }
}
