//! # docwire-protocol
//!
//! Legacy wire protocol for document databases.
//!
//! This crate provides:
//! - Length-prefixed message framing tolerant of arbitrary chunk boundaries
//! - OP_QUERY / OP_GET_MORE / OP_KILL_CURSORS / OP_INSERT / OP_UPDATE / OP_DELETE encoding
//! - OP_REPLY parsing
//! - Query and response flag bitfields
//! - The [`DocumentCodec`] seam for payload encoding

pub mod codec;
pub mod error;
pub mod flags;
pub mod frame;
pub mod message;

pub use codec::{to_document, DecodeOptions, Document, DocumentCodec, JsonCodec};
pub use error::ProtocolError;
pub use flags::{QueryFlags, ResponseFlags};
pub use frame::{FrameEvent, FrameParser, ParseState};
pub use message::{
    next_request_id, CursorId, Delete, GetMore, Insert, KillCursors, MessageHeader, OpCode,
    Query, Reply, RequestMessage, Update,
};

/// Default port for the database server.
pub const DEFAULT_PORT: u16 = 27017;

/// Size of the standard message header (messageLength, requestId, responseTo, opCode).
pub const MESSAGE_HEADER_SIZE: usize = 16;

/// Maximum size of a single encoded document (16 MiB).
pub const DEFAULT_MAX_DOCUMENT_SIZE: usize = 16 * 1024 * 1024;

/// Maximum size of a framed message (16 MiB x 4).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = DEFAULT_MAX_DOCUMENT_SIZE * 4;
