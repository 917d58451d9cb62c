//! Legacy wire messages.
//!
//! All integers are little-endian. Every message starts with a 16-byte
//! header:
//!
//! ```text
//! +---------------+-----------+------------+--------+
//! | messageLength | requestId | responseTo | opCode |
//! |    4 bytes    |  4 bytes  |  4 bytes   | 4 bytes|
//! +---------------+-----------+------------+--------+
//! ```

use crate::codec::{document_len, DecodeOptions, Document, DocumentCodec};
use crate::error::ProtocolError;
use crate::flags::{QueryFlags, ResponseFlags};
use crate::{DEFAULT_MAX_DOCUMENT_SIZE, MESSAGE_HEADER_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};

static REQUEST_ID: AtomicI32 = AtomicI32::new(1);

/// Returns the next process-wide request id.
pub fn next_request_id() -> i32 {
    REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Wire opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum OpCode {
    Reply = 1,
    Update = 2001,
    Insert = 2002,
    Query = 2004,
    GetMore = 2005,
    Delete = 2006,
    KillCursors = 2007,
}

impl OpCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(value: i32) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(OpCode::Reply),
            2001 => Ok(OpCode::Update),
            2002 => Ok(OpCode::Insert),
            2004 => Ok(OpCode::Query),
            2005 => Ok(OpCode::GetMore),
            2006 => Ok(OpCode::Delete),
            2007 => Ok(OpCode::KillCursors),
            other => Err(ProtocolError::UnknownOpCode(other)),
        }
    }
}

/// Server-side cursor identifier.
///
/// Zero means the server holds no cursor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CursorId(i64);

impl CursorId {
    pub const ZERO: CursorId = CursorId(0);

    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> i64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl From<i64> for CursorId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl fmt::Display for CursorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Standard message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: OpCode,
}

impl MessageHeader {
    /// Parses the header at the start of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < MESSAGE_HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                needed: MESSAGE_HEADER_SIZE - buf.len(),
            });
        }
        let mut cur = &buf[..MESSAGE_HEADER_SIZE];
        let message_length = cur.get_i32_le();
        let request_id = cur.get_i32_le();
        let response_to = cur.get_i32_le();
        let op_code = OpCode::from_i32(cur.get_i32_le())?;
        Ok(Self {
            message_length,
            request_id,
            response_to,
            op_code,
        })
    }
}

/// Builds one message, patching the length once the body is complete.
struct MessageWriter {
    buf: BytesMut,
}

impl MessageWriter {
    fn new(request_id: i32, response_to: i32, op_code: OpCode) -> Self {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_i32_le(0);
        buf.put_i32_le(request_id);
        buf.put_i32_le(response_to);
        buf.put_i32_le(op_code.as_i32());
        Self { buf }
    }

    fn i32(&mut self, value: i32) -> &mut Self {
        self.buf.put_i32_le(value);
        self
    }

    fn i64(&mut self, value: i64) -> &mut Self {
        self.buf.put_i64_le(value);
        self
    }

    fn cstring(&mut self, value: &str) -> Result<&mut Self, ProtocolError> {
        if value.as_bytes().contains(&0) {
            return Err(ProtocolError::InvalidNamespace(value.to_string()));
        }
        self.buf.put_slice(value.as_bytes());
        self.buf.put_u8(0);
        Ok(self)
    }

    fn document(
        &mut self,
        codec: &dyn DocumentCodec,
        doc: &Document,
    ) -> Result<&mut Self, ProtocolError> {
        let encoded = codec.encode(doc)?;
        if encoded.len() > DEFAULT_MAX_DOCUMENT_SIZE {
            return Err(ProtocolError::DocumentTooLarge {
                size: encoded.len(),
                max: DEFAULT_MAX_DOCUMENT_SIZE,
            });
        }
        self.buf.put_slice(&encoded);
        Ok(self)
    }

    fn finish(mut self) -> Bytes {
        let len = self.buf.len() as i32;
        self.buf[..4].copy_from_slice(&len.to_le_bytes());
        self.buf.freeze()
    }
}

/// Sequential reader over a message body.
struct MessageReader<'a> {
    buf: &'a [u8],
}

impl<'a> MessageReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize) -> Result<(), ProtocolError> {
        if self.buf.len() < n {
            return Err(ProtocolError::Truncated {
                needed: n - self.buf.len(),
            });
        }
        Ok(())
    }

    fn i32(&mut self) -> Result<i32, ProtocolError> {
        self.need(4)?;
        Ok(self.buf.get_i32_le())
    }

    fn i64(&mut self) -> Result<i64, ProtocolError> {
        self.need(8)?;
        Ok(self.buf.get_i64_le())
    }

    fn cstring(&mut self) -> Result<String, ProtocolError> {
        let end = self
            .buf
            .iter()
            .position(|b| *b == 0)
            .ok_or(ProtocolError::Truncated { needed: 1 })?;
        let value = std::str::from_utf8(&self.buf[..end])
            .map_err(|_| ProtocolError::InvalidUtf8)?
            .to_string();
        self.buf.advance(end + 1);
        Ok(value)
    }

    fn document(
        &mut self,
        codec: &dyn DocumentCodec,
        opts: &DecodeOptions,
    ) -> Result<Document, ProtocolError> {
        let len = document_len(self.buf)?;
        let doc = codec.decode(&self.buf[..len], opts)?;
        self.buf.advance(len);
        Ok(doc)
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn remaining(&self) -> usize {
        self.buf.len()
    }
}

/// OP_QUERY.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub request_id: i32,
    /// Full namespace (`db.collection`).
    pub ns: String,
    pub query: Document,
    /// Projection, sent only when present.
    pub fields: Option<Document>,
    pub number_to_skip: i32,
    pub number_to_return: i32,
    pub flags: QueryFlags,
}

impl Query {
    pub fn new(
        ns: impl Into<String>,
        query: Document,
        number_to_skip: i32,
        number_to_return: i32,
    ) -> Self {
        Self {
            request_id: next_request_id(),
            ns: ns.into(),
            query,
            fields: None,
            number_to_skip,
            number_to_return,
            flags: QueryFlags::new(),
        }
    }

    pub fn with_fields(mut self, fields: Document) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_flags(mut self, flags: QueryFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn encode(&self, codec: &dyn DocumentCodec) -> Result<Bytes, ProtocolError> {
        let mut w = MessageWriter::new(self.request_id, 0, OpCode::Query);
        w.i32(self.flags.bits() as i32);
        w.cstring(&self.ns)?;
        w.i32(self.number_to_skip).i32(self.number_to_return);
        w.document(codec, &self.query)?;
        if let Some(ref fields) = self.fields {
            w.document(codec, fields)?;
        }
        Ok(w.finish())
    }
}

/// OP_GET_MORE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetMore {
    pub request_id: i32,
    pub ns: String,
    pub number_to_return: i32,
    pub cursor_id: CursorId,
}

impl GetMore {
    pub fn new(ns: impl Into<String>, number_to_return: i32, cursor_id: CursorId) -> Self {
        Self {
            request_id: next_request_id(),
            ns: ns.into(),
            number_to_return,
            cursor_id,
        }
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut w = MessageWriter::new(self.request_id, 0, OpCode::GetMore);
        w.i32(0);
        w.cstring(&self.ns)?;
        w.i32(self.number_to_return).i64(self.cursor_id.get());
        Ok(w.finish())
    }
}

/// OP_KILL_CURSORS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillCursors {
    pub request_id: i32,
    pub cursor_ids: Vec<CursorId>,
}

impl KillCursors {
    pub fn new(cursor_ids: Vec<CursorId>) -> Self {
        Self {
            request_id: next_request_id(),
            cursor_ids,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut w = MessageWriter::new(self.request_id, 0, OpCode::KillCursors);
        w.i32(0).i32(self.cursor_ids.len() as i32);
        for id in &self.cursor_ids {
            w.i64(id.get());
        }
        w.finish()
    }
}

/// OP_INSERT.
#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    pub request_id: i32,
    pub ns: String,
    pub documents: Vec<Document>,
    pub continue_on_error: bool,
}

impl Insert {
    const CONTINUE_ON_ERROR: i32 = 1;

    pub fn new(ns: impl Into<String>, documents: Vec<Document>) -> Self {
        Self {
            request_id: next_request_id(),
            ns: ns.into(),
            documents,
            continue_on_error: false,
        }
    }

    pub fn encode(&self, codec: &dyn DocumentCodec) -> Result<Bytes, ProtocolError> {
        let flags = if self.continue_on_error {
            Self::CONTINUE_ON_ERROR
        } else {
            0
        };
        let mut w = MessageWriter::new(self.request_id, 0, OpCode::Insert);
        w.i32(flags);
        w.cstring(&self.ns)?;
        for doc in &self.documents {
            w.document(codec, doc)?;
        }
        Ok(w.finish())
    }
}

/// OP_UPDATE.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub request_id: i32,
    pub ns: String,
    pub selector: Document,
    pub update: Document,
    pub upsert: bool,
    pub multi: bool,
}

impl Update {
    const UPSERT: i32 = 1;
    const MULTI: i32 = 2;

    pub fn new(ns: impl Into<String>, selector: Document, update: Document) -> Self {
        Self {
            request_id: next_request_id(),
            ns: ns.into(),
            selector,
            update,
            upsert: false,
            multi: false,
        }
    }

    pub fn encode(&self, codec: &dyn DocumentCodec) -> Result<Bytes, ProtocolError> {
        let mut flags = 0;
        if self.upsert {
            flags |= Self::UPSERT;
        }
        if self.multi {
            flags |= Self::MULTI;
        }
        let mut w = MessageWriter::new(self.request_id, 0, OpCode::Update);
        w.i32(0);
        w.cstring(&self.ns)?;
        w.i32(flags);
        w.document(codec, &self.selector)?;
        w.document(codec, &self.update)?;
        Ok(w.finish())
    }
}

/// OP_DELETE.
#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    pub request_id: i32,
    pub ns: String,
    pub selector: Document,
    pub single_remove: bool,
}

impl Delete {
    const SINGLE_REMOVE: i32 = 1;

    pub fn new(ns: impl Into<String>, selector: Document) -> Self {
        Self {
            request_id: next_request_id(),
            ns: ns.into(),
            selector,
            single_remove: false,
        }
    }

    pub fn encode(&self, codec: &dyn DocumentCodec) -> Result<Bytes, ProtocolError> {
        let flags = if self.single_remove {
            Self::SINGLE_REMOVE
        } else {
            0
        };
        let mut w = MessageWriter::new(self.request_id, 0, OpCode::Delete);
        w.i32(0);
        w.cstring(&self.ns)?;
        w.i32(flags);
        w.document(codec, &self.selector)?;
        Ok(w.finish())
    }
}

/// Any client-to-server message.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestMessage {
    Query(Query),
    GetMore(GetMore),
    KillCursors(KillCursors),
    Insert(Insert),
    Update(Update),
    Delete(Delete),
}

impl RequestMessage {
    pub fn request_id(&self) -> i32 {
        match self {
            RequestMessage::Query(m) => m.request_id,
            RequestMessage::GetMore(m) => m.request_id,
            RequestMessage::KillCursors(m) => m.request_id,
            RequestMessage::Insert(m) => m.request_id,
            RequestMessage::Update(m) => m.request_id,
            RequestMessage::Delete(m) => m.request_id,
        }
    }

    /// Returns whether the server answers this message with an OP_REPLY.
    pub fn expects_reply(&self) -> bool {
        matches!(self, RequestMessage::Query(_) | RequestMessage::GetMore(_))
    }

    pub fn encode(&self, codec: &dyn DocumentCodec) -> Result<Bytes, ProtocolError> {
        match self {
            RequestMessage::Query(m) => m.encode(codec),
            RequestMessage::GetMore(m) => m.encode(),
            RequestMessage::KillCursors(m) => Ok(m.encode()),
            RequestMessage::Insert(m) => m.encode(codec),
            RequestMessage::Update(m) => m.encode(codec),
            RequestMessage::Delete(m) => m.encode(codec),
        }
    }

    /// Decodes one complete request message (server side of the protocol).
    pub fn decode(bytes: &[u8], codec: &dyn DocumentCodec) -> Result<Self, ProtocolError> {
        let header = MessageHeader::parse(bytes)?;
        let opts = DecodeOptions::default();
        let mut r = MessageReader::new(&bytes[MESSAGE_HEADER_SIZE..]);
        let request_id = header.request_id;

        let message = match header.op_code {
            OpCode::Query => {
                let flags = QueryFlags::from_bits(r.i32()? as u32);
                let ns = r.cstring()?;
                let number_to_skip = r.i32()?;
                let number_to_return = r.i32()?;
                let query = r.document(codec, &opts)?;
                let fields = if r.is_empty() {
                    None
                } else {
                    Some(r.document(codec, &opts)?)
                };
                RequestMessage::Query(Query {
                    request_id,
                    ns,
                    query,
                    fields,
                    number_to_skip,
                    number_to_return,
                    flags,
                })
            }
            OpCode::GetMore => {
                r.i32()?;
                let ns = r.cstring()?;
                let number_to_return = r.i32()?;
                let cursor_id = CursorId::new(r.i64()?);
                RequestMessage::GetMore(GetMore {
                    request_id,
                    ns,
                    number_to_return,
                    cursor_id,
                })
            }
            OpCode::KillCursors => {
                r.i32()?;
                let count = r.i32()?.max(0) as usize;
                let mut cursor_ids = Vec::with_capacity(count);
                for _ in 0..count {
                    cursor_ids.push(CursorId::new(r.i64()?));
                }
                RequestMessage::KillCursors(KillCursors {
                    request_id,
                    cursor_ids,
                })
            }
            OpCode::Insert => {
                let flags = r.i32()?;
                let ns = r.cstring()?;
                let mut documents = Vec::new();
                while !r.is_empty() {
                    documents.push(r.document(codec, &opts)?);
                }
                RequestMessage::Insert(Insert {
                    request_id,
                    ns,
                    documents,
                    continue_on_error: flags & Insert::CONTINUE_ON_ERROR != 0,
                })
            }
            OpCode::Update => {
                r.i32()?;
                let ns = r.cstring()?;
                let flags = r.i32()?;
                let selector = r.document(codec, &opts)?;
                let update = r.document(codec, &opts)?;
                RequestMessage::Update(Update {
                    request_id,
                    ns,
                    selector,
                    update,
                    upsert: flags & Update::UPSERT != 0,
                    multi: flags & Update::MULTI != 0,
                })
            }
            OpCode::Delete => {
                r.i32()?;
                let ns = r.cstring()?;
                let flags = r.i32()?;
                let selector = r.document(codec, &opts)?;
                RequestMessage::Delete(Delete {
                    request_id,
                    ns,
                    selector,
                    single_remove: flags & Delete::SINGLE_REMOVE != 0,
                })
            }
            OpCode::Reply => return Err(ProtocolError::UnknownOpCode(OpCode::Reply.as_i32())),
        };

        Ok(message)
    }
}

/// OP_REPLY.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub request_id: i32,
    pub response_to: i32,
    pub response_flags: ResponseFlags,
    pub cursor_id: CursorId,
    pub starting_from: i32,
    pub documents: Vec<Document>,
}

impl Reply {
    pub fn new(response_to: i32, documents: Vec<Document>) -> Self {
        Self {
            request_id: next_request_id(),
            response_to,
            response_flags: ResponseFlags::new(),
            cursor_id: CursorId::ZERO,
            starting_from: 0,
            documents,
        }
    }

    pub fn with_cursor_id(mut self, cursor_id: CursorId) -> Self {
        self.cursor_id = cursor_id;
        self
    }

    pub fn with_flags(mut self, flags: ResponseFlags) -> Self {
        self.response_flags = flags;
        self
    }

    /// Returns the first document of the reply.
    pub fn first(&self) -> Result<&Document, ProtocolError> {
        self.documents.first().ok_or(ProtocolError::EmptyReply)
    }

    /// Reads only the `responseTo` field of a framed message.
    pub fn peek_response_to(bytes: &[u8]) -> Result<i32, ProtocolError> {
        Ok(MessageHeader::parse(bytes)?.response_to)
    }

    /// Parses a complete OP_REPLY message.
    pub fn parse(
        bytes: &[u8],
        codec: &dyn DocumentCodec,
        opts: &DecodeOptions,
    ) -> Result<Self, ProtocolError> {
        let header = MessageHeader::parse(bytes)?;
        if header.op_code != OpCode::Reply {
            return Err(ProtocolError::UnknownOpCode(header.op_code.as_i32()));
        }
        let mut r = MessageReader::new(&bytes[MESSAGE_HEADER_SIZE..]);
        let response_flags = ResponseFlags::from_bits(r.i32()? as u32);
        let cursor_id = CursorId::new(r.i64()?);
        let starting_from = r.i32()?;
        let number_returned = r.i32()?.max(0) as usize;

        // numberReturned is untrusted; the smallest document is 5 bytes
        let mut documents = Vec::with_capacity(number_returned.min(r.remaining() / 5));
        for _ in 0..number_returned {
            documents.push(r.document(codec, opts)?);
        }

        Ok(Self {
            request_id: header.request_id,
            response_to: header.response_to,
            response_flags,
            cursor_id,
            starting_from,
            documents,
        })
    }

    /// Encodes the reply (server side of the protocol).
    pub fn encode(&self, codec: &dyn DocumentCodec) -> Result<Bytes, ProtocolError> {
        let mut w = MessageWriter::new(self.request_id, self.response_to, OpCode::Reply);
        w.i32(self.response_flags.bits() as i32)
            .i64(self.cursor_id.get())
            .i32(self.starting_from)
            .i32(self.documents.len() as i32);
        for doc in &self.documents {
            w.document(codec, doc)?;
        }
        Ok(w.finish())
    }
}
