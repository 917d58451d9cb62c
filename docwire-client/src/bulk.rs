//! Legacy write execution.
//!
//! Each insert, update or remove is sent as its own opcode message, paired
//! with a `getlasterror` command that reports how it went. The acknowledgements
//! are folded into a single [`BulkWriteResult`].

use crate::command::command_namespace;
use crate::error::ClientError;
use crate::wire::{server_error, WireProtocol};
use bytes::Bytes;
use docwire_protocol::{Delete, Document, Insert, Query, RequestMessage, Update};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Largest number of documents accepted by one insert call.
pub const MAX_WRITE_BATCH_SIZE: usize = 1000;

/// Error codes reported as per-operation write errors. Every other failing
/// acknowledgement is a write concern error.
const WRITE_ERROR_CODES: [i64; 8] = [11000, 11001, 12582, 16544, 16538, 16542, 14, 13511];

/// Code used for operations that could not be serialized.
const SERIALIZATION_FAILURE_CODE: i64 = 14;

/// Number of nodes, or a tag set name, that must acknowledge a write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Acknowledgment {
    Nodes(i32),
    Tag(String),
}

impl Acknowledgment {
    fn to_value(&self) -> Value {
        match self {
            Acknowledgment::Nodes(n) => json!(n),
            Acknowledgment::Tag(tag) => json!(tag),
        }
    }
}

impl From<&str> for Acknowledgment {
    /// A node count when `s` is an integer, a tag otherwise.
    fn from(s: &str) -> Self {
        match s.parse::<i32>() {
            Ok(n) => Acknowledgment::Nodes(n),
            Err(_) => Acknowledgment::Tag(s.to_string()),
        }
    }
}

impl std::str::FromStr for Acknowledgment {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Acknowledgment::from(s))
    }
}

/// Acknowledgement level requested for writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteConcern {
    pub w: Option<Acknowledgment>,
    pub wtimeout: Option<u64>,
    pub j: Option<bool>,
    pub fsync: Option<bool>,
}

impl Default for WriteConcern {
    fn default() -> Self {
        Self {
            w: Some(Acknowledgment::Nodes(1)),
            wtimeout: None,
            j: None,
            fsync: None,
        }
    }
}

impl WriteConcern {
    /// `{w: 0}`: fire and forget.
    pub fn unacknowledged() -> Self {
        Self {
            w: Some(Acknowledgment::Nodes(0)),
            ..Self::default()
        }
    }

    /// `w: 0` with neither `j` nor `fsync` requested.
    pub fn is_unacknowledged(&self) -> bool {
        self.w == Some(Acknowledgment::Nodes(0))
            && self.j != Some(true)
            && self.fsync != Some(true)
    }

    /// The `getlasterror` command carrying this write concern.
    pub fn get_last_error(&self) -> Document {
        let mut command = Document::new();
        command.insert("getlasterror".to_string(), json!(1));
        if let Some(ref w) = self.w {
            command.insert("w".to_string(), w.to_value());
        }
        if let Some(wtimeout) = self.wtimeout {
            command.insert("wtimeout".to_string(), json!(wtimeout));
        }
        if let Some(j) = self.j {
            command.insert("j".to_string(), json!(j));
        }
        if let Some(fsync) = self.fsync {
            command.insert("fsync".to_string(), json!(fsync));
        }
        command
    }
}

/// Options for a write call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkOptions {
    pub ordered: bool,
    pub write_concern: WriteConcern,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self {
            ordered: true,
            write_concern: WriteConcern::default(),
        }
    }
}

impl BulkOptions {
    pub fn unordered() -> Self {
        Self {
            ordered: false,
            ..Self::default()
        }
    }

    pub fn with_write_concern(mut self, write_concern: WriteConcern) -> Self {
        self.write_concern = write_concern;
        self
    }
}

/// One update statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateSpec {
    pub q: Document,
    pub u: Document,
    #[serde(default)]
    pub upsert: bool,
    #[serde(default)]
    pub multi: bool,
}

impl UpdateSpec {
    pub fn new(q: Document, u: Document) -> Self {
        Self {
            q,
            u,
            upsert: false,
            multi: false,
        }
    }
}

/// One remove statement. A limit of 1 removes a single document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveSpec {
    pub q: Document,
    #[serde(default)]
    pub limit: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteKind {
    Insert,
    Update,
    Remove,
}

#[derive(Debug, Clone)]
enum WriteOp {
    Insert(Document),
    Update(UpdateSpec),
    Remove(RemoveSpec),
}

impl WriteOp {
    fn kind(&self) -> WriteKind {
        match self {
            WriteOp::Insert(_) => WriteKind::Insert,
            WriteOp::Update(_) => WriteKind::Update,
            WriteOp::Remove(_) => WriteKind::Remove,
        }
    }

    fn message(&self, ns: &str) -> RequestMessage {
        match self {
            WriteOp::Insert(doc) => RequestMessage::Insert(Insert::new(ns, vec![doc.clone()])),
            WriteOp::Update(spec) => {
                let mut update = Update::new(ns, spec.q.clone(), spec.u.clone());
                update.upsert = spec.upsert;
                update.multi = spec.multi;
                RequestMessage::Update(update)
            }
            WriteOp::Remove(spec) => {
                let mut delete = Delete::new(ns, spec.q.clone());
                delete.single_remove = spec.limit == 1;
                RequestMessage::Delete(delete)
            }
        }
    }

    /// The `_id` of the update selector.
    fn selector_id(&self) -> Value {
        match self {
            WriteOp::Update(spec) => spec.q.get("_id").cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }
}

/// A document inserted by an upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upserted {
    pub index: usize,
    #[serde(rename = "_id")]
    pub id: Value,
}

/// A per-operation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteError {
    pub index: usize,
    pub code: Option<i32>,
    pub errmsg: Option<String>,
}

/// A failure to satisfy the write concern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteConcernError {
    pub code: Option<i32>,
    pub errmsg: Option<String>,
}

/// Folded acknowledgements of one write call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkWriteResult {
    pub ok: i32,
    pub n: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_modified: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upserted: Option<Vec<Upserted>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_errors: Option<Vec<WriteError>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_concern_error: Option<WriteConcernError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_op: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errmsg: Option<String>,
}

impl BulkWriteResult {
    fn acknowledged() -> Self {
        Self {
            ok: 1,
            ..Self::default()
        }
    }

    pub fn has_write_errors(&self) -> bool {
        self.write_errors.as_ref().is_some_and(|e| !e.is_empty())
    }
}

// =========================================================================
// Acknowledgement helpers
// =========================================================================

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

fn is_nil(value: Option<&Value>) -> bool {
    matches!(value, None | Some(Value::Null))
}

fn number(ack: &Document, key: &str) -> Option<f64> {
    ack.get(key).and_then(Value::as_f64)
}

/// Returns whether an acknowledgement reports a failure.
fn ack_failed(ack: &Document) -> bool {
    number(ack, "ok") == Some(0.0) || truthy(ack.get("err")) || truthy(ack.get("errmsg"))
}

fn ack_message(ack: &Document) -> Option<String> {
    ["errmsg", "err", "errMsg"]
        .iter()
        .map(|key| ack.get(*key))
        .find(|value| truthy(*value))
        .flatten()
        .map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
}

fn serialization_ack(error: &ClientError) -> Document {
    let mut ack = Document::new();
    ack.insert("ok".to_string(), json!(1));
    ack.insert("errmsg".to_string(), json!(error.to_string()));
    ack.insert("code".to_string(), json!(SERIALIZATION_FAILURE_CODE));
    ack
}

/// Folds acknowledgements, in operation order, into one result.
fn aggregate(kind: WriteKind, ops: &[WriteOp], acks: &[Document]) -> BulkWriteResult {
    let mut result = BulkWriteResult {
        ok: 1,
        n: 0,
        n_modified: (kind == WriteKind::Update).then_some(0),
        ..BulkWriteResult::default()
    };

    for (index, ack) in acks.iter().enumerate() {
        let upserted = ack.get("upserted").filter(|v| !v.is_null());
        let updated_existing = ack.get("updatedExisting").and_then(Value::as_bool);
        let n = number(ack, "n");

        if upserted.is_some() || updated_existing == Some(false) {
            result.upserted.get_or_insert_with(Vec::new);
        }
        if let Some(id) = upserted {
            if let Some(list) = result.upserted.as_mut() {
                list.push(Upserted {
                    index,
                    id: id.clone(),
                });
            }
        }

        // Upsert that reused the selector's _id: the server reports no id
        if updated_existing == Some(false) && n == Some(1.0) && is_nil(ack.get("upserted")) {
            let id = ops.get(index).map(WriteOp::selector_id).unwrap_or(Value::Null);
            if let Some(list) = result.upserted.as_mut() {
                list.push(Upserted { index, id });
            }
        } else if updated_existing == Some(true) {
            if let Some(modified) = result.n_modified.as_mut() {
                *modified += n.unwrap_or(0.0) as i64;
            }
        }

        if number(ack, "ok") == Some(1.0) && kind == WriteKind::Insert && is_nil(ack.get("err")) {
            result.n += 1;
        }

        if ack_failed(ack) {
            if number(ack, "ok") == Some(0.0) {
                result.ok = 0;
            }
            let code = ack.get("code").and_then(Value::as_i64);
            let errmsg = ack_message(ack);
            result.code = code.and_then(|c| i32::try_from(c).ok());
            result.errmsg = errmsg.clone();

            if code.is_some_and(|c| WRITE_ERROR_CODES.contains(&c)) {
                result.write_errors.get_or_insert_with(Vec::new).push(WriteError {
                    index,
                    code: result.code,
                    errmsg,
                });
            } else {
                result.write_concern_error = Some(WriteConcernError {
                    code: result.code,
                    errmsg,
                });
            }
        } else if let Some(n) = n {
            result.n += n as i64;
        } else {
            result.n += 1;
        }

        if let Some(last_op) = ack.get("lastOp").filter(|v| truthy(Some(*v))) {
            result.last_op = Some(last_op.clone());
        }
    }

    result
}

/// What became of one operation of an unordered call.
enum Slot {
    Done(Document),
    Waiting(crate::dispatch::PendingReply),
    Failed(ClientError),
}

impl WireProtocol {
    /// Inserts documents one message at a time.
    pub async fn insert(
        &self,
        ns: &str,
        documents: Vec<Document>,
        options: &BulkOptions,
    ) -> Result<BulkWriteResult, ClientError> {
        if documents.len() > MAX_WRITE_BATCH_SIZE {
            return Err(ClientError::BatchTooLarge {
                size: documents.len(),
                max: MAX_WRITE_BATCH_SIZE,
            });
        }
        let ops = documents.into_iter().map(WriteOp::Insert).collect();
        self.execute_write(ns, ops, options).await
    }

    pub async fn update(
        &self,
        ns: &str,
        updates: Vec<UpdateSpec>,
        options: &BulkOptions,
    ) -> Result<BulkWriteResult, ClientError> {
        let ops = updates.into_iter().map(WriteOp::Update).collect();
        self.execute_write(ns, ops, options).await
    }

    pub async fn remove(
        &self,
        ns: &str,
        removes: Vec<RemoveSpec>,
        options: &BulkOptions,
    ) -> Result<BulkWriteResult, ClientError> {
        let ops = removes.into_iter().map(WriteOp::Remove).collect();
        self.execute_write(ns, ops, options).await
    }

    async fn execute_write(
        &self,
        ns: &str,
        ops: Vec<WriteOp>,
        options: &BulkOptions,
    ) -> Result<BulkWriteResult, ClientError> {
        let Some(kind) = ops.first().map(WriteOp::kind) else {
            return Ok(BulkWriteResult::acknowledged());
        };
        if !options.ordered || options.write_concern.is_unacknowledged() {
            self.execute_unordered(kind, ns, ops, &options.write_concern)
                .await
        } else {
            self.execute_ordered(kind, ns, ops, &options.write_concern)
                .await
        }
    }

    /// Encodes an operation, optionally followed by its `getlasterror`.
    fn encode_op(
        &self,
        ns: &str,
        op: &WriteOp,
        ack: Option<&Document>,
    ) -> Result<(Vec<Bytes>, Option<i32>), ClientError> {
        let codec = self.dispatcher.codec();
        let mut buffers = vec![op.message(ns).encode(codec)?];
        let mut ack_id = None;
        if let Some(command) = ack {
            let query = Query::new(command_namespace(ns), command.clone(), 0, -1);
            ack_id = Some(query.request_id);
            buffers.push(query.encode(codec)?);
        }
        Ok((buffers, ack_id))
    }

    fn ack_document(&self, raw: &[u8]) -> Result<Document, ClientError> {
        let reply = self.dispatcher.parse_reply(raw)?;
        let doc = reply.first()?;
        if reply.response_flags.is_query_failure() {
            return Err(server_error(doc));
        }
        Ok(doc.clone())
    }

    async fn execute_ordered(
        &self,
        kind: WriteKind,
        ns: &str,
        ops: Vec<WriteOp>,
        write_concern: &WriteConcern,
    ) -> Result<BulkWriteResult, ClientError> {
        let get_last_error = write_concern.get_last_error();
        let mut acks = Vec::with_capacity(ops.len());

        for op in &ops {
            let (buffers, ack_id) = match self.encode_op(ns, op, Some(&get_last_error)) {
                Ok((buffers, ack_id)) => (buffers, ack_id.unwrap_or_default()),
                Err(e) => {
                    tracing::debug!("write op could not be serialized: {}", e);
                    acks.push(serialization_ack(&e));
                    break;
                }
            };

            let raw = self.dispatcher.dispatch(&buffers, ack_id).await?.wait().await?;
            let ack = self.ack_document(&raw)?;
            let failed = ack_failed(&ack);
            acks.push(ack);
            if failed {
                break;
            }
        }

        Ok(aggregate(kind, &ops, &acks))
    }

    async fn execute_unordered(
        &self,
        kind: WriteKind,
        ns: &str,
        ops: Vec<WriteOp>,
        write_concern: &WriteConcern,
    ) -> Result<BulkWriteResult, ClientError> {
        let unacknowledged = write_concern.is_unacknowledged();
        let get_last_error = (!unacknowledged).then(|| write_concern.get_last_error());

        let mut slots = Vec::with_capacity(ops.len());
        for op in &ops {
            let slot = match self.encode_op(ns, op, get_last_error.as_ref()) {
                Err(e) => Slot::Done(serialization_ack(&e)),
                Ok((buffers, Some(ack_id))) => {
                    match self.dispatcher.dispatch(&buffers, ack_id).await {
                        Ok(pending) => Slot::Waiting(pending),
                        Err(e) => Slot::Failed(e),
                    }
                }
                Ok((buffers, None)) => match self.dispatcher.send(&buffers).await {
                    Ok(()) => Slot::Done(Document::new()),
                    Err(e) => Slot::Failed(e),
                },
            };
            slots.push(slot);
        }

        let outcomes = join_all(slots.into_iter().map(|slot| async move {
            match slot {
                Slot::Done(ack) => Ok(ack),
                Slot::Waiting(pending) => self.ack_document(&pending.wait().await?),
                Slot::Failed(e) => Err(e),
            }
        }))
        .await;

        let acks = outcomes.into_iter().collect::<Result<Vec<_>, _>>()?;
        if unacknowledged {
            return Ok(BulkWriteResult::acknowledged());
        }
        Ok(aggregate(kind, &ops, &acks))
    }
}
