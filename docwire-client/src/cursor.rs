//! Query cursors.
//!
//! A [`Cursor`] is shaped while in [`CursorPhase::Init`], then pulls batches
//! from the server on demand: the initial query first, getMore afterwards,
//! until the server reports a zero cursor id and the buffer is drained.

use crate::command::{
    build_admin_command, build_count_command, build_find, normalize_sort, sort_document,
    CountOptions, FindCommand, ReadConcern, ReadPreference, SortDirection,
};
use crate::cursor_stream::CursorStream;
use crate::error::ClientError;
use crate::state::{CursorState, DEFAULT_BATCH_SIZE};
use crate::wire::{cursor_id_from_value, server_error, WireProtocol};
use docwire_protocol::{CursorId, DecodeOptions, Document, Query};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Default number of empty tailable batches tolerated before giving up.
pub const DEFAULT_NUMBER_OF_RETRIES: u32 = 5;

/// Default pause between empty tailable batches.
pub const DEFAULT_TAILABLE_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// A document transform registered with [`Cursor::map`].
pub type DocumentTransform = Arc<dyn Fn(Document) -> Document + Send + Sync>;

/// Cursor life-cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorPhase {
    Init,
    Open,
    Closed,
    /// A getMore is outstanding.
    GetMore,
}

/// What the cursor's first request is.
#[derive(Debug, Clone, PartialEq)]
pub enum CursorSource {
    /// A find built from the cursor's [`FindCommand`].
    Find,
    /// An admin command whose reply may describe a cursor.
    Command(Document),
    /// A server cursor opened elsewhere.
    Existing(CursorId),
}

/// Tailable retry options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorOptions {
    pub number_of_retries: u32,
    pub tailable_retry_interval: Duration,
}

impl Default for CursorOptions {
    fn default() -> Self {
        Self {
            number_of_retries: DEFAULT_NUMBER_OF_RETRIES,
            tailable_retry_interval: DEFAULT_TAILABLE_RETRY_INTERVAL,
        }
    }
}

/// Database and collection of a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    pub fn parse(ns: &str) -> Self {
        match ns.split_once('.') {
            Some((database, collection)) => Self {
                database: database.to_string(),
                collection: collection.to_string(),
            },
            None => Self {
                database: ns.to_string(),
                collection: String::new(),
            },
        }
    }
}

/// A server-side result set read in batches.
pub struct Cursor {
    wire: WireProtocol,
    /// Namespace used for getMore. A command reply may replace it.
    ns: String,
    /// Namespace the cursor was created with.
    initial_ns: String,
    source: CursorSource,
    find: FindCommand,
    state: CursorState,
    phase: CursorPhase,
    options: CursorOptions,
    current_retries: u32,
    pending_query: Option<Query>,
    /// Document fetched by `has_next` and not yet returned.
    current_doc: Option<Document>,
    transforms: Vec<DocumentTransform>,
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("ns", &self.ns)
            .field("source", &self.source)
            .field("phase", &self.phase)
            .field("cursor_id", &self.state.cursor_id)
            .field("buffered", &self.state.documents.len())
            .finish()
    }
}

impl Cursor {
    pub fn new(
        wire: WireProtocol,
        ns: impl Into<String>,
        source: CursorSource,
        find: FindCommand,
    ) -> Self {
        let ns = ns.into();
        let state = CursorState::new(
            find.limit,
            find.skip,
            find.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
        );
        let options = CursorOptions::default();
        Self {
            wire,
            initial_ns: ns.clone(),
            ns,
            source,
            find,
            state,
            phase: CursorPhase::Init,
            current_retries: options.number_of_retries,
            options,
            pending_query: None,
            current_doc: None,
            transforms: Vec::new(),
        }
    }

    /// A cursor over a find.
    pub fn find(wire: WireProtocol, ns: impl Into<String>, find: FindCommand) -> Self {
        Self::new(wire, ns, CursorSource::Find, find)
    }

    /// A cursor over an admin command's reply.
    pub fn command(wire: WireProtocol, ns: impl Into<String>, command: Document) -> Self {
        Self::new(
            wire,
            ns,
            CursorSource::Command(command),
            FindCommand::default(),
        )
    }

    /// A cursor resuming a server cursor opened elsewhere.
    pub fn existing(wire: WireProtocol, ns: impl Into<String>, cursor_id: CursorId) -> Self {
        Self::new(
            wire,
            ns,
            CursorSource::Existing(cursor_id),
            FindCommand::default(),
        )
    }

    /// Replaces the tailable retry options.
    pub fn with_options(mut self, options: CursorOptions) -> Self {
        self.options = options;
        self.current_retries = options.number_of_retries;
        self
    }

    pub fn phase(&self) -> CursorPhase {
        self.phase
    }

    pub fn source(&self) -> &CursorSource {
        &self.source
    }

    pub fn find_command(&self) -> &FindCommand {
        &self.find
    }

    pub fn cursor_state(&self) -> &CursorState {
        &self.state
    }

    pub fn options(&self) -> CursorOptions {
        self.options
    }

    /// Server cursor id, once the first reply has arrived.
    pub fn cursor_id(&self) -> Option<CursorId> {
        self.state.cursor_id
    }

    // =========================================================================
    // Shaping
    // =========================================================================

    fn ensure_init(&self) -> Result<(), ClientError> {
        if self.phase != CursorPhase::Init || self.state.dead {
            return Err(ClientError::CursorClosed);
        }
        Ok(())
    }

    fn ensure_not_tailable(&self, what: &'static str) -> Result<(), ClientError> {
        if self.find.flags.tailable {
            return Err(ClientError::TailableUnsupported(what));
        }
        Ok(())
    }

    pub fn filter(&mut self, filter: Document) -> Result<&mut Self, ClientError> {
        self.ensure_init()?;
        self.find.filter = filter;
        Ok(self)
    }

    pub fn hint(&mut self, hint: Value) -> Result<&mut Self, ClientError> {
        self.ensure_init()?;
        self.find.hint = Some(hint);
        Ok(self)
    }

    /// Sets the sort from a document whose values are directions.
    pub fn sort(&mut self, sort: &Document) -> Result<&mut Self, ClientError> {
        self.ensure_not_tailable("sorting")?;
        self.ensure_init()?;
        self.find.sort = Some(normalize_sort(sort)?);
        Ok(self)
    }

    /// Sets the sort from ordered (key, direction) pairs.
    pub fn sort_by<K: Into<String>>(
        &mut self,
        pairs: impl IntoIterator<Item = (K, SortDirection)>,
    ) -> Result<&mut Self, ClientError> {
        self.ensure_not_tailable("sorting")?;
        self.ensure_init()?;
        self.find.sort = Some(sort_document(pairs));
        Ok(self)
    }

    pub fn limit(&mut self, limit: i32) -> Result<&mut Self, ClientError> {
        self.ensure_not_tailable("limit")?;
        self.ensure_init()?;
        self.find.limit = limit;
        self.state.limit = limit;
        Ok(self)
    }

    pub fn skip(&mut self, skip: i32) -> Result<&mut Self, ClientError> {
        self.ensure_not_tailable("skip")?;
        self.ensure_init()?;
        self.find.skip = skip;
        self.state.skip = skip;
        Ok(self)
    }

    pub fn batch_size(&mut self, batch_size: i32) -> Result<&mut Self, ClientError> {
        self.ensure_not_tailable("batchSize")?;
        self.ensure_init()?;
        self.find.batch_size = Some(batch_size);
        self.state.batch_size = batch_size;
        Ok(self)
    }

    pub fn project(&mut self, projection: Document) -> Result<&mut Self, ClientError> {
        self.ensure_init()?;
        self.find.projection = Some(projection);
        Ok(self)
    }

    pub fn comment(&mut self, comment: Value) -> Result<&mut Self, ClientError> {
        self.ensure_init()?;
        self.find.comment = Some(comment);
        Ok(self)
    }

    pub fn min(&mut self, min: Document) -> Result<&mut Self, ClientError> {
        self.ensure_init()?;
        self.find.min = Some(min);
        Ok(self)
    }

    pub fn max(&mut self, max: Document) -> Result<&mut Self, ClientError> {
        self.ensure_init()?;
        self.find.max = Some(max);
        Ok(self)
    }

    pub fn max_scan(&mut self, max_scan: i64) -> Result<&mut Self, ClientError> {
        self.ensure_init()?;
        self.find.max_scan = Some(max_scan);
        Ok(self)
    }

    pub fn return_key(&mut self, return_key: bool) -> Result<&mut Self, ClientError> {
        self.ensure_init()?;
        self.find.return_key = Some(return_key);
        Ok(self)
    }

    pub fn show_record_id(&mut self, show: bool) -> Result<&mut Self, ClientError> {
        self.ensure_init()?;
        self.find.show_disk_loc = Some(show);
        Ok(self)
    }

    pub fn snapshot(&mut self, snapshot: bool) -> Result<&mut Self, ClientError> {
        self.ensure_init()?;
        self.find.snapshot = Some(snapshot);
        Ok(self)
    }

    pub fn max_time_ms(&mut self, millis: u64) -> Result<&mut Self, ClientError> {
        self.ensure_init()?;
        self.find.max_time_ms = Some(millis);
        Ok(self)
    }

    pub fn max_await_time_ms(&mut self, millis: u64) -> Result<&mut Self, ClientError> {
        self.ensure_init()?;
        self.find.max_await_time_ms = Some(millis);
        Ok(self)
    }

    pub fn read_concern(&mut self, read_concern: ReadConcern) -> Result<&mut Self, ClientError> {
        self.ensure_init()?;
        self.find.read_concern = Some(read_concern);
        Ok(self)
    }

    /// Sets a flag by name: tailable, oplogReplay, noCursorTimeout,
    /// awaitData, exhaust or partial.
    pub fn add_cursor_flag(&mut self, flag: &str, value: bool) -> Result<&mut Self, ClientError> {
        self.ensure_init()?;
        self.find.flags.set(flag, value)?;
        Ok(self)
    }

    /// Sets `numberOfRetries` or `tailableRetryInterval` (milliseconds).
    pub fn set_cursor_option(&mut self, name: &str, value: Value) -> Result<&mut Self, ClientError> {
        self.ensure_init()?;
        let number = value.as_u64().ok_or_else(|| {
            ClientError::InvalidArgument(format!("option {} must be a non-negative integer", name))
        })?;
        match name {
            "numberOfRetries" => {
                let retries = u32::try_from(number).unwrap_or(u32::MAX);
                self.options.number_of_retries = retries;
                self.current_retries = retries;
            }
            "tailableRetryInterval" => {
                self.options.tailable_retry_interval = Duration::from_millis(number);
            }
            other => {
                return Err(ClientError::InvalidArgument(format!(
                    "option {} is not a supported option [numberOfRetries, tailableRetryInterval]",
                    other
                )))
            }
        }
        Ok(self)
    }

    /// Adds a `$`-prefixed query modifier. `$orderby` also becomes the sort.
    pub fn add_query_modifier(&mut self, name: &str, value: Value) -> Result<&mut Self, ClientError> {
        self.ensure_init()?;
        if !name.starts_with('$') {
            return Err(ClientError::InvalidArgument(
                "a query modifier must start with $".to_string(),
            ));
        }
        if name == "$orderby" {
            if let Value::Object(ref sort) = value {
                self.find.sort = Some(normalize_sort(sort)?);
            }
        }
        self.find.modifiers.insert(name.to_string(), value);
        Ok(self)
    }

    pub fn set_read_preference(
        &mut self,
        read_preference: ReadPreference,
    ) -> Result<&mut Self, ClientError> {
        self.ensure_init()?;
        self.find.read_preference = Some(read_preference);
        Ok(self)
    }

    /// Decode options for this cursor's replies.
    pub fn promote(&mut self, promote: DecodeOptions) -> Result<&mut Self, ClientError> {
        self.ensure_init()?;
        self.state.promote = Some(promote);
        Ok(self)
    }

    /// Records a collation. The first fetch rejects it.
    pub fn collation(&mut self, collation: Document) -> &mut Self {
        self.find.collation = Some(collation);
        self
    }

    /// Registers a transform applied to every document handed out.
    pub fn map<F>(&mut self, transform: F) -> &mut Self
    where
        F: Fn(Document) -> Document + Send + Sync + 'static,
    {
        self.transforms.push(Arc::new(transform));
        self
    }

    // =========================================================================
    // Fetching
    // =========================================================================

    pub(crate) fn apply_transforms(&self, doc: Document) -> Document {
        self.transforms.iter().fold(doc, |doc, transform| transform(doc))
    }

    /// Builds the first request and leaves `Init`.
    fn initialize(&mut self) -> Result<(), ClientError> {
        self.state.init = true;
        if self.phase == CursorPhase::Init {
            self.phase = CursorPhase::Open;
        }
        if self.find.collation.is_some() {
            return Err(ClientError::CollationUnsupported);
        }

        let topology = self.wire.topology();
        self.pending_query = match &self.source {
            CursorSource::Find => Some(build_find(&self.ns, &self.find, &mut self.state, topology)?),
            CursorSource::Command(command) => Some(build_admin_command(
                &self.ns,
                command.clone(),
                self.find.read_preference.as_ref(),
                topology,
            )?),
            CursorSource::Existing(cursor_id) => {
                self.state.cursor_id = Some(*cursor_id);
                None
            }
        };
        Ok(())
    }

    /// Sends the first request and loads its reply into the cursor state.
    async fn initial_query(&mut self, query: Query) -> Result<(), ClientError> {
        let reply = self.wire.query(query, self.state.promote).await?;

        if self.source != CursorSource::Find && reply.documents.len() == 1 {
            let doc = &reply.documents[0];
            let cursor_field = doc.get("cursor");
            let is_cursor_reply = !cursor_field.is_some_and(Value::is_string)
                || has_error_field(doc)
                || doc.get("result").is_some_and(Value::is_array);

            if is_cursor_reply {
                if has_error_field(doc) {
                    return Err(server_error(doc));
                }
                if let Some(cursor) = cursor_field.and_then(Value::as_object) {
                    let cursor_id = cursor
                        .get("id")
                        .and_then(cursor_id_from_value)
                        .unwrap_or(CursorId::ZERO);
                    if let Some(ns) = cursor.get("ns").and_then(Value::as_str) {
                        self.ns = ns.to_string();
                    }
                    self.state.documents = documents_of(cursor.get("firstBatch"));
                    self.state.cursor_id = Some(cursor_id);
                    return Ok(());
                }
                if let Some(result) = doc.get("result").filter(|r| r.is_array()) {
                    self.state.documents = documents_of(Some(result));
                    self.state.cursor_id = Some(CursorId::ZERO);
                    return Ok(());
                }
            }
        }

        if reply.response_flags.is_query_failure() {
            return Err(server_error(reply.first()?));
        }

        self.state.cursor_id = Some(reply.cursor_id);
        self.state.documents = reply.documents.into();
        Ok(())
    }

    async fn refill(&mut self) -> Result<(), ClientError> {
        let batch_size = self.state.next_batch_size();
        self.phase = CursorPhase::GetMore;
        let result = self.wire.get_more(&self.ns, &mut self.state, batch_size).await;
        if self.phase == CursorPhase::GetMore {
            self.phase = CursorPhase::Open;
        }
        result
    }

    /// Waits before asking a tailable cursor again.
    async fn wait_for_tail(&mut self) -> Result<(), ClientError> {
        if self.find.flags.await_data {
            return Ok(());
        }
        if self.current_retries == 0 {
            self.close().await;
            return Err(ClientError::TailableRetriesExhausted);
        }
        self.current_retries -= 1;
        tokio::time::sleep(self.options.tailable_retry_interval).await;
        Ok(())
    }

    /// Returns the next raw document, or `None` once the cursor is exhausted.
    pub(crate) async fn fetch_next(&mut self) -> Result<Option<Document>, ClientError> {
        loop {
            if self.state.killed {
                self.state.notified = true;
                self.state.documents.clear();
                return Ok(None);
            }
            if self.state.dead {
                self.state.notified = true;
                return Ok(None);
            }

            if !self.state.init {
                self.initialize()?;
            }

            if self.state.cursor_id.is_none() {
                let Some(query) = self.pending_query.take() else {
                    self.state.dead = true;
                    return Ok(None);
                };
                self.initial_query(query).await?;

                if self.state.documents.is_empty()
                    && !self.state.has_live_cursor()
                    && !self.find.flags.tailable
                    && !self.find.flags.await_data
                {
                    self.state.notified = true;
                    return Ok(None);
                }
            }

            if self.state.limit_reached() {
                self.kill().await;
                self.state.dead = true;
                return Ok(None);
            }

            if self.state.documents.is_empty() && self.state.has_live_cursor() {
                self.refill().await?;

                if self.state.documents.is_empty() && self.find.flags.tailable {
                    if !self.state.has_live_cursor() {
                        return Err(ClientError::TailedCursorEmpty);
                    }
                    self.wait_for_tail().await?;
                    continue;
                }
                if !self.state.documents.is_empty() {
                    self.current_retries = self.options.number_of_retries;
                }
                if self.state.limit_reached() {
                    self.state.dead = true;
                    return Ok(None);
                }
                continue;
            }

            let Some(doc) = self.state.documents.pop_front() else {
                if self.find.flags.tailable {
                    return Err(ClientError::TailedCursorEmpty);
                }
                self.state.dead = true;
                return Ok(None);
            };

            self.state.current_limit += 1;
            if doc.contains_key("$err") {
                self.kill().await;
                return Err(server_error(&doc));
            }
            return Ok(Some(doc));
        }
    }

    // =========================================================================
    // Iteration
    // =========================================================================

    /// Returns the next document, or `None` once the cursor is exhausted.
    pub async fn next(&mut self) -> Result<Option<Document>, ClientError> {
        if let Some(doc) = self.current_doc.take() {
            return Ok(Some(doc));
        }
        if self.phase == CursorPhase::Closed {
            return Err(ClientError::CursorClosed);
        }
        let doc = self.fetch_next().await?;
        Ok(doc.map(|doc| self.apply_transforms(doc)))
    }

    /// Fetches and caches the next document without consuming it.
    pub async fn has_next(&mut self) -> Result<bool, ClientError> {
        if self.current_doc.is_some() {
            return Ok(true);
        }
        match self.next().await {
            Ok(Some(doc)) => {
                self.current_doc = Some(doc);
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(_) if self.phase == CursorPhase::Closed || self.state.dead => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Takes the document cached by [`Cursor::has_next`], transforms already applied.
    pub(crate) fn take_current(&mut self) -> Option<Document> {
        self.current_doc.take()
    }

    /// Number of documents buffered from the last batch.
    pub fn buffered_count(&self) -> usize {
        self.state.documents.len()
    }

    /// Takes up to `count` buffered documents, all when `None`, without
    /// touching the server. A positive limit is honoured and kills the
    /// cursor when reached.
    pub async fn read_buffered_documents(&mut self, count: Option<usize>) -> Vec<Document> {
        let available = self.state.documents.len();
        let mut count = count.map_or(available, |n| n.min(available));

        let mut limit_hit = false;
        if self.state.limit > 0 {
            let remaining = usize::try_from(self.state.limit - self.state.current_limit).unwrap_or(0);
            if count > remaining {
                count = remaining;
                limit_hit = true;
            }
        }

        let docs: Vec<Document> = self.state.documents.drain(..count).collect();
        self.state.current_limit += i32::try_from(count).unwrap_or(i32::MAX);
        if limit_hit {
            self.kill().await;
        }
        docs.into_iter()
            .map(|doc| self.apply_transforms(doc))
            .collect()
    }

    /// Reads every remaining document. Always starts over from the first batch.
    pub async fn to_array(&mut self) -> Result<Vec<Document>, ClientError> {
        if self.find.flags.tailable {
            return Err(ClientError::InvalidArgument(
                "Tailable cursor cannot be converted to array".to_string(),
            ));
        }
        self.rewind().await;

        let mut items = Vec::new();
        while let Some(doc) = self.fetch_next().await? {
            items.push(self.apply_transforms(doc));
            items.extend(self.read_buffered_documents(None).await);
        }
        self.phase = CursorPhase::Closed;
        Ok(items)
    }

    /// Calls `callback` with every document from the start, stopping early
    /// when it returns false.
    pub async fn each<F>(&mut self, mut callback: F) -> Result<(), ClientError>
    where
        F: FnMut(Document) -> bool,
    {
        self.rewind().await;

        loop {
            let Some(doc) = self.fetch_next().await? else {
                self.phase = CursorPhase::Closed;
                return Ok(());
            };
            if !callback(self.apply_transforms(doc)) {
                return Ok(());
            }
            for doc in self.read_buffered_documents(None).await {
                if !callback(doc) {
                    return Ok(());
                }
            }
        }
    }

    pub async fn for_each<F>(&mut self, mut callback: F) -> Result<(), ClientError>
    where
        F: FnMut(Document),
    {
        self.each(|doc| {
            callback(doc);
            true
        })
        .await
    }

    // =========================================================================
    // Life-cycle
    // =========================================================================

    /// Releases the server cursor and drops buffered documents.
    pub async fn kill(&mut self) {
        self.state.killed = true;
        self.state.documents.clear();
        if let Some(cursor_id) = self.state.cursor_id.filter(|id| !id.is_zero()) {
            if let Err(e) = self.wire.kill_cursor(cursor_id).await {
                tracing::debug!("killCursors {} failed: {}", cursor_id, e);
            }
        }
    }

    /// Moves back to `Init` so the next fetch re-issues the first request.
    pub async fn rewind(&mut self) {
        if self.state.init && !self.state.dead && !self.state.killed {
            self.kill().await;
        }
        self.state.reset();
        self.ns = self.initial_ns.clone();
        self.pending_query = None;
        self.current_doc = None;
        self.current_retries = self.options.number_of_retries;
        self.phase = CursorPhase::Init;
    }

    pub async fn close(&mut self) {
        self.phase = CursorPhase::Closed;
        self.current_doc = None;
        self.kill().await;
    }

    /// Returns whether the cursor is exhausted or killed.
    pub fn is_closed(&self) -> bool {
        self.state.dead
    }

    pub fn namespace(&self) -> Namespace {
        Namespace::parse(&self.ns)
    }

    /// A fresh cursor with the same command and options.
    pub fn clone_cursor(&self) -> Cursor {
        let mut cursor = Cursor::new(
            self.wire.clone(),
            self.initial_ns.clone(),
            self.source.clone(),
            self.find.clone(),
        );
        cursor.state = CursorState::new(self.state.limit, self.state.skip, self.state.batch_size);
        cursor.state.promote = self.state.promote;
        cursor.options = self.options;
        cursor.current_retries = self.options.number_of_retries;
        cursor.transforms = self.transforms.clone();
        cursor
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Counts the documents matching the cursor's find.
    pub async fn count(
        &self,
        apply_skip_limit: bool,
        opts: &CountOptions,
    ) -> Result<i64, ClientError> {
        if self.source != CursorSource::Find {
            return Err(ClientError::CountRequiresFind);
        }
        let command = build_count_command(&self.ns, &self.find, apply_skip_limit, opts);
        let result = self
            .wire
            .run_command(&self.ns, command, self.find.read_preference.as_ref())
            .await?;
        Ok(result.get("n").and_then(Value::as_f64).unwrap_or(0.0) as i64)
    }

    /// Runs the find with `$explain` and returns the raw plan document.
    pub async fn explain(&mut self) -> Result<Document, ClientError> {
        self.find.explain = true;
        self.find.read_concern = None;
        Ok(self.fetch_next().await?.unwrap_or_default())
    }

    /// Turns the cursor into a [`futures::Stream`] of documents.
    pub fn stream(self) -> CursorStream {
        CursorStream::new(self, None)
    }

    /// Like [`Cursor::stream`], with one more transform applied last.
    pub fn stream_with<F>(self, transform: F) -> CursorStream
    where
        F: Fn(Document) -> Document + Send + Sync + 'static,
    {
        CursorStream::new(self, Some(Arc::new(transform)))
    }
}

fn has_error_field(doc: &Document) -> bool {
    ["$err", "errmsg"].iter().any(|key| match doc.get(*key) {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    })
}

fn documents_of(batch: Option<&Value>) -> std::collections::VecDeque<Document> {
    batch
        .and_then(Value::as_array)
        .map(|docs| docs.iter().filter_map(|d| d.as_object().cloned()).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::TopologyKind;
    use crate::testing::{doc, reply, MockServer};
    use docwire_protocol::{Reply, RequestMessage, ResponseFlags};
    use parking_lot::Mutex;
    use serde_json::json;

    const SERVER_CURSOR: i64 = 99;

    fn page(docs: &[Document], offset: &mut usize, number_to_return: i32) -> Reply {
        let size = if number_to_return == 0 {
            docs.len()
        } else {
            number_to_return.unsigned_abs() as usize
        };
        let end = (*offset + size).min(docs.len());
        let batch = docs[*offset..end].to_vec();
        *offset = end;
        let id = if number_to_return > 0 && end < docs.len() {
            SERVER_CURSOR
        } else {
            0
        };
        Reply::new(0, batch).with_cursor_id(CursorId::new(id))
    }

    /// Serves `{i: 0..total}` in batches of whatever size is asked for.
    async fn paged_server(total: usize) -> MockServer {
        let docs: Vec<Document> = (0..total).map(|i| doc(json!({ "i": i }))).collect();
        let offset = Arc::new(Mutex::new(0usize));
        MockServer::start(move |request| match request {
            RequestMessage::Query(query) if !query.ns.ends_with(".$cmd") => {
                let mut offset = offset.lock();
                *offset = query.number_to_skip as usize;
                Some(page(&docs, &mut offset, query.number_to_return))
            }
            RequestMessage::GetMore(get_more) => {
                Some(page(&docs, &mut offset.lock(), get_more.number_to_return))
            }
            _ => None,
        })
        .await
    }

    async fn wire(server: &MockServer) -> WireProtocol {
        WireProtocol::new(server.dispatcher().await, TopologyKind::Single)
    }

    fn indexes(docs: &[Document]) -> Vec<i64> {
        docs.iter().filter_map(|d| d["i"].as_i64()).collect()
    }

    async fn drain(cursor: &mut Cursor) -> Vec<Document> {
        let mut docs = Vec::new();
        while let Some(doc) = cursor.next().await.unwrap() {
            docs.push(doc);
        }
        docs
    }

    fn count_requests(server: &MockServer, pred: impl Fn(&RequestMessage) -> bool) -> usize {
        server.requests().iter().filter(|&r| pred(r)).count()
    }

    #[tokio::test]
    async fn test_iterates_across_batches() {
        let server = paged_server(5).await;
        let mut cursor = Cursor::find(wire(&server).await, "db.c", FindCommand::default());
        cursor.batch_size(2).unwrap();

        let docs = drain(&mut cursor).await;
        assert_eq!(indexes(&docs), vec![0, 1, 2, 3, 4]);
        assert!(cursor.is_closed());
        assert!(cursor.next().await.unwrap().is_none());

        let requests = server.requests();
        assert_eq!(requests.len(), 3);
        assert!(matches!(&requests[0], RequestMessage::Query(q) if q.number_to_return == 2));
        assert!(matches!(&requests[1], RequestMessage::GetMore(g) if g.cursor_id == CursorId::new(SERVER_CURSOR)));
    }

    #[tokio::test]
    async fn test_limit_trims_get_more_and_kills() {
        let server = paged_server(10).await;
        let mut cursor = Cursor::find(wire(&server).await, "db.c", FindCommand::default());
        cursor.batch_size(3).unwrap().limit(5).unwrap();

        let docs = drain(&mut cursor).await;
        assert_eq!(indexes(&docs), vec![0, 1, 2, 3, 4]);

        let requests = server.wait_for_requests(3).await;
        assert!(matches!(&requests[1], RequestMessage::GetMore(g) if g.number_to_return == 2));
        assert!(matches!(
            &requests[2],
            RequestMessage::KillCursors(k) if k.cursor_ids == vec![CursorId::new(SERVER_CURSOR)]
        ));
    }

    #[tokio::test]
    async fn test_shaping_only_in_init() {
        let server = paged_server(3).await;
        let mut cursor = Cursor::find(wire(&server).await, "db.c", FindCommand::default());

        cursor
            .limit(2)
            .unwrap()
            .skip(1)
            .unwrap()
            .project(doc(json!({"i": 1})))
            .unwrap();
        assert_eq!(cursor.phase(), CursorPhase::Init);

        cursor.next().await.unwrap();
        assert_eq!(cursor.phase(), CursorPhase::Open);

        let err = cursor.limit(1).unwrap_err();
        assert!(matches!(err, ClientError::CursorClosed));
        assert_eq!(err.to_string(), "cursor is closed");
        assert!(cursor.hint(json!("i_1")).is_err());
        assert!(cursor.add_cursor_flag("partial", true).is_err());
        // collation is recorded at any time
        cursor.collation(doc(json!({"locale": "fr"})));
    }

    #[tokio::test]
    async fn test_has_next_caches_document() {
        let server = paged_server(2).await;
        let mut cursor = Cursor::find(wire(&server).await, "db.c", FindCommand::default());

        assert!(cursor.has_next().await.unwrap());
        assert!(cursor.has_next().await.unwrap());
        assert_eq!(cursor.next().await.unwrap().unwrap()["i"], json!(0));
        assert_eq!(cursor.next().await.unwrap().unwrap()["i"], json!(1));
        assert!(!cursor.has_next().await.unwrap());
        assert!(cursor.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_to_array_rewinds() {
        let server = paged_server(4).await;
        let mut cursor = Cursor::find(wire(&server).await, "db.c", FindCommand::default());
        cursor.batch_size(2).unwrap();

        assert_eq!(cursor.next().await.unwrap().unwrap()["i"], json!(0));

        let all = cursor.to_array().await.unwrap();
        assert_eq!(indexes(&all), vec![0, 1, 2, 3]);
        assert_eq!(cursor.phase(), CursorPhase::Closed);
        assert!(matches!(cursor.next().await, Err(ClientError::CursorClosed)));

        let queries = count_requests(&server, |r| matches!(r, RequestMessage::Query(_)));
        assert_eq!(queries, 2);
        let kills = count_requests(&server, |r| matches!(r, RequestMessage::KillCursors(_)));
        assert_eq!(kills, 1);
    }

    #[tokio::test]
    async fn test_close_kills_and_rejects_next() {
        let server = paged_server(4).await;
        let mut cursor = Cursor::find(wire(&server).await, "db.c", FindCommand::default());
        cursor.batch_size(2).unwrap();
        cursor.next().await.unwrap();

        cursor.close().await;
        assert_eq!(cursor.phase(), CursorPhase::Closed);
        assert!(matches!(cursor.next().await, Err(ClientError::CursorClosed)));
        assert!(!cursor.has_next().await.unwrap());

        let requests = server.wait_for_requests(2).await;
        assert!(matches!(&requests[1], RequestMessage::KillCursors(_)));
    }

    #[tokio::test]
    async fn test_each_stops_early() {
        let server = paged_server(6).await;
        let mut cursor = Cursor::find(wire(&server).await, "db.c", FindCommand::default());
        cursor.batch_size(2).unwrap();

        let mut seen = Vec::new();
        cursor
            .each(|doc| {
                seen.push(doc["i"].as_i64().unwrap_or(-1));
                seen.len() < 3
            })
            .await
            .unwrap();
        assert_eq!(seen, vec![0, 1, 2]);

        let mut all = Vec::new();
        cursor.for_each(|doc| all.push(doc)).await.unwrap();
        assert_eq!(all.len(), 6);
        assert_eq!(cursor.phase(), CursorPhase::Closed);
    }

    #[tokio::test]
    async fn test_read_buffered_documents_honours_limit() {
        let server = paged_server(10).await;
        let mut cursor = Cursor::find(wire(&server).await, "db.c", FindCommand::default());
        cursor.batch_size(6).unwrap().limit(4).unwrap();

        // limit < batch size: the server is asked for 4
        cursor.next().await.unwrap();
        assert_eq!(cursor.buffered_count(), 3);
        let rest = cursor.read_buffered_documents(Some(10)).await;
        assert_eq!(indexes(&rest), vec![1, 2, 3]);
        assert!(cursor.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transforms_apply_in_order() {
        let server = paged_server(2).await;
        let mut cursor = Cursor::find(wire(&server).await, "db.c", FindCommand::default());
        cursor
            .map(|mut doc| {
                doc.insert("tag".to_string(), json!("a"));
                doc
            })
            .map(|mut doc| {
                let tag = format!("{}b", doc["tag"].as_str().unwrap_or(""));
                doc.insert("tag".to_string(), json!(tag));
                doc
            });

        let first = cursor.next().await.unwrap().unwrap();
        assert_eq!(first["tag"], json!("ab"));

        let all = cursor.to_array().await.unwrap();
        assert!(all.iter().all(|d| d["tag"] == json!("ab")));
    }

    #[tokio::test]
    async fn test_tailable_restrictions() {
        let server = paged_server(1).await;
        let mut cursor = Cursor::find(wire(&server).await, "db.c", FindCommand::default());
        cursor.add_cursor_flag("tailable", true).unwrap();

        let err = cursor.sort(&doc(json!({"i": 1}))).unwrap_err();
        assert_eq!(err.to_string(), "Tailable cursor doesn't support sorting");
        assert!(matches!(cursor.limit(1), Err(ClientError::TailableUnsupported("limit"))));
        assert!(matches!(cursor.skip(1), Err(ClientError::TailableUnsupported("skip"))));
        assert!(matches!(
            cursor.batch_size(1),
            Err(ClientError::TailableUnsupported("batchSize"))
        ));

        let err = cursor.to_array().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid argument: Tailable cursor cannot be converted to array"
        );
    }

    #[tokio::test]
    async fn test_tailed_cursor_empty() {
        let server = MockServer::start(|request| match request {
            RequestMessage::Query(_) => Some(Reply::new(0, Vec::new())),
            _ => None,
        })
        .await;
        let mut cursor = Cursor::find(wire(&server).await, "db.capped", FindCommand::default());
        cursor.add_cursor_flag("tailable", true).unwrap();

        let err = cursor.next().await.unwrap_err();
        assert!(matches!(err, ClientError::TailedCursorEmpty));
        assert_eq!(err.to_string(), "No more documents in tailed cursor");
    }

    #[tokio::test]
    async fn test_tailable_retries_exhausted() {
        let server = MockServer::start(|request| match request {
            RequestMessage::Query(_) => Some(
                Reply::new(0, vec![doc(json!({"i": 0}))]).with_cursor_id(CursorId::new(7)),
            ),
            RequestMessage::GetMore(_) => {
                Some(Reply::new(0, Vec::new()).with_cursor_id(CursorId::new(7)))
            }
            _ => None,
        })
        .await;
        let mut cursor = Cursor::find(wire(&server).await, "db.capped", FindCommand::default());
        cursor
            .add_cursor_flag("tailable", true)
            .unwrap()
            .set_cursor_option("numberOfRetries", json!(2))
            .unwrap()
            .set_cursor_option("tailableRetryInterval", json!(1))
            .unwrap();

        assert!(cursor.next().await.unwrap().is_some());
        let err = cursor.next().await.unwrap_err();
        assert!(matches!(err, ClientError::TailableRetriesExhausted));
        assert_eq!(cursor.phase(), CursorPhase::Closed);

        let get_mores = count_requests(&server, |r| matches!(r, RequestMessage::GetMore(_)));
        assert_eq!(get_mores, 3);
    }

    #[tokio::test]
    async fn test_cursor_option_validation() {
        let server = paged_server(0).await;
        let mut cursor = Cursor::find(wire(&server).await, "db.c", FindCommand::default());
        assert!(cursor.set_cursor_option("numberOfRetries", json!(9)).is_ok());
        assert_eq!(cursor.options().number_of_retries, 9);
        assert!(cursor.set_cursor_option("bogus", json!(1)).is_err());
        assert!(cursor.add_cursor_flag("bogus", true).is_err());
    }

    #[tokio::test]
    async fn test_collation_rejected_before_io() {
        let server = paged_server(1).await;
        let mut cursor = Cursor::find(wire(&server).await, "db.c", FindCommand::default());
        cursor.collation(doc(json!({"locale": "en"})));

        assert!(matches!(
            cursor.next().await,
            Err(ClientError::CollationUnsupported)
        ));
        assert!(server.requests().is_empty());
    }

    #[tokio::test]
    async fn test_query_modifiers() {
        let server = paged_server(1).await;
        let mut cursor = Cursor::find(wire(&server).await, "db.c", FindCommand::default());

        assert!(cursor.add_query_modifier("orderby", json!({"i": 1})).is_err());
        cursor
            .add_query_modifier("$orderby", json!({"i": "desc"}))
            .unwrap()
            .add_query_modifier("$maxTimeMS", json!(50))
            .unwrap();
        assert_eq!(cursor.find_command().sort, Some(doc(json!({"i": -1}))));

        cursor.next().await.unwrap();
        let requests = server.requests();
        let RequestMessage::Query(query) = &requests[0] else {
            panic!("expected query");
        };
        assert_eq!(query.query["$orderby"], json!({"i": -1}));
        assert_eq!(query.query["$maxTimeMS"], json!(50));
        assert_eq!(query.query["$query"], json!({}));
    }

    #[tokio::test]
    async fn test_query_failure() {
        let server = MockServer::start(|_| {
            Some(
                reply(json!({"$err": "bad query", "code": 17}))
                    .with_flags(ResponseFlags::new().with_query_failure()),
            )
        })
        .await;
        let mut cursor = Cursor::find(wire(&server).await, "db.c", FindCommand::default());
        let err = cursor.next().await.unwrap_err();
        assert_eq!(err.code(), Some(17));
        assert_eq!(err.to_string(), "server error 17: bad query");
    }

    #[tokio::test]
    async fn test_command_cursor_first_batch() {
        let server = MockServer::start(|request| match request {
            RequestMessage::Query(_) => Some(reply(json!({
                "cursor": {"id": 55, "ns": "db.other", "firstBatch": [{"a": 1}]},
                "ok": 1
            }))),
            RequestMessage::GetMore(_) => Some(Reply::new(0, vec![doc(json!({"a": 2}))])),
            _ => None,
        })
        .await;
        let command = doc(json!({"aggregate": "c", "pipeline": [], "cursor": {}}));
        let mut cursor = Cursor::command(wire(&server).await, "db.c", command);

        let docs = drain(&mut cursor).await;
        assert_eq!(docs, vec![doc(json!({"a": 1})), doc(json!({"a": 2}))]);

        let requests = server.requests();
        assert!(matches!(&requests[0], RequestMessage::Query(q) if q.ns == "db.$cmd"));
        assert!(matches!(
            &requests[1],
            RequestMessage::GetMore(g) if g.ns == "db.other" && g.cursor_id == CursorId::new(55)
        ));
        assert_eq!(cursor.namespace().collection, "other");
    }

    #[tokio::test]
    async fn test_command_result_array() {
        let server = MockServer::start(|_| {
            Some(reply(json!({"result": [{"x": 1}, {"x": 2}], "ok": 1})))
        })
        .await;
        let command = doc(json!({"aggregate": "c", "pipeline": []}));
        let mut cursor = Cursor::command(wire(&server).await, "db.c", command);

        let docs = drain(&mut cursor).await;
        assert_eq!(docs.len(), 2);
        assert_eq!(server.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_command_error_reply() {
        let server = MockServer::start(|_| {
            Some(reply(json!({"ok": 0, "errmsg": "unknown pipeline stage", "code": 16436})))
        })
        .await;
        let command = doc(json!({"aggregate": "c", "pipeline": [{"$bogus": {}}]}));
        let mut cursor = Cursor::command(wire(&server).await, "db.c", command);

        let err = cursor.next().await.unwrap_err();
        assert_eq!(err.code(), Some(16436));
    }

    #[tokio::test]
    async fn test_existing_cursor_resumes_with_get_more() {
        let server = paged_server(3).await;
        let mut cursor = Cursor::existing(wire(&server).await, "db.c", CursorId::new(SERVER_CURSOR));
        cursor.next().await.unwrap();

        let requests = server.requests();
        assert!(matches!(&requests[0], RequestMessage::GetMore(_)));
    }

    #[tokio::test]
    async fn test_count() {
        let server = MockServer::start(|request| match request {
            RequestMessage::Query(q) if q.query.contains_key("count") => {
                Some(reply(json!({"n": 42, "ok": 1})))
            }
            _ => None,
        })
        .await;
        let wire = wire(&server).await;

        let mut cursor = Cursor::find(wire.clone(), "db.c", FindCommand::new(doc(json!({"a": 1}))));
        cursor.skip(3).unwrap();
        let n = cursor.count(true, &CountOptions::default()).await.unwrap();
        assert_eq!(n, 42);

        let requests = server.requests();
        let RequestMessage::Query(sent) = &requests[0] else {
            panic!("expected count");
        };
        assert_eq!(sent.ns, "db.$cmd");
        assert_eq!(sent.query["count"], json!("c"));
        assert_eq!(sent.query["skip"], json!(3));

        let command_cursor = Cursor::command(wire, "db.c", doc(json!({"listIndexes": "c"})));
        assert!(matches!(
            command_cursor.count(false, &CountOptions::default()).await,
            Err(ClientError::CountRequiresFind)
        ));
        assert_eq!(server.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_explain() {
        let server = MockServer::start(|request| match request {
            RequestMessage::Query(q) if q.query.contains_key("$explain") => {
                Some(reply(json!({"queryPlanner": {"winningPlan": "COLLSCAN"}})))
            }
            _ => None,
        })
        .await;
        let mut find = FindCommand::default();
        find.read_concern = Some(ReadConcern::new("majority"));
        let mut cursor = Cursor::find(wire(&server).await, "db.c", find);
        cursor.limit(10).unwrap().map(|_| Document::new());

        let plan = cursor.explain().await.unwrap();
        assert!(plan.contains_key("queryPlanner"));

        let requests = server.requests();
        let RequestMessage::Query(sent) = &requests[0] else {
            panic!("expected query");
        };
        assert_eq!(sent.number_to_return, -10);
    }

    #[tokio::test]
    async fn test_clone_cursor_starts_fresh() {
        let server = paged_server(3).await;
        let mut cursor = Cursor::find(wire(&server).await, "db.c", FindCommand::default());
        cursor.skip(1).unwrap();
        drain(&mut cursor).await;

        let mut clone = cursor.clone_cursor();
        assert_eq!(clone.phase(), CursorPhase::Init);
        let docs = drain(&mut clone).await;
        assert_eq!(indexes(&docs), vec![1, 2]);
    }

    #[test]
    fn test_namespace_parse() {
        assert_eq!(
            Namespace::parse("db.coll.sub"),
            Namespace {
                database: "db".to_string(),
                collection: "coll.sub".to_string()
            }
        );
        assert_eq!(Namespace::parse("db").collection, "");
    }

    #[test]
    fn test_default_options() {
        let options = CursorOptions::default();
        assert_eq!(options.number_of_retries, 5);
        assert_eq!(options.tailable_retry_interval, Duration::from_millis(500));
    }
}
