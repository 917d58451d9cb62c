//! Command builders.
//!
//! Translates logical operations into legacy OP_QUERY messages. Nothing here
//! performs I/O, so every capability check fails before a byte is written.

use crate::error::ClientError;
use crate::state::CursorState;
use docwire_protocol::{Document, Query, QueryFlags};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

/// Kind of deployment the connection talks to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyKind {
    #[default]
    Single,
    ReplicaSet,
    /// A query router in front of shards.
    Routed,
}

impl FromStr for TopologyKind {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "single" | "standalone" => Ok(TopologyKind::Single),
            "replica_set" | "replicaset" | "replset" => Ok(TopologyKind::ReplicaSet),
            "routed" | "mongos" | "sharded" => Ok(TopologyKind::Routed),
            other => Err(ClientError::InvalidArgument(format!(
                "unknown topology kind: {}",
                other
            ))),
        }
    }
}

/// Read preference modes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadPreferenceMode {
    #[default]
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

impl ReadPreferenceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadPreferenceMode::Primary => "primary",
            ReadPreferenceMode::PrimaryPreferred => "primaryPreferred",
            ReadPreferenceMode::Secondary => "secondary",
            ReadPreferenceMode::SecondaryPreferred => "secondaryPreferred",
            ReadPreferenceMode::Nearest => "nearest",
        }
    }
}

impl FromStr for ReadPreferenceMode {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary" => Ok(ReadPreferenceMode::Primary),
            "primaryPreferred" => Ok(ReadPreferenceMode::PrimaryPreferred),
            "secondary" => Ok(ReadPreferenceMode::Secondary),
            "secondaryPreferred" => Ok(ReadPreferenceMode::SecondaryPreferred),
            "nearest" => Ok(ReadPreferenceMode::Nearest),
            other => Err(ClientError::InvalidArgument(format!(
                "unknown read preference: {}",
                other
            ))),
        }
    }
}

/// Which server class may serve a read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadPreference {
    pub mode: ReadPreferenceMode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Document>,
}

impl ReadPreference {
    pub fn new(mode: ReadPreferenceMode) -> Self {
        Self {
            mode,
            tags: Vec::new(),
        }
    }

    pub fn with_tags(mut self, tags: Vec<Document>) -> Self {
        self.tags = tags;
        self
    }

    pub fn is_primary(&self) -> bool {
        self.mode == ReadPreferenceMode::Primary
    }

    /// Returns whether reads may go to a non-primary.
    pub fn slave_ok(&self) -> bool {
        !self.is_primary()
    }

    /// The `$readPreference` document.
    pub fn to_value(&self) -> Value {
        let mut doc = Document::new();
        doc.insert("mode".to_string(), json!(self.mode.as_str()));
        if !self.tags.is_empty() {
            doc.insert("tags".to_string(), json!(self.tags));
        }
        Value::Object(doc)
    }
}

/// Read isolation level. Only `local` can be served by the legacy protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadConcern {
    pub level: String,
}

impl ReadConcern {
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
        }
    }

    pub fn local() -> Self {
        Self::new("local")
    }

    pub fn is_local(&self) -> bool {
        self.level == "local"
    }

    fn check(&self, command: &str) -> Result<(), ClientError> {
        if self.is_local() {
            Ok(())
        } else {
            Err(ClientError::UnsupportedReadConcern {
                command: command.to_string(),
                level: self.level.clone(),
            })
        }
    }
}

/// Sort direction of one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    pub fn as_i32(&self) -> i32 {
        match self {
            SortDirection::Ascending => 1,
            SortDirection::Descending => -1,
        }
    }

    /// Parses a direction given as a number or a string.
    pub fn from_value(value: &Value) -> Result<Self, ClientError> {
        match value {
            Value::Number(n) if n.as_i64() == Some(1) => Ok(SortDirection::Ascending),
            Value::Number(n) if n.as_i64() == Some(-1) => Ok(SortDirection::Descending),
            Value::String(s) => s.parse(),
            other => Err(illegal_sort(&other.to_string())),
        }
    }
}

impl FromStr for SortDirection {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "1" | "asc" | "ascending" => Ok(SortDirection::Ascending),
            "-1" | "desc" | "descending" => Ok(SortDirection::Descending),
            _ => Err(illegal_sort(s)),
        }
    }
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i32())
    }
}

fn illegal_sort(direction: &str) -> ClientError {
    ClientError::InvalidArgument(format!(
        "Illegal sort clause, must be of the form [['field1', '(ascending|descending)'], ['field2', '(ascending|descending)']], got {}",
        direction
    ))
}

/// Builds the sort document from ordered (key, direction) pairs.
pub fn sort_document<K: Into<String>>(
    pairs: impl IntoIterator<Item = (K, SortDirection)>,
) -> Document {
    pairs
        .into_iter()
        .map(|(key, dir)| (key.into(), json!(dir.as_i32())))
        .collect()
}

/// Normalizes a sort document whose values may be strings or numbers.
pub fn normalize_sort(sort: &Document) -> Result<Document, ClientError> {
    let mut out = Document::new();
    for (key, value) in sort {
        out.insert(key.clone(), json!(SortDirection::from_value(value)?.as_i32()));
    }
    Ok(out)
}

/// Cursor behavior flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CursorFlags {
    pub tailable: bool,
    pub oplog_replay: bool,
    pub no_cursor_timeout: bool,
    pub await_data: bool,
    pub exhaust: bool,
    pub partial: bool,
}

impl CursorFlags {
    /// Sets a flag by its option name.
    pub fn set(&mut self, name: &str, value: bool) -> Result<(), ClientError> {
        match name {
            "tailable" => self.tailable = value,
            "oplogReplay" => self.oplog_replay = value,
            "noCursorTimeout" => self.no_cursor_timeout = value,
            "awaitData" => self.await_data = value,
            "exhaust" => self.exhaust = value,
            "partial" => self.partial = value,
            other => {
                return Err(ClientError::InvalidArgument(format!(
                    "flag {} not supported, supported flags are tailable, oplogReplay, noCursorTimeout, awaitData, exhaust, partial",
                    other
                )))
            }
        }
        Ok(())
    }

    /// Wire flag bits. Exhaust is accepted but never sent.
    fn query_flags(&self, slave_ok: bool) -> QueryFlags {
        QueryFlags::new()
            .with_tailable(self.tailable)
            .with_oplog_replay(self.oplog_replay)
            .with_no_cursor_timeout(self.no_cursor_timeout)
            .with_await_data(self.await_data)
            .with_partial(self.partial)
            .with_slave_ok(slave_ok)
    }
}

/// A logical find.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindCommand {
    pub filter: Document,
    pub projection: Option<Document>,
    pub sort: Option<Document>,
    pub hint: Option<Value>,
    pub snapshot: Option<bool>,
    pub return_key: Option<bool>,
    pub max_scan: Option<i64>,
    pub min: Option<Document>,
    pub max: Option<Document>,
    pub show_disk_loc: Option<bool>,
    pub comment: Option<Value>,
    pub max_time_ms: Option<u64>,
    /// Accepted for tailable await-data cursors. The legacy protocol has no
    /// field for it.
    pub max_await_time_ms: Option<u64>,
    pub explain: bool,
    pub read_concern: Option<ReadConcern>,
    pub collation: Option<Document>,
    pub flags: CursorFlags,
    pub limit: i32,
    pub skip: i32,
    pub batch_size: Option<i32>,
    pub read_preference: Option<ReadPreference>,
    /// Additional `$` query modifiers, sent verbatim.
    pub modifiers: Document,
}

impl FindCommand {
    pub fn new(filter: Document) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }
}

/// Computes `numberToReturn` for an initial query.
pub fn number_to_return(limit: i32, batch_size: i32) -> i32 {
    if limit == 0 {
        batch_size
    } else if limit < 0 || limit < batch_size || (batch_size == 0 && limit > 0) {
        limit
    } else {
        batch_size
    }
}

fn insert(doc: &mut Document, key: &str, value: Value) {
    doc.insert(key.to_string(), value);
}

/// Builds the initial OP_QUERY for a find.
///
/// Updates `state.batch_size` from the command when one is given.
pub fn build_find(
    ns: &str,
    find: &FindCommand,
    state: &mut CursorState,
    topology: TopologyKind,
) -> Result<Query, ClientError> {
    if let Some(batch_size) = find.batch_size.filter(|b| *b != 0) {
        state.batch_size = batch_size;
    }
    let mut number_to_return = number_to_return(state.limit, state.batch_size);

    if let Some(ref read_concern) = find.read_concern {
        read_concern.check("find")?;
    }

    let mut wrapped = Document::new();

    if topology == TopologyKind::Routed {
        if let Some(ref read_preference) = find.read_preference {
            insert(&mut wrapped, "$readPreference", read_preference.to_value());
        }
    }
    if let Some(ref sort) = find.sort {
        insert(&mut wrapped, "$orderby", Value::Object(sort.clone()));
    }
    if let Some(ref hint) = find.hint {
        insert(&mut wrapped, "$hint", hint.clone());
    }
    if find.snapshot == Some(true) {
        insert(&mut wrapped, "$snapshot", json!(true));
    }
    if find.return_key == Some(true) {
        insert(&mut wrapped, "$returnKey", json!(true));
    }
    if let Some(max_scan) = find.max_scan.filter(|n| *n != 0) {
        insert(&mut wrapped, "$maxScan", json!(max_scan));
    }
    if let Some(ref min) = find.min {
        insert(&mut wrapped, "$min", Value::Object(min.clone()));
    }
    if let Some(ref max) = find.max {
        insert(&mut wrapped, "$max", Value::Object(max.clone()));
    }
    if find.show_disk_loc == Some(true) {
        insert(&mut wrapped, "$showDiskLoc", json!(true));
    }
    if let Some(comment) = find.comment.as_ref().filter(|c| !c.is_null()) {
        insert(&mut wrapped, "$comment", comment.clone());
    }
    if let Some(max_time_ms) = find.max_time_ms.filter(|n| *n != 0) {
        insert(&mut wrapped, "$maxTimeMS", json!(max_time_ms));
    }
    for (key, value) in &find.modifiers {
        if !wrapped.contains_key(key) {
            wrapped.insert(key.clone(), value.clone());
        }
    }
    if find.explain {
        // Zero or negative: a positive count would explain as limit(0)
        number_to_return = find.limit.saturating_abs().saturating_neg();
        insert(&mut wrapped, "$explain", json!(true));
    }

    let query_doc = if wrapped.is_empty() {
        find.filter.clone()
    } else {
        insert(&mut wrapped, "$query", Value::Object(find.filter.clone()));
        wrapped
    };

    let slave_ok = find
        .read_preference
        .as_ref()
        .is_some_and(ReadPreference::slave_ok);

    let mut query = Query::new(ns, query_doc, state.skip, number_to_return)
        .with_flags(find.flags.query_flags(slave_ok));
    if let Some(projection) = find.projection.as_ref().filter(|p| !p.is_empty()) {
        query = query.with_fields(projection.clone());
    }
    Ok(query)
}

/// The `<db>.$cmd` namespace for `ns`.
pub fn command_namespace(ns: &str) -> String {
    let db = ns.split('.').next().unwrap_or(ns);
    format!("{}.$cmd", db)
}

/// Builds an admin command query on `<db>.$cmd`.
///
/// A local `readConcern` is stripped. Any other level fails.
pub fn build_admin_command(
    ns: &str,
    mut command: Document,
    read_preference: Option<&ReadPreference>,
    topology: TopologyKind,
) -> Result<Query, ClientError> {
    if let Some(level) = command
        .get("readConcern")
        .and_then(|rc| rc.get("level"))
        .and_then(Value::as_str)
    {
        let name = command.keys().next().cloned().unwrap_or_default();
        ReadConcern::new(level).check(&name)?;
    }
    command.remove("readConcern");

    let slave_ok = read_preference.is_some_and(ReadPreference::slave_ok);

    let query_doc = match read_preference {
        Some(rp) if topology == TopologyKind::Routed && !rp.is_primary() => {
            let mut wrapped = Document::new();
            insert(&mut wrapped, "$query", Value::Object(command));
            insert(&mut wrapped, "$readPreference", rp.to_value());
            wrapped
        }
        _ => command,
    };

    Ok(Query::new(command_namespace(ns), query_doc, 0, -1)
        .with_flags(QueryFlags::new().with_slave_ok(slave_ok)))
}

/// Options for a count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountOptions {
    pub skip: Option<i32>,
    pub limit: Option<i32>,
    pub max_time_ms: Option<u64>,
}

/// Builds the `count` command document for a find.
pub fn build_count_command(
    ns: &str,
    find: &FindCommand,
    apply_skip_limit: bool,
    opts: &CountOptions,
) -> Document {
    let collection = ns.split_once('.').map(|(_, c)| c).unwrap_or("");

    let mut command = Document::new();
    insert(&mut command, "count", json!(collection));
    insert(&mut command, "query", Value::Object(find.filter.clone()));
    if let Some(ref read_concern) = find.read_concern {
        insert(&mut command, "readConcern", json!({"level": read_concern.level}));
    }
    if let Some(ref hint) = find.hint {
        insert(&mut command, "hint", hint.clone());
    }
    if let Some(max_time_ms) = opts.max_time_ms.or(find.max_time_ms) {
        insert(&mut command, "maxTimeMS", json!(max_time_ms));
    }

    let (skip, limit) = if apply_skip_limit {
        (Some(find.skip), Some(find.limit))
    } else {
        (opts.skip, opts.limit)
    };
    if let Some(skip) = skip.filter(|s| *s != 0) {
        insert(&mut command, "skip", json!(skip));
    }
    if let Some(limit) = limit.filter(|l| *l != 0) {
        insert(&mut command, "limit", json!(limit));
    }
    command
}
