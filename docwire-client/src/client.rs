//! High-level client API.

use crate::bulk::{BulkOptions, BulkWriteResult, RemoveSpec, UpdateSpec};
use crate::command::{CountOptions, FindCommand, ReadPreference, TopologyKind};
use crate::config::{Config, CursorSettings};
use crate::connection::{ConnectOverrides, ConnectionConfig};
use crate::cursor::Cursor;
use crate::dispatch::Dispatcher;
use crate::error::ClientError;
use crate::registry::ConnectionRegistry;
use crate::wire::WireProtocol;
use docwire_protocol::{Document, JsonCodec};
use serde_json::json;
use std::sync::Arc;

/// Client over a single connection.
pub struct Client {
    wire: WireProtocol,
    registry: Arc<ConnectionRegistry>,
    write_options: BulkOptions,
    cursor_settings: CursorSettings,
}

impl Client {
    /// Validates `config` and connects.
    pub async fn connect(config: &Config) -> Result<Self, ClientError> {
        config
            .validate()
            .map_err(|e| ClientError::InvalidArgument(e.to_string()))?;

        let mut client = Self::connect_with(
            config.to_connection_config(),
            config.topology,
            &ConnectOverrides::default(),
        )
        .await?;
        client.write_options = BulkOptions::default().with_write_concern(config.write_concern.clone());
        client.cursor_settings = config.cursor.clone();
        Ok(client)
    }

    /// Connects with an explicit connection configuration.
    pub async fn connect_with(
        config: ConnectionConfig,
        topology: TopologyKind,
        overrides: &ConnectOverrides,
    ) -> Result<Self, ClientError> {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = Dispatcher::connect(
            config,
            Some(registry.clone()),
            Arc::new(JsonCodec::new()),
            overrides,
        )
        .await?;
        Ok(Self {
            wire: WireProtocol::new(dispatcher, topology),
            registry,
            write_options: BulkOptions::default(),
            cursor_settings: CursorSettings::default(),
        })
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.wire.is_connected()
    }

    /// Closes the connection.
    pub async fn close(&self) {
        self.wire.dispatcher().close().await;
    }

    pub fn wire(&self) -> &WireProtocol {
        &self.wire
    }

    /// Connection registry, disabled until [`ConnectionRegistry::enable`].
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Write options used when none are given.
    pub fn write_options(&self) -> &BulkOptions {
        &self.write_options
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Runs an admin command against `db`.
    pub async fn command(&self, db: &str, command: Document) -> Result<Document, ClientError> {
        self.wire.run_command(db, command, None).await
    }

    /// Runs a command with a read preference.
    pub async fn command_with_read_preference(
        &self,
        db: &str,
        command: Document,
        read_preference: &ReadPreference,
    ) -> Result<Document, ClientError> {
        self.wire.run_command(db, command, Some(read_preference)).await
    }

    /// Asks the server to describe itself.
    pub async fn ping(&self) -> Result<Document, ClientError> {
        let mut command = Document::new();
        command.insert("ismaster".to_string(), json!(1));
        self.command("admin", command).await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Opens a cursor over `filter` in `ns`.
    pub fn find(&self, ns: &str, filter: Document) -> Cursor {
        let mut find = FindCommand::new(filter);
        find.batch_size = Some(self.cursor_settings.batch_size);
        Cursor::find(self.wire.clone(), ns, find).with_options(self.cursor_settings.options())
    }

    /// Opens a cursor over a command that returns one.
    pub fn command_cursor(&self, ns: &str, command: Document) -> Cursor {
        Cursor::command(self.wire.clone(), ns, command)
            .with_options(self.cursor_settings.options())
    }

    /// Counts the documents matching `filter`.
    pub async fn count(&self, ns: &str, filter: Document) -> Result<i64, ClientError> {
        self.find(ns, filter)
            .count(false, &CountOptions::default())
            .await
    }

    // =========================================================================
    // Writes
    // =========================================================================

    pub async fn insert(
        &self,
        ns: &str,
        documents: Vec<Document>,
        options: Option<&BulkOptions>,
    ) -> Result<BulkWriteResult, ClientError> {
        let options = options.unwrap_or(&self.write_options);
        self.wire.insert(ns, documents, options).await
    }

    pub async fn update(
        &self,
        ns: &str,
        updates: Vec<UpdateSpec>,
        options: Option<&BulkOptions>,
    ) -> Result<BulkWriteResult, ClientError> {
        let options = options.unwrap_or(&self.write_options);
        self.wire.update(ns, updates, options).await
    }

    pub async fn remove(
        &self,
        ns: &str,
        removes: Vec<RemoveSpec>,
        options: Option<&BulkOptions>,
    ) -> Result<BulkWriteResult, ClientError> {
        let options = options.unwrap_or(&self.write_options);
        self.wire.remove(ns, removes, options).await
    }
}
