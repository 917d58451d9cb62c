//! # docwire-client
//!
//! Client library for the legacy document-database wire protocol.
//!
//! This crate provides:
//! - Async TCP, TLS and Unix-socket connections with reply framing
//! - Request/reply correlation over one connection
//! - Find, getMore, killCursors and admin command builders
//! - Ordered and unordered legacy writes acknowledged with getlasterror
//! - Cursors with a pull API and a `futures::Stream` adapter
//! - YAML and environment configuration

pub mod bulk;
pub mod client;
pub mod command;
pub mod config;
pub mod connection;
pub mod cursor;
pub mod cursor_stream;
pub mod dispatch;
pub mod error;
pub mod registry;
pub mod state;
pub mod stream;
pub mod tls;
pub mod wire;

#[cfg(test)]
mod testing;

pub use bulk::{
    Acknowledgment, BulkOptions, BulkWriteResult, RemoveSpec, UpdateSpec, Upserted,
    WriteConcern, WriteConcernError, WriteError,
};
pub use client::Client;
pub use command::{
    CountOptions, CursorFlags, FindCommand, ReadConcern, ReadPreference, ReadPreferenceMode,
    SortDirection, TopologyKind,
};
pub use config::{Config, ConfigError};
pub use connection::{
    AddressFamily, ConnectOverrides, Connection, ConnectionConfig, ConnectionEvent,
    ConnectionObserver, TlsClientConfig,
};
pub use cursor::{Cursor, CursorOptions, CursorPhase, CursorSource, Namespace};
pub use cursor_stream::CursorStream;
pub use dispatch::Dispatcher;
pub use error::ClientError;
pub use registry::{ConnectionInfo, ConnectionRegistry};
pub use state::CursorState;
pub use wire::WireProtocol;
