//! Reply dispatch.
//!
//! The connection knows nothing about payloads. The [`Dispatcher`] owns a
//! connection, keeps the set of requests still waiting for an answer, and
//! routes every framed reply to its waiter by the `responseTo` header field.

use crate::connection::{
    ConnectOverrides, Connection, ConnectionConfig, ConnectionEvent, ConnectionObserver,
};
use crate::error::ClientError;
use crate::registry::ConnectionRegistry;
use bytes::Bytes;
use dashmap::DashMap;
use docwire_protocol::{DecodeOptions, DocumentCodec, Reply, RequestMessage};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

type PendingMap = DashMap<i32, oneshot::Sender<Result<Bytes, ClientError>>>;

/// Routes framed replies to the requests waiting for them.
struct ReplyRouter {
    pending: Arc<PendingMap>,
}

impl ReplyRouter {
    fn fail_all(&self, make_error: impl Fn() -> ClientError) {
        let ids: Vec<i32> = self.pending.iter().map(|entry| *entry.key()).collect();
        if !ids.is_empty() {
            tracing::debug!("Failing {} pending requests", ids.len());
        }
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(make_error()));
            }
        }
    }
}

impl ConnectionObserver for ReplyRouter {
    fn on_event(&self, connection_id: u64, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::Connect => {}
            ConnectionEvent::Message(bytes) => match Reply::peek_response_to(bytes) {
                Ok(response_to) => {
                    if let Some((_, tx)) = self.pending.remove(&response_to) {
                        tracing::trace!("dispatching reply to request {}", response_to);
                        let _ = tx.send(Ok(bytes.clone()));
                    } else {
                        tracing::debug!("no pending request for responseTo={}", response_to);
                    }
                }
                Err(e) => {
                    tracing::warn!("connection {}: unreadable reply header: {}", connection_id, e)
                }
            },
            ConnectionEvent::ParseError { error, state } => {
                tracing::warn!(
                    "connection {}: discarded input after parse error: {} ({:?})",
                    connection_id,
                    error,
                    state
                );
            }
            ConnectionEvent::Error { message, .. } => self.fail_all(|| {
                ClientError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    message.clone(),
                ))
            }),
            ConnectionEvent::Timeout(message) => {
                self.fail_all(|| ClientError::Timeout(message.clone()))
            }
            ConnectionEvent::Close(_) => self.fail_all(|| ClientError::ConnectionClosed),
        }
    }
}

/// A request whose reply has not arrived yet.
pub struct PendingReply {
    request_id: i32,
    rx: oneshot::Receiver<Result<Bytes, ClientError>>,
}

impl PendingReply {
    pub fn request_id(&self) -> i32 {
        self.request_id
    }

    /// Waits for the raw reply message.
    pub async fn wait(self) -> Result<Bytes, ClientError> {
        self.rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }
}

/// A connection plus request/reply correlation.
pub struct Dispatcher {
    connection: Arc<Connection>,
    pending: Arc<PendingMap>,
    codec: Arc<dyn DocumentCodec>,
    read_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Connects and starts the background read loop.
    pub async fn connect(
        config: ConnectionConfig,
        registry: Option<Arc<ConnectionRegistry>>,
        codec: Arc<dyn DocumentCodec>,
        overrides: &ConnectOverrides,
    ) -> Result<Arc<Self>, ClientError> {
        let connection = Arc::new(Connection::new(config, registry));
        let dispatcher = Self::attach(connection.clone(), codec);
        connection.connect(overrides).await?;
        dispatcher.start();
        Ok(dispatcher)
    }

    /// Wraps a connection that has not connected yet.
    pub fn attach(connection: Arc<Connection>, codec: Arc<dyn DocumentCodec>) -> Arc<Self> {
        let pending = Arc::new(PendingMap::new());
        connection.add_observer(Arc::new(ReplyRouter {
            pending: pending.clone(),
        }));
        Arc::new(Self {
            connection,
            pending,
            codec,
            read_task: parking_lot::Mutex::new(None),
        })
    }

    /// Spawns the read loop of a connected connection.
    pub fn start(&self) {
        let connection = self.connection.clone();
        let handle = tokio::spawn(async move { connection.read_loop().await });
        *self.read_task.lock() = Some(handle);
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn codec(&self) -> &dyn DocumentCodec {
        self.codec.as_ref()
    }

    /// Decode options for replies.
    pub fn promote(&self) -> DecodeOptions {
        self.connection.promote_options()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Number of requests waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn unusable(&self) -> ClientError {
        if self.connection.is_destroyed() {
            let info = self.connection.info();
            ClientError::ConnectionDestroyed {
                host: info.host,
                port: info.port,
            }
        } else if !self.connection.is_connected() {
            ClientError::NotConnected
        } else {
            ClientError::ConnectionClosed
        }
    }

    /// Writes `buffers` in one go and registers interest in the reply to
    /// `request_id`.
    ///
    /// The waiter is registered before the write so a fast reply is never lost.
    pub async fn dispatch(
        &self,
        buffers: &[Bytes],
        request_id: i32,
    ) -> Result<PendingReply, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);

        if !self.connection.write(buffers).await {
            self.pending.remove(&request_id);
            return Err(self.unusable());
        }

        Ok(PendingReply { request_id, rx })
    }

    /// Writes buffers that expect no reply.
    pub async fn send(&self, buffers: &[Bytes]) -> Result<(), ClientError> {
        if self.connection.write(buffers).await {
            Ok(())
        } else {
            Err(self.unusable())
        }
    }

    /// Sends a request and parses its reply, with the connection's decode
    /// options unless `promote` overrides them.
    pub async fn request(
        &self,
        message: &RequestMessage,
        promote: Option<DecodeOptions>,
    ) -> Result<Reply, ClientError> {
        let bytes = message.encode(self.codec())?;
        tracing::debug!(
            "request id={} ({} bytes)",
            message.request_id(),
            bytes.len()
        );
        let raw = self
            .dispatch(&[bytes], message.request_id())
            .await?
            .wait()
            .await?;
        let promote = promote.unwrap_or_else(|| self.promote());
        self.parse_reply_with(&raw, &promote)
    }

    /// Parses a raw reply with this connection's codec and decode options.
    pub fn parse_reply(&self, raw: &[u8]) -> Result<Reply, ClientError> {
        Ok(Reply::parse(raw, self.codec(), &self.promote())?)
    }

    /// Parses a raw reply with explicit decode options.
    pub fn parse_reply_with(
        &self,
        raw: &[u8],
        promote: &DecodeOptions,
    ) -> Result<Reply, ClientError> {
        Ok(Reply::parse(raw, self.codec(), promote)?)
    }

    /// Destroys the connection and fails every outstanding request.
    pub async fn close(&self) {
        self.connection.destroy().await;
        let ids: Vec<i32> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(ClientError::ConnectionClosed));
            }
        }
        if let Some(handle) = self.read_task.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockServer;
    use docwire_protocol::{to_document, JsonCodec, Query};
    use serde_json::json;

    #[tokio::test]
    async fn test_request_reply_correlation() {
        let server = MockServer::start(|request| {
            let RequestMessage::Query(query) = request else {
                return None;
            };
            Some(Reply::new(0, vec![query.query.clone()]))
        })
        .await;
        let dispatcher = server.dispatcher().await;

        let a = Query::new("db.$cmd", to_document(json!({"ping": 1})).unwrap(), 0, -1);
        let b = Query::new("db.$cmd", to_document(json!({"ping": 2})).unwrap(), 0, -1);
        let a = RequestMessage::Query(a);
        let b = RequestMessage::Query(b);
        let (ra, rb) = tokio::join!(dispatcher.request(&a, None), dispatcher.request(&b, None));
        assert_eq!(ra.unwrap().first().unwrap()["ping"], json!(1));
        assert_eq!(rb.unwrap().first().unwrap()["ping"], json!(2));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_pending() {
        let server = MockServer::start(|_| None).await;
        let dispatcher = server.dispatcher().await;

        let query = Query::new("db.$cmd", to_document(json!({"ping": 1})).unwrap(), 0, -1);
        let bytes = query.encode(&JsonCodec::new()).unwrap();
        let pending = dispatcher.dispatch(&[bytes], query.request_id).await.unwrap();
        assert_eq!(pending.request_id(), query.request_id);

        dispatcher.close().await;
        assert!(matches!(pending.wait().await, Err(ClientError::ConnectionClosed)));
        assert!(matches!(
            dispatcher.send(&[Bytes::from_static(b"x")]).await,
            Err(ClientError::ConnectionDestroyed { .. })
        ));
    }

    #[tokio::test]
    async fn test_server_close_fails_pending() {
        let server = MockServer::start(|_| None).await;
        let dispatcher = server.dispatcher().await;

        let query = Query::new("db.$cmd", to_document(json!({"ping": 1})).unwrap(), 0, -1);
        let bytes = query.encode(&JsonCodec::new()).unwrap();
        let pending = dispatcher.dispatch(&[bytes], query.request_id).await.unwrap();

        server.disconnect_clients();
        assert!(pending.wait().await.is_err());
    }
}
