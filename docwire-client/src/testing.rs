//! In-process server used by the tests.

use crate::connection::{ConnectOverrides, ConnectionConfig};
use crate::dispatch::Dispatcher;
use docwire_protocol::{
    to_document, Document, FrameEvent, FrameParser, JsonCodec, Reply,
    RequestMessage, DEFAULT_MAX_MESSAGE_SIZE,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;

type Handler = dyn Fn(&RequestMessage) -> Option<Reply> + Send + Sync;

/// Accepts connections, records every decoded request, and answers with
/// whatever the handler returns. `None` means no reply.
pub struct MockServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<RequestMessage>>>,
    disconnect: Arc<watch::Sender<bool>>,
}

impl MockServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&RequestMessage) -> Option<Reply> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<Handler> = Arc::new(handler);
        let (disconnect, _) = watch::channel(false);
        let disconnect = Arc::new(disconnect);

        let recorded = requests.clone();
        let disconnect_tx = disconnect.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let handler = handler.clone();
                let recorded = recorded.clone();
                let mut disconnect_rx = disconnect_tx.subscribe();
                tokio::spawn(async move {
                    let codec = JsonCodec::new();
                    let mut parser = FrameParser::new(DEFAULT_MAX_MESSAGE_SIZE);
                    let mut buf = vec![0u8; 8192];
                    loop {
                        let n = tokio::select! {
                            _ = disconnect_rx.changed() => return,
                            read = socket.read(&mut buf) => match read {
                                Ok(0) | Err(_) => return,
                                Ok(n) => n,
                            },
                        };
                        for event in parser.push_slice(&buf[..n]) {
                            let FrameEvent::Message(bytes) = event else {
                                continue;
                            };
                            let request = RequestMessage::decode(&bytes, &codec).unwrap();
                            recorded.lock().push(request.clone());
                            if let Some(mut reply) = handler(&request) {
                                reply.response_to = request.request_id();
                                let out = reply.encode(&codec).unwrap();
                                if socket.write_all(&out).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            requests,
            disconnect,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn config(&self) -> ConnectionConfig {
        ConnectionConfig::new("127.0.0.1", self.addr.port())
    }

    pub async fn dispatcher(&self) -> Arc<Dispatcher> {
        Dispatcher::connect(
            self.config(),
            None,
            Arc::new(JsonCodec::new()),
            &ConnectOverrides::default(),
        )
        .await
        .unwrap()
    }

    /// Snapshot of the requests received so far.
    pub fn requests(&self) -> Vec<RequestMessage> {
        self.requests.lock().clone()
    }

    /// Waits until at least `count` requests have arrived.
    pub async fn wait_for_requests(&self, count: usize) -> Vec<RequestMessage> {
        for _ in 0..200 {
            if self.requests.lock().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.requests()
    }

    /// Drops every accepted socket.
    pub fn disconnect_clients(&self) {
        let _ = self.disconnect.send(true);
    }
}

pub fn doc(value: Value) -> Document {
    to_document(value).unwrap()
}

/// A single-document reply with no cursor.
pub fn reply(value: Value) -> Reply {
    Reply::new(0, vec![doc(value)])
}

