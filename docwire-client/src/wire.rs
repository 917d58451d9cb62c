//! Wire protocol operations over a dispatcher.

use crate::command::{build_admin_command, ReadPreference, TopologyKind};
use crate::dispatch::Dispatcher;
use crate::error::ClientError;
use crate::state::CursorState;
use docwire_protocol::{
    CursorId, DecodeOptions, Document, GetMore, KillCursors, Query, Reply, RequestMessage,
};
use serde_json::Value;
use std::sync::Arc;

/// Issues legacy requests on one connection.
#[derive(Clone)]
pub struct WireProtocol {
    pub(crate) dispatcher: Arc<Dispatcher>,
    topology: TopologyKind,
}

impl WireProtocol {
    pub fn new(dispatcher: Arc<Dispatcher>, topology: TopologyKind) -> Self {
        Self {
            dispatcher,
            topology,
        }
    }

    pub fn topology(&self) -> TopologyKind {
        self.topology
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn is_connected(&self) -> bool {
        self.dispatcher.is_connected()
    }

    /// Sends a query and returns the raw reply.
    pub async fn query(
        &self,
        query: Query,
        promote: Option<DecodeOptions>,
    ) -> Result<Reply, ClientError> {
        tracing::debug!("query ns={} id={}", query.ns, query.request_id);
        self.dispatcher
            .request(&RequestMessage::Query(query), promote)
            .await
    }

    /// Fetches the next batch of an open server cursor into `state`.
    ///
    /// A "cursor not found" reply leaves `state` untouched.
    pub async fn get_more(
        &self,
        ns: &str,
        state: &mut CursorState,
        batch_size: i32,
    ) -> Result<(), ClientError> {
        let cursor_id = state.cursor_id.unwrap_or(CursorId::ZERO);
        tracing::debug!("getMore ns={} cursor={} batch={}", ns, cursor_id, batch_size);
        let message = RequestMessage::GetMore(GetMore::new(ns, batch_size, cursor_id));
        let reply = self.dispatcher.request(&message, state.promote).await?;

        if reply.response_flags.is_cursor_not_found() {
            return Err(ClientError::CursorNotFound);
        }

        state.documents = reply.documents.into();
        state.cursor_id = Some(reply.cursor_id);
        Ok(())
    }

    /// Tells the server to release a cursor. Does nothing when not connected.
    pub async fn kill_cursor(&self, cursor_id: CursorId) -> Result<(), ClientError> {
        if !self.dispatcher.is_connected() {
            return Ok(());
        }
        tracing::debug!("killCursors cursor={}", cursor_id);
        let message = KillCursors::new(vec![cursor_id]);
        self.dispatcher.send(&[message.encode()]).await
    }

    /// Runs an admin command and returns its result document.
    pub async fn run_command(
        &self,
        ns: &str,
        command: Document,
        read_preference: Option<&ReadPreference>,
    ) -> Result<Document, ClientError> {
        let query = build_admin_command(ns, command, read_preference, self.topology)?;
        let reply = self.query(query, None).await?;
        let doc = reply.first()?;
        if reply.response_flags.is_query_failure() || doc.contains_key("$err") || is_not_ok(doc)
        {
            return Err(server_error(doc));
        }
        Ok(doc.clone())
    }
}

fn is_not_ok(doc: &Document) -> bool {
    match doc.get("ok") {
        Some(Value::Number(n)) => n.as_f64() == Some(0.0),
        Some(Value::Bool(b)) => !b,
        _ => false,
    }
}

/// Builds a server error from a failure document.
pub(crate) fn server_error(doc: &Document) -> ClientError {
    let code = doc
        .get("code")
        .and_then(Value::as_i64)
        .and_then(|c| i32::try_from(c).ok());
    let message = ["$err", "errmsg", "err"]
        .iter()
        .find_map(|key| doc.get(*key).and_then(Value::as_str))
        .unwrap_or("unknown server error")
        .to_string();
    ClientError::ServerError { code, message }
}

/// Reads a cursor id that may be a plain number or a wrapped 64-bit value.
pub(crate) fn cursor_id_from_value(value: &Value) -> Option<CursorId> {
    match value {
        Value::Number(n) => n.as_i64().map(CursorId::new),
        Value::Object(map) => map
            .get("$numberLong")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<i64>().ok())
            .map(CursorId::new),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{doc, reply, MockServer};
    use docwire_protocol::ResponseFlags;
    use serde_json::json;

    #[tokio::test]
    async fn test_get_more_updates_state() {
        let server = MockServer::start(|request| match request {
            RequestMessage::GetMore(get_more) => {
                assert_eq!(get_more.number_to_return, 7);
                Some(
                    Reply::new(0, vec![doc(json!({"a": 1})), doc(json!({"a": 2}))])
                        .with_cursor_id(CursorId::new(0)),
                )
            }
            _ => None,
        })
        .await;
        let wire = WireProtocol::new(server.dispatcher().await, TopologyKind::Single);

        let mut state = CursorState::default();
        state.cursor_id = Some(CursorId::new(42));
        wire.get_more("db.c", &mut state, 7).await.unwrap();
        assert_eq!(state.documents.len(), 2);
        assert_eq!(state.cursor_id, Some(CursorId::ZERO));

        let requests = server.requests();
        let RequestMessage::GetMore(sent) = &requests[0] else {
            panic!("expected getMore");
        };
        assert_eq!(sent.cursor_id, CursorId::new(42));
        assert_eq!(sent.ns, "db.c");
    }

    #[tokio::test]
    async fn test_get_more_cursor_not_found_leaves_state() {
        let server = MockServer::start(|_| {
            Some(Reply::new(0, Vec::new()).with_flags(ResponseFlags::new().with_cursor_not_found()))
        })
        .await;
        let wire = WireProtocol::new(server.dispatcher().await, TopologyKind::Single);

        let mut state = CursorState::default();
        state.cursor_id = Some(CursorId::new(5));
        state.documents.push_back(doc(json!({"kept": true})));

        let err = wire.get_more("db.c", &mut state, 10).await.unwrap_err();
        assert!(matches!(err, ClientError::CursorNotFound));
        assert_eq!(err.to_string(), "cursor does not exist, was killed or timed out");
        assert_eq!(state.documents.len(), 1);
        assert_eq!(state.cursor_id, Some(CursorId::new(5)));
    }

    #[tokio::test]
    async fn test_kill_cursor_fire_and_forget() {
        let server = MockServer::start(|_| None).await;
        let dispatcher = server.dispatcher().await;
        let wire = WireProtocol::new(dispatcher.clone(), TopologyKind::Single);

        wire.kill_cursor(CursorId::new(77)).await.unwrap();
        let requests = server.wait_for_requests(1).await;
        assert!(matches!(
            &requests[0],
            RequestMessage::KillCursors(k) if k.cursor_ids == vec![CursorId::new(77)]
        ));

        dispatcher.close().await;
        wire.kill_cursor(CursorId::new(78)).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_command() {
        let server = MockServer::start(|request| {
            let RequestMessage::Query(query) = request else {
                return None;
            };
            if query.query.contains_key("ismaster") {
                Some(reply(json!({"ismaster": true, "ok": 1})))
            } else {
                Some(reply(json!({"ok": 0, "errmsg": "no such command", "code": 59})))
            }
        })
        .await;
        let wire = WireProtocol::new(server.dispatcher().await, TopologyKind::Single);

        let result = wire
            .run_command("admin", doc(json!({"ismaster": 1})), None)
            .await
            .unwrap();
        assert_eq!(result["ismaster"], json!(true));

        let err = wire
            .run_command("admin", doc(json!({"bogus": 1})), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(59));
        assert_eq!(err.to_string(), "server error 59: no such command");

        let requests = server.requests();
        let RequestMessage::Query(sent) = &requests[0] else {
            panic!("expected query");
        };
        assert_eq!(sent.ns, "admin.$cmd");
        assert_eq!(sent.number_to_return, -1);
    }

    #[test]
    fn test_cursor_id_from_value() {
        assert_eq!(cursor_id_from_value(&json!(12)), Some(CursorId::new(12)));
        assert_eq!(
            cursor_id_from_value(&json!({"$numberLong": "9000000000"})),
            Some(CursorId::new(9_000_000_000))
        );
        assert_eq!(cursor_id_from_value(&json!("12")), None);
    }
}
