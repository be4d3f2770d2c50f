// Per-connection call router.
//
// Calls are handled one at a time in arrival order. A streaming call only
// occupies the dispatcher for its synchronous phases; generation then runs
// in a task tracked by call id so a later `abortChatCompletion` (or the
// connection closing) can interrupt it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use parley_common::protocol::errors::ErrorCode;
use parley_common::protocol::rpc::{CallId, Request, ServerMessage};
use parley_common::protocol::rpc_methods::{method_kind, MethodKind, ABORT_CHAT_COMPLETION};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ServiceError;
use crate::rpc::methods::{dispatch_call, parse_params, start_completion, CallContext, RpcServerState};
use crate::rpc::trace::{current_trace_id, trace_id_for_params, with_trace_id_scope};
use crate::session::Outbound;
use crate::sync::lock_guard;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AbortParams {
    call_id: CallId,
}

pub struct Connection {
    ctx: CallContext,
    state: RpcServerState,
    outbound: mpsc::UnboundedSender<Outbound>,
    streams: Arc<Mutex<HashMap<CallId, CancellationToken>>>,
    cancel_all: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
}

impl Connection {
    pub fn new(
        ctx: CallContext,
        state: RpcServerState,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        Self {
            ctx,
            state,
            outbound,
            streams: Arc::new(Mutex::new(HashMap::new())),
            cancel_all: CancellationToken::new(),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Route one decoded request inside its own trace scope.
    pub async fn handle(&self, request: Request) {
        let trace_id = trace_id_for_params(&request.params);
        with_trace_id_scope(trace_id, self.route(request)).await;
    }

    /// Queue a reply that has no request behind it, e.g. a malformed frame.
    pub fn reply_error(&self, id: Option<CallId>, error: ServiceError) {
        self.send(ServerMessage::error(id, error.into_rpc()));
    }

    /// Interrupt every in-flight stream and wait for their tasks to record
    /// the outcome.
    pub async fn close(&self) {
        self.cancel_all.cancel();
        let mut tasks = std::mem::take(&mut *lock_guard(&self.tasks));
        while let Some(joined) = tasks.join_next().await {
            if let Err(error) = joined {
                warn!(error = %error, "completion task failed");
            }
        }
    }

    async fn route(&self, request: Request) {
        let id = request.id;
        debug!(
            call_id = id,
            method = %request.method,
            session_id = %self.ctx.session_id,
            trace_id = ?current_trace_id(),
            "rpc call"
        );

        match method_kind(&request.method) {
            None => self.reply_error(
                Some(id),
                ServiceError::new(
                    ErrorCode::NotImplemented,
                    format!("method `{}` is not implemented", request.method),
                ),
            ),
            Some(MethodKind::Call) => match dispatch_call(request, &self.ctx, &self.state).await {
                Ok(result) => self.send(ServerMessage::result(id, result)),
                Err(error) => self.reply_error(Some(id), error),
            },
            Some(MethodKind::Stream) => self.start_stream(request),
            Some(MethodKind::Post) => self.post(request),
        }
    }

    fn start_stream(&self, request: Request) {
        let id = request.id;
        if lock_guard(&self.streams).contains_key(&id) {
            self.reply_error(
                Some(id),
                ServiceError::bad_request(format!("call id {id} already has a stream in flight")),
            );
            return;
        }

        let active = match start_completion(request.params, &self.ctx, &self.state) {
            Ok(active) => active,
            Err(error) => {
                self.reply_error(Some(id), error);
                return;
            }
        };

        let cancel = self.cancel_all.child_token();
        lock_guard(&self.streams).insert(id, cancel.clone());

        let outbound = self.outbound.clone();
        let streams = Arc::clone(&self.streams);
        let trace_id = current_trace_id().unwrap_or_default();
        let task = async move {
            let tokens = outbound.clone();
            let forward = move |token: &str| {
                let partial = ServerMessage::result(id, json!({ "token": token }));
                tokens.send(Outbound::Message(partial)).is_ok()
            };
            let outcome = active.run(cancel, forward).await;
            lock_guard(&streams).remove(&id);

            let frame = match outcome.and_then(|done| {
                serde_json::to_value(done).map_err(|error| {
                    ServiceError::internal(format!("failed to encode result: {error}"))
                })
            }) {
                Ok(result) => ServerMessage::stream_end(id, result),
                Err(error) => {
                    debug!(call_id = id, error = %error, "stream ended with error");
                    ServerMessage::error(Some(id), error.into_rpc())
                }
            };
            // The socket may already be gone; the outcome is recorded either way.
            let _ = outbound.send(Outbound::Message(frame));
        };

        let mut tasks = lock_guard(&self.tasks);
        while tasks.try_join_next().is_some() {}
        tasks.spawn(with_trace_id_scope(trace_id, task));
    }

    /// Posts are never answered, not even with an error.
    fn post(&self, request: Request) {
        if request.method != ABORT_CHAT_COMPLETION {
            debug!(method = %request.method, "ignoring unhandled post");
            return;
        }
        let params: AbortParams = match parse_params(request.params) {
            Ok(params) => params,
            Err(error) => {
                debug!(error = %error, "ignoring malformed abort");
                return;
            }
        };
        match lock_guard(&self.streams).get(&params.call_id) {
            Some(cancel) => {
                cancel.cancel();
                debug!(call_id = params.call_id, "stream abort requested");
            }
            None => debug!(call_id = params.call_id, "abort for unknown stream"),
        }
    }

    fn send(&self, message: ServerMessage) {
        if self.outbound.send(Outbound::Message(message)).is_err() {
            debug!(session_id = %self.ctx.session_id, "dropping reply for closed connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parley_common::protocol::errors::ErrorCode;
    use parley_common::protocol::rpc::{Request, ServerMessage};
    use parley_common::types::{ModelConfig, UserRole};
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::Connection;
    use crate::auth::UserIdentity;
    use crate::rpc::methods::{CallContext, RpcServerState};
    use crate::session::Outbound;

    fn open(state: &RpcServerState) -> (Connection, mpsc::UnboundedReceiver<Outbound>) {
        let user_id = state.users().create("alice", "pw", UserRole::User).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let registration = state.sessions().register(user_id, tx.clone());
        let ctx = CallContext {
            session_id: registration.session_id,
            user: UserIdentity { user_id, username: "alice".into(), role: UserRole::User },
        };
        (Connection::new(ctx, state.clone(), tx), rx)
    }

    async fn next_message(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> ServerMessage {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(Outbound::Message(message))) => message,
            other => panic!("expected a reply, got {other:?}"),
        }
    }

    async fn locked_chat(connection: &Connection, rx: &mut mpsc::UnboundedReceiver<Outbound>) -> String {
        connection.handle(Request::new(1, "newChat", json!({}))).await;
        let ServerMessage::Result { result, .. } = next_message(rx).await else {
            panic!("newChat failed");
        };
        let chat_id = result["id"].as_str().unwrap().to_string();
        connection.handle(Request::new(2, "lockChat", json!({ "id": chat_id }))).await;
        next_message(rx).await;
        chat_id
    }

    fn echo_model(state: &RpcServerState, delay_ms: u64) {
        state
            .models()
            .insert(ModelConfig {
                id: "echo".into(),
                display_name: "Echo".into(),
                provider: "echo".into(),
                params: json!({ "delayMs": delay_ms }),
            })
            .unwrap();
    }

    #[tokio::test]
    async fn stream_sends_tokens_then_end() {
        let state = RpcServerState::new();
        echo_model(&state, 0);
        let (connection, mut rx) = open(&state);
        let chat_id = locked_chat(&connection, &mut rx).await;

        connection
            .handle(Request::new(
                7,
                "chatCompletion",
                json!({ "id": chat_id, "modelId": "echo", "userMessage": { "content": "hi there" } }),
            ))
            .await;

        assert_eq!(next_message(&mut rx).await, ServerMessage::result(7, json!({ "token": "hi" })));
        assert_eq!(next_message(&mut rx).await, ServerMessage::result(7, json!({ "token": " there" })));
        match next_message(&mut rx).await {
            ServerMessage::StreamEnd { id, result, .. } => {
                assert_eq!(id, 7);
                assert!(result["assistantMessageId"].is_string());
            }
            other => panic!("expected stream end, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn abort_interrupts_and_is_not_answered() {
        let state = RpcServerState::new();
        echo_model(&state, 200);
        let (connection, mut rx) = open(&state);
        let chat_id = locked_chat(&connection, &mut rx).await;

        connection
            .handle(Request::new(
                9,
                "chatCompletion",
                json!({ "id": chat_id, "modelId": "echo", "userMessage": { "content": "a b c d" } }),
            ))
            .await;
        connection.handle(Request::new(10, "abortChatCompletion", json!({ "callId": 9 }))).await;
        connection.handle(Request::new(11, "abortChatCompletion", json!({ "callId": 404 }))).await;

        loop {
            match next_message(&mut rx).await {
                ServerMessage::Result { id: 9, .. } => continue,
                ServerMessage::Error { id, error } => {
                    assert_eq!(id, Some(9));
                    assert_eq!(error.error_code(), Some(ErrorCode::StreamInterrupted));
                    break;
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert!(rx.try_recv().is_err());
        assert!(!state.locks().state(&chat_id).is_streaming());
    }

    #[tokio::test]
    async fn close_cancels_streams_in_flight() {
        let state = RpcServerState::new();
        echo_model(&state, 200);
        let (connection, mut rx) = open(&state);
        let chat_id = locked_chat(&connection, &mut rx).await;

        connection
            .handle(Request::new(
                3,
                "chatCompletion",
                json!({ "id": chat_id, "modelId": "echo", "userMessage": { "content": "slow words" } }),
            ))
            .await;
        connection.close().await;

        assert!(!state.locks().state(&chat_id).is_streaming());
        let mut terminal = None;
        while let Ok(Outbound::Message(message)) = rx.try_recv() {
            if message.is_terminal() {
                terminal = Some(message);
            }
        }
        match terminal {
            Some(ServerMessage::Error { id, error }) => {
                assert_eq!(id, Some(3));
                assert_eq!(error.error_code(), Some(ErrorCode::StreamInterrupted));
            }
            other => panic!("expected interrupted stream, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_stream_id_and_unknown_method() {
        let state = RpcServerState::new();
        echo_model(&state, 200);
        let (connection, mut rx) = open(&state);
        let chat_id = locked_chat(&connection, &mut rx).await;
        let params = json!({ "id": chat_id, "modelId": "echo", "userMessage": { "content": "x y" } });

        connection.handle(Request::new(5, "chatCompletion", params.clone())).await;
        connection.handle(Request::new(5, "chatCompletion", params)).await;
        loop {
            match next_message(&mut rx).await {
                ServerMessage::Result { id: 5, .. } => continue,
                ServerMessage::Error { id, error } => {
                    assert_eq!(id, Some(5));
                    assert_eq!(error.error_code(), Some(ErrorCode::BadRequest));
                    break;
                }
                other => panic!("expected duplicate-id error, got {other:?}"),
            }
        }

        connection.handle(Request::new(6, "summonDragon", json!({}))).await;
        loop {
            if let ServerMessage::Error { id: Some(6), error } = next_message(&mut rx).await {
                assert_eq!(error.error_code(), Some(ErrorCode::NotImplemented));
                break;
            }
        }
        connection.close().await;
    }
}
