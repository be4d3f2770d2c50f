use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use parley_common::protocol::rpc::{CallId, Request, ServerMessage};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::{extract_bearer_credentials, UserIdentity};
use crate::error::ServiceError;
use crate::rpc::connection::Connection;
use crate::rpc::methods::{disconnect_session, CallContext, RpcServerState};
use crate::session::Outbound;

pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

pub fn router(state: RpcServerState) -> Router {
    Router::new()
        .route("/rpc", get(rpc_ws_route))
        .route("/healthz", get(healthz))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: RpcServerState) -> Result<()> {
    serve_until(listener, state, std::future::pending()).await
}

/// Serve until `shutdown` resolves, then stop accepting connections.
pub async fn serve_until<F>(listener: TcpListener, state: RpcServerState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("parley rpc websocket server failed")
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn rpc_ws_route(
    State(state): State<RpcServerState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let user = match authenticate(&state, &headers).await {
        Ok(user) => user,
        Err(error) => return error.into_response(),
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    ws.max_frame_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, state, user))
}

async fn authenticate(state: &RpcServerState, headers: &HeaderMap) -> Result<UserIdentity, ServiceError> {
    let header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ServiceError::unauthorized("missing bearer credentials"))?;
    let (username, credential) = extract_bearer_credentials(header)
        .ok_or_else(|| ServiceError::unauthorized("malformed bearer credentials"))?;

    match state.authenticator().authenticate(username, credential).await {
        Some(user) => Ok(user),
        None => {
            warn!(username, "rejected websocket upgrade");
            Err(ServiceError::unauthorized("invalid credentials"))
        }
    }
}

async fn handle_socket(mut socket: WebSocket, state: RpcServerState, user: UserIdentity) {
    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<Outbound>();
    let registration = state.sessions().register(user.user_id, outbound_sender.clone());
    let session_id = registration.session_id;
    info!(%session_id, user_id = %user.user_id, username = %user.username, "session opened");

    let connection =
        Arc::new(Connection::new(CallContext { session_id, user }, state.clone(), outbound_sender));

    // Calls from one session are handled strictly in arrival order.
    let (request_sender, mut request_receiver) = mpsc::unbounded_channel::<Request>();
    let dispatcher = {
        let connection = Arc::clone(&connection);
        tokio::spawn(async move {
            while let Some(request) = request_receiver.recv().await {
                connection.handle(request).await;
            }
        })
    };

    let mut next_push_id: CallId = 1;
    loop {
        tokio::select! {
            _ = registration.closed.cancelled() => {
                debug!(%session_id, "server closed session");
                let _ = socket.send(WsMessage::Close(None)).await;
                break;
            }
            maybe_outbound = outbound_receiver.recv() => {
                let Some(outbound) = maybe_outbound else {
                    break;
                };
                let frame = match outbound {
                    Outbound::Message(message) => message,
                    Outbound::Push(push) => {
                        let id = next_push_id;
                        next_push_id += 1;
                        ServerMessage::push(id, push.method(), push.params())
                    }
                };
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
            maybe_message = socket.recv() => {
                let Some(Ok(message)) = maybe_message else {
                    break;
                };
                let payload = match message {
                    WsMessage::Text(payload) => decode_request(payload.as_bytes()),
                    WsMessage::Binary(payload) => decode_request(payload.as_ref()),
                    WsMessage::Ping(payload) => {
                        if socket.send(WsMessage::Pong(payload)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    WsMessage::Pong(_) => continue,
                    WsMessage::Close(_) => break,
                };
                match payload {
                    Ok(request) => {
                        if request_sender.send(request).is_err() {
                            break;
                        }
                    }
                    Err((id, error)) => connection.reply_error(id, error),
                }
            }
        }
    }

    dispatcher.abort();
    connection.close().await;
    disconnect_session(&state, session_id);
    info!(%session_id, "session closed");
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerMessage) -> Result<()> {
    let encoded = serde_json::to_string(frame).context("failed to encode server frame")?;
    socket.send(WsMessage::Text(encoded.into())).await.context("failed to send server frame")
}

/// Decode one client frame. On failure, recover the call id when the frame
/// is at least a JSON object carrying a numeric `id`.
fn decode_request(payload: &[u8]) -> Result<Request, (Option<CallId>, ServiceError)> {
    serde_json::from_slice::<Request>(payload).map_err(|error| {
        let id = serde_json::from_slice::<Value>(payload)
            .ok()
            .and_then(|value| value.get("id").and_then(Value::as_u64));
        (id, ServiceError::bad_request(format!("malformed request: {error}")))
    })
}
