//! WebSocket ingress for client connections.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use batchline_common::{Envelope, EnvelopeKind, ErrorBody, ErrorKind, Hello, HelloAck};

use crate::router::InferenceRequest;
use crate::sink::ReplyTx;
use crate::{AppState, SERVER_VERSION};

type WsSender = SplitSink<WebSocket, Message>;

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    tracing::debug!("Client connection attempt from {}", addr);
    ws.on_upgrade(move |socket| handle_client(socket, state, addr))
}

/// Decrements the connected-clients counter when the connection ends.
struct ConnectionGuard(Arc<AppState>);

impl ConnectionGuard {
    fn new(state: Arc<AppState>) -> Self {
        state.connected_clients.fetch_add(1, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.connected_clients.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn handle_client(socket: WebSocket, state: Arc<AppState>, addr: SocketAddr) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let hello_timeout = Duration::from_secs(state.config.server.hello_timeout_secs);
    let hello = match timeout(hello_timeout, ws_rx.next()).await {
        Ok(Some(Ok(Message::Binary(data)))) => match parse_hello(data) {
            Ok(hello) => hello,
            Err(body) => {
                tracing::warn!("Rejected hello from {}: {}", addr, body.message);
                let _ = send_envelope(&mut ws_tx, &Envelope::error("", 0, &body)).await;
                return;
            }
        },
        Ok(Some(Ok(_))) => {
            tracing::warn!("Expected binary hello frame from {}", addr);
            let body = ErrorBody::new(ErrorKind::Protocol, "Expected binary hello frame");
            let _ = send_envelope(&mut ws_tx, &Envelope::error("", 0, &body)).await;
            return;
        }
        Ok(Some(Err(e))) => {
            tracing::warn!("WebSocket error during hello from {}: {}", addr, e);
            return;
        }
        Ok(None) => {
            tracing::debug!("Connection closed before hello from {}", addr);
            return;
        }
        Err(_) => {
            tracing::warn!("Hello timeout from {}", addr);
            let body = ErrorBody::new(ErrorKind::Timeout, "Hello timeout");
            let _ = send_envelope(&mut ws_tx, &Envelope::error("", 0, &body)).await;
            return;
        }
    };

    let identity = hello.identity;
    let ack = HelloAck {
        identity: identity.clone(),
        server_version: SERVER_VERSION.to_string(),
        protocol: state.config.server.protocol,
    };
    let ack = match Envelope::with_json(EnvelopeKind::HelloAck, &identity, 0, &ack) {
        Ok(ack) => ack,
        Err(e) => {
            tracing::error!("Failed to encode hello ack: {}", e);
            return;
        }
    };
    if let Err(e) = send_envelope(&mut ws_tx, &ack).await {
        tracing::warn!("Failed to send hello ack to {}: {}", identity, e);
        return;
    }

    let _guard = ConnectionGuard::new(state.clone());
    tracing::info!(
        "Client {} connected from {} (protocol {}, version {})",
        identity,
        addr,
        hello.protocol,
        hello.client_version
    );

    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Envelope>();

    loop {
        tokio::select! {
            Some(env) = reply_rx.recv() => {
                if let Err(e) = send_envelope(&mut ws_tx, &env).await {
                    tracing::warn!("Failed to send reply to {}: {}", identity, e);
                    break;
                }
            }

            frame = ws_rx.next() => {
                let Some(result) = frame else {
                    tracing::debug!("Client {} stream ended", identity);
                    break;
                };
                match result {
                    Ok(Message::Binary(data)) => {
                        handle_frame(&state, &identity, data, &reply_tx).await;
                    }
                    Ok(Message::Text(_)) => {
                        let body = ErrorBody::new(ErrorKind::Protocol, "Text frames are not supported");
                        let _ = reply_tx.send(Envelope::error(&identity, 0, &body));
                    }
                    Ok(Message::Ping(data)) => {
                        if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                            tracing::warn!("Failed to send pong to {}: {}", identity, e);
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::debug!("Client {} sent close frame", identity);
                        break;
                    }
                    Ok(Message::Pong(_)) => {}
                    Err(e) => {
                        tracing::warn!("WebSocket error from {}: {}", identity, e);
                        break;
                    }
                }
            }
        }
    }

    tracing::info!("Client {} disconnected", identity);
}

fn parse_hello(data: Vec<u8>) -> Result<Hello, ErrorBody> {
    let env = Envelope::decode(Bytes::from(data)).map_err(|e| ErrorBody::from(&e))?;
    if env.kind != EnvelopeKind::Hello {
        return Err(ErrorBody::new(
            ErrorKind::Protocol,
            format!("Expected hello, got {:?}", env.kind),
        ));
    }
    let hello: Hello = env.decode_json().map_err(|e| ErrorBody::from(&e))?;
    if hello.identity.is_empty() {
        return Err(ErrorBody::new(ErrorKind::Protocol, "Client identity cannot be empty"));
    }
    Ok(hello)
}

/// Handle one frame after the handshake. Failures become error replies.
async fn handle_frame(state: &Arc<AppState>, identity: &str, data: Vec<u8>, reply_tx: &ReplyTx) {
    let env = match Envelope::decode(Bytes::from(data)) {
        Ok(env) => env,
        Err(e) => {
            tracing::warn!("Undecodable frame from {}: {}", identity, e);
            let _ = reply_tx.send(Envelope::error(identity, 0, &ErrorBody::from(&e)));
            return;
        }
    };

    match env.kind {
        EnvelopeKind::Request => {
            let payload = match env.decode_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    let _ = reply_tx.send(Envelope::error(identity, env.request_id, &ErrorBody::from(&e)));
                    return;
                }
            };
            let request = InferenceRequest {
                origin_id: identity.to_string(),
                request_id: env.request_id,
                payload,
                reply_to: reply_tx.clone(),
            };
            if let Err(e) = state.router.submit(request).await {
                let _ = reply_tx.send(Envelope::error(identity, env.request_id, &e.to_body()));
            }
        }
        EnvelopeKind::StatusRequest => {
            // Answered off the connection loop so a slow pool does not stall reads.
            let state = state.clone();
            let identity = identity.to_string();
            let reply_tx = reply_tx.clone();
            tokio::spawn(async move {
                let reply = match state.server_status().await {
                    Ok(status) => Envelope::with_json(EnvelopeKind::StatusReply, &identity, env.request_id, &status)
                        .unwrap_or_else(|e| Envelope::error(&identity, env.request_id, &ErrorBody::from(&e))),
                    Err(e) => Envelope::error(
                        &identity,
                        env.request_id,
                        &ErrorBody::new(ErrorKind::Internal, e.to_string()),
                    ),
                };
                let _ = reply_tx.send(reply);
            });
        }
        other => {
            let body = ErrorBody::new(ErrorKind::Protocol, format!("Unexpected {:?} frame", other));
            let _ = reply_tx.send(Envelope::error(identity, env.request_id, &body));
        }
    }
}

async fn send_envelope(ws_tx: &mut WsSender, env: &Envelope) -> Result<(), axum::Error> {
    ws_tx.send(Message::Binary(env.encode().to_vec())).await
}
