//! Relay server implementation.

use axum::{
    Json, Router,
    extract::{
        Path, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use chrono::{TimeDelta, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tether_client::navigation::ThreadData;
use tether_client::rest::{LoginRequest, TokenResponse};
use tether_core::{
    Claims, ClientFrame, ConfirmedMessage, Credential, Identity, MessageId, ResourceId, Role,
    ServerFrame,
};
use tokio::sync::{RwLock, broadcast};

/// Close code sent when the credential is refused.
const CLOSE_AUTH: u16 = 4001;
/// Close code sent when a credential update changes identity.
const CLOSE_FORBIDDEN: u16 = 4003;
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

struct RelayState {
    threads: RwLock<HashMap<ResourceId, Vec<ConfirmedMessage>>>,
    next_id: AtomicU64,
    messages_tx: broadcast::Sender<ConfirmedMessage>,
    token_lifetime: TimeDelta,
}

impl RelayState {
    fn issue_token(&self, identity: &Identity) -> String {
        let now = Utc::now();
        Claims::new(identity, now, now + self.token_lifetime).encode_unsigned()
    }

    async fn post(
        &self,
        author: &Identity,
        resource_id: ResourceId,
        client_ref: Option<tether_core::TempId>,
        content: String,
    ) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let message = ConfirmedMessage {
            id: MessageId::new(format!("m{id}")),
            resource_id: resource_id.clone(),
            role: Role::User,
            content,
            sent_at: Utc::now(),
            client_ref,
        };
        tracing::info!(%author, %resource_id, id = %message.id, "message posted");
        self.threads
            .write()
            .await
            .entry(resource_id)
            .or_default()
            .push(message.clone());
        let _ = self.messages_tx.send(message);
    }
}

type AppState = Arc<RelayState>;

pub async fn run(addr: SocketAddr, token_lifetime: Duration) -> anyhow::Result<()> {
    let (messages_tx, _) = broadcast::channel(256);
    let state = Arc::new(RelayState {
        threads: RwLock::new(HashMap::new()),
        next_id: AtomicU64::new(1),
        messages_tx,
        token_lifetime: TimeDelta::from_std(token_lifetime)?,
    });

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/threads/{id}", get(get_thread))
        .with_state(state);

    tracing::info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Check a token presented by (or on behalf of) `expected`.
fn check_token(token: &str, expected: Option<&Identity>) -> Result<Credential, String> {
    let credential = Credential::decode(token).map_err(|e| e.to_string())?;
    if credential.is_expired() {
        return Err("token expired".to_string());
    }
    if let Some(expected) = expected {
        if credential.identity() != expected {
            return Err(format!(
                "token belongs to {}, not {}",
                credential.identity(),
                expected
            ));
        }
    }
    Ok(credential)
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

async fn login(State(state): State<AppState>, Json(req): Json<LoginRequest>) -> Json<TokenResponse> {
    tracing::info!(identity = %req.identity, "login");
    Json(TokenResponse {
        token: state.issue_token(&req.identity),
    })
}

async fn refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<TokenResponse>, StatusCode> {
    let token = bearer(&headers).ok_or(StatusCode::UNAUTHORIZED)?;
    // Expired tokens may still be exchanged; only undecodable ones are refused.
    let credential = Credential::decode(token).map_err(|_| StatusCode::UNAUTHORIZED)?;
    tracing::debug!(identity = %credential.identity(), "refresh");
    Ok(Json(TokenResponse {
        token: state.issue_token(credential.identity()),
    }))
}

async fn get_thread(State(state): State<AppState>, Path(id): Path<String>) -> Json<ThreadData> {
    let resource_id = ResourceId::new(id);
    let messages = state
        .threads
        .read()
        .await
        .get(&resource_id)
        .cloned()
        .unwrap_or_default();
    Json(ThreadData {
        title: format!("Thread {resource_id}"),
        resource_id,
        messages,
    })
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

type Sink = SplitSink<WebSocket, Message>;

async fn send_frame(sink: &mut Sink, frame: &ServerFrame) -> anyhow::Result<()> {
    let text = serde_json::to_string(frame)?;
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}

async fn close(sink: &mut Sink, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
}

/// Wait for the auth frame and validate it.
async fn authenticate(stream: &mut SplitStream<WebSocket>) -> Result<Identity, String> {
    let wait = async {
        while let Some(msg) = stream.next().await {
            let Ok(Message::Text(text)) = msg else {
                continue;
            };
            match serde_json::from_str::<ClientFrame>(text.as_str()) {
                Ok(ClientFrame::Auth { identity, token }) => {
                    return check_token(&token, Some(&identity)).map(|_| identity);
                }
                Ok(_) => return Err("expected auth frame".to_string()),
                Err(e) => return Err(e.to_string()),
            }
        }
        Err("closed before auth".to_string())
    };
    tokio::time::timeout(AUTH_TIMEOUT, wait)
        .await
        .unwrap_or_else(|_| Err("auth timed out".to_string()))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    let identity = match authenticate(&mut stream).await {
        Ok(identity) => identity,
        Err(reason) => {
            tracing::warn!(%reason, "rejecting connection");
            let error = ServerFrame::Error {
                code: "auth".to_string(),
                message: reason.clone(),
            };
            let _ = send_frame(&mut sink, &error).await;
            close(&mut sink, CLOSE_AUTH, &reason).await;
            return;
        }
    };

    if let Err(e) = session(&state, &identity, &mut sink, &mut stream).await {
        tracing::debug!(%identity, error = %e, "connection ended with error");
    }
    tracing::info!(%identity, "disconnected");
}

async fn session(
    state: &AppState,
    identity: &Identity,
    sink: &mut Sink,
    stream: &mut SplitStream<WebSocket>,
) -> anyhow::Result<()> {
    send_frame(
        sink,
        &ServerFrame::Welcome {
            identity: identity.clone(),
        },
    )
    .await?;
    tracing::info!(%identity, "connected");

    let mut messages_rx = state.messages_tx.subscribe();

    loop {
        tokio::select! {
            msg = stream.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.into()),
                };
                match serde_json::from_str::<ClientFrame>(text.as_str()) {
                    Ok(ClientFrame::SendMessage { resource_id, client_ref, content }) => {
                        state.post(identity, resource_id, Some(client_ref), content).await;
                    }
                    Ok(ClientFrame::CredentialUpdate { token }) => {
                        if let Err(reason) = check_token(&token, Some(identity)) {
                            tracing::warn!(%identity, %reason, "credential update refused");
                            close(sink, CLOSE_FORBIDDEN, &reason).await;
                            return Ok(());
                        }
                        tracing::debug!(%identity, "credential updated");
                    }
                    Ok(ClientFrame::Auth { .. }) => {
                        tracing::warn!(%identity, "ignoring repeated auth frame");
                    }
                    Err(e) => tracing::warn!("Invalid frame: {}", e),
                }
            }

            msg = messages_rx.recv() => match msg {
                Ok(message) => send_frame(sink, &ServerFrame::Message(message)).await?,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(%identity, skipped, "client fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
        }
    }
}
