//! WebSocket transport.

use crate::transport::{Link, LinkEvent, Transport};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tether_core::{ClientFrame, ConnectionError, Credential, ErrorKind, ServerFrame};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};

/// Opens links to a `ws://` / `wss://` endpoint.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

fn classify(err: tungstenite::Error) -> ConnectionError {
    match err {
        tungstenite::Error::Http(response) => ConnectionError::new(
            ErrorKind::from_http_status(response.status().as_u16()),
            format!("handshake rejected with HTTP {}", response.status()),
        ),
        tungstenite::Error::Io(e) => ConnectionError::network(e.to_string()),
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            ConnectionError::network("connection closed")
        }
        other => ConnectionError::new(ErrorKind::Protocol, other.to_string()),
    }
}

fn close_error(frame: Option<CloseFrame>) -> ConnectionError {
    match frame {
        Some(frame) => ConnectionError::from_close(frame.code.into(), &frame.reason),
        None => ConnectionError::from_close(1005, ""),
    }
}

fn encode(frame: &ClientFrame) -> Result<Message, ConnectionError> {
    serde_json::to_string(frame)
        .map(|text| Message::Text(text.into()))
        .map_err(|e| ConnectionError::new(ErrorKind::Protocol, e.to_string()))
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, credential: &Credential) -> Result<Link, ConnectionError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectionError::new(ErrorKind::Protocol, e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.token()))
            .map_err(|e| ConnectionError::new(ErrorKind::Protocol, e.to_string()))?;
        request.headers_mut().insert("authorization", bearer);

        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(classify)?;
        let (mut sink, mut stream) = ws.split();

        let auth = ClientFrame::Auth {
            identity: credential.identity().clone(),
            token: credential.token().to_string(),
        };
        sink.send(encode(&auth)?).await.map_err(classify)?;

        // Wait for the server to accept or refuse the credential.
        loop {
            let msg = stream
                .next()
                .await
                .ok_or_else(|| ConnectionError::network("closed during handshake"))?
                .map_err(classify)?;
            match msg {
                Message::Text(text) => match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(ServerFrame::Welcome { identity }) => {
                        tracing::debug!(component = "connection", %identity, "server accepted credential");
                        break;
                    }
                    Ok(ServerFrame::Error { code, message }) if code == "auth" => {
                        return Err(ConnectionError::auth_rejected(message));
                    }
                    Ok(other) => tracing::debug!(component = "connection", ?other, "ignoring frame before welcome"),
                    Err(e) => return Err(ConnectionError::new(ErrorKind::Protocol, e.to_string())),
                },
                Message::Close(frame) => return Err(close_error(frame)),
                _ => {}
            }
        }

        let (link, mut outbound_rx, inbound_tx) = Link::pair();

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let msg = match encode(&frame) {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::warn!(component = "connection", error = %e, "dropping unencodable frame");
                        continue;
                    }
                };
                if let Err(e) = sink.send(msg).await {
                    tracing::debug!(component = "connection", error = %e, "write failed");
                    return;
                }
            }
            // Link dropped by the manager.
            let _ = sink.send(Message::Close(None)).await;
        });

        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let event = match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(frame) => LinkEvent::Frame(frame),
                        Err(e) => {
                            tracing::warn!(component = "connection", error = %e, "invalid frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        let _ = inbound_tx.send(LinkEvent::Closed(close_error(frame)));
                        return;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = inbound_tx.send(LinkEvent::Closed(classify(e)));
                        return;
                    }
                };
                if inbound_tx.send(event).is_err() {
                    return;
                }
            }
            let _ = inbound_tx.send(LinkEvent::Closed(ConnectionError::network("stream ended")));
        });

        Ok(link)
    }
}
