//! **Inference service client**: streams audio frames and reads back prosody predictions.
//!
//! Implement [`InferenceClient`] / [`InferenceSession`] for any streaming emotion
//! service. [`HumeStreamClient`] is the production backend: one WebSocket per
//! session, one JSON request per frame (base64 audio), one JSON reply per request.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crate::classifier::EmotionPrediction;
use crate::error::{BridgeError, BridgeResult};
use crate::ingress::AudioFrame;

/// Predictions for one frame. Empty means "no detection".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferenceResponse {
    pub predictions: Vec<EmotionPrediction>,
}

impl InferenceResponse {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(predictions: Vec<EmotionPrediction>) -> Self {
        Self { predictions }
    }

    pub fn is_empty(&self) -> bool {
        self.predictions.is_empty()
    }
}

/// Opens streaming sessions. Fails with `Auth` or `Network`.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn connect(&self, api_key: &str) -> BridgeResult<Box<dyn InferenceSession>>;
}

/// One open stream. Fails with `Network`, `Timeout` or `Protocol`.
#[async_trait]
pub trait InferenceSession: Send {
    async fn send(&mut self, frame: &AudioFrame) -> BridgeResult<InferenceResponse>;

    async fn close(&mut self) -> BridgeResult<()>;
}

// -----------------------------------------------------------------------------
// Wire format
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct StreamReply {
    #[serde(default)]
    prosody: Option<ProsodyReply>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProsodyReply {
    #[serde(default)]
    predictions: Vec<ProsodyPrediction>,
}

#[derive(Debug, Deserialize)]
struct ProsodyPrediction {
    #[serde(default)]
    emotions: Vec<EmotionPrediction>,
}

/// Parse one reply. Only the first prediction's emotion list is used.
pub fn parse_reply(text: &str) -> BridgeResult<InferenceResponse> {
    let reply: StreamReply = serde_json::from_str(text)?;
    if let Some(error) = reply.error {
        let code = reply.code.unwrap_or_else(|| "unknown".to_string());
        return Err(BridgeError::Protocol(format!("service error {}: {}", code, error)));
    }
    let predictions = reply
        .prosody
        .and_then(|p| p.predictions.into_iter().next())
        .map(|p| p.emotions)
        .unwrap_or_default();
    Ok(InferenceResponse { predictions })
}

/// Request body for one frame.
pub fn encode_request(frame: &AudioFrame) -> String {
    serde_json::json!({
        "models": { "prosody": {} },
        "data": BASE64.encode(frame.as_bytes()),
    })
    .to_string()
}

// -----------------------------------------------------------------------------
// Production backend
// -----------------------------------------------------------------------------

/// WebSocket client for the Hume streaming API (or anything speaking its protocol).
#[derive(Debug, Clone)]
pub struct HumeStreamClient {
    /// e.g. wss://api.hume.ai/v0/stream/models
    pub url: String,
    /// Max wait for the reply to one frame, and for a close handshake.
    pub reply_timeout: Duration,
    /// Max wait for the TCP/TLS/WebSocket handshake.
    pub connect_timeout: Duration,
}

impl HumeStreamClient {
    /// Uses `reply_timeout` for the handshake as well.
    pub fn new(url: impl Into<String>, reply_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            reply_timeout,
            connect_timeout: reply_timeout,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

#[async_trait]
impl InferenceClient for HumeStreamClient {
    async fn connect(&self, api_key: &str) -> BridgeResult<Box<dyn InferenceSession>> {
        let mut request = self.url.as_str().into_client_request()?;
        let header = HeaderValue::from_str(api_key)
            .map_err(|e| BridgeError::Auth(format!("credential is not a valid header: {}", e)))?;
        request.headers_mut().insert("X-Hume-Api-Key", header);

        let limit = self.connect_timeout;
        let (ws, _response) = tokio::time::timeout(limit, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| BridgeError::Timeout(limit))??;
        info!(target: "aura::session", url = %self.url, "✅ Inference stream connected");
        Ok(Box::new(HumeStreamSession {
            ws,
            reply_timeout: self.reply_timeout,
        }))
    }
}

struct HumeStreamSession {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    reply_timeout: Duration,
}

impl HumeStreamSession {
    async fn next_reply(&mut self) -> BridgeResult<InferenceResponse> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => return parse_reply(&text),
                Some(Ok(Message::Binary(bytes))) => {
                    let text = String::from_utf8(bytes)
                        .map_err(|e| BridgeError::Protocol(e.to_string()))?;
                    return parse_reply(&text);
                }
                Some(Ok(Message::Ping(payload))) => {
                    self.ws.send(Message::Pong(payload)).await?;
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| format!("{} {}", f.code, f.reason))
                        .unwrap_or_else(|| "no reason".to_string());
                    return Err(BridgeError::Network(format!("closed by service: {}", reason)));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err(BridgeError::Network("stream ended".to_string())),
            }
        }
    }
}

#[async_trait]
impl InferenceSession for HumeStreamSession {
    async fn send(&mut self, frame: &AudioFrame) -> BridgeResult<InferenceResponse> {
        self.ws.send(Message::Text(encode_request(frame))).await?;
        debug!(target: "aura::session", bytes = frame.len(), "frame sent");
        let limit = self.reply_timeout;
        tokio::time::timeout(limit, self.next_reply())
            .await
            .map_err(|_| BridgeError::Timeout(limit))?
    }

    async fn close(&mut self) -> BridgeResult<()> {
        let limit = self.reply_timeout;
        let closed = tokio::time::timeout(limit, self.ws.close(None))
            .await
            .map_err(|_| BridgeError::Timeout(limit))?;
        match closed {
            Ok(()) => Ok(()),
            Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
            | Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
