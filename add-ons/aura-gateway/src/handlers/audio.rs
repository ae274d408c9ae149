//! GET /ws/audio – browser microphone stream.
//!
//! Every Binary message is one frame; Text messages carry base64 frames. Frames are
//! only queued while a credential is configured, otherwise they are dropped. Nothing
//! is ever sent back.

use aura_bridge::{AudioIngressQueue, SessionConfigStore};
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::{debug, info};

use crate::AppState;

pub async fn audio_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    info!(target: "aura::gateway", "🎤 Audio client connected");
    let mut frames = 0u64;
    while let Some(Ok(msg)) = socket.recv().await {
        let bytes = match msg {
            Message::Binary(bytes) => bytes,
            Message::Text(text) => match BASE64.decode(text.trim()) {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!(target: "aura::gateway", error = %e, "ignoring non-base64 text frame");
                    continue;
                }
            },
            Message::Close(_) => break,
            _ => continue,
        };
        if accept_frame(&state.store, &state.queue, bytes) {
            frames += 1;
        }
    }
    info!(target: "aura::gateway", frames, "Audio client disconnected");
}

/// Queue a frame if streaming is configured. Returns whether it was queued.
pub(crate) fn accept_frame(store: &SessionConfigStore, queue: &AudioIngressQueue, bytes: Vec<u8>) -> bool {
    if bytes.is_empty() || !store.get().has_credential() {
        return false;
    }
    queue.push(bytes);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use aura_bridge::SessionConfig;

    #[test]
    fn frames_without_credential_are_dropped() {
        let store = SessionConfigStore::default();
        let queue = AudioIngressQueue::new(4);
        assert!(!accept_frame(&store, &queue, vec![1, 2]));
        assert!(queue.is_empty());

        store.set(SessionConfig {
            api_key: Some("key".into()),
            ..Default::default()
        });
        assert!(accept_frame(&store, &queue, vec![1, 2]));
        assert!(!accept_frame(&store, &queue, Vec::new()));
        assert_eq!(queue.len(), 1);
    }
}
