//! Aura Gateway: the network surface around the streaming core.
//!
//! - `POST /setup` connects the light bridge and stores the inference credential.
//! - `GET /ws/audio` feeds microphone frames into the ingress queue.
//! - `GET /api/v1/emotions` streams `emotion_update` events (SSE).
//! - `GET /api/v1/status`, `GET /api/v1/health`, `GET /api/v1/logs` (SSE).
//!
//! The inference session manager runs on its own OS thread with its own runtime, so
//! request handling and the streaming loop never share a scheduler.

mod handlers;
mod logging;

use aura_bridge::{
    ActuatorConnector, ActuatorDispatcher, AudioIngressQueue, BridgeConfig, BridgeResult,
    EmotionObservers, HueConnector, HumeStreamClient, InferenceClient, InferenceSessionManager,
    SessionConfigStore, SessionHandle, SessionSettings, SetupService,
};
use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) config: Arc<BridgeConfig>,
    pub(crate) store: SessionConfigStore,
    pub(crate) queue: Arc<AudioIngressQueue>,
    pub(crate) setup: SetupService,
    pub(crate) dispatcher: ActuatorDispatcher,
    pub(crate) observers: EmotionObservers,
    /// Streaming worker thread (state + counters).
    pub(crate) session: Arc<SessionHandle>,
    pub(crate) log_tx: broadcast::Sender<String>,
    pub(crate) started_at: DateTime<Utc>,
}

/// Wire the core together and start the streaming worker. Must run inside a tokio
/// runtime: the dispatcher worker lives on it.
pub(crate) fn start_core(
    config: Arc<BridgeConfig>,
    client: Arc<dyn InferenceClient>,
    connector: Arc<dyn ActuatorConnector>,
    log_tx: broadcast::Sender<String>,
) -> BridgeResult<AppState> {
    let store = SessionConfigStore::default();
    let queue = Arc::new(AudioIngressQueue::new(config.queue_depth));
    let observers = EmotionObservers::default();
    let dispatcher = ActuatorDispatcher::spawn(config.dispatch_capacity, config.dispatch_workers);
    let setup = SetupService::new(connector, store.clone(), dispatcher.clone());

    let manager = InferenceSessionManager::new(
        client,
        store.clone(),
        Arc::clone(&queue),
        dispatcher.clone(),
        observers.clone(),
        SessionSettings::from(config.as_ref()),
    );
    let session = Arc::new(manager.spawn_on_thread()?);

    Ok(AppState {
        config,
        store,
        queue,
        setup,
        dispatcher,
        observers,
        session,
        log_tx,
        started_at: Utc::now(),
    })
}

fn build_app(state: AppState) -> Router {
    // Browser UI may be served from anywhere.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/setup", post(handlers::setup::setup))
        .route("/ws/audio", get(handlers::audio::audio_ws))
        .route("/api/v1/emotions", get(handlers::events::emotions_stream))
        .route("/api/v1/logs", get(handlers::events::logs_stream))
        .route("/api/v1/status", get(handlers::status::status))
        .route("/api/v1/health", get(handlers::status::health))
        .layer(cors)
        .with_state(state)
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let config = Arc::new(BridgeConfig::from_env());

    let (log_tx, _) = broadcast::channel(1000);
    let _log_guard = logging::init(log_tx.clone(), config.log_dir.as_deref());

    let client = Arc::new(HumeStreamClient::new(
        config.inference_url.clone(),
        config.inference_timeout,
    ));
    let connector = Arc::new(HueConnector::new(
        config.bridge_username.clone(),
        config.device_timeout,
    ));

    let state = match start_core(Arc::clone(&config), client, connector, log_tx) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(target: "aura::gateway", error = %e, "Failed to start streaming worker");
            std::process::exit(1);
        }
    };

    let addr = config.listen_addr.clone();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(target: "aura::gateway", error = %e, "Cannot bind {}", addr);
            std::process::exit(1);
        }
    };
    tracing::info!(target: "aura::gateway", "🚀 Aura running on http://{}", addr);

    let server = axum::serve(listener, build_app(state));
    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!(target: "aura::gateway", "Server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(target: "aura::gateway", "Shutting down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use aura_bridge::{
        ActuatorDriver, ActuatorState, BridgeError, InferenceSession,
    };
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    struct OfflineClient;

    #[async_trait]
    impl InferenceClient for OfflineClient {
        async fn connect(&self, _api_key: &str) -> BridgeResult<Box<dyn InferenceSession>> {
            Err(BridgeError::Network("offline".into()))
        }
    }

    struct NullDriver;

    impl ActuatorDriver for NullDriver {
        fn set_state(&self, _: &str, _: &ActuatorState, _: u16) -> BridgeResult<()> {
            Ok(())
        }
    }

    /// Accepts exactly one bridge address.
    struct OneBridge(&'static str);

    impl ActuatorConnector for OneBridge {
        fn connect(&self, address: &str) -> BridgeResult<Arc<dyn ActuatorDriver>> {
            if address == self.0 {
                Ok(Arc::new(NullDriver))
            } else {
                Err(BridgeError::Config("link button not pressed on the bridge".into()))
            }
        }
    }

    fn test_state() -> AppState {
        let (log_tx, _) = broadcast::channel(16);
        start_core(
            Arc::new(BridgeConfig::default()),
            Arc::new(OfflineClient),
            Arc::new(OneBridge("10.0.0.2")),
            log_tx,
        )
        .unwrap()
    }

    async fn json_body(res: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_ok() {
        let app = build_app(test_state());
        let res = app.oneshot(get_req("/api/v1/health")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_setup_success_configures_session() {
        let state = test_state();
        let app = build_app(state.clone());
        let res = app
            .clone()
            .oneshot(post_json(
                "/setup",
                serde_json::json!({ "hue_ip": "10.0.0.2", "hume_key": "secret-key", "light_name": "Desk" }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let json = json_body(res).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["message"], "Connected!");
        assert!(state.dispatcher.has_driver());

        let res = app.oneshot(get_req("/api/v1/status")).await.unwrap();
        let status = json_body(res).await;
        assert_eq!(status["credential_configured"], true);
        assert_eq!(status["actuator"], "Desk");
        assert_eq!(status["device_address"], "10.0.0.2");
        assert!(!status.to_string().contains("secret-key"));
    }

    #[tokio::test]
    async fn test_setup_bridge_failure_leaves_session_unset() {
        let state = test_state();
        let app = build_app(state.clone());
        let res = app
            .oneshot(post_json(
                "/setup",
                serde_json::json!({ "device_address": "10.0.0.99", "api_key": "k", "actuator_id": "Desk" }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let json = json_body(res).await;
        assert_eq!(json["success"], false);
        assert!(json["message"]
            .as_str()
            .unwrap()
            .starts_with("Bridge connect failed. Did you press the physical link button? Error:"));
        assert!(!state.store.get().has_credential());
        assert!(!state.dispatcher.has_driver());
    }

    #[tokio::test]
    async fn test_setup_rejects_empty_address() {
        let state = test_state();
        let app = build_app(state.clone());
        let res = app
            .oneshot(post_json("/setup", serde_json::json!({ "hue_ip": "  ", "hume_key": "k" })))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            "Configuration error: Device address cannot be empty"
        );
        assert!(!state.store.get().has_credential());
        assert!(!state.dispatcher.has_driver());
    }

    #[tokio::test]
    async fn test_setup_rejects_malformed_body() {
        let app = build_app(test_state());
        let req = Request::builder()
            .method("POST")
            .uri("/setup")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let res = app.oneshot(req).await.unwrap();
        assert!(res.status().is_client_error());
    }

    #[tokio::test]
    async fn test_status_before_setup() {
        let app = build_app(test_state());
        let res = app.oneshot(get_req("/api/v1/status")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let json = json_body(res).await;
        assert_eq!(json["connection"], "idle");
        assert_eq!(json["session_running"], true);
        assert_eq!(json["credential_configured"], false);
        assert_eq!(json["queue"]["depth"], 0);
        assert_eq!(json["queue"]["max_depth"], 256);
        assert_eq!(json["dispatch"]["queued"], 0);
        assert!(json["last_detection"].is_null());
    }

    #[tokio::test]
    async fn test_emotions_is_event_stream() {
        let app = build_app(test_state());
        let res = app.oneshot(get_req("/api/v1/emotions")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let content_type = res.headers()["content-type"].to_str().unwrap();
        assert!(content_type.starts_with("text/event-stream"));
    }

    #[tokio::test]
    async fn test_cors_allows_any_origin() {
        let app = build_app(test_state());
        let req = Request::builder()
            .method("GET")
            .uri("/api/v1/health")
            .header("origin", "http://192.168.1.50:8080")
            .body(Body::empty())
            .unwrap();
        let res = app.oneshot(req).await.unwrap();
        assert_eq!(res.headers()["access-control-allow-origin"], "*");
    }
}
