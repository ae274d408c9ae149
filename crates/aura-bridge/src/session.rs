//! **Inference Session Manager** - the streaming state machine.
//!
//! ```text
//!          credential set            connected
//!   Idle ───────────────▶ Connecting ─────────▶ Streaming ──┐ frame → reply → classify
//!    ▲                        │                   │  │  ◀──┘
//!    │       backoff          │ failed            │  │ credential cleared / changed
//!    ├────────────────── Error ◀──────────────────┘  ▼
//!    │                                  I/O error   Disconnecting
//!    └──────────────────────────────────────────────────┘ closed
//! ```
//!
//! One call to [`InferenceSessionManager::step`] performs one state's worth of
//! work; [`InferenceSessionManager::run`] steps forever. The manager owns the
//! open session, so there is exactly one consumer of the ingress queue and
//! replies are handled in the order frames were pushed.
//!
//! A credential change is observed through the config store's `watch` channel
//! while the manager waits on the handshake, a frame or a reply. A pending
//! connect is abandoned and a reply for the old session is discarded.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::classifier::{classify, is_confident, to_actuator_state, DEFAULT_CONFIDENCE_THRESHOLD};
use crate::clock::{Clock, TokioClock};
use crate::config::{BridgeConfig, SessionConfig, SessionConfigStore};
use crate::dispatcher::ActuatorDispatcher;
use crate::error::{BridgeError, BridgeResult};
use crate::inference::{InferenceClient, InferenceResponse, InferenceSession};
use crate::ingress::AudioIngressQueue;
use crate::observer::{EmotionEvent, EmotionObservers};

/// Connection state of the streaming worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Streaming,
    Disconnecting,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Loop tunables.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionSettings {
    /// Fixed wait after any connection failure before retrying.
    pub reconnect_backoff: Duration,
    /// How often Idle re-checks for a credential.
    pub idle_tick: Duration,
    /// Scores must be strictly above this to act.
    pub confidence_threshold: f64,
    /// Passed through to the actuator.
    pub transition_time: u16,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            reconnect_backoff: Duration::from_secs(2),
            idle_tick: Duration::from_secs(1),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            transition_time: 5,
        }
    }
}

impl From<&BridgeConfig> for SessionSettings {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            reconnect_backoff: config.reconnect_backoff,
            idle_tick: config.idle_tick,
            confidence_threshold: config.confidence_threshold,
            transition_time: config.transition_time,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    connect_attempts: AtomicU64,
    connect_failures: AtomicU64,
    stream_failures: AtomicU64,
    frames_sent: AtomicU64,
    responses: AtomicU64,
    detections: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SessionMetrics {
        SessionMetrics {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            stream_failures: self.stream_failures.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            detections: self.detections.load(Ordering::Relaxed),
        }
    }
}

/// Counters since start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionMetrics {
    pub connect_attempts: u64,
    pub connect_failures: u64,
    pub stream_failures: u64,
    pub frames_sent: u64,
    pub responses: u64,
    pub detections: u64,
}

struct ActiveSession {
    /// Credential the session was opened with.
    key: String,
    inner: Box<dyn InferenceSession>,
}

/// Result of one Streaming iteration, computed while the session is borrowed.
enum StreamStep {
    /// Config changed while waiting for a frame; re-check next step.
    Recheck,
    /// Credential cleared or replaced.
    Superseded,
    Reply(InferenceResponse),
    Failed(BridgeError),
}

pub struct InferenceSessionManager {
    client: Arc<dyn InferenceClient>,
    store: SessionConfigStore,
    config_rx: watch::Receiver<SessionConfig>,
    queue: Arc<AudioIngressQueue>,
    dispatcher: ActuatorDispatcher,
    observers: EmotionObservers,
    settings: SessionSettings,
    clock: Arc<dyn Clock>,
    state_tx: watch::Sender<ConnectionState>,
    counters: Arc<Counters>,
    session: Option<ActiveSession>,
}

impl InferenceSessionManager {
    pub fn new(
        client: Arc<dyn InferenceClient>,
        store: SessionConfigStore,
        queue: Arc<AudioIngressQueue>,
        dispatcher: ActuatorDispatcher,
        observers: EmotionObservers,
        settings: SessionSettings,
    ) -> Self {
        let config_rx = store.subscribe();
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        Self {
            client,
            store,
            config_rx,
            queue,
            dispatcher,
            observers,
            settings,
            clock: Arc::new(TokioClock),
            state_tx,
            counters: Arc::new(Counters::default()),
            session: None,
        }
    }

    /// Replace the timer used for idle ticks and backoff.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Receiver for state changes.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn metrics(&self) -> SessionMetrics {
        self.counters.snapshot()
    }

    fn transition(&self, next: ConnectionState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            debug!(target: "aura::session", from = %previous, to = %next, "state change");
        }
    }

    /// Perform one state's worth of work.
    pub async fn step(&mut self) {
        match self.current_state() {
            ConnectionState::Idle => self.idle().await,
            ConnectionState::Connecting => self.connect().await,
            ConnectionState::Streaming => self.stream_once().await,
            ConnectionState::Disconnecting => self.disconnect().await,
            ConnectionState::Error => self.recover().await,
        }
    }

    /// Step forever. There is no exit; the loop stops with its runtime.
    pub async fn run(mut self) {
        info!(target: "aura::session", "🎙️ Inference session manager started");
        loop {
            self.step().await;
        }
    }

    /// Run on a dedicated OS thread with its own runtime.
    pub fn spawn_on_thread(self) -> BridgeResult<SessionHandle> {
        let state = self.state();
        let counters = Arc::clone(&self.counters);
        let thread = std::thread::Builder::new()
            .name("aura-session".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!(target: "aura::session", "Session thread: runtime failed: {}", e);
                        return;
                    }
                };
                rt.block_on(self.run());
            })?;
        Ok(SessionHandle {
            thread,
            state,
            counters,
        })
    }

    async fn idle(&mut self) {
        if self.config_rx.borrow_and_update().has_credential() {
            self.transition(ConnectionState::Connecting);
            return;
        }
        // Wake early on a config write instead of waiting out the tick.
        tokio::select! {
            _ = self.clock.sleep(self.settings.idle_tick) => {}
            _ = self.config_rx.changed() => {}
        }
    }

    async fn connect(&mut self) {
        let key = self
            .config_rx
            .borrow_and_update()
            .credential()
            .map(str::to_string);
        let Some(key) = key else {
            self.transition(ConnectionState::Idle);
            return;
        };

        Counters::bump(&self.counters.connect_attempts);
        info!(target: "aura::session", "🔌 Connecting to inference service");
        let attempt = tokio::select! {
            result = self.client.connect(&key) => Some(result),
            _ = key_changed(&mut self.config_rx, &key) => None,
        };
        match attempt {
            Some(Ok(inner)) => {
                self.session = Some(ActiveSession { key, inner });
                info!(target: "aura::session", "✅ Streaming");
                self.transition(ConnectionState::Streaming);
            }
            Some(Err(e)) => {
                Counters::bump(&self.counters.connect_failures);
                if e.is_auth() {
                    error!(target: "aura::session", error = %e, "Inference service rejected the credential, retrying");
                } else {
                    warn!(target: "aura::session", error = %e, "Inference connect failed, retrying");
                }
                self.transition(ConnectionState::Error);
            }
            None => {
                info!(target: "aura::session", "Credential changed, abandoning connect");
                self.transition(ConnectionState::Idle);
            }
        }
    }

    async fn stream_once(&mut self) {
        if self.session.is_none() {
            self.transition(ConnectionState::Idle);
            return;
        }
        let step = match self.session.as_mut() {
            Some(active) => {
                stream_iteration(active, &mut self.config_rx, &self.queue, &self.counters).await
            }
            None => return,
        };

        match step {
            StreamStep::Recheck => {}
            StreamStep::Superseded => {
                info!(target: "aura::session", "Credential changed, closing inference session");
                self.transition(ConnectionState::Disconnecting);
            }
            StreamStep::Reply(response) => {
                Counters::bump(&self.counters.responses);
                self.handle_response(response);
            }
            StreamStep::Failed(e) => {
                Counters::bump(&self.counters.stream_failures);
                warn!(target: "aura::session", error = %e, "Stream error, reconnecting");
                self.transition(ConnectionState::Error);
            }
        }
    }

    fn handle_response(&self, response: InferenceResponse) {
        let Some(top) = classify(&response.predictions) else {
            return;
        };
        if !is_confident(top.score, self.settings.confidence_threshold) {
            debug!(target: "aura::session", emotion = %top.emotion, score = top.score, "below threshold");
            return;
        }

        Counters::bump(&self.counters.detections);
        info!(target: "aura::session", "🎭 Detected: {} ({:.2})", top.emotion, top.score);

        let state = to_actuator_state(&top.emotion);
        self.observers.emit(EmotionEvent {
            emotion: top.emotion,
            score: top.score,
        });

        let config = self.store.get();
        if let Some(actuator) = config.actuator() {
            self.dispatcher
                .dispatch(actuator, state, self.settings.transition_time);
        }
    }

    async fn disconnect(&mut self) {
        if let Some(active) = self.session.take() {
            close_session(active).await;
            info!(target: "aura::session", "Inference session closed");
        }
        self.transition(ConnectionState::Idle);
    }

    async fn recover(&mut self) {
        if let Some(active) = self.session.take() {
            close_session(active).await;
        }
        self.clock.sleep(self.settings.reconnect_backoff).await;
        self.transition(ConnectionState::Idle);
    }
}

/// One Streaming iteration: credential check, pop, send, await reply.
async fn stream_iteration(
    active: &mut ActiveSession,
    config_rx: &mut watch::Receiver<SessionConfig>,
    queue: &AudioIngressQueue,
    counters: &Counters,
) -> StreamStep {
    let ActiveSession { key, inner } = active;
    if config_rx.borrow_and_update().credential() != Some(key.as_str()) {
        return StreamStep::Superseded;
    }

    // `pop` is cancel-safe: a frame is only taken when this branch wins.
    let frame = tokio::select! {
        frame = queue.pop() => frame,
        _ = config_rx.changed() => return StreamStep::Recheck,
    };

    Counters::bump(&counters.frames_sent);
    tokio::select! {
        result = inner.send(&frame) => match result {
            Ok(response) => StreamStep::Reply(response),
            Err(e) => StreamStep::Failed(e),
        },
        _ = key_changed(config_rx, key) => StreamStep::Superseded,
    }
}

/// Resolves once the stored credential differs from `key` (cleared or replaced).
/// Writes that keep the same key are absorbed.
async fn key_changed(config_rx: &mut watch::Receiver<SessionConfig>, key: &str) {
    loop {
        if config_rx.changed().await.is_err() {
            // Store dropped: the credential can no longer change.
            std::future::pending::<()>().await;
        }
        if config_rx.borrow_and_update().credential() != Some(key) {
            return;
        }
    }
}

async fn close_session(mut active: ActiveSession) {
    if let Err(e) = active.inner.close().await {
        debug!(target: "aura::session", error = %e, "close failed");
    }
}

/// Handle to a manager running on its own thread.
pub struct SessionHandle {
    thread: std::thread::JoinHandle<()>,
    state: watch::Receiver<ConnectionState>,
    counters: Arc<Counters>,
}

impl SessionHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn metrics(&self) -> SessionMetrics {
        self.counters.snapshot()
    }

    pub fn is_running(&self) -> bool {
        !self.thread.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::EmotionPrediction;
    use crate::ingress::AudioFrame;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct InstantClock;

    #[async_trait]
    impl Clock for InstantClock {
        async fn sleep(&self, _duration: Duration) {
            tokio::task::yield_now().await;
        }
    }

    struct ScriptedSession {
        replies: VecDeque<BridgeResult<InferenceResponse>>,
    }

    #[async_trait]
    impl InferenceSession for ScriptedSession {
        async fn send(&mut self, _frame: &AudioFrame) -> BridgeResult<InferenceResponse> {
            self.replies
                .pop_front()
                .unwrap_or_else(|| Ok(InferenceResponse::empty()))
        }

        async fn close(&mut self) -> BridgeResult<()> {
            Ok(())
        }
    }

    /// Fails `failures` times, then hands out one scripted session.
    struct ScriptedClient {
        failures: Mutex<u32>,
        replies: Mutex<Option<VecDeque<BridgeResult<InferenceResponse>>>>,
    }

    #[async_trait]
    impl InferenceClient for ScriptedClient {
        async fn connect(&self, _api_key: &str) -> BridgeResult<Box<dyn InferenceSession>> {
            {
                let mut failures = self.failures.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(BridgeError::Network("refused".into()));
                }
            }
            let replies = self.replies.lock().unwrap().take().unwrap_or_default();
            Ok(Box::new(ScriptedSession { replies }))
        }
    }

    fn build(
        failures: u32,
        replies: Vec<BridgeResult<InferenceResponse>>,
    ) -> (InferenceSessionManager, SessionConfigStore, Arc<AudioIngressQueue>, EmotionObservers) {
        let store = SessionConfigStore::default();
        let queue = Arc::new(AudioIngressQueue::new(16));
        let observers = EmotionObservers::default();
        let client = Arc::new(ScriptedClient {
            failures: Mutex::new(failures),
            replies: Mutex::new(Some(replies.into_iter().collect())),
        });
        let manager = InferenceSessionManager::new(
            client,
            store.clone(),
            Arc::clone(&queue),
            ActuatorDispatcher::spawn(4, 1),
            observers.clone(),
            SessionSettings::default(),
        )
        .with_clock(Arc::new(InstantClock));
        (manager, store, queue, observers)
    }

    fn with_key(key: &str) -> SessionConfig {
        SessionConfig {
            api_key: Some(key.to_string()),
            ..Default::default()
        }
    }

    /// Never finishes the handshake.
    struct HungClient;

    #[async_trait]
    impl InferenceClient for HungClient {
        async fn connect(&self, _api_key: &str) -> BridgeResult<Box<dyn InferenceSession>> {
            std::future::pending().await
        }
    }

    /// Session whose sends and closes both fail; counts close attempts.
    struct BrokenSession {
        closes: Arc<AtomicU64>,
    }

    #[async_trait]
    impl InferenceSession for BrokenSession {
        async fn send(&mut self, _frame: &AudioFrame) -> BridgeResult<InferenceResponse> {
            Err(BridgeError::Network("reset".into()))
        }

        async fn close(&mut self) -> BridgeResult<()> {
            self.closes.fetch_add(1, Ordering::Relaxed);
            Err(BridgeError::Network("already gone".into()))
        }
    }

    struct BrokenClient {
        closes: Arc<AtomicU64>,
    }

    #[async_trait]
    impl InferenceClient for BrokenClient {
        async fn connect(&self, _api_key: &str) -> BridgeResult<Box<dyn InferenceSession>> {
            Ok(Box::new(BrokenSession {
                closes: Arc::clone(&self.closes),
            }))
        }
    }

    fn build_with(
        client: Arc<dyn InferenceClient>,
    ) -> (InferenceSessionManager, SessionConfigStore, Arc<AudioIngressQueue>) {
        let store = SessionConfigStore::default();
        let queue = Arc::new(AudioIngressQueue::new(16));
        let manager = InferenceSessionManager::new(
            client,
            store.clone(),
            Arc::clone(&queue),
            ActuatorDispatcher::spawn(4, 1),
            EmotionObservers::default(),
            SessionSettings::default(),
        )
        .with_clock(Arc::new(InstantClock));
        (manager, store, queue)
    }

    #[test]
    fn state_names() {
        assert_eq!(ConnectionState::Streaming.as_str(), "streaming");
        assert_eq!(
            serde_json::to_value(ConnectionState::Disconnecting).unwrap(),
            "disconnecting"
        );
    }

    #[tokio::test]
    async fn idle_without_credential_stays_idle() {
        let (mut manager, _store, _queue, _obs) = build(0, vec![]);
        manager.step().await;
        manager.step().await;
        assert_eq!(manager.current_state(), ConnectionState::Idle);
        assert_eq!(manager.metrics().connect_attempts, 0);
    }

    #[tokio::test]
    async fn credential_moves_idle_to_streaming() {
        let (mut manager, store, _queue, _obs) = build(0, vec![]);
        store.set(with_key("k1"));
        manager.step().await;
        assert_eq!(manager.current_state(), ConnectionState::Connecting);
        manager.step().await;
        assert_eq!(manager.current_state(), ConnectionState::Streaming);
    }

    #[tokio::test]
    async fn connect_failure_goes_through_error_back_to_idle() {
        let (mut manager, store, _queue, _obs) = build(1, vec![]);
        store.set(with_key("k1"));
        manager.step().await; // Idle -> Connecting
        manager.step().await; // Connecting -> Error
        assert_eq!(manager.current_state(), ConnectionState::Error);
        manager.step().await; // backoff -> Idle
        assert_eq!(manager.current_state(), ConnectionState::Idle);
        assert_eq!(manager.metrics().connect_failures, 1);
    }

    #[tokio::test]
    async fn confident_reply_is_emitted() {
        let reply = InferenceResponse::new(vec![
            EmotionPrediction::new("Calmness", 0.2),
            EmotionPrediction::new("Anxiety", 0.7),
        ]);
        let (mut manager, store, queue, observers) = build(0, vec![Ok(reply)]);
        let mut events = observers.subscribe();
        store.set(with_key("k1"));
        manager.step().await;
        manager.step().await;

        queue.push(vec![1u8, 2, 3]);
        manager.step().await;

        let event = events.try_recv().unwrap();
        assert_eq!(event.emotion, "Anxiety");
        assert_eq!(event.score, 0.7);
        assert_eq!(manager.metrics().detections, 1);
    }

    #[tokio::test]
    async fn stream_error_goes_to_error_state() {
        let (mut manager, store, queue, _obs) =
            build(0, vec![Err(BridgeError::Timeout(Duration::from_secs(10)))]);
        store.set(with_key("k1"));
        manager.step().await;
        manager.step().await;
        queue.push(vec![0u8]);
        manager.step().await;
        assert_eq!(manager.current_state(), ConnectionState::Error);
        assert_eq!(manager.metrics().stream_failures, 1);
    }

    #[tokio::test]
    async fn changed_key_disconnects() {
        let (mut manager, store, _queue, _obs) = build(0, vec![]);
        store.set(with_key("k1"));
        manager.step().await;
        manager.step().await;
        store.set(with_key("k2"));
        manager.step().await;
        assert_eq!(manager.current_state(), ConnectionState::Disconnecting);
        manager.step().await;
        assert_eq!(manager.current_state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn actuator_change_keeps_session() {
        let (mut manager, store, queue, _obs) = build(0, vec![]);
        store.set(with_key("k1"));
        manager.step().await;
        manager.step().await;
        store.set(SessionConfig {
            actuator_id: Some("Desk".into()),
            ..with_key("k1")
        });
        queue.push(vec![0u8]);
        manager.step().await;
        assert_eq!(manager.current_state(), ConnectionState::Streaming);
    }

    #[tokio::test]
    async fn cleared_credential_abandons_hung_connect() {
        let (mut manager, store, _queue) = build_with(Arc::new(HungClient));
        store.set(with_key("k1"));
        manager.step().await;
        assert_eq!(manager.current_state(), ConnectionState::Connecting);

        tokio::join!(manager.step(), async {
            tokio::task::yield_now().await;
            store.set(SessionConfig::default());
        });
        assert_eq!(manager.current_state(), ConnectionState::Idle);
        assert_eq!(manager.metrics().connect_attempts, 1);
        assert_eq!(manager.metrics().connect_failures, 0);
    }

    #[tokio::test]
    async fn replaced_credential_abandons_hung_connect() {
        let (mut manager, store, _queue) = build_with(Arc::new(HungClient));
        store.set(with_key("k1"));
        manager.step().await;

        tokio::join!(manager.step(), async {
            tokio::task::yield_now().await;
            store.set(with_key("k2"));
        });
        assert_eq!(manager.current_state(), ConnectionState::Idle);

        // The next attempt uses the new key.
        manager.step().await;
        assert_eq!(manager.current_state(), ConnectionState::Connecting);
        assert_eq!(manager.metrics().connect_attempts, 1);
    }

    #[tokio::test]
    async fn failed_close_still_recovers() {
        let closes = Arc::new(AtomicU64::new(0));
        let (mut manager, store, queue) = build_with(Arc::new(BrokenClient {
            closes: Arc::clone(&closes),
        }));
        store.set(with_key("k1"));
        manager.step().await;
        manager.step().await;
        queue.push(vec![0u8]);
        manager.step().await;
        assert_eq!(manager.current_state(), ConnectionState::Error);

        manager.step().await;
        assert_eq!(manager.current_state(), ConnectionState::Idle);
        assert_eq!(closes.load(Ordering::Relaxed), 1);
    }
}
