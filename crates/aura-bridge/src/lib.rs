//! # Aura Bridge - live prosody to ambient light
//!
//! This crate is the streaming core of Aura: it takes raw audio frames pushed by
//! whatever receives them from the network, streams them to a prosody inference
//! service, turns the top-scoring emotion into a light state and hands that state
//! to a device dispatcher that can never stall the stream.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                     Inference Session Manager                      │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐              │
//! │  │ Audio Ingress│→ │  Streaming   │→ │  Emotion     │              │
//! │  │    Queue     │  │  Session (ws)│  │  Classifier  │              │
//! │  └──────────────┘  └──────────────┘  └──────────────┘              │
//! │         ↑                 ↑                 ↓            ↓          │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐ ┌──────────┐ │
//! │  │ audio push   │  │ Session      │  │  Actuator    │ │ Observer │ │
//! │  │ (gateway ws) │  │ Config Store │  │  Dispatcher  │ │ channel  │ │
//! │  └──────────────┘  └──────────────┘  └──────────────┘ └──────────┘ │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The manager is an explicit state machine (`Idle → Connecting → Streaming →
//! Disconnecting/Error → Idle`) driven by the [`SessionConfigStore`] and by I/O
//! outcomes. All waiting goes through a [`Clock`] so the loop can be driven with a
//! fake clock in tests.

pub mod actuator;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod inference;
pub mod ingress;
pub mod observer;
pub mod session;
pub mod setup;

pub use actuator::{ActuatorConnector, ActuatorDriver, HueBridge, HueConnector};
pub use classifier::{
    classify, is_confident, to_actuator_state, ActuatorState, Classification, EmotionCategory,
    EmotionPrediction, DEFAULT_CONFIDENCE_THRESHOLD,
};
pub use clock::{Clock, TokioClock};
pub use config::{BridgeConfig, SessionConfig, SessionConfigStore};
pub use dispatcher::{ActuatorDispatcher, DispatchOutcome, DispatchStats};
pub use error::{BridgeError, BridgeResult};
pub use inference::{HumeStreamClient, InferenceClient, InferenceResponse, InferenceSession};
pub use ingress::{AudioFrame, AudioIngressQueue};
pub use observer::{EmotionEvent, EmotionObservers, LastDetection};
pub use session::{
    ConnectionState, InferenceSessionManager, SessionHandle, SessionMetrics, SessionSettings,
};
pub use setup::{SetupOutcome, SetupRequest, SetupService};
