//! Route handlers. Each takes `State<AppState>` like the rest of the gateway.

pub mod audio;
pub mod events;
pub mod setup;
pub mod status;
