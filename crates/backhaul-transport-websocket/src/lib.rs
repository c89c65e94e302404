//! WebSocket control-channel transport using tokio-tungstenite
//!
//! A control channel is one WebSocket connection between an agent and the
//! server. Each binary message carries exactly one frame, so message
//! boundaries are frame boundaries and per-direction order is the order in
//! which frames were queued.
//!
//! Liveness uses WebSocket ping/pong: the agent pings, the server answers.

pub mod channel;
pub mod config;
pub mod error;
pub mod listener;

pub use channel::{ChannelStats, ControlChannel, ControlReceiver};
pub use config::WebSocketConfig;
pub use error::{TransportError, TransportResult};
pub use listener::{WebSocketConnector, WebSocketListener};
