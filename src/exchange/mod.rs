// src/exchange/mod.rs

//! Request/response exchange on top of raw channels.
//!
//! - [`CorrelationTable`]: pending-call entries keyed by request id.
//! - [`ExchangeChannel`]: upgrades a raw channel with `request()`.
//! - [`ExchangeHandler`]: routes responses, intercepts heartbeats.
//! - [`HeartbeatMonitor`]: periodic liveness sweep.

mod channel;
mod correlation;
mod handler;
mod heartbeat;

pub use channel::ExchangeChannel;
pub use correlation::{CorrelationTable, ResponseFuture};
pub use handler::ExchangeHandler;
pub use heartbeat::{ChannelProvider, HeartbeatMonitor, IdleAction};
