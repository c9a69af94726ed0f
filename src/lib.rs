// src/lib.rs

//! Request/response exchange semantics over pluggable transports
//!
//! This library provides the correlation layer of an RPC stack: request id
//! generation, pending-call matching, per-call timeouts, heartbeat-based
//! liveness, and client/server connection lifecycles. Transports plug in
//! underneath via the [`Channel`] and [`Transporter`](transport::Transporter)
//! traits; an in-memory transport ships as the reference implementation.
//!

// Import all sub modules once...
mod channel;
mod client;
mod codec;
mod error;
mod handler;
mod message;
mod server;
mod url;

pub mod exchange;
pub mod transport;

mod macros;

// Re-export main types
pub use client::{ClientState, ExchangeClient};
pub use server::ExchangeServer;

pub use error::{Error, Result};
pub use url::Url;

pub use message::{next_request_id, EventKind, Message, Request, Response, Status};

pub use codec::{check_payload, Codec, CodecPtr, CodecRegistry, DecodeResult, JsonCodec};

pub use exchange::{CorrelationTable, ExchangeChannel, ExchangeHandler, ResponseFuture};

// --- public re-exports
pub use channel::{
    //
    channel_key,
    Channel,
    ChannelContext,
    ChannelPtr,
    Side,
};
pub use handler::{ChannelHandler, HandlerPtr};

pub use transport::{
    //
    Listener,
    ListenerPtr,
    Transporter,
    TransporterPtr,
    TransporterRegistry,
};

/// Connect a client using the default transporter registry.
///
/// The URL scheme selects the transporter (`mem` by default).
pub async fn connect(url: &str, handler: HandlerPtr) -> Result<ExchangeClient> {
    // ---
    let url = Url::parse(url)?;
    let transporter = TransporterRegistry::with_defaults().resolve(&url)?;
    ExchangeClient::connect(url, transporter, handler).await
}

/// Bind a server using the default transporter registry.
pub async fn bind(url: &str, handler: HandlerPtr) -> Result<ExchangeServer> {
    // ---
    let url = Url::parse(url)?;
    let transporter = TransporterRegistry::with_defaults().resolve(&url)?;
    ExchangeServer::bind(url, transporter, handler).await
}
