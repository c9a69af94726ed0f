// src/handler.rs

//! Channel event callbacks.
//!
//! A [`ChannelHandler`] is the seam between the transport and everything
//! above it. Transports invoke these callbacks from their receive loops for
//! many channels concurrently; no single-threaded event-loop assumption may
//! be made by implementors.
//!
//! The exchange layer wraps the business handler
//! ([`ExchangeHandler`](crate::exchange::ExchangeHandler)), so by the time
//! `received` reaches business code, heartbeats and correlation responses
//! have already been intercepted.

use async_trait::async_trait;
use std::sync::Arc;

use crate::{ChannelPtr, Error, Message, Result};

/// Callbacks fired by a transport for channel lifecycle and traffic.
///
/// Every method has a no-op default so implementors override only what they
/// need. Errors returned from callbacks are logged by the dispatching layer
/// and never allowed to break the connection's I/O.
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    /// A connection was established (either side).
    async fn connected(&self, channel: ChannelPtr) -> Result<()> {
        let _ = channel;
        Ok(())
    }

    /// A connection went away.
    async fn disconnected(&self, channel: ChannelPtr) -> Result<()> {
        let _ = channel;
        Ok(())
    }

    /// A message arrived on the channel.
    async fn received(&self, channel: ChannelPtr, message: Message) -> Result<()> {
        let _ = (channel, message);
        Ok(())
    }

    /// A message was accepted by the transport for sending.
    async fn sent(&self, channel: ChannelPtr, message: &Message) -> Result<()> {
        let _ = (channel, message);
        Ok(())
    }

    /// An error surfaced on the channel's I/O path.
    async fn caught(&self, channel: ChannelPtr, error: Error) -> Result<()> {
        let _ = (channel, error);
        Ok(())
    }
}

/// Shared handler pointer.
pub type HandlerPtr = Arc<dyn ChannelHandler>;
