// src/exchange/handler.rs

//! Exchange-level message dispatch.
//!
//! [`ExchangeHandler`] sits between the transport and the business handler.
//! By the time business `received` fires, heartbeats have been answered or
//! consumed, broken requests have been refused, and responses have been
//! routed to their pending calls.

use std::sync::Arc;

use async_trait::async_trait;

use crate::channel::channel_key;
use crate::macros::{log_debug, log_warn};
use crate::message::EventKind;
use crate::{
    // ---
    Channel,
    ChannelHandler,
    ChannelPtr,
    CorrelationTable,
    Error,
    HandlerPtr,
    Message,
    Response,
    Result,
    Status,
};

/// Handler wrapper adding exchange semantics to a business handler.
pub struct ExchangeHandler {
    next: HandlerPtr,
    table: Arc<CorrelationTable>,
}

impl ExchangeHandler {
    // ---

    /// Wrap `next` (the business handler) with exchange dispatch backed by
    /// `table`.
    pub fn new(next: HandlerPtr, table: Arc<CorrelationTable>) -> Arc<Self> {
        // ---
        Arc::new(Self { next, table })
    }

    /// Answer a two-way heartbeat probe in place.
    async fn reply_heartbeat(&self, channel: &ChannelPtr, id: i64) {
        // ---
        let reply = Message::Response(Response::heartbeat(id));
        if let Err(_err) = channel.send(reply, false).await {
            log_warn!("failed to answer heartbeat on {}: {_err}", channel.remote_addr());
        }
    }

    /// Refuse a request whose frame was unparsable but whose id survived.
    async fn reply_broken(&self, channel: &ChannelPtr, id: i64, detail: &[u8]) {
        // ---
        let text = String::from_utf8_lossy(detail).into_owned();
        let reply = Message::Response(Response::error(id, Status::BadRequest, text));
        if let Err(_err) = channel.send(reply, false).await {
            log_warn!("failed to refuse broken request on {}: {_err}", channel.remote_addr());
        }
    }
}

#[async_trait]
impl ChannelHandler for ExchangeHandler {
    // ---

    async fn connected(&self, channel: ChannelPtr) -> Result<()> {
        self.next.connected(channel).await
    }

    async fn disconnected(&self, channel: ChannelPtr) -> Result<()> {
        // ---
        // Every pending call on this channel resolves now; a future must
        // never hang because its channel died.
        self.table.close_channel(channel_key(&channel));
        channel.context().clear();
        self.next.disconnected(channel).await
    }

    async fn received(&self, channel: ChannelPtr, message: Message) -> Result<()> {
        // ---
        match message {
            Message::Request(req) if req.event == Some(EventKind::Heartbeat) => {
                // Answered immediately; never reaches business dispatch.
                if req.two_way {
                    self.reply_heartbeat(&channel, req.id).await;
                }
                Ok(())
            }
            Message::Request(req) if req.broken => {
                // The id was recoverable, so only this call fails.
                self.reply_broken(&channel, req.id, &req.payload).await;
                Ok(())
            }
            Message::Response(resp) if resp.event == Some(EventKind::Heartbeat) => {
                // Liveness already recorded by the read timestamp.
                log_debug!("heartbeat response from {}", channel.remote_addr());
                Ok(())
            }
            Message::Response(resp) => {
                self.table.on_response(resp);
                Ok(())
            }
            Message::Request(req) => {
                // Business dispatch. Errors are logged here, never allowed
                // to break the connection's I/O.
                if let Err(_err) = self.next.received(channel, Message::Request(req)).await {
                    log_warn!("business handler error: {_err}");
                }
                Ok(())
            }
        }
    }

    async fn sent(&self, channel: ChannelPtr, message: &Message) -> Result<()> {
        self.next.sent(channel, message).await
    }

    async fn caught(&self, channel: ChannelPtr, error: Error) -> Result<()> {
        // ---
        log_warn!("channel error on {}: {error}", channel.remote_addr());
        self.next.caught(channel, error).await
    }
}
