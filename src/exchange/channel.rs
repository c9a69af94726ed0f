// src/exchange/channel.rs

//! Exchange channel: request/response semantics over a raw channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::channel::channel_key;
use crate::codec::check_payload;
use crate::macros::log_warn;
use crate::{Channel, ChannelPtr, CorrelationTable, Error, Message, Request, ResponseFuture, Result};

/// A raw channel upgraded with correlated `request()` calls.
///
/// The first wrap of a channel is cached on its context, so wrapping is
/// idempotent: every caller shares one wrapper and one closing state.
pub struct ExchangeChannel {
    channel: ChannelPtr,
    table: Arc<CorrelationTable>,
    closing: AtomicBool,
}

impl ExchangeChannel {
    // ---

    /// Wrap `channel`, reusing the cached wrapper if one exists.
    pub fn wrap(channel: &ChannelPtr, table: &Arc<CorrelationTable>) -> Arc<Self> {
        // ---
        channel.context().exchange_wrapper(|| {
            Arc::new(Self {
                channel: channel.clone(),
                table: table.clone(),
                closing: AtomicBool::new(false),
            })
        })
    }

    /// The wrapped raw channel.
    pub fn channel(&self) -> &ChannelPtr {
        &self.channel
    }

    /// Whether `close` has begun.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Relaxed)
    }

    /// Send a two-way request, waiting up to the endpoint `timeout`.
    pub async fn request(&self, payload: Bytes) -> ResponseFuture {
        let timeout = self.channel.url().timeout();
        self.request_with_timeout(payload, timeout).await
    }

    /// Send a two-way request with an explicit timeout.
    ///
    /// Returns an awaitable handle immediately; the I/O path is never
    /// blocked on the response. The pending entry is registered *before*
    /// the transmit so a fast response cannot race past it. A transmit
    /// failure resolves the handle with `SendFailure`.
    pub async fn request_with_timeout(&self, payload: Bytes, timeout: Duration) -> ResponseFuture {
        // ---
        let request = Request::new(payload);
        let id = request.id;

        if self.is_closing() || !self.channel.is_connected() {
            return ResponseFuture::failed(id, Error::ChannelClosed);
        }
        if let Err(err) = check_payload(self.channel.url(), request.payload.len()) {
            return ResponseFuture::failed(id, err);
        }

        let key = channel_key(&self.channel);
        let future = self.table.register(key, id, timeout);

        if let Err(err) = self.channel.send(Message::Request(request), false).await {
            self.table
                .resolve(id, Err(Error::SendFailure(err.to_string())));
        }

        future
    }

    /// Send a message without expecting a correlated response.
    ///
    /// `wait_for_sent` bounds the call on the endpoint `timeout` until the
    /// transport has accepted the bytes.
    pub async fn send(&self, message: Message, wait_for_sent: bool) -> Result<()> {
        // ---
        if self.is_closing() || !self.channel.is_connected() {
            return Err(Error::ChannelClosed);
        }
        check_payload(self.channel.url(), message.payload_len())?;
        self.channel.send(message, wait_for_sent).await
    }

    /// Send an opaque payload as a one-way request.
    pub async fn send_payload(&self, payload: Bytes, wait_for_sent: bool) -> Result<()> {
        // ---
        self.send(Message::Request(Request::oneway(payload)), wait_for_sent)
            .await
    }

    /// Graceful close: wait, bounded by `timeout`, until no pending calls
    /// remain for this channel, then force the raw channel closed.
    ///
    /// Pending calls still unresolved at the deadline resolve with
    /// `ChannelClosed`. Closing an already-closing wrapper is a no-op.
    pub async fn close(&self, timeout: Duration) {
        // ---
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        let key = channel_key(&self.channel);
        if !self.table.wait_drained(key, timeout).await {
            log_warn!(
                "closing {} with {} pending call(s) unresolved",
                self.channel.remote_addr(),
                self.table.pending_count(key),
            );
        }

        self.channel.close().await;
        // Whatever survived the drain window resolves now.
        self.table.close_channel(key);
    }
}
