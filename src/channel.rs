// src/channel.rs

//! Channel abstraction.
//!
//! A [`Channel`] is one bidirectional connection endpoint, owned by the
//! transport that created it. The exchange layer never sees sockets or
//! event loops; it sees channels, their [`ChannelContext`], and the
//! callbacks on [`ChannelHandler`](crate::ChannelHandler).
//!
//! Known per-connection state (timestamps, side, the cached exchange
//! wrapper) lives in typed fields on the context. A small string map exists
//! only for genuinely extensible keys.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::exchange::ExchangeChannel;
use crate::{Message, Result, Url};

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// Mutex poisoning indicates that another task panicked while holding the
/// lock. The state protected by these locks is per-connection bookkeeping
/// with no invariants spanning multiple fields; the worst outcome of
/// continuing is a stale attribute or a dropped response. Connection-level
/// failures are handled by the transport receive loop.
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Milliseconds since a process-wide anchor.
///
/// Uses the tokio clock so paused-time tests observe consistent idle
/// durations.
pub(crate) fn now_millis() -> u64 {
    // ---
    static START: OnceLock<Instant> = OnceLock::new();
    let start = *START.get_or_init(Instant::now);
    Instant::now().duration_since(start).as_millis() as u64
}

/// Which end of the connection this channel is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// This process initiated the connection.
    Client,
    /// This process accepted the connection.
    Server,
}

impl Side {
    /// `true` for the initiating end.
    pub fn is_client(self) -> bool {
        matches!(self, Side::Client)
    }
}

/// Typed per-channel state.
///
/// Timestamps are atomics so the heartbeat sweep never contends with the
/// I/O path. The attribute map is for extensible keys only; everything the
/// exchange layer itself needs has a dedicated field.
pub struct ChannelContext {
    side: Side,
    last_read: AtomicU64,
    last_write: AtomicU64,
    exchange: Mutex<Option<Arc<ExchangeChannel>>>,
    attrs: Mutex<HashMap<String, String>>,
}

impl ChannelContext {
    // ---

    /// Create a fresh context; both timestamps start at "now".
    pub fn new(side: Side) -> Self {
        // ---
        let now = now_millis();
        Self {
            side,
            last_read: AtomicU64::new(now),
            last_write: AtomicU64::new(now),
            exchange: Mutex::new(None),
            attrs: Mutex::new(HashMap::new()),
        }
    }

    /// Which end of the connection this context belongs to.
    pub fn side(&self) -> Side {
        self.side
    }

    /// Record a successful receive.
    pub fn mark_read(&self) {
        self.last_read.store(now_millis(), Ordering::Relaxed);
    }

    /// Record a successful send.
    pub fn mark_write(&self) {
        self.last_write.store(now_millis(), Ordering::Relaxed);
    }

    /// Time since the last successful receive.
    pub fn read_idle(&self) -> Duration {
        // ---
        Duration::from_millis(now_millis().saturating_sub(self.last_read.load(Ordering::Relaxed)))
    }

    /// Time since the last successful send.
    pub fn write_idle(&self) -> Duration {
        // ---
        Duration::from_millis(now_millis().saturating_sub(self.last_write.load(Ordering::Relaxed)))
    }

    /// Fetch the cached exchange wrapper, creating it on first use.
    ///
    /// Caching here makes re-wrapping a raw channel idempotent: every caller
    /// sees the same wrapper and therefore the same closing state.
    pub(crate) fn exchange_wrapper(
        &self,
        create: impl FnOnce() -> Arc<ExchangeChannel>,
    ) -> Arc<ExchangeChannel> {
        // ---
        let mut slot = lock_ignore_poison(&self.exchange);
        match &*slot {
            Some(existing) => existing.clone(),
            None => {
                let wrapper = create();
                *slot = Some(wrapper.clone());
                wrapper
            }
        }
    }

    /// Set an extensible attribute.
    pub fn set_attr(&self, key: impl Into<String>, value: impl Into<String>) {
        // ---
        lock_ignore_poison(&self.attrs).insert(key.into(), value.into());
    }

    /// Read an extensible attribute.
    pub fn attr(&self, key: &str) -> Option<String> {
        lock_ignore_poison(&self.attrs).get(key).cloned()
    }

    /// Clear all attributes and the cached wrapper.
    ///
    /// Called on disconnect so nothing from the old connection leaks into a
    /// reconnected one.
    pub fn clear(&self) {
        // ---
        lock_ignore_poison(&self.attrs).clear();
        *lock_ignore_poison(&self.exchange) = None;
    }
}

/// A bidirectional, attribute-bearing connection endpoint.
///
/// Implemented by transports; consumed by the exchange layer. Sends on a
/// single channel are FIFO relative to each other; nothing is guaranteed
/// across channels.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Endpoint configuration this channel was created from.
    fn url(&self) -> &Url;

    /// Per-channel typed state.
    fn context(&self) -> &ChannelContext;

    /// Whether the connection is currently usable.
    fn is_connected(&self) -> bool;

    /// Local address, transport-specific rendering.
    fn local_addr(&self) -> String;

    /// Remote address, transport-specific rendering.
    fn remote_addr(&self) -> String;

    /// Hand a message to the transport.
    ///
    /// With `wait_for_sent` the call waits, bounded by the endpoint
    /// `timeout`, until the transport has accepted the bytes; otherwise it
    /// returns as soon as the message is queued.
    async fn send(&self, message: Message, wait_for_sent: bool) -> Result<()>;

    /// Close the connection. Idempotent.
    async fn close(&self);
}

/// Shared channel pointer.
pub type ChannelPtr = Arc<dyn Channel>;

/// Identity key for a channel.
///
/// Clones of one `Arc` share an allocation, so the pointer address
/// identifies the connection for the correlation table.
pub fn channel_key(channel: &ChannelPtr) -> usize {
    Arc::as_ptr(channel) as *const () as usize
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[tokio::test]
    async fn test_idle_tracking() {
        // ---
        let ctx = ChannelContext::new(Side::Client);
        ctx.mark_read();
        ctx.mark_write();
        assert!(ctx.read_idle() < Duration::from_secs(1));
        assert!(ctx.write_idle() < Duration::from_secs(1));
    }

    #[test]
    fn test_attrs_clear() {
        // ---
        let ctx = ChannelContext::new(Side::Server);
        ctx.set_attr("trace", "abc");
        assert_eq!(ctx.attr("trace").as_deref(), Some("abc"));

        ctx.clear();
        assert_eq!(ctx.attr("trace"), None);
    }
}
