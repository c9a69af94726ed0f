// src/server.rs

//! Exchange server lifecycle.
//!
//! An [`ExchangeServer`] binds a listener and tracks every accepted channel
//! until it disconnects or the server closes. Servers never initiate
//! outbound connects; recovering a lost connection is always the client's
//! job. The server's heartbeat monitor therefore closes dead channels
//! instead of reconnecting them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::channel::{channel_key, lock_ignore_poison};
use crate::exchange::{ChannelProvider, IdleAction};
use crate::macros::{log_debug, log_info, log_warn};
use crate::transport::{Listener, ListenerPtr, Transporter, TransporterPtr};
use crate::{
    // ---
    Channel,
    ChannelHandler,
    ChannelPtr,
    CorrelationTable,
    Error,
    ExchangeChannel,
    ExchangeHandler,
    HandlerPtr,
    Message,
    Result,
    Url,
};

/// Running exchange server.
///
/// Cheap to clone (internally `Arc`-backed).
#[derive(Clone)]
pub struct ExchangeServer {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    url: Url,
    table: Arc<CorrelationTable>,

    listener: Mutex<Option<ListenerPtr>>,
    /// Accepted channels keyed by channel identity.
    channels: Mutex<HashMap<usize, ChannelPtr>>,

    heartbeat: Mutex<Option<crate::exchange::HeartbeatMonitor>>,

    closing: AtomicBool,
    /// Connection limit from `accepts`; 0 means unlimited.
    accepts: usize,
}

impl ExchangeServer {
    // ---

    /// Bind `url` with the given transporter and business handler.
    ///
    /// # Errors
    ///
    /// - `Error::Config`: invalid heartbeat options
    /// - `Error::ConnectFailure`: the transporter could not bind
    pub async fn bind(
        url: Url,
        transporter: TransporterPtr,
        handler: HandlerPtr,
    ) -> Result<Self> {
        // ---
        url.validate_heartbeat()?;

        let table = CorrelationTable::new();
        let accepts = url.accepts();

        let inner = Arc::new(Inner {
            url: url.clone(),
            table: table.clone(),
            listener: Mutex::new(None),
            channels: Mutex::new(HashMap::new()),
            heartbeat: Mutex::new(None),
            closing: AtomicBool::new(false),
            accepts,
        });

        let chain: HandlerPtr = Arc::new(AcceptHandler {
            inner: Arc::downgrade(&inner),
            next: ExchangeHandler::new(handler, table),
        });

        let listener = transporter.bind(&url, chain).await?;
        log_info!("listening on {}", listener.local_url());
        *lock_ignore_poison(&inner.listener) = Some(listener);

        let server = Self { inner };
        server.start_heartbeat();
        Ok(server)
    }

    /// Endpoint this server was bound from.
    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    /// The effective local address, if still bound.
    pub fn local_url(&self) -> Option<Url> {
        // ---
        lock_ignore_poison(&self.inner.listener)
            .as_ref()
            .map(|l| l.local_url().clone())
    }

    /// Whether the listener is still accepting.
    pub fn is_bound(&self) -> bool {
        // ---
        !self.inner.closing.load(Ordering::Relaxed)
            && lock_ignore_poison(&self.inner.listener).is_some()
    }

    /// Snapshot of the currently accepted channels.
    pub fn channels(&self) -> Vec<ChannelPtr> {
        // ---
        lock_ignore_poison(&self.inner.channels)
            .values()
            .cloned()
            .collect()
    }

    /// Number of currently accepted channels.
    pub fn channel_count(&self) -> usize {
        lock_ignore_poison(&self.inner.channels).len()
    }

    /// Number of inbound calls with responses still pending.
    pub fn pending_calls(&self) -> usize {
        self.inner.table.len()
    }

    /// Broadcast a message to every accepted channel, best effort.
    ///
    /// Failures are logged per channel and never abort the loop; the
    /// returned count is how many channels accepted the message.
    pub async fn send(&self, message: Message, wait_for_sent: bool) -> usize {
        // ---
        let mut delivered = 0;
        for channel in self.channels() {
            let exchange = ExchangeChannel::wrap(&channel, &self.inner.table);
            match exchange.send(message.clone(), wait_for_sent).await {
                Ok(()) => delivered += 1,
                Err(_err) => {
                    log_warn!("broadcast to {} failed: {_err}", channel.remote_addr());
                }
            }
        }
        delivered
    }

    /// Close the server for good.
    ///
    /// Stops accepting first, then gracefully closes every accepted channel
    /// within the shared `timeout` budget. Idempotent; shutdown always
    /// completes.
    pub async fn close(&self, timeout: Duration) {
        // ---
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(monitor) = lock_ignore_poison(&self.inner.heartbeat).take() {
            monitor.stop();
        }

        // Drain first, unbind last. The closing flag already refuses any
        // channel accepted at the fabric level in the meantime.
        //
        // One deadline across all channels, so a slow drain on one cannot
        // extend the total shutdown time.
        let deadline = Instant::now() + timeout;
        let channels: Vec<ChannelPtr> = {
            let mut map = lock_ignore_poison(&self.inner.channels);
            map.drain().map(|(_, ch)| ch).collect()
        };

        for channel in channels {
            let remaining = deadline.saturating_duration_since(Instant::now());
            ExchangeChannel::wrap(&channel, &self.inner.table)
                .close(remaining)
                .await;
        }

        if let Some(listener) = lock_ignore_poison(&self.inner.listener).take() {
            listener.unbind().await;
        }

        log_info!("closed server for {}", self.inner.url);
    }

    /// Start the heartbeat monitor when the endpoint enables it.
    ///
    /// The idle action closes the channel; the client notices and
    /// reconnects on its own schedule.
    fn start_heartbeat(&self) {
        // ---
        let interval = self.inner.url.heartbeat();
        if interval.is_zero() {
            return;
        }
        let timeout = self.inner.url.heartbeat_timeout();

        let provider: ChannelProvider = {
            let weak = Arc::downgrade(&self.inner);
            Arc::new(move || {
                weak.upgrade()
                    .map(|inner| {
                        lock_ignore_poison(&inner.channels)
                            .values()
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default()
            })
        };

        let on_idle: IdleAction = Arc::new(|channel: ChannelPtr| {
            Box::pin(async move {
                channel.close().await;
            })
        });

        *lock_ignore_poison(&self.inner.heartbeat) = Some(
            crate::exchange::HeartbeatMonitor::start(interval, timeout, provider, on_idle),
        );
    }
}

/// Server-side hook in the handler chain: admission control and channel
/// registry maintenance.
struct AcceptHandler {
    inner: Weak<Inner>,
    next: HandlerPtr,
}

impl AcceptHandler {
    /// Admit the channel, or close it when the server is full or closing.
    ///
    /// Returns `true` when the channel was registered.
    async fn admit(&self, channel: &ChannelPtr) -> bool {
        // ---
        let Some(inner) = self.inner.upgrade() else {
            channel.close().await;
            return false;
        };

        if inner.closing.load(Ordering::Relaxed) {
            log_debug!("refusing {} while closing", channel.remote_addr());
            channel.close().await;
            return false;
        }

        // Admission is decided in one sync block; the registry guard must
        // not be held across an await.
        let admitted = {
            let mut channels = lock_ignore_poison(&inner.channels);
            if inner.accepts > 0 && channels.len() >= inner.accepts {
                false
            } else {
                channels.insert(channel_key(channel), channel.clone());
                true
            }
        };

        if !admitted {
            log_warn!(
                "refusing {}: accept limit {} reached",
                channel.remote_addr(),
                inner.accepts,
            );
            channel.close().await;
            return false;
        }

        log_debug!("accepted {}", channel.remote_addr());
        true
    }
}

#[async_trait]
impl ChannelHandler for AcceptHandler {
    // ---

    async fn connected(&self, channel: ChannelPtr) -> Result<()> {
        // ---
        if !self.admit(&channel).await {
            // Refused channels never reach the business handler.
            return Ok(());
        }
        self.next.connected(channel).await
    }

    async fn disconnected(&self, channel: ChannelPtr) -> Result<()> {
        // ---
        let registered = self
            .inner
            .upgrade()
            .map(|inner| {
                let mut channels = lock_ignore_poison(&inner.channels);
                let removed = channels.remove(&channel_key(&channel)).is_some();
                if removed && channels.is_empty() {
                    log_info!("last channel disconnected from {}", inner.url);
                }
                removed
            })
            .unwrap_or(false);

        if !registered {
            // A refused channel's teardown; the business handler never saw
            // it connect, so it does not see it disconnect.
            return Ok(());
        }
        self.next.disconnected(channel).await
    }

    async fn received(&self, channel: ChannelPtr, message: Message) -> Result<()> {
        self.next.received(channel, message).await
    }

    async fn sent(&self, channel: ChannelPtr, message: &Message) -> Result<()> {
        self.next.sent(channel, message).await
    }

    async fn caught(&self, channel: ChannelPtr, error: Error) -> Result<()> {
        self.next.caught(channel, error).await
    }
}
