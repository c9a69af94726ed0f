// src/client.rs

//! Exchange client lifecycle.
//!
//! An [`ExchangeClient`] owns one logical channel at a time and drives it
//! through `Opening → Connecting → Connected ⇄ Disconnected → Closed`.
//! Self-healing is silent: a periodic task retries lost connections and a
//! heartbeat monitor forces a reconnect after a read-idle timeout. Errors
//! surface only from an explicit synchronous `connect` and from awaiting a
//! call handle.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::channel::{channel_key, lock_ignore_poison, now_millis};
use crate::exchange::{ChannelProvider, HeartbeatMonitor, IdleAction};
use crate::macros::{log_debug, log_error, log_info, log_warn};
use crate::transport::{Transporter, TransporterPtr};
use crate::{
    // ---
    next_request_id,
    Channel,
    ChannelHandler,
    ChannelPtr,
    CorrelationTable,
    Error,
    ExchangeChannel,
    ExchangeHandler,
    HandlerPtr,
    Message,
    ResponseFuture,
    Result,
    Url,
};

/// Client connection states. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Local resources opened, no connect attempted yet.
    Opening,
    /// A connect attempt is in flight.
    Connecting,
    /// A live channel exists.
    Connected,
    /// No live channel; the periodic task retries.
    Disconnected,
    /// Closed for good.
    Closed,
}

/// Running exchange client.
///
/// Cheap to clone (internally `Arc`-backed).
#[derive(Clone)]
pub struct ExchangeClient {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    url: Url,
    transporter: TransporterPtr,
    /// Full handler chain handed to the transporter on every connect.
    handler: HandlerPtr,
    table: Arc<CorrelationTable>,

    state: Mutex<ClientState>,
    channel: Mutex<Option<ChannelPtr>>,

    /// Serializes connect attempts. Only ever taken from caller or
    /// background tasks, never from transport callbacks, so it cannot
    /// deadlock against the I/O path.
    connect_lock: tokio::sync::Mutex<()>,

    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    heartbeat: Mutex<Option<HeartbeatMonitor>>,

    /// Millis timestamp of the last successful connect, refreshed while
    /// connected.
    last_connected: AtomicU64,
    /// Consecutive connect failures since the last success.
    failures: AtomicU32,
    /// Ensures a persistent outage is error-logged once, not per attempt.
    outage_logged: AtomicBool,
}

impl ExchangeClient {
    // ---

    /// Connect to `url` with the given transporter and business handler.
    ///
    /// With `check=true` (the default) a failed first connect fails
    /// construction; with `check=false` the client is returned disconnected
    /// and the periodic task retries lazily.
    ///
    /// # Errors
    ///
    /// - `Error::Config`: invalid heartbeat options
    /// - `Error::ConnectFailure`: first connect failed and `check=true`
    pub async fn connect(
        url: Url,
        transporter: TransporterPtr,
        handler: HandlerPtr,
    ) -> Result<Self> {
        // ---
        url.validate_heartbeat()?;

        let table = CorrelationTable::new();

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            // ---
            let exchange = ExchangeHandler::new(handler, table.clone());
            let chain: HandlerPtr = Arc::new(ClientHandler {
                inner: weak.clone(),
                next: exchange,
            });

            Inner {
                url,
                transporter,
                handler: chain,
                table,
                state: Mutex::new(ClientState::Opening),
                channel: Mutex::new(None),
                connect_lock: tokio::sync::Mutex::new(()),
                reconnect_task: Mutex::new(None),
                heartbeat: Mutex::new(None),
                last_connected: AtomicU64::new(now_millis()),
                failures: AtomicU32::new(0),
                outage_logged: AtomicBool::new(false),
            }
        });

        let client = Self { inner };

        if let Err(err) = client.do_connect().await {
            if client.inner.url.check() {
                return Err(err);
            }
            log_warn!(
                "initial connect to {} failed, leaving client disconnected: {err}",
                client.inner.url,
            );
        }

        client.start_heartbeat();

        Ok(client)
    }

    /// Endpoint this client talks to.
    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClientState {
        *lock_ignore_poison(&self.inner.state)
    }

    /// Whether a live channel exists right now.
    pub fn is_connected(&self) -> bool {
        // ---
        lock_ignore_poison(&self.inner.channel)
            .as_ref()
            .map(|ch| ch.is_connected())
            .unwrap_or(false)
    }

    /// The current raw channel, if any.
    pub fn channel(&self) -> Option<ChannelPtr> {
        lock_ignore_poison(&self.inner.channel).clone()
    }

    /// Consecutive connect failures since the last success.
    pub fn failure_count(&self) -> u32 {
        self.inner.failures.load(Ordering::Relaxed)
    }

    /// Number of calls currently awaiting responses.
    pub fn pending_calls(&self) -> usize {
        self.inner.table.len()
    }

    /// Send a two-way request, waiting up to the endpoint `timeout`.
    pub async fn request(&self, payload: Bytes) -> ResponseFuture {
        let timeout = self.inner.url.timeout();
        self.request_with_timeout(payload, timeout).await
    }

    /// Send a two-way request with an explicit timeout.
    ///
    /// Always returns a handle; fail-fast conditions (no channel, closed)
    /// resolve the handle immediately rather than raising here.
    pub async fn request_with_timeout(&self, payload: Bytes, timeout: Duration) -> ResponseFuture {
        // ---
        if !self.is_connected() && self.inner.url.send_reconnect() {
            if let Err(err) = self.do_connect().await {
                return ResponseFuture::failed(next_request_id(), err);
            }
        }

        match self.exchange_channel() {
            Some(exchange) => exchange.request_with_timeout(payload, timeout).await,
            None => ResponseFuture::failed(next_request_id(), Error::ChannelClosed),
        }
    }

    /// Send a message.
    ///
    /// With `send.reconnect` a disconnected client connects synchronously
    /// first; otherwise a live channel is required and the call fails fast
    /// with `ChannelClosed`. Sends are never queued while disconnected.
    pub async fn send(&self, message: Message, wait_for_sent: bool) -> Result<()> {
        // ---
        if !self.is_connected() && self.inner.url.send_reconnect() {
            self.do_connect().await?;
        }

        match self.exchange_channel() {
            Some(exchange) => exchange.send(message, wait_for_sent).await,
            None => Err(Error::ChannelClosed),
        }
    }

    /// Drop the current channel and connect again.
    ///
    /// Used after heartbeat-timeout detection; also available to callers.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConnectFailure` if the new connect fails.
    pub async fn reconnect(&self) -> Result<()> {
        // ---
        self.disconnect().await;
        self.do_connect().await
    }

    /// Drop the current channel, staying open for later reconnects.
    pub async fn disconnect(&self) {
        // ---
        let channel = lock_ignore_poison(&self.inner.channel).take();

        {
            let mut state = lock_ignore_poison(&self.inner.state);
            if *state != ClientState::Closed {
                *state = ClientState::Disconnected;
            }
        }

        if let Some(channel) = channel {
            // Pending calls on the dropped channel resolve now rather than
            // waiting for their timeouts.
            self.inner.table.close_channel(channel_key(&channel));
            channel.close().await;
        }
    }

    /// Close the client for good.
    ///
    /// Pending calls get up to `timeout` to drain before the channel is
    /// forced closed. Every step is best-effort; a second close is a no-op
    /// and shutdown always completes.
    pub async fn close(&self, timeout: Duration) {
        // ---
        {
            let mut state = lock_ignore_poison(&self.inner.state);
            if *state == ClientState::Closed {
                return;
            }
            *state = ClientState::Closed;
        }

        if let Some(task) = lock_ignore_poison(&self.inner.reconnect_task).take() {
            task.abort();
        }
        if let Some(monitor) = lock_ignore_poison(&self.inner.heartbeat).take() {
            monitor.stop();
        }

        let channel = lock_ignore_poison(&self.inner.channel).take();
        if let Some(channel) = channel {
            ExchangeChannel::wrap(&channel, &self.inner.table)
                .close(timeout)
                .await;
        }

        log_info!("closed client for {}", self.inner.url);
    }

    /// The exchange wrapper for the current channel, if any.
    fn exchange_channel(&self) -> Option<Arc<ExchangeChannel>> {
        // ---
        let channel = lock_ignore_poison(&self.inner.channel).clone()?;
        Some(ExchangeChannel::wrap(&channel, &self.inner.table))
    }

    /// One guarded connect attempt.
    ///
    /// No-op when already connected. An explicit caller gets the failure;
    /// the periodic task only logs it.
    async fn do_connect(&self) -> Result<()> {
        // ---
        let inner = &self.inner;
        let _guard = inner.connect_lock.lock().await;

        if *lock_ignore_poison(&inner.state) == ClientState::Closed {
            return Err(Error::ChannelClosed);
        }
        if self.is_connected() {
            return Ok(());
        }

        self.ensure_reconnect_task();

        *lock_ignore_poison(&inner.state) = ClientState::Connecting;

        let attempt = time::timeout(
            inner.url.connect_timeout(),
            inner.transporter.connect(&inner.url, inner.handler.clone()),
        )
        .await;

        match attempt {
            Ok(Ok(channel)) => {
                *lock_ignore_poison(&inner.channel) = Some(channel);
                *lock_ignore_poison(&inner.state) = ClientState::Connected;
                inner.last_connected.store(now_millis(), Ordering::Relaxed);
                inner.failures.store(0, Ordering::Relaxed);
                inner.outage_logged.store(false, Ordering::Relaxed);
                log_info!("connected to {}", inner.url);
                Ok(())
            }
            Ok(Err(err)) => {
                *lock_ignore_poison(&inner.state) = ClientState::Disconnected;
                inner.failures.fetch_add(1, Ordering::Relaxed);
                Err(Error::ConnectFailure(format!("{}: {err}", inner.url)))
            }
            Err(_elapsed) => {
                *lock_ignore_poison(&inner.state) = ClientState::Disconnected;
                inner.failures.fetch_add(1, Ordering::Relaxed);
                Err(Error::ConnectFailure(format!(
                    "{}: connect timed out after {:?}",
                    inner.url,
                    inner.url.connect_timeout()
                )))
            }
        }
    }

    /// Start the periodic reconnect-check on first use.
    ///
    /// Disabled entirely by `reconnect=false`. The task holds only a weak
    /// reference, so it dies with the client.
    fn ensure_reconnect_task(&self) {
        // ---
        let Some(period) = self.inner.url.reconnect_interval() else {
            return;
        };

        let mut slot = lock_ignore_poison(&self.inner.reconnect_task);
        if slot.is_some() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let shutdown_timeout = self.inner.url.shutdown_timeout();

        *slot = Some(tokio::spawn(async move {
            // ---
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let Some(inner) = weak.upgrade() else { break };
                if *lock_ignore_poison(&inner.state) == ClientState::Closed {
                    break;
                }

                let client = ExchangeClient { inner };
                if client.is_connected() {
                    client
                        .inner
                        .last_connected
                        .store(now_millis(), Ordering::Relaxed);
                    continue;
                }

                if let Err(_err) = client.do_connect().await {
                    let outage =
                        now_millis().saturating_sub(client.inner.last_connected.load(Ordering::Relaxed));
                    if outage > shutdown_timeout.as_millis() as u64
                        && !client.inner.outage_logged.swap(true, Ordering::SeqCst)
                    {
                        // One error-level line per outage, not per attempt.
                        log_error!(
                            "client {} unreachable for {outage}ms: {_err}",
                            client.inner.url,
                        );
                    } else {
                        log_debug!("reconnect attempt failed: {_err}");
                    }
                }
            }
        }));
    }

    /// Start the heartbeat monitor when the endpoint enables it.
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
                    .and_then(|inner| lock_ignore_poison(&inner.channel).clone())
                    .into_iter()
                    .collect()
            })
        };

        let on_idle: IdleAction = {
            let weak = Arc::downgrade(&self.inner);
            Arc::new(move |channel: ChannelPtr| {
                let weak = weak.clone();
                Box::pin(async move {
                    // ---
                    let Some(inner) = weak.upgrade() else { return };
                    let client = ExchangeClient { inner };
                    let _remote = channel.remote_addr();
                    log_warn!("heartbeat timed out on {_remote}, reconnecting");
                    if let Err(_err) = client.reconnect().await {
                        log_warn!("reconnect after heartbeat timeout failed: {_err}");
                    }
                })
            })
        };

        *lock_ignore_poison(&self.inner.heartbeat) =
            Some(HeartbeatMonitor::start(interval, timeout, provider, on_idle));
    }
}

/// Client-side hook in the handler chain: keeps the lifecycle state in sync
/// with what the transport reports.
struct ClientHandler {
    inner: Weak<Inner>,
    next: HandlerPtr,
}

#[async_trait]
impl ChannelHandler for ClientHandler {
    // ---

    async fn connected(&self, channel: ChannelPtr) -> Result<()> {
        self.next.connected(channel).await
    }

    async fn disconnected(&self, channel: ChannelPtr) -> Result<()> {
        // ---
        if let Some(inner) = self.inner.upgrade() {
            let mut slot = lock_ignore_poison(&inner.channel);
            // A reconnect may already have installed a fresh channel; only
            // clear the slot if it still holds the dying one.
            let is_current = slot
                .as_ref()
                .map(|current| channel_key(current) == channel_key(&channel))
                .unwrap_or(false);
            if is_current {
                *slot = None;
            }
            drop(slot);

            let mut state = lock_ignore_poison(&inner.state);
            if is_current && *state != ClientState::Closed {
                *state = ClientState::Disconnected;
            }
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
