// src/transport/memory.rs

//! In-memory transport implementation.
//!
//! A pure in-process implementation of [`Transporter`], intended for
//! testing, local execution, and as the reference for transport semantics.
//!
//! ## Reference Semantics
//!
//! The in-memory transport defines the **reference behavior** every real
//! transport is expected to approximate:
//!
//! - `connect` fails with `ConnectFailure` when nothing listens on the
//!   target authority.
//! - Sends on one channel are delivered FIFO; nothing is ordered across
//!   channels.
//! - Closing either end of a connection fires `disconnected` on both ends.
//! - Handler callbacks run on transport tasks, concurrently across
//!   channels; callback errors are reported through `caught` and never stop
//!   the receive loop.
//!
//! ## Non-Goals
//!
//! No attempt is made to emulate the failure modes of any real network.
//! Messages pass by value, so the codec layer is bypassed entirely here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::time;

use crate::channel::lock_ignore_poison;
use crate::macros::{log_debug, log_info, log_warn};
use crate::{
    // ---
    Channel,
    ChannelContext,
    ChannelPtr,
    Error,
    HandlerPtr,
    Listener,
    ListenerPtr,
    Message,
    Result,
    Side,
    Transporter,
    Url,
};

/// Outbound queue depth per channel.
const SEND_QUEUE: usize = 64;

/// Shared connection fabric for the in-memory transport.
///
/// Simulates a network within a single process: listeners register under
/// their bind authority, and connecting to that authority cross-wires a
/// pair of channels exactly as an accepted socket would.
///
/// Production-style use goes through the process-global hub
/// ([`MemoryTransporter::new`]); tests that need isolation construct their
/// own hub and use [`MemoryTransporter::with_hub`].
pub struct MemoryHub {
    // ---
    listeners: Mutex<HashMap<String, ListenerEntry>>,
}

#[derive(Clone)]
struct ListenerEntry {
    url: Url,
    handler: HandlerPtr,
}

impl MemoryHub {
    /// Create a new, empty hub.
    pub fn new() -> Arc<Self> {
        // ---
        Arc::new(Self {
            listeners: Mutex::new(HashMap::new()),
        })
    }

    async fn connect(&self, url: &Url, handler: HandlerPtr) -> Result<ChannelPtr> {
        // ---
        let authority = url.authority();
        let entry = lock_ignore_poison(&self.listeners)
            .get(&authority)
            .cloned()
            .ok_or_else(|| Error::ConnectFailure(format!("connection refused: {authority}")))?;

        let (to_server_tx, to_server_rx) = mpsc::channel(SEND_QUEUE);
        let (to_client_tx, to_client_rx) = mpsc::channel(SEND_QUEUE);

        let client_addr = format!("client:{}", crate::next_request_id());

        let client = MemoryChannel::new(
            url.clone(),
            Side::Client,
            to_server_tx,
            handler.clone(),
            client_addr.clone(),
            authority.clone(),
        );
        let server = MemoryChannel::new(
            entry.url.clone(),
            Side::Server,
            to_client_tx,
            entry.handler.clone(),
            authority,
            client_addr,
        );

        spawn_read_loop(server.clone(), to_server_rx, entry.handler.clone());
        spawn_read_loop(client.clone(), to_client_rx, handler.clone());

        // Accept side first, so a rejecting server (limit, shutdown) closes
        // the pair before the client ever observes a usable channel.
        let server_ch: ChannelPtr = server;
        if let Err(_err) = entry.handler.connected(server_ch).await {
            log_warn!("accept handler error: {_err}");
        }

        let client_ch: ChannelPtr = client;
        if let Err(_err) = handler.connected(client_ch.clone()).await {
            log_warn!("connect handler error: {_err}");
        }

        Ok(client_ch)
    }

    async fn bind(self: &Arc<Self>, url: &Url, handler: HandlerPtr) -> Result<ListenerPtr> {
        // ---
        let bind_url = url.bind_url();
        let authority = bind_url.authority();

        let mut listeners = lock_ignore_poison(&self.listeners);
        if listeners.contains_key(&authority) {
            return Err(Error::ConnectFailure(format!(
                "address already in use: {authority}"
            )));
        }
        listeners.insert(
            authority.clone(),
            ListenerEntry {
                url: url.clone(),
                handler,
            },
        );
        drop(listeners);

        log_debug!("listening on {authority}");

        Ok(Arc::new(MemoryListener {
            hub: Arc::downgrade(self),
            local_url: bind_url,
        }))
    }

    fn unbind(&self, authority: &str) {
        // ---
        if lock_ignore_poison(&self.listeners).remove(authority).is_some() {
            log_info!("unbound {authority}");
        }
    }
}

/// Process-global hub used by [`MemoryTransporter::new`].
static GLOBAL_HUB: OnceLock<Arc<MemoryHub>> = OnceLock::new();

fn global_hub() -> Arc<MemoryHub> {
    GLOBAL_HUB.get_or_init(MemoryHub::new).clone()
}

/// In-memory transporter.
pub struct MemoryTransporter {
    hub: Arc<MemoryHub>,
}

impl MemoryTransporter {
    // ---

    /// Transporter backed by the process-global hub.
    pub fn new() -> Self {
        Self { hub: global_hub() }
    }

    /// Transporter backed by an explicit hub, for isolated parallel tests.
    pub fn with_hub(hub: Arc<MemoryHub>) -> Self {
        Self { hub }
    }
}

impl Default for MemoryTransporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transporter for MemoryTransporter {
    // ---

    async fn connect(&self, url: &Url, handler: HandlerPtr) -> Result<ChannelPtr> {
        self.hub.connect(url, handler).await
    }

    async fn bind(&self, url: &Url, handler: HandlerPtr) -> Result<ListenerPtr> {
        self.hub.bind(url, handler).await
    }
}

struct MemoryListener {
    hub: Weak<MemoryHub>,
    local_url: Url,
}

#[async_trait]
impl Listener for MemoryListener {
    // ---

    fn local_url(&self) -> &Url {
        &self.local_url
    }

    async fn unbind(&self) {
        // ---
        if let Some(hub) = self.hub.upgrade() {
            hub.unbind(&self.local_url.authority());
        }
    }
}

/// One end of an in-memory connection.
struct MemoryChannel {
    // ---
    url: Url,
    ctx: ChannelContext,
    out: Mutex<Option<mpsc::Sender<Message>>>,
    closed: watch::Sender<bool>,
    handler: HandlerPtr,
    local: String,
    remote: String,
    /// Back-reference so `sent` callbacks can carry the channel itself.
    me: Weak<MemoryChannel>,
}

impl MemoryChannel {
    // ---

    fn new(
        url: Url,
        side: Side,
        out: mpsc::Sender<Message>,
        handler: HandlerPtr,
        local: String,
        remote: String,
    ) -> Arc<Self> {
        // ---
        Arc::new_cyclic(|me| Self {
            url,
            ctx: ChannelContext::new(side),
            out: Mutex::new(Some(out)),
            closed: watch::Sender::new(false),
            handler,
            local,
            remote,
            me: me.clone(),
        })
    }

    fn closed_rx(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    // ---

    fn url(&self) -> &Url {
        &self.url
    }

    fn context(&self) -> &ChannelContext {
        &self.ctx
    }

    fn is_connected(&self) -> bool {
        !*self.closed.borrow()
    }

    fn local_addr(&self) -> String {
        self.local.clone()
    }

    fn remote_addr(&self) -> String {
        self.remote.clone()
    }

    async fn send(&self, message: Message, wait_for_sent: bool) -> Result<()> {
        // ---
        if !self.is_connected() {
            return Err(Error::ChannelClosed);
        }
        let tx = lock_ignore_poison(&self.out)
            .clone()
            .ok_or(Error::ChannelClosed)?;

        // The queue preserves FIFO order per channel. `wait_for_sent`
        // bounds the wait for queue acceptance on the endpoint timeout.
        let outbound = message.clone();
        if wait_for_sent {
            time::timeout(self.url.timeout(), tx.send(outbound))
                .await
                .map_err(|_| {
                    Error::SendFailure(format!(
                        "send to {} timed out after {:?}",
                        self.remote,
                        self.url.timeout()
                    ))
                })?
                .map_err(|_| Error::ChannelClosed)?;
        } else {
            tx.send(outbound).await.map_err(|_| Error::ChannelClosed)?;
        }

        self.ctx.mark_write();

        if let Some(me) = self.me.upgrade() {
            let ch: ChannelPtr = me;
            if let Err(_err) = self.handler.sent(ch, &message).await {
                log_debug!("sent callback error: {_err}");
            }
        }

        Ok(())
    }

    async fn close(&self) {
        // ---
        if !self.closed.send_replace(true) {
            // Dropping our sender makes the peer's receive loop observe
            // end-of-stream and fire its disconnect path.
            *lock_ignore_poison(&self.out) = None;
            log_debug!("closed channel {} -> {}", self.local, self.remote);
        }
    }
}

/// Receive loop for one channel end.
///
/// Dispatches inbound messages to the handler chain; a callback error is
/// routed through `caught` and the loop continues. Exits when the peer's
/// sender drops or this end closes, then fires `disconnected` exactly once.
fn spawn_read_loop(channel: Arc<MemoryChannel>, mut rx: mpsc::Receiver<Message>, handler: HandlerPtr) {
    // ---
    tokio::spawn(async move {
        let mut closed = channel.closed_rx();

        loop {
            let message = tokio::select! {
                _ = closed.wait_for(|closed| *closed) => None,
                message = rx.recv() => message,
            };
            let Some(message) = message else { break };

            channel.context().mark_read();

            let ch: ChannelPtr = channel.clone();
            if let Err(err) = handler.received(ch.clone(), message).await {
                if let Err(_err) = handler.caught(ch, err).await {
                    log_warn!("caught callback error: {_err}");
                }
            }
        }

        channel.close().await;

        let ch: ChannelPtr = channel.clone();
        if let Err(_err) = handler.disconnected(ch).await {
            log_warn!("disconnect callback error: {_err}");
        }
    });
}

#[cfg(test)]
pub(crate) fn test_channel() -> ChannelPtr {
    // ---
    test_channel_with_url(Url::new("mem", "localhost", 0))
}

/// Detached channel for unit tests: sends drain into a black hole.
#[cfg(test)]
pub(crate) fn test_channel_with_url(url: Url) -> ChannelPtr {
    // ---
    struct NoopHandler;

    #[async_trait]
    impl crate::ChannelHandler for NoopHandler {}

    let (tx, mut rx) = mpsc::channel(SEND_QUEUE);
    tokio::spawn(async move { while rx.recv().await.is_some() {} });

    MemoryChannel::new(
        url,
        Side::Client,
        tx,
        Arc::new(NoopHandler),
        "test-local".to_owned(),
        "test-remote".to_owned(),
    )
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{ChannelHandler, Request};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    struct Recorder {
        received: AsyncMutex<Vec<Message>>,
        disconnects: AtomicUsize,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            // ---
            Arc::new(Self {
                received: AsyncMutex::new(Vec::new()),
                disconnects: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ChannelHandler for Recorder {
        // ---
        async fn received(&self, _channel: ChannelPtr, message: Message) -> Result<()> {
            self.received.lock().await.push(message);
            Ok(())
        }

        async fn disconnected(&self, _channel: ChannelPtr) -> Result<()> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_connect_refused_without_listener() {
        // ---
        let hub = MemoryHub::new();
        let transporter = MemoryTransporter::with_hub(hub);
        let url = Url::new("mem", "nobody", 1);

        let result = transporter.connect(&url, Recorder::new()).await;
        assert!(matches!(result, Err(Error::ConnectFailure(_))));
    }

    #[tokio::test]
    async fn test_delivery_both_ways() {
        // ---
        let hub = MemoryHub::new();
        let transporter = MemoryTransporter::with_hub(hub);
        let url = Url::new("mem", "svc", 1);

        let server_side = Recorder::new();
        let client_side = Recorder::new();

        let _listener = transporter.bind(&url, server_side.clone()).await.unwrap();
        let channel = transporter.connect(&url, client_side.clone()).await.unwrap();

        channel
            .send(
                Message::Request(Request::oneway(Bytes::from_static(b"ping"))),
                true,
            )
            .await
            .unwrap();

        tokio::task::yield_now().await;
        time::sleep(std::time::Duration::from_millis(10)).await;

        let received = server_side.received.lock().await;
        assert_eq!(received.len(), 1);
    }

    #[tokio::test]
    async fn test_close_fires_disconnect_on_both_ends() {
        // ---
        let hub = MemoryHub::new();
        let transporter = MemoryTransporter::with_hub(hub);
        let url = Url::new("mem", "svc", 2);

        let server_side = Recorder::new();
        let client_side = Recorder::new();

        let _listener = transporter.bind(&url, server_side.clone()).await.unwrap();
        let channel = transporter.connect(&url, client_side.clone()).await.unwrap();

        channel.close().await;
        time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(!channel.is_connected());
        assert_eq!(client_side.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(server_side.disconnects.load(Ordering::SeqCst), 1);

        // Double close is a no-op.
        channel.close().await;
        time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(client_side.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unbind_refuses_new_connections() {
        // ---
        let hub = MemoryHub::new();
        let transporter = MemoryTransporter::with_hub(hub);
        let url = Url::new("mem", "svc", 3);

        let listener = transporter.bind(&url, Recorder::new()).await.unwrap();
        listener.unbind().await;

        let result = transporter.connect(&url, Recorder::new()).await;
        assert!(matches!(result, Err(Error::ConnectFailure(_))));
    }
}
