// src/exchange/correlation.rs

//! Correlation of asynchronous responses to pending calls.
//!
//! The [`CorrelationTable`] maps request ids to pending-call entries. It is
//! an explicit, injectable service whose lifetime is owned by the composing
//! client or server, never process-global state.
//!
//! Each entry is resolved exactly once, by whichever of {matching response,
//! timeout, channel close, send failure} wins. Removal is idempotent: the
//! losers of that race find the entry gone and do nothing.
//!
//! # Concurrency
//!
//! Entries are created by the issuing task and removed by arbitrary I/O or
//! timer tasks. The map is guarded by a mutex with insert/remove-sized
//! critical sections. Every removal fires a [`Notify`] so graceful close can
//! wait for a channel's entries to drain without polling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::channel::lock_ignore_poison;
use crate::macros::log_debug;
use crate::{Error, Response, Result};

/// One pending two-way call.
struct Pending {
    // ---
    /// Identity of the channel the request went out on.
    channel: usize,
    tx: oneshot::Sender<Result<Response>>,
    /// Timer resolving this entry with `Timeout`; aborted when anything
    /// else wins.
    timer: Option<JoinHandle<()>>,
}

/// Awaitable handle for one two-way call.
///
/// Returned immediately by `request()`; the caller blocks on it from its own
/// task, never from the I/O path.
pub struct ResponseFuture {
    id: i64,
    rx: oneshot::Receiver<Result<Response>>,
}

impl ResponseFuture {
    // ---

    /// Correlation id of the underlying request.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Handle that is already resolved with an error.
    ///
    /// Used for fail-fast paths (no live channel, payload too large) so the
    /// caller sees a uniform awaitable either way.
    pub(crate) fn failed(id: i64, error: Error) -> Self {
        // ---
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error));
        Self { id, rx }
    }

    /// Wait for the call to resolve.
    ///
    /// # Errors
    ///
    /// Exactly one of: the error the entry was resolved with (`Timeout`,
    /// `SendFailure`, `ChannelClosed`, ...), or `ChannelClosed` if the
    /// correlation table itself was dropped.
    pub async fn wait(self) -> Result<Response> {
        // ---
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ChannelClosed),
        }
    }
}

/// Process-visible map from request id to pending-call entry.
pub struct CorrelationTable {
    pending: Mutex<HashMap<i64, Pending>>,
    drained: Notify,
}

impl CorrelationTable {
    // ---

    /// Create an empty table.
    pub fn new() -> Arc<Self> {
        // ---
        Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
            drained: Notify::new(),
        })
    }

    /// Register a pending entry for `id` on `channel`.
    ///
    /// Must be called **before** the request is transmitted, so a response
    /// racing back on the I/O thread always finds the entry. A timer task
    /// resolves the entry with [`Error::Timeout`] at the deadline.
    ///
    /// Invariant: at most one live entry per id. Ids come from
    /// [`next_request_id`](crate::next_request_id) and are never reused
    /// while outstanding, so an occupied slot indicates a caller bug; the
    /// old entry is resolved with an internal error rather than leaked.
    pub fn register(self: &Arc<Self>, channel: usize, id: i64, timeout: Duration) -> ResponseFuture {
        // ---
        let (tx, rx) = oneshot::channel();

        // The entry goes into the map before the timer task exists, so even
        // a zero timeout finds it and resolves it.
        let previous = {
            let mut pending = lock_ignore_poison(&self.pending);
            pending.insert(
                id,
                Pending {
                    channel,
                    tx,
                    timer: None,
                },
            )
        };

        if let Some(previous) = previous {
            // Ids wrapped into a still-outstanding call. Resolve the old
            // entry so its caller does not hang forever.
            if let Some(timer) = previous.timer {
                timer.abort();
            }
            let _ = previous
                .tx
                .send(Err(Error::SendFailure(format!("request id {id} reused"))));
        }

        let timer = {
            let table = Arc::downgrade(self);
            tokio::spawn(async move {
                // ---
                time::sleep(timeout).await;
                if let Some(table) = table.upgrade() {
                    table.resolve(id, Err(Error::Timeout));
                }
            })
        };

        // Attach the timer unless something already resolved the entry.
        {
            let mut pending = lock_ignore_poison(&self.pending);
            match pending.get_mut(&id) {
                Some(entry) => entry.timer = Some(timer),
                None => timer.abort(),
            }
        }

        ResponseFuture { id, rx }
    }

    /// Resolve and remove the entry for `id`. Idempotent.
    pub fn resolve(&self, id: i64, result: Result<Response>) {
        // ---
        let entry = {
            let mut pending = lock_ignore_poison(&self.pending);
            pending.remove(&id)
        };

        let Some(entry) = entry else {
            // Late, duplicate or unknown id: drop silently. Never an error
            // on the I/O thread.
            log_debug!("no pending call for id {id}, dropping result");
            return;
        };

        if let Some(timer) = entry.timer {
            timer.abort();
        }

        // A dropped receiver means the caller abandoned the call.
        let _ = entry.tx.send(result);
        self.drained.notify_waiters();
    }

    /// Route an inbound response to its pending call.
    pub fn on_response(&self, response: Response) {
        self.resolve(response.id, Ok(response));
    }

    /// Resolve every entry registered against `channel` with
    /// [`Error::ChannelClosed`].
    ///
    /// A pending call must never hang because its channel died.
    pub fn close_channel(&self, channel: usize) {
        // ---
        let ids: Vec<i64> = {
            let pending = lock_ignore_poison(&self.pending);
            pending
                .iter()
                .filter(|(_, entry)| entry.channel == channel)
                .map(|(id, _)| *id)
                .collect()
        };

        for id in ids {
            self.resolve(id, Err(Error::ChannelClosed));
        }
    }

    /// Number of pending entries registered against `channel`.
    pub fn pending_count(&self, channel: usize) -> usize {
        // ---
        lock_ignore_poison(&self.pending)
            .values()
            .filter(|entry| entry.channel == channel)
            .count()
    }

    /// Total number of pending entries.
    pub fn len(&self) -> usize {
        lock_ignore_poison(&self.pending).len()
    }

    /// Whether the table holds no pending entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until no pending entries remain for `channel`, bounded by
    /// `budget`. Returns `true` when the channel drained in time.
    pub async fn wait_drained(&self, channel: usize, budget: Duration) -> bool {
        // ---
        let deadline = Instant::now() + budget;
        loop {
            // Register interest before checking, so a removal between the
            // check and the wait cannot be missed.
            let notified = self.drained.notified();

            if self.pending_count(channel) == 0 {
                return true;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }

            if time::timeout(remaining, notified).await.is_err() {
                return self.pending_count(channel) == 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::next_request_id;
    use bytes::Bytes;

    const CHAN: usize = 0xdead;

    #[tokio::test]
    async fn test_response_resolves_entry() {
        // ---
        let table = CorrelationTable::new();
        let id = next_request_id();
        let fut = table.register(CHAN, id, Duration::from_secs(5));

        table.on_response(Response::ok(id, Bytes::from_static(b"done")));

        let resp = fut.wait().await.unwrap();
        assert_eq!(resp.payload, Bytes::from_static(b"done"));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_resolves_entry() {
        // ---
        let table = CorrelationTable::new();
        let id = next_request_id();
        let fut = table.register(CHAN, id, Duration::from_millis(100));

        // No response ever arrives; after >=100ms the timer wins.
        assert!(matches!(fut.wait().await, Err(Error::Timeout)));
        assert_eq!(table.pending_count(CHAN), 0);
    }

    #[tokio::test]
    async fn test_orphan_response_dropped() {
        // ---
        let table = CorrelationTable::new();
        let id = next_request_id();
        let fut = table.register(CHAN, id, Duration::from_secs(5));

        // A response for an id nobody is waiting on must not disturb the
        // live entry.
        table.on_response(Response::ok(id.wrapping_add(12345), Bytes::new()));
        assert_eq!(table.pending_count(CHAN), 1);

        table.on_response(Response::ok(id, Bytes::new()));
        assert!(fut.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_close_channel_resolves_only_that_channel() {
        // ---
        let table = CorrelationTable::new();
        let id_a = next_request_id();
        let id_b = next_request_id();
        let fut_a = table.register(CHAN, id_a, Duration::from_secs(5));
        let fut_b = table.register(CHAN + 1, id_b, Duration::from_secs(5));

        table.close_channel(CHAN);

        assert!(matches!(fut_a.wait().await, Err(Error::ChannelClosed)));
        assert_eq!(table.pending_count(CHAN), 0);
        assert_eq!(table.pending_count(CHAN + 1), 1);

        table.on_response(Response::ok(id_b, Bytes::new()));
        assert!(fut_b.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_resolve_idempotent() {
        // ---
        let table = CorrelationTable::new();
        let id = next_request_id();
        let fut = table.register(CHAN, id, Duration::from_secs(5));

        table.on_response(Response::ok(id, Bytes::from_static(b"first")));
        // Duplicate resolution is a no-op.
        table.resolve(id, Err(Error::ChannelClosed));

        let resp = fut.wait().await.unwrap();
        assert_eq!(resp.payload, Bytes::from_static(b"first"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_zero_timeout_always_resolves() {
        // ---
        // With a zero timeout the timer can fire as soon as it is spawned;
        // the entry must already be visible to it or the call hangs.
        let table = CorrelationTable::new();
        for _ in 0..500 {
            let id = next_request_id();
            let fut = table.register(CHAN, id, Duration::from_millis(0));
            let result = time::timeout(Duration::from_millis(500), fut.wait())
                .await
                .expect("entry never timed out");
            assert!(matches!(result, Err(Error::Timeout)));
        }
        assert_eq!(table.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_drained() {
        // ---
        let table = CorrelationTable::new();
        let id = next_request_id();
        let _fut = table.register(CHAN, id, Duration::from_secs(60));

        // Entry still pending: the bounded wait gives up.
        assert!(!table.wait_drained(CHAN, Duration::from_millis(50)).await);

        let table2 = table.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(20)).await;
            table2.resolve(id, Ok(Response::ok(id, Bytes::new())));
        });

        assert!(table.wait_drained(CHAN, Duration::from_secs(1)).await);
    }
}
