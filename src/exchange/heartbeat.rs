// src/exchange/heartbeat.rs

//! Heartbeat-based liveness monitoring.
//!
//! Timestamping happens on the I/O path: transports call
//! [`ChannelContext::mark_read`](crate::ChannelContext::mark_read) on every
//! successful receive and `mark_write` on every successful send. The monitor
//! here is the other half: a periodic sweep over every channel in scope.
//!
//! Per sweep, per channel:
//! - no read **and** no write within one interval → send a two-way
//!   heartbeat request;
//! - no read within the heartbeat timeout → invoke the idle action
//!   (clients reconnect; servers close the channel outright, since servers
//!   never initiate outbound reconnects).
//!
//! The sweep body logs and continues on any individual failure; one slow or
//! broken channel never stops the scheduler.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::macros::{log_debug, log_warn};
use crate::{Channel, ChannelPtr, Message, Request};

/// Yields the channels a sweep should visit (a client's single channel, or
/// a server's accepted set).
pub type ChannelProvider = Arc<dyn Fn() -> Vec<ChannelPtr> + Send + Sync>;

/// Action taken when a channel has been read-idle past the heartbeat
/// timeout.
pub type IdleAction =
    Arc<dyn Fn(ChannelPtr) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Periodic heartbeat sweep task.
///
/// Stopped explicitly via [`stop`](HeartbeatMonitor::stop) or implicitly on
/// drop.
pub struct HeartbeatMonitor {
    task: JoinHandle<()>,
}

impl HeartbeatMonitor {
    // ---

    /// Start sweeping every `interval`, treating a channel as dead after
    /// `timeout` without a read.
    ///
    /// Callers disable heartbeats by not constructing a monitor
    /// (`interval == 0` in the endpoint options); the interval here must be
    /// non-zero.
    pub fn start(
        interval: Duration,
        timeout: Duration,
        provider: ChannelProvider,
        on_idle: IdleAction,
    ) -> Self {
        // ---
        let task = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick of a tokio interval fires immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                sweep(interval, timeout, &provider, &on_idle).await;
            }
        });

        Self { task }
    }

    /// Stop the sweep task.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// One pass over every channel in scope.
async fn sweep(
    interval: Duration,
    timeout: Duration,
    provider: &ChannelProvider,
    on_idle: &IdleAction,
) {
    // ---
    for channel in provider() {
        if !channel.is_connected() {
            continue;
        }

        let ctx = channel.context();
        let read_idle = ctx.read_idle();
        let write_idle = ctx.write_idle();

        if read_idle >= timeout {
            // Two missed intervals minimum (enforced at construction), so
            // this is a real outage, not a slow tick.
            log_warn!(
                "no read from {} for {read_idle:?} (limit {timeout:?})",
                channel.remote_addr(),
            );
            on_idle(channel).await;
            continue;
        }

        if read_idle >= interval && write_idle >= interval {
            log_debug!("sending heartbeat to {}", channel.remote_addr());
            let probe = Message::Request(Request::heartbeat());
            if let Err(_err) = channel.send(probe, false).await {
                log_warn!("heartbeat send to {} failed: {_err}", channel.remote_addr());
            }
        }
    }
}
