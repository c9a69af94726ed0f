// src/transport/mod.rs

//! Transport abstractions.
//!
//! A [`Transporter`] turns endpoint URLs into live [`Channel`]s: `connect`
//! for the initiating side, `bind` for the accepting side. Implementations
//! are looked up in a [`TransporterRegistry`] by URL scheme, a plain map
//! resolved once at construction, nothing dynamic.
//!
//! Concrete socket transports live outside this crate. The in-memory
//! transport in [`memory`] is the reference implementation of the channel
//! and delivery semantics and is what the integration tests run against.

pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::{ChannelPtr, Error, HandlerPtr, Result, Url};

/// Connection factory for one URL scheme.
#[async_trait]
pub trait Transporter: Send + Sync {
    /// Open a client connection to `url`, delivering events to `handler`.
    async fn connect(&self, url: &Url, handler: HandlerPtr) -> Result<ChannelPtr>;

    /// Start accepting connections on `url`'s bind address, delivering
    /// events for every accepted channel to `handler`.
    async fn bind(&self, url: &Url, handler: HandlerPtr) -> Result<ListenerPtr>;
}

/// Shared transporter pointer.
pub type TransporterPtr = Arc<dyn Transporter>;

/// A bound acceptor.
#[async_trait]
pub trait Listener: Send + Sync {
    /// The effective local address this listener accepted on.
    fn local_url(&self) -> &Url;

    /// Stop accepting. Already-accepted channels are unaffected.
    async fn unbind(&self);
}

/// Shared listener pointer.
pub type ListenerPtr = Arc<dyn Listener>;

/// Transporter lookup keyed by URL scheme.
pub struct TransporterRegistry {
    transporters: HashMap<String, TransporterPtr>,
}

impl TransporterRegistry {
    // ---

    /// Empty registry.
    pub fn new() -> Self {
        // ---
        Self {
            transporters: HashMap::new(),
        }
    }

    /// Registry with the in-memory transport registered under `"mem"`.
    pub fn with_defaults() -> Self {
        // ---
        let mut registry = Self::new();
        registry.register("mem", Arc::new(memory::MemoryTransporter::new()));
        registry
    }

    /// Register a transporter for a scheme, replacing any previous entry.
    pub fn register(&mut self, scheme: impl Into<String>, transporter: TransporterPtr) {
        self.transporters.insert(scheme.into(), transporter);
    }

    /// Look up the transporter for a scheme.
    pub fn get(&self, scheme: &str) -> Option<TransporterPtr> {
        self.transporters.get(scheme).cloned()
    }

    /// Resolve the transporter for a URL.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an unregistered scheme.
    pub fn resolve(&self, url: &Url) -> Result<TransporterPtr> {
        // ---
        self.get(&url.scheme)
            .ok_or_else(|| Error::Config(format!("no transporter for scheme '{}'", url.scheme)))
    }
}

impl Default for TransporterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
