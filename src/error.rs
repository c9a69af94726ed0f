use thiserror::Error;

/// Errors that can occur in the exchange layer
#[derive(Error, Debug)]
pub enum Error {
    /// Connecting to the remote endpoint failed.
    ///
    /// Retried by the periodic reconnect task; surfaced only to an explicit
    /// synchronous `connect()` caller.
    #[error("connect failed: {0}")]
    ConnectFailure(String),

    /// A send could not be handed to the transport (not connected, or the
    /// write was rejected). Fails that call only; never retried here.
    #[error("send failed: {0}")]
    SendFailure(String),

    /// No response arrived within the per-request timeout. The channel
    /// stays open.
    #[error("request timed out")]
    Timeout,

    /// The channel died. Resolves every pending call registered against it.
    #[error("channel closed")]
    ChannelClosed,

    /// Encode-time payload size check failed; nothing was written.
    #[error("payload of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge {
        /// Size of the offending payload.
        size: usize,
        /// Configured maximum (`payload` endpoint option).
        limit: usize,
    },

    /// An inbound frame could not be parsed and the request id was not
    /// recoverable. The channel is treated as corrupted and closed.
    #[error("protocol decode error: {0}")]
    Decode(String),

    /// Invalid endpoint configuration (e.g. heartbeat timeout below twice
    /// the heartbeat interval).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for exchange operations
pub type Result<T> = std::result::Result<T, Error>;
