// src/url.rs

//! Endpoint URLs and recognized configuration options.
//!
//! An endpoint is described by a URL of the form
//! `scheme://host:port?key=value&key2=value2`. The scheme selects a
//! transporter from the registry; the query parameters carry every tunable
//! the exchange layer recognizes. Typed getters below apply the documented
//! defaults so callers never read the raw parameter map for known keys.
//!
//! Recognized options:
//!
//! | key                | meaning                                   | default    |
//! |--------------------|-------------------------------------------|------------|
//! | `timeout`          | call timeout, ms                          | 1000       |
//! | `connect.timeout`  | connect timeout, ms                       | `timeout`  |
//! | `heartbeat`        | heartbeat interval, ms (0 = disabled)     | 0          |
//! | `heartbeat.timeout`| missed-read window before idle action, ms | 3×interval |
//! | `payload`          | max payload bytes per message             | 8 MiB      |
//! | `reconnect`        | reconnect-check interval, ms or `false`   | 2000       |
//! | `send.reconnect`   | connect synchronously before a send       | false      |
//! | `accepts`          | max server connections (0 = unlimited)    | 0          |
//! | `shutdown.timeout` | graceful-drain / outage-log threshold, ms | 900000     |
//! | `check`            | fail construction if first connect fails  | true       |
//! | `bind.host`        | effective bind host (e.g. behind NAT)     | `host`     |
//! | `bind.port`        | effective bind port                       | `port`     |

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::{Error, Result};

/// Default call timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Default maximum payload size in bytes (8 MiB).
pub const DEFAULT_PAYLOAD_LIMIT: usize = 8 * 1024 * 1024;

/// Default reconnect-check interval in milliseconds.
pub const DEFAULT_RECONNECT_MS: u64 = 2000;

/// Default shutdown timeout in milliseconds (15 minutes).
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 15 * 60 * 1000;

/// Parsed endpoint URL.
///
/// Cheap to clone; parameters are immutable after construction apart from
/// the [`with_param`](Url::with_param) builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    /// Transporter scheme (e.g. `"mem"`).
    pub scheme: String,
    /// Advertised host.
    pub host: String,
    /// Advertised port.
    pub port: u16,
    /// Raw query parameters.
    pub params: HashMap<String, String>,
}

impl Url {
    // ---

    /// Build a URL from parts with no parameters.
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        // ---
        Self {
            scheme: scheme.into(),
            host: host.into(),
            port,
            params: HashMap::new(),
        }
    }

    /// Parse `scheme://host:port?key=value&...`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` on any malformed component.
    pub fn parse(input: &str) -> Result<Self> {
        // ---
        let (scheme, rest) = input
            .split_once("://")
            .ok_or_else(|| Error::Config(format!("missing scheme in url: {input}")))?;

        let (authority, query) = match rest.split_once('?') {
            Some((a, q)) => (a, Some(q)),
            None => (rest, None),
        };

        let (host, port_str) = authority
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("missing port in url: {input}")))?;

        let port: u16 = port_str
            .parse()
            .map_err(|_| Error::Config(format!("invalid port in url: {input}")))?;

        if host.is_empty() {
            return Err(Error::Config(format!("empty host in url: {input}")));
        }

        let mut params = HashMap::new();
        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| Error::Config(format!("malformed parameter: {pair}")))?;
                params.insert(key.to_owned(), value.to_owned());
            }
        }

        Ok(Self {
            scheme: scheme.to_owned(),
            host: host.to_owned(),
            port,
            params,
        })
    }

    /// Set a parameter, replacing any previous value.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        // ---
        self.params.insert(key.into(), value.into());
        self
    }

    /// `host:port` of the advertised address.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Raw parameter lookup.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    fn u64_param(&self, key: &str, default: u64) -> u64 {
        // ---
        self.param(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn bool_param(&self, key: &str, default: bool) -> bool {
        // ---
        self.param(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// Call timeout (`timeout`, default 1000ms).
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.u64_param("timeout", DEFAULT_TIMEOUT_MS))
    }

    /// Connect timeout (`connect.timeout`, falls back to `timeout`).
    pub fn connect_timeout(&self) -> Duration {
        // ---
        match self.param("connect.timeout").and_then(|v| v.parse().ok()) {
            Some(ms) => Duration::from_millis(ms),
            None => self.timeout(),
        }
    }

    /// Heartbeat interval (`heartbeat`, 0 = disabled).
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.u64_param("heartbeat", 0))
    }

    /// Heartbeat timeout (`heartbeat.timeout`, default 3× interval).
    pub fn heartbeat_timeout(&self) -> Duration {
        // ---
        let default = self.u64_param("heartbeat", 0).saturating_mul(3);
        Duration::from_millis(self.u64_param("heartbeat.timeout", default))
    }

    /// Maximum payload bytes (`payload`, default 8 MiB).
    pub fn payload_limit(&self) -> usize {
        self.u64_param("payload", DEFAULT_PAYLOAD_LIMIT as u64) as usize
    }

    /// Reconnect-check interval (`reconnect`). `"false"` disables the
    /// periodic task entirely.
    pub fn reconnect_interval(&self) -> Option<Duration> {
        // ---
        match self.param("reconnect") {
            Some("false") => None,
            Some(v) => Some(Duration::from_millis(
                v.parse().unwrap_or(DEFAULT_RECONNECT_MS),
            )),
            None => Some(Duration::from_millis(DEFAULT_RECONNECT_MS)),
        }
    }

    /// Whether a disconnected client should connect synchronously before a
    /// send (`send.reconnect`, default false). Sends are never queued.
    pub fn send_reconnect(&self) -> bool {
        self.bool_param("send.reconnect", false)
    }

    /// Maximum accepted server connections (`accepts`, 0 = unlimited).
    pub fn accepts(&self) -> usize {
        self.u64_param("accepts", 0) as usize
    }

    /// Shutdown timeout (`shutdown.timeout`, default 15 minutes).
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.u64_param("shutdown.timeout", DEFAULT_SHUTDOWN_TIMEOUT_MS))
    }

    /// Whether construction should fail when the first connect fails
    /// (`check`, default true). With `check=false` the client starts
    /// disconnected and the periodic task retries lazily.
    pub fn check(&self) -> bool {
        self.bool_param("check", true)
    }

    /// Effective bind address. `bind.host`/`bind.port` override the
    /// advertised authority for servers running behind address translation.
    pub fn bind_url(&self) -> Url {
        // ---
        let mut url = self.clone();
        if let Some(host) = self.param("bind.host") {
            url.host = host.to_owned();
        }
        if let Some(port) = self.param("bind.port").and_then(|v| v.parse().ok()) {
            url.port = port;
        }
        url
    }

    /// Validate heartbeat options.
    ///
    /// Two missed intervals are the minimum observable liveness signal, so a
    /// timeout below `2 * heartbeat` can never fire meaningfully.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when heartbeats are enabled and
    /// `heartbeat.timeout < 2 * heartbeat`.
    pub fn validate_heartbeat(&self) -> Result<()> {
        // ---
        let interval = self.heartbeat();
        if !interval.is_zero() && self.heartbeat_timeout() < interval * 2 {
            return Err(Error::Config(format!(
                "heartbeat.timeout ({:?}) must be at least twice the heartbeat interval ({:?})",
                self.heartbeat_timeout(),
                interval,
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)?;
        let mut sep = '?';
        // Sorted for a stable rendering.
        let mut keys: Vec<_> = self.params.keys().collect();
        keys.sort();
        for key in keys {
            write!(f, "{sep}{key}={}", self.params[key])?;
            sep = '&';
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_parse_round_trip() {
        // ---
        let url = Url::parse("mem://localhost:9090?timeout=250&heartbeat=60000").unwrap();
        assert_eq!(url.scheme, "mem");
        assert_eq!(url.authority(), "localhost:9090");
        assert_eq!(url.timeout(), Duration::from_millis(250));
        assert_eq!(url.heartbeat(), Duration::from_millis(60000));

        let rendered = url.to_string();
        let reparsed = Url::parse(&rendered).unwrap();
        assert_eq!(url, reparsed);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        // ---
        assert!(Url::parse("no-scheme").is_err());
        assert!(Url::parse("mem://nohost").is_err());
        assert!(Url::parse("mem://host:notaport").is_err());
        assert!(Url::parse("mem://:9090").is_err());
        assert!(Url::parse("mem://host:1?badpair").is_err());
    }

    #[test]
    fn test_defaults() {
        // ---
        let url = Url::new("mem", "localhost", 1);
        assert_eq!(url.timeout(), Duration::from_millis(DEFAULT_TIMEOUT_MS));
        assert_eq!(url.connect_timeout(), url.timeout());
        assert!(url.heartbeat().is_zero());
        assert_eq!(url.payload_limit(), DEFAULT_PAYLOAD_LIMIT);
        assert_eq!(
            url.reconnect_interval(),
            Some(Duration::from_millis(DEFAULT_RECONNECT_MS))
        );
        assert!(!url.send_reconnect());
        assert_eq!(url.accepts(), 0);
        assert!(url.check());
    }

    #[test]
    fn test_reconnect_disabled() {
        // ---
        let url = Url::new("mem", "localhost", 1).with_param("reconnect", "false");
        assert_eq!(url.reconnect_interval(), None);
    }

    #[test]
    fn test_heartbeat_validation() {
        // ---
        // Default timeout is 3x the interval: fine.
        let url = Url::new("mem", "localhost", 1).with_param("heartbeat", "60000");
        assert!(url.validate_heartbeat().is_ok());

        // Below two intervals: fails fast.
        let url = url.with_param("heartbeat.timeout", "119999");
        assert!(url.validate_heartbeat().is_err());

        // Exactly two intervals is the minimum.
        let url = url.with_param("heartbeat.timeout", "120000");
        assert!(url.validate_heartbeat().is_ok());
    }

    #[test]
    fn test_bind_url() {
        // ---
        let url = Url::parse("mem://public.example:9090?bind.host=0.0.0.0&bind.port=19090").unwrap();
        let bind = url.bind_url();
        assert_eq!(bind.authority(), "0.0.0.0:19090");
        // Advertised address is untouched.
        assert_eq!(url.authority(), "public.example:9090");
    }
}
