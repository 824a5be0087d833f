//! Server and client configuration.
//!
//! The server reads its settings from the environment:
//!
//! | Variable | Default |
//! |----------|---------|
//! | `HOST` | `127.0.0.1` |
//! | `PORT` | `1234` |
//! | `MAX_MESSAGE_SIZE` | `1048576` |
//! | `IDLE_TIMEOUT_MS` | `30000` |
//! | `COMPRESSION_THRESHOLD` | `1024` |
//! | `MAX_MALFORMED_MESSAGES` | `8` |
//! | `PEER_QUEUE_CAPACITY` | `256` |
//! | `PRINCIPAL_HEADER` | `x-zwriter-principal` |

use std::str::FromStr;
use std::time::Duration;

use zwriter_crdt::ReplicaId;

use crate::error::CollabError;

pub const DEFAULT_PRINCIPAL_HEADER: &str = "x-zwriter-principal";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Largest accepted message, before and after decompression
    pub max_message_size: usize,
    /// Connections without inbound traffic for this long are closed
    pub idle_timeout: Duration,
    /// Frames at least this large are LZ4 compressed when negotiated
    pub compression_threshold: usize,
    /// Malformed payloads tolerated per connection
    pub max_malformed_messages: u32,
    /// Outbound messages buffered per peer before it counts as a slow consumer
    pub peer_queue_capacity: usize,
    /// Request header whose value becomes the connection's principal
    pub principal_header: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:1234".to_string(),
            max_message_size: 1024 * 1024,
            idle_timeout: Duration::from_millis(30_000),
            compression_threshold: 1024,
            max_malformed_messages: 8,
            peer_queue_capacity: 256,
            principal_header: DEFAULT_PRINCIPAL_HEADER.to_string(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, CollabError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source (unset = default).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CollabError> {
        let defaults = Self::default();
        let host = lookup("HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let port: u16 = parse_var(&lookup, "PORT")?.unwrap_or(1234);

        let config = Self {
            bind_addr: format!("{host}:{port}"),
            max_message_size: parse_var(&lookup, "MAX_MESSAGE_SIZE")?
                .unwrap_or(defaults.max_message_size),
            idle_timeout: parse_var(&lookup, "IDLE_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.idle_timeout),
            compression_threshold: parse_var(&lookup, "COMPRESSION_THRESHOLD")?
                .unwrap_or(defaults.compression_threshold),
            max_malformed_messages: parse_var(&lookup, "MAX_MALFORMED_MESSAGES")?
                .unwrap_or(defaults.max_malformed_messages),
            peer_queue_capacity: parse_var(&lookup, "PEER_QUEUE_CAPACITY")?
                .unwrap_or(defaults.peer_queue_capacity),
            principal_header: lookup("PRINCIPAL_HEADER")
                .unwrap_or(defaults.principal_header)
                .to_ascii_lowercase(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CollabError> {
        if self.max_message_size == 0 {
            return Err(CollabError::Config("MAX_MESSAGE_SIZE must be positive".into()));
        }
        if self.idle_timeout.is_zero() {
            return Err(CollabError::Config("IDLE_TIMEOUT_MS must be positive".into()));
        }
        if self.peer_queue_capacity == 0 {
            return Err(CollabError::Config("PEER_QUEUE_CAPACITY must be positive".into()));
        }
        if self.principal_header.is_empty() {
            return Err(CollabError::Config("PRINCIPAL_HEADER must not be empty".into()));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, CollabError>
where
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| CollabError::Config(format!("{name}={raw:?}: {e}"))),
    }
}

/// Client bridge configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub max_message_size: usize,
    pub compression_threshold: usize,
    /// Interval between WebSocket pings (also renews the awareness entry)
    pub heartbeat_interval: Duration,
    /// Remote awareness entries not refreshed within this window are dropped
    pub awareness_timeout: Duration,
    /// First reconnect delay, doubled per failed attempt
    pub reconnect_initial_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// `None` retries forever
    pub max_reconnect_attempts: Option<u32>,
    pub max_malformed_messages: u32,
    /// Sent in `principal_header` during the handshake
    pub principal: Option<String>,
    pub principal_header: String,
    /// Fixed replica id for the local document (random when `None`)
    pub replica_id: Option<ReplicaId>,
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_message_size: 1024 * 1024,
            compression_threshold: 1024,
            heartbeat_interval: Duration::from_secs(10),
            awareness_timeout: Duration::from_secs(30),
            reconnect_initial_delay: Duration::from_millis(100),
            reconnect_max_delay: Duration::from_secs(5),
            max_reconnect_attempts: Some(10),
            max_malformed_messages: 8,
            principal: None,
            principal_header: DEFAULT_PRINCIPAL_HEADER.to_string(),
            replica_id: None,
            event_capacity: 256,
        }
    }
}

impl ClientConfig {
    /// Delay before reconnect attempt `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.reconnect_initial_delay
            .saturating_mul(factor)
            .min(self.reconnect_max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_server_config_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:1234");
        assert_eq!(config.max_message_size, 1_048_576);
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.compression_threshold, 1024);
        assert_eq!(config.max_malformed_messages, 8);
        assert_eq!(config.principal_header, "x-zwriter-principal");
    }

    #[test]
    fn test_server_config_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("HOST", "0.0.0.0"),
            ("PORT", "9000"),
            ("IDLE_TIMEOUT_MS", "500"),
            ("MAX_MESSAGE_SIZE", "2048"),
            ("PRINCIPAL_HEADER", "X-User"),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.idle_timeout, Duration::from_millis(500));
        assert_eq!(config.max_message_size, 2048);
        assert_eq!(config.principal_header, "x-user");
    }

    #[test]
    fn test_server_config_rejects_bad_values() {
        assert!(ServerConfig::from_lookup(lookup(&[("PORT", "http")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("PORT", "70000")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("MAX_MESSAGE_SIZE", "0")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("IDLE_TIMEOUT_MS", "-1")])).is_err());
    }

    #[test]
    fn test_client_backoff_is_capped() {
        let config = ClientConfig::default();
        assert_eq!(config.backoff(0), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(400));
        assert_eq!(config.backoff(10), Duration::from_secs(5));
        assert_eq!(config.backoff(u32::MAX), Duration::from_secs(5));
    }
}
