//! RabbitMQ connection and topology settings.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use crate::publisher::ConfirmMode;

/// Exchange the producer publishes notification events to.
pub const DEFAULT_EXCHANGE_NAME: &str = "notification-create";
/// Queue the notification service consumes from.
pub const DEFAULT_QUEUE_NAME: &str = "notification.service.queue";
/// Suffix appended to the main queue name to form the error queue name.
pub const ERROR_QUEUE_SUFFIX: &str = "_error";

/// Broker connection parameters plus the names of the pipeline's topology.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct RabbitMqSettings {
    pub host: String,
    pub port: u16,
    pub virtual_host: String,
    pub username: String,
    pub password: String,
    /// Connection attempt timeout in seconds. Default: 5.
    pub connection_timeout_secs: u64,
    /// Fanout exchange name. Default: `notification-create`.
    pub exchange: String,
    /// Main queue name. Default: `notification.service.queue`.
    pub queue_name: String,
    /// Unacknowledged deliveries per consumer channel. Default: 1.
    pub prefetch: u16,
    /// Declare the main queue with dead-letter arguments pointing at the
    /// error queue. Disable for queues owned by another system. Default: true.
    pub dead_letter: bool,
    /// Publisher guarantee. Default: confirmed.
    pub confirm_mode: ConfirmMode,
}

impl Default for RabbitMqSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            virtual_host: "/".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            connection_timeout_secs: 5,
            exchange: DEFAULT_EXCHANGE_NAME.to_string(),
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            prefetch: 1,
            dead_letter: true,
            confirm_mode: ConfirmMode::default(),
        }
    }
}

impl RabbitMqSettings {
    /// AMQP URI with credentials and the virtual host percent-encoded.
    pub fn amqp_uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            percent_encode(&self.username),
            percent_encode(&self.password),
            self.host,
            self.port,
            percent_encode(&self.virtual_host)
        )
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    /// `<queue_name>_error`.
    pub fn error_queue_name(&self) -> String {
        crate::topology::error_queue_name(&self.queue_name)
    }
}

impl fmt::Debug for RabbitMqSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RabbitMqSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("virtual_host", &self.virtual_host)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("connection_timeout_secs", &self.connection_timeout_secs)
            .field("exchange", &self.exchange)
            .field("queue_name", &self.queue_name)
            .field("prefetch", &self.prefetch)
            .field("dead_letter", &self.dead_letter)
            .field("confirm_mode", &self.confirm_mode)
            .finish()
    }
}

/// Encode everything outside the RFC 3986 unreserved set.
fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}
