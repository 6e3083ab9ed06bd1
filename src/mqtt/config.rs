use std::fmt;
use std::time::Duration;

use super::message_manager::SessionKind;

const DEFAULT_MQTT_PORT: u16 = 1883;

/// Host and port of an MQTT broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broker {
    pub host: String,
    pub port: u16,
}

impl Broker {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `host`, `host:port` or `tcp://host:port`.
    ///
    /// Returns `None` for an empty host or an unparsable port.
    pub fn parse(address: &str) -> Option<Self> {
        let address = address.trim();
        let address = address
            .strip_prefix("tcp://")
            .or_else(|| address.strip_prefix("mqtt://"))
            .unwrap_or(address);

        let (host, port) = match address.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().ok()?),
            None => (address, DEFAULT_MQTT_PORT),
        };

        if host.is_empty() {
            return None;
        }
        Some(Self::new(host, port))
    }
}

impl fmt::Display for Broker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Username/password pair sent in the CONNECT packet.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Everything a [`Transport`](super::transport::Transport) needs to open one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub kind: SessionKind,
    pub broker: Broker,
    pub client_id: String,
    pub credentials: Option<Credentials>,
    pub keep_alive: Duration,
    /// Topics subscribed on every successful connect
    pub subscriptions: Vec<String>,
    /// Upper bound for any single broker round trip
    pub request_timeout: Duration,
}
