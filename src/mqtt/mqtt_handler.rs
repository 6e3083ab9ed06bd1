//! Connection lifecycle for a single MQTT session.
//!
//! ```text
//!                connect()              transport + subscriptions ok
//! Disconnected ───────────► Connecting ─────────────────────────────► Connected
//!      ▲                        │                                         │
//!      └────────────────────────┘ any step fails (resources torn down)    │
//!      ▲                                                                  │
//!      └──────────────────────────────────────────────────────────────────┘
//!                     ConnectionLost event / shutdown()
//! ```
//!
//! A session never reconnects on its own. The bridge calls [`Session::supervise`]
//! on every tick; a disconnected session waits one fixed reconnect delay and
//! then tries exactly once.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::config::SessionOptions;
use super::message_manager::{EventSink, SessionEvent, SessionKind};
use super::transport::{Transport, TransportError};

const MAX_ERROR_MESSAGES: usize = 10;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Observable snapshot of a session, broadcast on every change
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionStatus {
    pub connection_state: ConnectionState,
    pub error_messages: Vec<String>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<chrono::DateTime<chrono::Local>>,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("{session} session cannot connect while {state:?}")]
    InvalidState {
        session: SessionKind,
        state: ConnectionState,
    },

    #[error("{session} session failed to connect: {source}")]
    Connect {
        session: SessionKind,
        #[source]
        source: TransportError,
    },

    #[error("{session} session failed to subscribe: {source}")]
    Subscribe {
        session: SessionKind,
        #[source]
        source: TransportError,
    },

    #[error("{session} session is not connected")]
    NotConnected { session: SessionKind },

    #[error("{session} session failed to publish: {source}")]
    Publish {
        session: SessionKind,
        #[source]
        source: TransportError,
    },
}

pub struct Session {
    options: SessionOptions,
    transport: Box<dyn Transport>,
    state: ConnectionState,
    generation: u64,
    retry_at: Option<Instant>,
    events: mpsc::Sender<SessionEvent>,
    status: watch::Sender<SessionStatus>,
}

impl Session {
    pub fn new(
        options: SessionOptions,
        transport: Box<dyn Transport>,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus::default());
        Self {
            options,
            transport,
            state: ConnectionState::Disconnected,
            generation: 0,
            retry_at: None,
            events,
            status,
        }
    }

    pub fn kind(&self) -> SessionKind {
        self.options.kind
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// True when `generation` belongs to the connection currently held
    pub fn is_current(&self, generation: u64) -> bool {
        self.state != ConnectionState::Disconnected && generation == self.generation
    }

    /// Opens the transport, registers the event sink and subscribes every configured topic.
    ///
    /// Only valid from `Disconnected`. On failure all partially created
    /// resources are released and the session is back in `Disconnected`.
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        let session = self.kind();
        if self.state != ConnectionState::Disconnected {
            return Err(SessionError::InvalidState {
                session,
                state: self.state,
            });
        }

        self.set_state(ConnectionState::Connecting);
        self.generation += 1;
        info!(
            "Connecting {} session to {} (attempt #{})",
            session, self.options.broker, self.generation
        );

        let sink = EventSink::new(session, self.generation, self.events.clone());
        if let Err(source) = self.transport.connect(&self.options, sink).await {
            self.teardown(&source.to_string());
            return Err(SessionError::Connect { session, source });
        }

        let subscriptions = self.options.subscriptions.clone();
        for topic in &subscriptions {
            if let Err(source) = self.transport.subscribe(topic).await {
                if let Err(e) = self.transport.disconnect().await {
                    debug!("Disconnect after failed subscribe also failed: {}", e);
                }
                self.teardown(&source.to_string());
                return Err(SessionError::Subscribe { session, source });
            }
            debug!("{} session subscribed to {}", session, topic);
        }

        self.retry_at = None;
        self.set_state(ConnectionState::Connected);
        info!("{} session connected", session);
        Ok(())
    }

    /// Applies a loss notification from the transport.
    ///
    /// Returns `false` when the notification is stale, i.e. it belongs to an
    /// earlier connection or the session is already down.
    pub fn handle_connection_lost(&mut self, generation: u64, cause: &str) -> bool {
        if !self.is_current(generation) {
            debug!(
                "Ignoring stale loss notification for {} session (generation {}, current {})",
                self.kind(),
                generation,
                self.generation
            );
            return false;
        }

        warn!("{} session lost its connection: {}", self.kind(), cause);
        self.teardown(cause);
        true
    }

    /// Reconnect supervision, called once per tick.
    ///
    /// Returns the outcome when a connect attempt was made on this tick.
    pub async fn supervise(
        &mut self,
        now: Instant,
        reconnect_delay: Duration,
    ) -> Option<Result<(), SessionError>> {
        if self.state != ConnectionState::Disconnected {
            return None;
        }

        match self.retry_at {
            None => {
                info!(
                    "{} session not connected, retrying in {:?}",
                    self.kind(),
                    reconnect_delay
                );
                self.retry_at = Some(now + reconnect_delay);
                None
            }
            Some(at) if now >= at => {
                self.retry_at = None;
                let result = self.connect().await;
                if let Err(e) = &result {
                    error!("Reconnect failed: {}", e);
                }
                Some(result)
            }
            Some(_) => None,
        }
    }

    pub async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), SessionError> {
        let session = self.kind();
        if !self.is_connected() {
            return Err(SessionError::NotConnected { session });
        }

        match self.transport.publish(topic, payload).await {
            Ok(()) => {
                self.status.send_modify(|status| {
                    status.messages_sent += 1;
                    status.last_activity = Some(chrono::Local::now());
                });
                Ok(())
            }
            Err(source) => {
                self.record_error(source.to_string());
                Err(SessionError::Publish { session, source })
            }
        }
    }

    pub fn record_received(&self) {
        self.status.send_modify(|status| {
            status.messages_received += 1;
            status.last_activity = Some(chrono::Local::now());
        });
    }

    /// Unsubscribes and disconnects a live session, then releases the transport in any state
    pub async fn shutdown(&mut self) {
        let session = self.kind();
        if self.is_connected() {
            for topic in &self.options.subscriptions {
                if let Err(e) = self.transport.unsubscribe(topic).await {
                    warn!("{} session could not unsubscribe: {}", session, e);
                }
            }
            if let Err(e) = self.transport.disconnect().await {
                warn!("{} session could not disconnect cleanly: {}", session, e);
            }
        } else {
            debug!("{} session was not connected at shutdown", session);
        }

        self.transport.release();
        self.retry_at = None;
        self.set_state(ConnectionState::Disconnected);
        info!("{} session closed", session);
    }

    fn teardown(&mut self, cause: &str) {
        self.transport.release();
        self.record_error(cause.to_string());
        self.set_state(ConnectionState::Disconnected);
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.status
            .send_modify(|status| status.connection_state = state);
    }

    fn record_error(&self, message: String) {
        self.status.send_modify(|status| {
            status.error_messages.push(message);
            if status.error_messages.len() > MAX_ERROR_MESSAGES {
                status.error_messages.remove(0);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::config::Broker;
    use crate::mqtt::message_manager::SessionEventKind;
    use crate::mqtt::mock::MockBroker;

    fn options(subscriptions: &[&str]) -> SessionOptions {
        SessionOptions {
            kind: SessionKind::Delivery,
            broker: Broker::new("localhost", 1883),
            client_id: "test".to_string(),
            credentials: None,
            keep_alive: Duration::from_secs(45),
            subscriptions: subscriptions.iter().map(|s| s.to_string()).collect(),
            request_timeout: Duration::from_secs(1),
        }
    }

    fn session(broker: &MockBroker, subscriptions: &[&str]) -> (Session, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (Session::new(options(subscriptions), broker.transport(), tx), rx)
    }

    #[tokio::test]
    async fn connect_subscribes_and_reaches_connected() {
        let broker = MockBroker::default();
        let (mut session, _rx) = session(&broker, &["downlink/ds/TimeWindow"]);
        assert_eq!(session.state(), ConnectionState::Disconnected);

        session.connect().await.unwrap();

        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(broker.subscriptions(), vec!["downlink/ds/TimeWindow"]);
        assert_eq!(
            session.status().connection_state,
            ConnectionState::Connected
        );
    }

    #[tokio::test]
    async fn connect_failure_returns_to_disconnected() {
        let broker = MockBroker::default();
        broker.fail_next_connects(1);
        let (mut session, _rx) = session(&broker, &["a"]);

        let err = session.connect().await.unwrap_err();

        assert!(matches!(err, SessionError::Connect { .. }));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(broker.releases(), 1);
        assert_eq!(session.status().error_messages.len(), 1);
    }

    #[tokio::test]
    async fn subscribe_failure_tears_down_connection() {
        let broker = MockBroker::default();
        broker.fail_subscribe(true);
        let (mut session, _rx) = session(&broker, &["a"]);

        let err = session.connect().await.unwrap_err();

        assert!(matches!(err, SessionError::Subscribe { .. }));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(broker.disconnects(), 1);
        assert_eq!(broker.releases(), 1);
    }

    #[tokio::test]
    async fn connect_is_rejected_unless_disconnected() {
        let broker = MockBroker::default();
        let (mut session, _rx) = session(&broker, &[]);
        session.connect().await.unwrap();

        let err = session.connect().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidState {
                state: ConnectionState::Connected,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn loss_event_disconnects_current_generation_only() {
        let broker = MockBroker::default();
        let (mut session, mut rx) = session(&broker, &[]);
        session.connect().await.unwrap();

        broker.drop_connection("keep alive timeout").await;
        let event = rx.recv().await.unwrap();
        let cause = match &event.kind {
            SessionEventKind::ConnectionLost(cause) => cause.clone(),
            other => panic!("unexpected event {:?}", other),
        };

        assert!(session.handle_connection_lost(event.generation, &cause));
        assert_eq!(session.state(), ConnectionState::Disconnected);

        // A repeated notification for the same connection is ignored
        assert!(!session.handle_connection_lost(event.generation, &cause));

        session.connect().await.unwrap();
        assert!(!session.handle_connection_lost(event.generation, "late"));
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn publish_requires_connection() {
        let broker = MockBroker::default();
        let (mut session, _rx) = session(&broker, &[]);

        let err = session.publish("batch_ds", b"{}".to_vec()).await.unwrap_err();
        assert!(matches!(err, SessionError::NotConnected { .. }));
        assert!(broker.published().is_empty());

        session.connect().await.unwrap();
        session.publish("batch_ds", b"{}".to_vec()).await.unwrap();
        assert_eq!(broker.published().len(), 1);
        assert_eq!(session.status().messages_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn supervise_waits_fixed_delay_before_single_attempt() {
        let broker = MockBroker::default();
        broker.fail_next_connects(1);
        let (mut session, _rx) = session(&broker, &[]);
        let delay = Duration::from_secs(5);

        let start = Instant::now();
        assert!(session.supervise(start, delay).await.is_none());
        assert!(session
            .supervise(start + Duration::from_secs(4), delay)
            .await
            .is_none());
        assert_eq!(broker.connects(), 0);

        let first = session.supervise(start + delay, delay).await;
        assert!(matches!(first, Some(Err(_))));
        assert_eq!(broker.connects(), 1);

        // The failed attempt restarts the fixed delay
        let later = start + delay + Duration::from_secs(1);
        assert!(session.supervise(later, delay).await.is_none());
        let second = session.supervise(later + delay, delay).await;
        assert!(matches!(second, Some(Ok(()))));
        assert!(session.is_connected());
        assert!(session.supervise(later + delay * 2, delay).await.is_none());
    }

    #[tokio::test]
    async fn shutdown_unsubscribes_connected_session() {
        let broker = MockBroker::default();
        let (mut session, _rx) = session(&broker, &["mwp/json/data/log/dataservice/query_results"]);
        session.connect().await.unwrap();

        session.shutdown().await;

        assert_eq!(
            broker.unsubscribed(),
            vec!["mwp/json/data/log/dataservice/query_results"]
        );
        assert_eq!(broker.disconnects(), 1);
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn shutdown_of_idle_session_only_releases() {
        let broker = MockBroker::default();
        let (mut session, _rx) = session(&broker, &["a"]);

        session.shutdown().await;

        assert!(broker.unsubscribed().is_empty());
        assert_eq!(broker.disconnects(), 0);
        assert_eq!(broker.releases(), 1);
    }
}
