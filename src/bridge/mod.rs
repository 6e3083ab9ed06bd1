//! # Bridge
//!
//! Owns both sessions, the row mapper, the batch publisher and the table
//! waiting for delivery. Everything runs on one event loop:
//!
//! ```text
//!            ┌──────────── SessionEvent (mpsc) ◄──── transports
//!            │
//! Bridge ────┼──────────── tick (interval) ───► supervise sessions, flush pending table
//!            │
//!            └──────────── CancellationToken ───► drain and stop
//! ```
//!
//! Lifecycle: `Initializing → Running → Draining → Stopped`.

pub mod batch_publisher;
pub mod selection;

use statum::{machine, state};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{BridgeConfig, Config, ConfigError};
use crate::mapping::{DisplayTable, RowMapper};
use crate::mqtt::config::{Broker, Credentials, SessionOptions};
use crate::mqtt::message_manager::{MqttMessage, SessionEvent, SessionEventKind, SessionKind};
use crate::mqtt::mqtt_handler::{Session, SessionError, SessionStatus};
use crate::mqtt::transport::Transport;
use batch_publisher::{BatchPublisher, PublishReport};

/// Controller telemetry published by the local data service
pub const TELEMETRY_TOPIC: &str = "mwp/json/data/log/dataservice/query_results";
/// Range requests sent back to the local data service
pub const QUERY_REQUEST_TOPIC: &str = "mwp/json/data/log/dataservice/query_request";
/// Time-window selector changes coming from the dashboard
pub const SELECTION_TOPIC: &str = "downlink/ds/TimeWindow";

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Ingest session could not be started: {0}")]
    IngestStart(#[source] SessionError),
}

/// Counters and flags published after every change
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BridgeStatus {
    /// Set when the ingest connection drops, cleared once it is back
    pub ingest_lost: bool,
    pub ingest_losses: usize,
    pub tables_mapped: usize,
    pub telemetry_dropped: usize,
    pub publish_passes: usize,
    pub batches_sent: usize,
    pub batches_failed: usize,
    pub selections_forwarded: usize,
    pub pending_delivery: bool,
}

#[state]
#[derive(Debug, Clone)]
pub enum BridgeState {
    Initializing,
    Running,
    Draining,
    Stopped,
}

#[machine]
pub struct Bridge<S: BridgeState> {
    ingest: Session,
    delivery: Session,
    mapper: RowMapper,
    publisher: BatchPublisher,
    events: mpsc::Receiver<SessionEvent>,
    pending: Option<DisplayTable>,
    settings: BridgeConfig,
    status: watch::Sender<BridgeStatus>,
}

impl<S: BridgeState> Bridge<S> {
    pub fn subscribe_status(&self) -> watch::Receiver<BridgeStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> BridgeStatus {
        self.status.borrow().clone()
    }

    pub fn ingest_status(&self) -> watch::Receiver<SessionStatus> {
        self.ingest.subscribe_status()
    }

    pub fn delivery_status(&self) -> watch::Receiver<SessionStatus> {
        self.delivery.subscribe_status()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}

impl Bridge<Initializing> {
    /// Builds both sessions from `config`; the ingest session talks to `ingest_broker`
    pub fn create(
        config: &Config,
        ingest_broker: Broker,
        ingest_transport: Box<dyn Transport>,
        delivery_transport: Box<dyn Transport>,
    ) -> Result<Self, BridgeError> {
        let settings = config.bridge.clone();
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let ingest_options = SessionOptions {
            kind: SessionKind::Ingest,
            broker: ingest_broker,
            client_id: config.ingest.client_id.clone(),
            credentials: None,
            keep_alive: std::time::Duration::from_secs(config.ingest.keep_alive_secs),
            subscriptions: vec![TELEMETRY_TOPIC.to_string()],
            request_timeout: settings.publish_timeout(),
        };
        let delivery_options = SessionOptions {
            kind: SessionKind::Delivery,
            broker: config.delivery_broker()?,
            client_id: config.blynk.client_id.clone(),
            credentials: Some(Credentials {
                username: config.blynk.device_name.clone(),
                password: config.blynk.auth_token.clone(),
            }),
            keep_alive: std::time::Duration::from_secs(settings.delivery_keep_alive_secs),
            subscriptions: vec![SELECTION_TOPIC.to_string()],
            request_timeout: settings.publish_timeout(),
        };

        info!(
            "Bridging {} to {} (template '{}', topic '{}')",
            ingest_options.broker,
            delivery_options.broker,
            config.blynk.template_name,
            config.blynk.topic
        );
        debug!("Template id {}", config.blynk.template_id);

        let (status, _) = watch::channel(BridgeStatus::default());
        Ok(Self::new(
            Session::new(ingest_options, ingest_transport, events_tx.clone()),
            Session::new(delivery_options, delivery_transport, events_tx),
            RowMapper::from_config(config),
            BatchPublisher::from_config(config),
            events_rx,
            None, // pending
            settings,
            status,
        ))
    }

    /// Connects both sessions. Only an ingest failure is fatal; delivery is retried by the tick.
    pub async fn start(mut self) -> Result<Bridge<Running>, BridgeError> {
        self.ingest
            .connect()
            .await
            .map_err(BridgeError::IngestStart)?;

        if let Err(e) = self.delivery.connect().await {
            warn!("Delivery session unavailable at startup, will retry: {}", e);
        }

        info!("Bridge running");
        Ok(self.transition())
    }
}

impl Bridge<Running> {
    pub async fn handle_event(&mut self, event: SessionEvent) {
        let SessionEvent {
            session,
            generation,
            kind,
        } = event;

        match kind {
            SessionEventKind::Message(message) => {
                if !self.session(session).is_current(generation) {
                    debug!("Dropping message from stale {} connection", session);
                    return;
                }
                self.session(session).record_received();
                self.handle_message(session, message).await;
            }
            SessionEventKind::ConnectionLost(cause) => {
                let applied = match session {
                    SessionKind::Ingest => self.ingest.handle_connection_lost(generation, &cause),
                    SessionKind::Delivery => {
                        self.delivery.handle_connection_lost(generation, &cause)
                    }
                };
                if applied && session == SessionKind::Ingest {
                    error!("Ingest connection lost: {}", cause);
                    self.status.send_modify(|status| {
                        status.ingest_lost = true;
                        status.ingest_losses += 1;
                    });
                }
            }
        }
    }

    async fn handle_message(&mut self, session: SessionKind, message: MqttMessage) {
        match message.topic.as_str() {
            TELEMETRY_TOPIC => {
                debug!("Telemetry from {}: {}", session, message);
                self.handle_telemetry(&message.payload).await;
            }
            SELECTION_TOPIC => {
                info!("Selection from {}: {}", session, message);
                self.handle_selection(&message.payload).await;
            }
            other => debug!("Ignoring message on {} from {} session", other, session),
        }
    }

    /// Maps a telemetry document and delivers it right away. The table stays pending if delivery is down.
    pub async fn handle_telemetry(&mut self, payload: &[u8]) {
        match self.mapper.map(payload) {
            Ok(table) => {
                debug!("Mapped {} valid rows", table.valid_count());
                self.pending = Some(table);
                self.status.send_modify(|status| status.tables_mapped += 1);
                self.flush_pending().await;
            }
            Err(e) => {
                warn!("Dropping telemetry message: {}", e);
                self.status
                    .send_modify(|status| status.telemetry_dropped += 1);
            }
        }
    }

    /// Forwards a dashboard time-window selection as a range request on the ingest session
    pub async fn handle_selection(&mut self, payload: &[u8]) {
        let request = match selection::range_request(payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("Dropping selection: {}", e);
                return;
            }
        };

        if !self.ingest.is_connected() {
            warn!("Ingest session down, dropping range request");
            return;
        }

        match self.ingest.publish(QUERY_REQUEST_TOPIC, request).await {
            Ok(()) => {
                info!("Requested new range on {}", QUERY_REQUEST_TOPIC);
                self.status
                    .send_modify(|status| status.selections_forwarded += 1);
            }
            Err(e) => error!("Range request failed: {}", e),
        }
    }

    /// Periodic supervision of both sessions plus redelivery of a pending table
    pub async fn on_tick(&mut self, now: Instant) {
        let delay = self.settings.reconnect_delay();

        if let Some(Ok(())) = self.ingest.supervise(now, delay).await {
            info!("Ingest session restored");
            self.status.send_modify(|status| status.ingest_lost = false);
        }
        self.delivery.supervise(now, delay).await;

        if self.delivery.is_connected() && self.pending.is_some() {
            info!("Delivering pending table");
            self.flush_pending().await;
        }
    }

    pub async fn run_until_shutdown(mut self, shutdown: CancellationToken) -> Bridge<Draining> {
        let mut tick = tokio::time::interval(self.settings.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }

                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        warn!("Session event channel closed");
                        break;
                    }
                },

                now = tick.tick() => self.on_tick(now).await,
            }
        }

        self.transition()
    }

    async fn flush_pending(&mut self) {
        let Some(table) = self.pending.as_ref() else {
            return;
        };

        let report = self.publisher.publish(table, &mut self.delivery).await;
        if report.is_skipped() {
            debug!("Keeping table until delivery reconnects");
        } else {
            debug!("Publish pass sent {} messages", report.messages_sent());
        }
        if let PublishReport::Completed {
            batches_sent,
            batches_failed,
            ..
        } = report
        {
            self.pending = None;
            self.status.send_modify(|status| {
                status.publish_passes += 1;
                status.batches_sent += batches_sent;
                status.batches_failed += batches_failed;
            });
        }
        let pending = self.pending.is_some();
        self.status
            .send_modify(|status| status.pending_delivery = pending);
    }

    fn session(&self, kind: SessionKind) -> &Session {
        match kind {
            SessionKind::Ingest => &self.ingest,
            SessionKind::Delivery => &self.delivery,
        }
    }
}

impl Bridge<Draining> {
    /// Unsubscribes and disconnects live sessions and releases both transports
    pub async fn shutdown(mut self) -> Bridge<Stopped> {
        if self.pending.is_some() {
            warn!("Discarding undelivered table at shutdown");
        }
        // Pump tasks block on a full channel and would sit on UNSUBACKs
        self.events.close();
        let mut dropped = 0usize;
        while self.events.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!("Dropped {} session events during shutdown", dropped);
        }
        self.ingest.shutdown().await;
        self.delivery.shutdown().await;
        info!("Bridge stopped");
        self.transition()
    }
}
