//! Transport seam between the session state machine and the MQTT client library.
//!
//! [`RumqttTransport`] drives a `rumqttc` event loop in a dedicated pump task.
//! Broker acknowledgements (CONNACK, SUBACK, UNSUBACK) are routed back to the
//! transport over a control channel so `connect`/`subscribe` can wait for them,
//! while inbound publishes and connection loss go to the bridge through the
//! [`EventSink`] registered at connect time.
//!
//! ```text
//! rumqttc EventLoop ──► pump task ──┬─► control channel ──► connect()/subscribe()
//!                                   └─► EventSink ───────► Bridge event loop
//! ```
//!
//! The pump stops at the first error instead of letting `rumqttc` reconnect on
//! its own; reconnection is the session supervisor's job. It also stops right
//! after writing an outgoing DISCONNECT, which is what `disconnect` waits for.

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeReasonCode,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::SessionOptions;
use super::message_manager::EventSink;

const CLIENT_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to connect: {0}")]
    Connect(String),

    #[error("Failed to subscribe to {topic}: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("Failed to unsubscribe from {topic}: {reason}")]
    Unsubscribe { topic: String, reason: String },

    #[error("Failed to publish to {topic}: {reason}")]
    Publish { topic: String, reason: String },

    #[error("Timed out after {0:?} waiting for the broker")]
    Timeout(Duration),

    #[error("Transport has no open connection")]
    NotConnected,
}

/// Connection primitives the session supervisor relies on.
///
/// Implementations deliver inbound messages and connection loss through the
/// [`EventSink`] passed to [`Transport::connect`], never by calling back into
/// the session directly.
#[async_trait]
pub trait Transport: Send {
    /// Creates the client, registers `sink` and waits for the broker to accept the connection
    async fn connect(
        &mut self,
        options: &SessionOptions,
        sink: EventSink,
    ) -> Result<(), TransportError>;

    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Sends a clean DISCONNECT to the broker
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Drops the client and stops background work. Safe to call in any state.
    fn release(&mut self);
}

#[derive(Debug)]
enum Control {
    ConnAck,
    SubAck(Vec<SubscribeReasonCode>),
    UnsubAck,
    Failed(String),
}

/// [`Transport`] backed by `rumqttc`
#[derive(Default)]
pub struct RumqttTransport {
    client: Option<AsyncClient>,
    pump: Option<JoinHandle<()>>,
    control: Option<mpsc::UnboundedReceiver<Control>>,
    request_timeout: Duration,
}

impl RumqttTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self) -> Result<&AsyncClient, TransportError> {
        self.client.as_ref().ok_or(TransportError::NotConnected)
    }

    /// Waits for the next acknowledgement accepted by `select`, skipping unrelated ones
    async fn await_control<T>(
        &mut self,
        select: impl Fn(Control) -> Option<Result<T, String>>,
    ) -> Result<Result<T, String>, TransportError> {
        let timeout = self.request_timeout;
        let control = self.control.as_mut().ok_or(TransportError::NotConnected)?;

        let wait = async {
            while let Some(message) = control.recv().await {
                if let Control::Failed(cause) = message {
                    return Err(cause);
                }
                if let Some(result) = select(message) {
                    return Ok(result);
                }
            }
            Err("event loop stopped".to_string())
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(cause)) => Ok(Err(cause)),
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }
}

#[async_trait]
impl Transport for RumqttTransport {
    async fn connect(
        &mut self,
        options: &SessionOptions,
        sink: EventSink,
    ) -> Result<(), TransportError> {
        self.release();
        self.request_timeout = options.request_timeout;

        let mut mqtt_options = MqttOptions::new(
            options.client_id.clone(),
            options.broker.host.clone(),
            options.broker.port,
        );
        mqtt_options
            .set_keep_alive(options.keep_alive)
            .set_clean_session(true);
        if let Some(credentials) = &options.credentials {
            mqtt_options.set_credentials(
                credentials.username.clone(),
                credentials.password.clone(),
            );
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, CLIENT_CHANNEL_CAPACITY);
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        debug!(
            "Starting {} event pump for {} as {}",
            sink.session(),
            options.broker,
            options.client_id
        );
        self.pump = Some(tokio::spawn(pump_events(eventloop, sink, control_tx)));
        self.client = Some(client);
        self.control = Some(control_rx);

        match self
            .await_control(|message| match message {
                Control::ConnAck => Some(Ok(())),
                _ => None,
            })
            .await?
        {
            Ok(()) => {
                info!("Connected to {}", options.broker);
                Ok(())
            }
            Err(cause) => Err(TransportError::Connect(cause)),
        }
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        let client = self.client()?.clone();
        let request = client.subscribe(topic, QoS::AtMostOnce);
        match tokio::time::timeout(self.request_timeout, request).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(TransportError::Subscribe {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => return Err(TransportError::Timeout(self.request_timeout)),
        }

        let codes = self
            .await_control(|message| match message {
                Control::SubAck(codes) => Some(Ok(codes)),
                _ => None,
            })
            .await?
            .map_err(|reason| TransportError::Subscribe {
                topic: topic.to_string(),
                reason,
            })?;

        if codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure))
        {
            return Err(TransportError::Subscribe {
                topic: topic.to_string(),
                reason: "rejected by broker".to_string(),
            });
        }
        debug!("Subscribed to {}", topic);
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        let client = self.client()?.clone();
        match tokio::time::timeout(self.request_timeout, client.unsubscribe(topic)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(TransportError::Unsubscribe {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => return Err(TransportError::Timeout(self.request_timeout)),
        }

        self.await_control(|message| match message {
            Control::UnsubAck => Some(Ok(())),
            _ => None,
        })
        .await?
        .map_err(|reason| TransportError::Unsubscribe {
            topic: topic.to_string(),
            reason,
        })
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let client = self.client()?;
        let request = client.publish(topic, QoS::AtMostOnce, false, payload);
        match tokio::time::timeout(self.request_timeout, request).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(TransportError::Timeout(self.request_timeout)),
        }
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let client = self.client()?;
        match tokio::time::timeout(self.request_timeout, client.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(TransportError::Connect(e.to_string())),
            Err(_) => return Err(TransportError::Timeout(self.request_timeout)),
        }

        // The request is only queued; the pump writes DISCONNECT and then exits
        if let Some(mut pump) = self.pump.take() {
            if tokio::time::timeout(self.request_timeout, &mut pump)
                .await
                .is_err()
            {
                warn!("Event loop did not flush DISCONNECT in time, aborting it");
                pump.abort();
                return Err(TransportError::Timeout(self.request_timeout));
            }
        }
        Ok(())
    }

    fn release(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.client = None;
        self.control = None;
    }
}

impl Drop for RumqttTransport {
    fn drop(&mut self) {
        self.release();
    }
}

async fn pump_events(
    mut eventloop: EventLoop,
    sink: EventSink,
    control: mpsc::UnboundedSender<Control>,
) {
    let mut connected = false;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                connected = true;
                let _ = control.send(Control::ConnAck);
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let _ = control.send(Control::SubAck(ack.return_codes));
            }
            Ok(Event::Incoming(Packet::UnsubAck(_))) => {
                let _ = control.send(Control::UnsubAck);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                sink.message(publish.topic.clone(), publish.payload.to_vec())
                    .await;
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("{} broker closed the session", sink.session());
                sink.connection_lost("broker sent DISCONNECT".to_string())
                    .await;
                break;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("{} event loop flushed DISCONNECT", sink.session());
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if connected {
                    sink.connection_lost(e.to_string()).await;
                } else {
                    let _ = control.send(Control::Failed(e.to_string()));
                }
                break;
            }
        }
    }
}
