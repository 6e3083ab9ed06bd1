//! In-memory transport for exercising sessions and the bridge without a broker.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::config::SessionOptions;
use super::message_manager::EventSink;
use super::transport::{Transport, TransportError};

#[derive(Default)]
struct BrokerState {
    connected: bool,
    sink: Option<EventSink>,
    failing_connects: usize,
    fail_subscribe: bool,
    failing_publishes: BTreeSet<usize>,
    publish_attempts: usize,
    connects: usize,
    disconnects: usize,
    releases: usize,
    subscriptions: Vec<String>,
    unsubscribed: Vec<String>,
    published: Vec<(String, Vec<u8>)>,
}

/// Shared handle to a fake broker; every transport it hands out records into the same state
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }

    pub fn transport(&self) -> Box<dyn Transport> {
        Box::new(MockTransport {
            broker: self.clone(),
        })
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.lock().failing_connects = count;
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.lock().fail_subscribe = fail;
    }

    /// Fails the publish attempts with the given zero-based indices
    pub fn fail_publishes(&self, attempts: &[usize]) {
        self.lock().failing_publishes = attempts.iter().copied().collect();
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    pub fn disconnects(&self) -> usize {
        self.lock().disconnects
    }

    pub fn releases(&self) -> usize {
        self.lock().releases
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.lock().subscriptions.clone()
    }

    pub fn unsubscribed(&self) -> Vec<String> {
        self.lock().unsubscribed.clone()
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.lock().published.clone()
    }

    pub fn published_json(&self) -> Vec<serde_json::Value> {
        self.published()
            .iter()
            .map(|(_, payload)| serde_json::from_slice(payload).unwrap())
            .collect()
    }

    /// Delivers an inbound message through the sink of the live connection
    pub async fn inject(&self, topic: &str, payload: &[u8]) {
        let sink = self.lock().sink.clone();
        if let Some(sink) = sink {
            sink.message(topic.to_string(), payload.to_vec()).await;
        }
    }

    /// Simulates the broker going away underneath a connected session
    pub async fn drop_connection(&self, cause: &str) {
        let sink = {
            let mut state = self.lock();
            state.connected = false;
            state.sink.take()
        };
        if let Some(sink) = sink {
            sink.connection_lost(cause.to_string()).await;
        }
    }
}

pub struct MockTransport {
    broker: MockBroker,
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &mut self,
        _options: &SessionOptions,
        sink: EventSink,
    ) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        state.connects += 1;
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(TransportError::Connect("connection refused".to_string()));
        }
        state.connected = true;
        state.sink = Some(sink);
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if state.fail_subscribe {
            return Err(TransportError::Subscribe {
                topic: topic.to_string(),
                reason: "rejected by broker".to_string(),
            });
        }
        state.subscriptions.push(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        state.unsubscribed.push(topic.to_string());
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        let attempt = state.publish_attempts;
        state.publish_attempts += 1;
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if state.failing_publishes.contains(&attempt) {
            return Err(TransportError::Publish {
                topic: topic.to_string(),
                reason: "broker rejected publish".to_string(),
            });
        }
        state.published.push((topic.to_string(), payload));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        state.disconnects += 1;
        state.connected = false;
        Ok(())
    }

    fn release(&mut self) {
        let mut state = self.broker.lock();
        state.releases += 1;
        state.connected = false;
        state.sink = None;
    }
}
