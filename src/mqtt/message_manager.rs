use chrono::NaiveDateTime;
use std::fmt;
use tokio::sync::mpsc;
use tracing::warn;

const PREVIEW_LEN: usize = 48;

/// Which of the two bridge sessions an event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    /// Local broker carrying controller telemetry
    Ingest,
    /// Dashboard broker receiving batched rows
    Delivery,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SessionKind::Ingest => write!(f, "ingest"),
            SessionKind::Delivery => write!(f, "delivery"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub timestamp: NaiveDateTime,
}

impl fmt::Display for MqttMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = String::from_utf8_lossy(&self.payload);
        let preview: String = text.chars().take(PREVIEW_LEN).collect();
        let ellipsis = if text.chars().count() > PREVIEW_LEN {
            "..."
        } else {
            ""
        };
        write!(
            f,
            "{} - {} ({} bytes): {}{}",
            self.timestamp,
            self.topic,
            self.payload.len(),
            preview,
            ellipsis
        )
    }
}

impl MqttMessage {
    pub fn from_topic(topic: String, payload: Vec<u8>) -> Self {
        MqttMessage {
            topic,
            payload,
            timestamp: chrono::Local::now().naive_local(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEventKind {
    Message(MqttMessage),
    ConnectionLost(String),
}

/// Notification raised by a transport outside the bridge's own call stack.
///
/// `generation` identifies the connection attempt that produced the event so
/// late notifications from a torn-down connection can be told apart from the
/// live one.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub session: SessionKind,
    pub generation: u64,
    pub kind: SessionEventKind,
}

/// Callback endpoint handed to a transport on connect.
#[derive(Debug, Clone)]
pub struct EventSink {
    session: SessionKind,
    generation: u64,
    tx: mpsc::Sender<SessionEvent>,
}

impl EventSink {
    pub fn new(session: SessionKind, generation: u64, tx: mpsc::Sender<SessionEvent>) -> Self {
        Self {
            session,
            generation,
            tx,
        }
    }

    pub fn session(&self) -> SessionKind {
        self.session
    }

    pub async fn message(&self, topic: String, payload: Vec<u8>) {
        let message = MqttMessage::from_topic(topic, payload);
        self.emit(SessionEventKind::Message(message)).await;
    }

    pub async fn connection_lost(&self, cause: String) {
        self.emit(SessionEventKind::ConnectionLost(cause)).await;
    }

    async fn emit(&self, kind: SessionEventKind) {
        let event = SessionEvent {
            session: self.session,
            generation: self.generation,
            kind,
        };
        if self.tx.send(event).await.is_err() {
            warn!("{} session event dropped, bridge is no longer listening", self.session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sink_tags_events_with_session_and_generation() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = EventSink::new(SessionKind::Delivery, 7, tx);

        sink.message("downlink/ds/TimeWindow".to_string(), b"3".to_vec())
            .await;
        sink.connection_lost("keep alive timeout".to_string()).await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.session, SessionKind::Delivery);
        assert_eq!(first.generation, 7);
        match first.kind {
            SessionEventKind::Message(msg) => {
                assert_eq!(msg.topic, "downlink/ds/TimeWindow");
                assert_eq!(msg.payload, b"3");
            }
            other => panic!("unexpected event {:?}", other),
        }

        let second = rx.recv().await.unwrap();
        assert_eq!(
            second.kind,
            SessionEventKind::ConnectionLost("keep alive timeout".to_string())
        );
    }

    #[test]
    fn display_truncates_long_payloads() {
        let msg = MqttMessage::from_topic("t".to_string(), vec![b'x'; 200]);
        let rendered = msg.to_string();
        assert!(rendered.contains("(200 bytes)"));
        assert!(rendered.ends_with("..."));
    }
}
