// Live-log broadcaster
//
// Per-execution fan-out of status/log/error/heartbeat frames to subscribers.
// A subscriber that can no longer receive is evicted rather than ever
// blocking the publisher.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Kinds of frames pushed to live subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Status,
    Log,
    Error,
    Heartbeat,
}

/// One frame pushed to subscribers of an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamFrame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    pub execution_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

impl StreamFrame {
    pub fn new(kind: FrameKind, execution_id: Uuid, data: Value) -> Self {
        Self {
            kind,
            execution_id,
            timestamp: Utc::now(),
            data,
        }
    }

    pub fn status(execution_id: Uuid, data: Value) -> Self {
        Self::new(FrameKind::Status, execution_id, data)
    }

    pub fn log(execution_id: Uuid, data: Value) -> Self {
        Self::new(FrameKind::Log, execution_id, data)
    }

    pub fn error(execution_id: Uuid, message: &str) -> Self {
        Self::new(FrameKind::Error, execution_id, json!({"error": message}))
    }

    pub fn heartbeat(execution_id: Uuid) -> Self {
        Self::new(FrameKind::Heartbeat, execution_id, json!({}))
    }

    /// Whether this is a terminal status frame.
    pub fn is_final_status(&self) -> bool {
        self.kind == FrameKind::Status
            && matches!(
                self.data.get("status").and_then(Value::as_str),
                Some("success") | Some("failed") | Some("cancelled")
            )
    }
}

/// Receiving half handed to a subscriber.
pub type FrameReceiver = mpsc::UnboundedReceiver<StreamFrame>;

/// Fan-out hub mapping execution ids to live subscribers.
#[derive(Debug, Default)]
pub struct LogBroadcaster {
    subscribers: Mutex<HashMap<Uuid, Vec<mpsc::UnboundedSender<StreamFrame>>>>,
}

impl LogBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to an execution's frames. The subscriber immediately
    /// receives a `status: connected` frame.
    pub fn subscribe(&self, execution_id: Uuid) -> FrameReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(StreamFrame::status(
            execution_id,
            json!({"status": "connected", "message": "Streaming logs..."}),
        ));
        self.subscribers
            .lock()
            .entry(execution_id)
            .or_default()
            .push(tx);
        rx
    }

    /// Fan a frame out to every live subscriber of the execution. Senders
    /// whose receiver is gone are evicted here.
    pub fn publish(&self, frame: StreamFrame) {
        let mut subscribers = self.subscribers.lock();
        if let Some(senders) = subscribers.get_mut(&frame.execution_id) {
            senders.retain(|sender| sender.send(frame.clone()).is_ok());
            if senders.is_empty() {
                subscribers.remove(&frame.execution_id);
            }
        }
    }

    /// Publish a final frame and drop all subscribers for the execution,
    /// closing their channels.
    pub fn finish(&self, frame: StreamFrame) {
        let execution_id = frame.execution_id;
        self.publish(frame);
        self.subscribers.lock().remove(&execution_id);
    }

    pub fn subscriber_count(&self, execution_id: Uuid) -> usize {
        self.subscribers
            .lock()
            .get(&execution_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_gets_connected_frame_first() {
        let hub = LogBroadcaster::new();
        let id = Uuid::new_v4();
        let mut rx = hub.subscribe(id);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, FrameKind::Status);
        assert_eq!(first.data["status"], json!("connected"));
    }

    #[tokio::test]
    async fn test_publish_fans_out_to_all_subscribers() {
        let hub = LogBroadcaster::new();
        let id = Uuid::new_v4();
        let mut rx1 = hub.subscribe(id);
        let mut rx2 = hub.subscribe(id);
        rx1.recv().await.unwrap();
        rx2.recv().await.unwrap();

        hub.publish(StreamFrame::log(id, json!({"node_id": "a"})));
        assert_eq!(rx1.recv().await.unwrap().data["node_id"], json!("a"));
        assert_eq!(rx2.recv().await.unwrap().data["node_id"], json!("a"));
    }

    #[tokio::test]
    async fn test_dead_subscriber_is_evicted() {
        let hub = LogBroadcaster::new();
        let id = Uuid::new_v4();
        let rx = hub.subscribe(id);
        assert_eq!(hub.subscriber_count(id), 1);

        drop(rx);
        hub.publish(StreamFrame::heartbeat(id));
        assert_eq!(hub.subscriber_count(id), 0);
    }

    #[tokio::test]
    async fn test_finish_closes_channels() {
        let hub = LogBroadcaster::new();
        let id = Uuid::new_v4();
        let mut rx = hub.subscribe(id);
        rx.recv().await.unwrap();

        hub.finish(StreamFrame::status(
            id,
            json!({"status": "success", "duration_ms": 10}),
        ));

        let last = rx.recv().await.unwrap();
        assert!(last.is_final_status());
        // channel is closed after the final frame
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_publish_to_unknown_execution_is_noop() {
        let hub = LogBroadcaster::new();
        hub.publish(StreamFrame::heartbeat(Uuid::new_v4()));
    }
}
