use crate::MaestroResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A frame on the real-time channel. Every message exchanged with a peer —
/// agent, dashboard or monitor — has this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Frame {
    pub fn new(frame_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            frame_type: frame_type.into(),
            timestamp: Utc::now(),
            data,
        }
    }
}

/// An internal system event, published on the coordinator's event bus and
/// consumed by the workflow engine, the gateway fan-out and the metrics
/// collector. Same shape as a wire frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: Utc::now(),
            data,
        }
    }

    pub fn into_frame(self) -> Frame {
        Frame {
            frame_type: self.event_type,
            timestamp: self.timestamp,
            data: self.data,
        }
    }
}

/// Outbound half of the real-time channel, as seen from the orchestrator
/// core. The gateway implements this over its per-connection send channels;
/// a send must never block — a missing peer or a full channel is a
/// `Transport` error the caller deals with.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_to_agent(&self, agent_id: &str, frame: Frame) -> MaestroResult<()>;
}
