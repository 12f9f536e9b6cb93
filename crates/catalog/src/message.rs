//! Durable outbound events, the audit trail consumed by downstream
//! monitoring (the `MonitorSink` seam in `conveyor`).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub event_type: String,
    pub payload: Value,
    pub created_at: chrono::DateTime<chrono::Utc>,
}
