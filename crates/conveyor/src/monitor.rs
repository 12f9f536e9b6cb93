//! Outbound transfer events: every state transition is durably recorded
//! via [`catalog::Transaction::add_message`] (the audit trail), and
//! additionally offered to an optional external [`MonitorSink`] (the
//! seam a production deployment would wire to its message bus).

use catalog::message::Message;
use catalog::Transaction;
use serde_json::Value;
use uuid::Uuid;

use crate::error::ConveyorError;

/// External notification seam. Production Rucio publishes to ActiveMQ;
/// here it is just a trait so tests can assert on what would have been
/// sent without standing up a broker.
pub trait MonitorSink: Send + Sync {
    fn emit(&self, event_type: &str, payload: &Value);
}

/// Never notifies anyone; the durable `messages` table is still written.
pub struct NullMonitorSink;

impl MonitorSink for NullMonitorSink {
    fn emit(&self, _event_type: &str, _payload: &Value) {}
}

/// Records `event_type`/`payload` in the durable message log and offers
/// it to `sink`.
pub fn add_monitor_message(tx: &Transaction<'_>, sink: &dyn MonitorSink, event_type: &str, payload: Value) -> Result<(), ConveyorError> {
    tx.add_message(&Message {
        id: Uuid::new_v4(),
        event_type: event_type.to_string(),
        payload: payload.clone(),
        created_at: chrono::Utc::now(),
    })?;
    sink.emit(event_type, &payload);
    Ok(())
}
