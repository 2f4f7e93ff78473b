use serde::Serialize;
use serde_json::Value;

/// Transient per-cycle delta: one newly observed occurrence plus its
/// extracted event-info columns. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaEvent {
    pub instance: String,
    pub event_time: f64,
    pub fields: Vec<Value>,
}

/// Production request type understood by the downstream engine.
pub const REQUEST_TYPE_PRODUCTION: u8 = 1;

/// Wire shape the downstream automation engine accepts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRequest {
    pub rule_type_id: i64,
    pub request_type: u8,
    pub instance: String,
    pub event_time: f64,
    pub event_info: Vec<Value>,
}

pub fn format_events(rule_type_id: i64, deltas: &[DeltaEvent]) -> Vec<EventRequest> {
    deltas
        .iter()
        .map(|d| EventRequest {
            rule_type_id,
            request_type: REQUEST_TYPE_PRODUCTION,
            instance: d.instance.clone(),
            event_time: d.event_time,
            event_info: d.fields.clone(),
        })
        .collect()
}
