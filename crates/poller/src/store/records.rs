/// One monitored target. Configuration management owns every field except
/// `busy` and `last_update_ms`, which the poll cycle claims and releases.
#[derive(Debug, Clone, PartialEq)]
pub struct Adapter {
    pub id: i64,
    pub name: String,
    pub uri: String,
    pub username: String,
    pub password: String,
    pub metric: String,
    pub evtime_path: String,
    pub instance_path: String,
    pub rule_type_id: i64,
    pub busy: bool,
    pub last_update_ms: i64,
}

/// One ordered event-info column for an adapter: a dotted response key that
/// becomes one field of every forwarded event.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchRule {
    pub id: i64,
    pub adapter_id: i64,
    pub response_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStatus {
    InProgress,
    Completed,
    Error,
    ForceClosed,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::ForceClosed => "force_closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            "force_closed" => Some(Self::ForceClosed),
            _ => None,
        }
    }
}

/// Audit row for one poll attempt. Invariant: at most one InProgress row per
/// adapter, guarded by the adapter busy flag.
#[derive(Debug, Clone, PartialEq)]
pub struct PollCycleRecord {
    pub id: String,
    pub adapter_id: i64,
    pub status: CycleStatus,
    /// High-water-mark epoch seconds covered by this cycle's window.
    pub cursor: f64,
    pub host: String,
    pub updated_at_ms: i64,
}

/// One (instance, event-time) trigger candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerKey {
    pub instance: String,
    pub event_time: f64,
}
