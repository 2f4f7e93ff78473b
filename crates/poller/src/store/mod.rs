mod memory;
mod postgres;
mod records;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use records::{Adapter, CycleStatus, MatchRule, PollCycleRecord, TriggerKey};

#[derive(Debug)]
pub enum StoreError {
    Sql(String),
    NotFound(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sql(e) => write!(f, "sql: {e}"),
            Self::NotFound(what) => write!(f, "not found: {what}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Sql(e.to_string())
    }
}

pub fn now_epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Transactional access to adapters, match rules, and poll-cycle records.
///
/// The busy flag travels through a single compare-and-set method: callers
/// present the `last_update_ms` they read, and the claim only lands if the row
/// is unchanged since then.
#[async_trait::async_trait]
pub trait MonitoringStore: Send + Sync {
    async fn list_adapters(&self) -> Result<Vec<Adapter>, StoreError>;

    async fn get_adapter(&self, adapter_id: i64) -> Result<Option<Adapter>, StoreError>;

    async fn mark_busy_if_unchanged(
        &self,
        adapter_id: i64,
        seen_last_update_ms: i64,
        now_ms: i64,
    ) -> Result<bool, StoreError>;

    async fn clear_busy(&self, adapter_id: i64, now_ms: i64) -> Result<(), StoreError>;

    /// Cursor of the most recent Completed cycle for the adapter, if any.
    async fn latest_completed_cursor(&self, adapter_id: i64) -> Result<Option<f64>, StoreError>;

    async fn open_cycle(&self, record: PollCycleRecord) -> Result<(), StoreError>;

    async fn close_cycle(
        &self,
        cycle_id: &str,
        status: CycleStatus,
        cursor: f64,
        host: &str,
        now_ms: i64,
    ) -> Result<(), StoreError>;

    /// Forces every InProgress cycle owned by `host` to ForceClosed and clears
    /// the busy flag of the affected adapters. Returns the adapter ids touched.
    async fn force_close_stale(&self, host: &str, now_ms: i64) -> Result<Vec<i64>, StoreError>;

    /// Match-rule columns for the adapter, in configured order.
    async fn match_rules(&self, adapter_id: i64) -> Result<Vec<MatchRule>, StoreError>;
}

/// Persisted "already reported" trigger state, scoped per adapter.
#[async_trait::async_trait]
pub trait TriggerStore: Send + Sync {
    /// Parallel flags: `true` when the pair has been recorded before.
    async fn known(&self, adapter_id: i64, pairs: &[TriggerKey]) -> Result<Vec<bool>, StoreError>;

    async fn record(&self, adapter_id: i64, pairs: &[TriggerKey]) -> Result<(), StoreError>;
}
