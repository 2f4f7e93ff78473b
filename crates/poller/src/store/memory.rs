use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;

use super::records::{Adapter, CycleStatus, MatchRule, PollCycleRecord, TriggerKey};
use super::{MonitoringStore, StoreError, TriggerStore};

/// In-memory store over concurrent maps. The integration test harness runs
/// against this; production wiring uses [`super::PgStore`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    adapters: Arc<DashMap<i64, Adapter>>,
    rules: Arc<DashMap<i64, Vec<MatchRule>>>,
    cycles: Arc<DashMap<String, PollCycleRecord>>,
    // Trigger keys per adapter; event time keyed by raw bits for exact equality.
    triggers: Arc<DashMap<i64, HashSet<(String, u64)>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_adapter(&self, adapter: Adapter) {
        self.adapters.insert(adapter.id, adapter);
    }

    pub fn insert_match_rule(&self, rule: MatchRule) {
        self.rules.entry(rule.adapter_id).or_default().push(rule);
    }

    pub fn insert_cycle(&self, record: PollCycleRecord) {
        self.cycles.insert(record.id.clone(), record);
    }

    pub fn cycles_for(&self, adapter_id: i64) -> Vec<PollCycleRecord> {
        self.cycles
            .iter()
            .filter(|r| r.value().adapter_id == adapter_id)
            .map(|r| r.value().clone())
            .collect()
    }

    pub fn adapter(&self, adapter_id: i64) -> Option<Adapter> {
        self.adapters.get(&adapter_id).map(|a| a.clone())
    }
}

#[async_trait::async_trait]
impl MonitoringStore for MemoryStore {
    async fn list_adapters(&self) -> Result<Vec<Adapter>, StoreError> {
        let mut all: Vec<Adapter> = self.adapters.iter().map(|a| a.value().clone()).collect();
        all.sort_by_key(|a| a.id);
        Ok(all)
    }

    async fn get_adapter(&self, adapter_id: i64) -> Result<Option<Adapter>, StoreError> {
        Ok(self.adapters.get(&adapter_id).map(|a| a.clone()))
    }

    async fn mark_busy_if_unchanged(
        &self,
        adapter_id: i64,
        seen_last_update_ms: i64,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let Some(mut adapter) = self.adapters.get_mut(&adapter_id) else {
            return Err(StoreError::NotFound(format!("adapter {adapter_id}")));
        };
        if adapter.last_update_ms != seen_last_update_ms {
            return Ok(false);
        }
        adapter.busy = true;
        adapter.last_update_ms = now_ms;
        Ok(true)
    }

    async fn clear_busy(&self, adapter_id: i64, now_ms: i64) -> Result<(), StoreError> {
        if let Some(mut adapter) = self.adapters.get_mut(&adapter_id) {
            adapter.busy = false;
            adapter.last_update_ms = now_ms;
        }
        Ok(())
    }

    async fn latest_completed_cursor(&self, adapter_id: i64) -> Result<Option<f64>, StoreError> {
        let latest = self
            .cycles
            .iter()
            .filter(|r| {
                r.value().adapter_id == adapter_id && r.value().status == CycleStatus::Completed
            })
            .map(|r| r.value().cursor)
            .fold(None::<f64>, |acc, c| match acc {
                Some(best) if best >= c => Some(best),
                _ => Some(c),
            });
        Ok(latest)
    }

    async fn open_cycle(&self, record: PollCycleRecord) -> Result<(), StoreError> {
        self.cycles.insert(record.id.clone(), record);
        Ok(())
    }

    async fn close_cycle(
        &self,
        cycle_id: &str,
        status: CycleStatus,
        cursor: f64,
        host: &str,
        now_ms: i64,
    ) -> Result<(), StoreError> {
        let Some(mut record) = self.cycles.get_mut(cycle_id) else {
            return Err(StoreError::NotFound(format!("cycle {cycle_id}")));
        };
        record.status = status;
        record.cursor = cursor;
        record.host = host.to_string();
        record.updated_at_ms = now_ms;
        Ok(())
    }

    async fn force_close_stale(&self, host: &str, now_ms: i64) -> Result<Vec<i64>, StoreError> {
        let mut touched = Vec::new();
        for mut record in self.cycles.iter_mut() {
            let r = record.value_mut();
            if r.status == CycleStatus::InProgress && r.host == host {
                r.status = CycleStatus::ForceClosed;
                r.updated_at_ms = now_ms;
                touched.push(r.adapter_id);
            }
        }
        for adapter_id in &touched {
            if let Some(mut adapter) = self.adapters.get_mut(adapter_id) {
                adapter.busy = false;
                adapter.last_update_ms = now_ms;
            }
        }
        Ok(touched)
    }

    async fn match_rules(&self, adapter_id: i64) -> Result<Vec<MatchRule>, StoreError> {
        let mut rules = self
            .rules
            .get(&adapter_id)
            .map(|r| r.clone())
            .unwrap_or_default();
        rules.sort_by_key(|r| r.id);
        Ok(rules)
    }
}

#[async_trait::async_trait]
impl TriggerStore for MemoryStore {
    async fn known(&self, adapter_id: i64, pairs: &[TriggerKey]) -> Result<Vec<bool>, StoreError> {
        let seen = self.triggers.get(&adapter_id);
        Ok(pairs
            .iter()
            .map(|p| {
                seen.as_ref()
                    .map(|s| s.contains(&(p.instance.clone(), p.event_time.to_bits())))
                    .unwrap_or(false)
            })
            .collect())
    }

    async fn record(&self, adapter_id: i64, pairs: &[TriggerKey]) -> Result<(), StoreError> {
        let mut seen = self.triggers.entry(adapter_id).or_default();
        for p in pairs {
            seen.insert((p.instance.clone(), p.event_time.to_bits()));
        }
        Ok(())
    }
}
