use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use vigil_common::epoch::{self, NormalizeError};
use vigil_common::pathspec::{self, ExtractError};

use crate::backend::{Backend, BackendError, QueryOutcome};
use crate::dispatch::{DispatchError, Dispatcher};
use crate::format::{format_events, DeltaEvent};
use crate::store::{
    now_epoch_ms, Adapter, CycleStatus, MonitoringStore, PollCycleRecord, StoreError, TriggerKey,
};
use crate::trigger::TriggerDiff;

/// How one poll cycle ended, from the supervisor's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Cycle completed; count of events handed downstream (possibly zero).
    Completed { dispatched: usize },
    /// A concurrent poller owns the adapter; yielded without error.
    Yielded,
    /// Cycle ran and closed with Error status.
    Failed,
    /// Cycle never opened (adapter missing, claim lost, or open failed).
    Skipped,
}

#[derive(Debug)]
enum CycleError {
    Backend(BackendError),
    Extract {
        which: &'static str,
        source: ExtractError,
    },
    Normalize(NormalizeError),
    KeyLengthMismatch {
        evtimes: usize,
        instances: usize,
    },
    ColumnLengthMismatch {
        key: String,
        expected: usize,
        got: usize,
    },
    Store(StoreError),
    Dispatch(DispatchError),
}

impl std::fmt::Display for CycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backend(e) => write!(f, "backend: {e}"),
            Self::Extract { which, source } => write!(f, "{which} extraction: {source}"),
            Self::Normalize(e) => write!(f, "event-time normalize: {e}"),
            Self::KeyLengthMismatch { evtimes, instances } => write!(
                f,
                "diff-key extractions disagree: {evtimes} event times vs {instances} instances"
            ),
            Self::ColumnLengthMismatch { key, expected, got } => write!(
                f,
                "event-info column '{key}' yielded {got} values, expected {expected}"
            ),
            Self::Store(e) => write!(f, "store: {e}"),
            Self::Dispatch(e) => write!(f, "{e}"),
        }
    }
}

enum CycleBody {
    Dispatched(usize),
    NothingNew,
    Conflict,
}

/// Runs one poll cycle for one adapter: fetch, diff against seen triggers,
/// extract event info, format, dispatch, and close the history row. Every
/// path through [`AdapterWorker::run_cycle`] leaves the cycle record in a
/// terminal status; only a process crash can strand an InProgress row, and
/// the supervisor's recovery sweep covers that.
pub struct AdapterWorker {
    store: Arc<dyn MonitoringStore>,
    triggers: TriggerDiff,
    backend: Arc<dyn Backend>,
    dispatcher: Arc<dyn Dispatcher>,
    host: String,
}

impl AdapterWorker {
    pub fn new(
        store: Arc<dyn MonitoringStore>,
        triggers: TriggerDiff,
        backend: Arc<dyn Backend>,
        dispatcher: Arc<dyn Dispatcher>,
        host: String,
    ) -> Self {
        Self {
            store,
            triggers,
            backend,
            dispatcher,
            host,
        }
    }

    pub async fn run_cycle(&self, adapter_id: i64) -> CycleOutcome {
        let adapter = match self.store.get_adapter(adapter_id).await {
            Ok(Some(a)) => a,
            Ok(None) => {
                tracing::warn!(adapter_id, "adapter no longer configured, skipping");
                return CycleOutcome::Skipped;
            }
            Err(e) => {
                tracing::error!(adapter_id, error = %e, "loading adapter failed");
                return CycleOutcome::Skipped;
            }
        };

        let prior_cursor = match self.store.latest_completed_cursor(adapter_id).await {
            Ok(Some(c)) => c,
            Ok(None) => adapter.last_update_ms as f64 / 1000.0,
            Err(e) => {
                tracing::error!(adapter_id, error = %e, "loading prior cursor failed");
                return CycleOutcome::Skipped;
            }
        };

        let now_ms = now_epoch_ms();
        let now = now_ms as f64 / 1000.0;

        // Claim the adapter. The compare-and-set is the safety net against a
        // second worker starting for the same adapter between enumeration and
        // here.
        match self
            .store
            .mark_busy_if_unchanged(adapter_id, adapter.last_update_ms, now_ms)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(adapter_id, "adapter claimed elsewhere, skipping");
                return CycleOutcome::Skipped;
            }
            Err(e) => {
                tracing::error!(adapter_id, error = %e, "claiming adapter failed");
                return CycleOutcome::Skipped;
            }
        }

        let cycle_id = Uuid::new_v4().to_string();
        let record = PollCycleRecord {
            id: cycle_id.clone(),
            adapter_id,
            status: CycleStatus::InProgress,
            cursor: now,
            host: self.host.clone(),
            updated_at_ms: now_ms,
        };
        if let Err(e) = self.store.open_cycle(record).await {
            tracing::error!(adapter_id, error = %e, "opening cycle record failed, aborting");
            self.release(adapter_id).await;
            return CycleOutcome::Skipped;
        }

        tracing::debug!(adapter_id, %cycle_id, prior_cursor, window_end = now, "cycle opened");

        let body = self.poll_and_dispatch(&adapter, prior_cursor, now).await;

        match body {
            Ok(CycleBody::Dispatched(count)) => {
                self.close(&cycle_id, adapter_id, CycleStatus::Completed, now).await;
                self.release(adapter_id).await;
                tracing::info!(adapter_id, %cycle_id, dispatched = count, "cycle completed");
                CycleOutcome::Completed { dispatched: count }
            }
            Ok(CycleBody::NothingNew) => {
                self.close(&cycle_id, adapter_id, CycleStatus::Completed, now).await;
                self.release(adapter_id).await;
                tracing::debug!(adapter_id, %cycle_id, "cycle completed, nothing new");
                CycleOutcome::Completed { dispatched: 0 }
            }
            Ok(CycleBody::Conflict) => {
                // The concurrent poller keeps the claim; busy stays set and
                // the cursor does not advance past the unpolled window.
                self.close(&cycle_id, adapter_id, CycleStatus::Completed, prior_cursor)
                    .await;
                tracing::info!(adapter_id, %cycle_id, "adapter polled by another process, yielding");
                CycleOutcome::Yielded
            }
            Err(e) => {
                tracing::error!(adapter_id, %cycle_id, error = %e, "cycle failed");
                self.close(&cycle_id, adapter_id, CycleStatus::Error, now).await;
                self.release(adapter_id).await;
                CycleOutcome::Failed
            }
        }
    }

    async fn close(&self, cycle_id: &str, adapter_id: i64, status: CycleStatus, cursor: f64) {
        if let Err(e) = self
            .store
            .close_cycle(cycle_id, status, cursor, &self.host, now_epoch_ms())
            .await
        {
            tracing::error!(adapter_id, %cycle_id, error = %e, "closing cycle record failed");
        }
    }

    async fn release(&self, adapter_id: i64) {
        if let Err(e) = self.store.clear_busy(adapter_id, now_epoch_ms()).await {
            tracing::error!(adapter_id, error = %e, "clearing busy flag failed");
        }
    }

    async fn poll_and_dispatch(
        &self,
        adapter: &Adapter,
        window_start: f64,
        window_end: f64,
    ) -> Result<CycleBody, CycleError> {
        let payload = match self
            .backend
            .query(adapter, window_start, window_end)
            .await
            .map_err(CycleError::Backend)?
        {
            QueryOutcome::Conflict => return Ok(CycleBody::Conflict),
            QueryOutcome::Payload(p) => p,
        };

        let pairs = self.parse_diff_keys(adapter, &payload)?;
        let flags = self
            .triggers
            .diff(adapter.id, &pairs)
            .await
            .map_err(CycleError::Store)?;

        let columns = self.parse_event_info(adapter, &payload).await?;
        let row_count = columns.first().map(Vec::len).unwrap_or(0);

        let mut deltas = Vec::new();
        if row_count == pairs.len() {
            for (i, new) in flags.iter().enumerate() {
                if *new {
                    deltas.push(DeltaEvent {
                        instance: pairs[i].instance.clone(),
                        event_time: pairs[i].event_time,
                        fields: columns.iter().map(|col| col[i].clone()).collect(),
                    });
                }
            }
        } else if !pairs.is_empty() {
            tracing::warn!(
                adapter_id = adapter.id,
                pairs = pairs.len(),
                rows = row_count,
                "event-info rows do not align with diff keys, dropping delta"
            );
        }

        if deltas.is_empty() {
            return Ok(CycleBody::NothingNew);
        }

        let batch = format_events(adapter.rule_type_id, &deltas);
        if batch.is_empty() {
            return Ok(CycleBody::NothingNew);
        }

        self.dispatcher
            .send(&batch)
            .await
            .map_err(CycleError::Dispatch)?;

        Ok(CycleBody::Dispatched(batch.len()))
    }

    /// Extracts the (instance, event-time) candidates for the diff. Both
    /// paths must resolve and yield the same number of leaves; zero is a
    /// valid count and simply means no candidates this window.
    fn parse_diff_keys(
        &self,
        adapter: &Adapter,
        payload: &Value,
    ) -> Result<Vec<TriggerKey>, CycleError> {
        let evtimes =
            pathspec::extract(payload, &adapter.evtime_path).map_err(|e| CycleError::Extract {
                which: "event-time",
                source: e,
            })?;
        let instances =
            pathspec::extract(payload, &adapter.instance_path).map_err(|e| CycleError::Extract {
                which: "instance",
                source: e,
            })?;

        if evtimes.len() != instances.len() {
            return Err(CycleError::KeyLengthMismatch {
                evtimes: evtimes.len(),
                instances: instances.len(),
            });
        }

        let mut pairs = Vec::with_capacity(evtimes.len());
        for (instance, evtime) in instances.iter().zip(evtimes.iter()) {
            let event_time = epoch::normalize(evtime).map_err(CycleError::Normalize)?;
            pairs.push(TriggerKey {
                instance: scalar_string(instance),
                event_time,
            });
        }
        Ok(pairs)
    }

    /// Extracts every configured event-info column; a count disagreement
    /// between columns is a hard failure for the whole cycle.
    async fn parse_event_info(
        &self,
        adapter: &Adapter,
        payload: &Value,
    ) -> Result<Vec<Vec<Value>>, CycleError> {
        let rules = self
            .store
            .match_rules(adapter.id)
            .await
            .map_err(CycleError::Store)?;

        let mut columns = Vec::with_capacity(rules.len());
        for rule in &rules {
            let column =
                pathspec::extract(payload, &rule.response_key).map_err(|e| CycleError::Extract {
                    which: "event-info",
                    source: e,
                })?;
            columns.push((rule.response_key.clone(), column));
        }

        if let Some((_, first)) = columns.first() {
            let expected = first.len();
            for (key, column) in &columns {
                if column.len() != expected {
                    return Err(CycleError::ColumnLengthMismatch {
                        key: key.clone(),
                        expected,
                        got: column.len(),
                    });
                }
            }
        }

        Ok(columns.into_iter().map(|(_, col)| col).collect())
    }
}

fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
