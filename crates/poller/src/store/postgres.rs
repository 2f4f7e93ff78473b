use sqlx::PgPool;

use super::records::{Adapter, CycleStatus, MatchRule, PollCycleRecord, TriggerKey};
use super::{MonitoringStore, StoreError, TriggerStore};

/// Postgres-backed store. Cycle open/close and the recovery sweep each run in
/// one transaction so a row is never left half-written.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AdapterRow {
    adapter_id: i64,
    name: String,
    uri: String,
    username: String,
    password: String,
    metric: String,
    evtime_path: String,
    instance_path: String,
    rule_type_id: i64,
    busy: bool,
    last_update_ms: i64,
}

impl From<AdapterRow> for Adapter {
    fn from(r: AdapterRow) -> Self {
        Adapter {
            id: r.adapter_id,
            name: r.name,
            uri: r.uri,
            username: r.username,
            password: r.password,
            metric: r.metric,
            evtime_path: r.evtime_path,
            instance_path: r.instance_path,
            rule_type_id: r.rule_type_id,
            busy: r.busy,
            last_update_ms: r.last_update_ms,
        }
    }
}

const ADAPTER_COLUMNS: &str = "adapter_id, name, uri, username, password, metric, \
     evtime_path, instance_path, rule_type_id, busy, last_update_ms";

#[async_trait::async_trait]
impl MonitoringStore for PgStore {
    async fn list_adapters(&self) -> Result<Vec<Adapter>, StoreError> {
        let rows = sqlx::query_as::<_, AdapterRow>(&format!(
            "SELECT {ADAPTER_COLUMNS} FROM adapters ORDER BY adapter_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Adapter::from).collect())
    }

    async fn get_adapter(&self, adapter_id: i64) -> Result<Option<Adapter>, StoreError> {
        let row = sqlx::query_as::<_, AdapterRow>(&format!(
            "SELECT {ADAPTER_COLUMNS} FROM adapters WHERE adapter_id = $1"
        ))
        .bind(adapter_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Adapter::from))
    }

    async fn mark_busy_if_unchanged(
        &self,
        adapter_id: i64,
        seen_last_update_ms: i64,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE adapters SET busy = TRUE, last_update_ms = $3 \
             WHERE adapter_id = $1 AND last_update_ms = $2",
        )
        .bind(adapter_id)
        .bind(seen_last_update_ms)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear_busy(&self, adapter_id: i64, now_ms: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE adapters SET busy = FALSE, last_update_ms = $2 WHERE adapter_id = $1")
            .bind(adapter_id)
            .bind(now_ms)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn latest_completed_cursor(&self, adapter_id: i64) -> Result<Option<f64>, StoreError> {
        let cursor: Option<f64> = sqlx::query_scalar(
            "SELECT last_change FROM poll_cycles \
             WHERE adapter_id = $1 AND status = 'completed' \
             ORDER BY last_change DESC LIMIT 1",
        )
        .bind(adapter_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(cursor)
    }

    async fn open_cycle(&self, record: PollCycleRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO poll_cycles
               (cycle_id, adapter_id, status, last_change, host, updated_at)
               VALUES ($1, $2, $3, $4, $5,
                       to_timestamp($6::double precision / 1000))"#,
        )
        .bind(&record.id)
        .bind(record.adapter_id)
        .bind(record.status.as_str())
        .bind(record.cursor)
        .bind(&record.host)
        .bind(record.updated_at_ms)
        .execute(&self.pool)
        .await?;
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
        let result = sqlx::query(
            r#"UPDATE poll_cycles
               SET status = $2, last_change = $3, host = $4,
                   updated_at = to_timestamp($5::double precision / 1000)
               WHERE cycle_id = $1"#,
        )
        .bind(cycle_id)
        .bind(status.as_str())
        .bind(cursor)
        .bind(host)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("cycle {cycle_id}")));
        }
        Ok(())
    }

    async fn force_close_stale(&self, host: &str, now_ms: i64) -> Result<Vec<i64>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let adapter_ids: Vec<i64> = sqlx::query_scalar(
            r#"UPDATE poll_cycles
               SET status = 'force_closed',
                   updated_at = to_timestamp($2::double precision / 1000)
               WHERE status = 'in_progress' AND host = $1
               RETURNING adapter_id"#,
        )
        .bind(host)
        .bind(now_ms)
        .fetch_all(&mut *tx)
        .await?;

        for adapter_id in &adapter_ids {
            sqlx::query(
                "UPDATE adapters SET busy = FALSE, last_update_ms = $2 WHERE adapter_id = $1",
            )
            .bind(adapter_id)
            .bind(now_ms)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(adapter_ids)
    }

    async fn match_rules(&self, adapter_id: i64) -> Result<Vec<MatchRule>, StoreError> {
        let rows = sqlx::query_as::<_, MatchRuleRow>(
            "SELECT match_id, adapter_id, response_key FROM match_rules \
             WHERE adapter_id = $1 ORDER BY match_id",
        )
        .bind(adapter_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| MatchRule {
                id: r.match_id,
                adapter_id: r.adapter_id,
                response_key: r.response_key,
            })
            .collect())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MatchRuleRow {
    match_id: i64,
    adapter_id: i64,
    response_key: String,
}

#[async_trait::async_trait]
impl TriggerStore for PgStore {
    async fn known(&self, adapter_id: i64, pairs: &[TriggerKey]) -> Result<Vec<bool>, StoreError> {
        let mut flags = Vec::with_capacity(pairs.len());
        for pair in pairs {
            let hit: Option<i32> = sqlx::query_scalar(
                "SELECT 1 FROM seen_triggers \
                 WHERE adapter_id = $1 AND instance = $2 AND event_time = $3",
            )
            .bind(adapter_id)
            .bind(&pair.instance)
            .bind(pair.event_time)
            .fetch_optional(&self.pool)
            .await?;
            flags.push(hit.is_some());
        }
        Ok(flags)
    }

    async fn record(&self, adapter_id: i64, pairs: &[TriggerKey]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for pair in pairs {
            sqlx::query(
                r#"INSERT INTO seen_triggers (adapter_id, instance, event_time)
                   VALUES ($1, $2, $3)
                   ON CONFLICT (adapter_id, instance, event_time) DO NOTHING"#,
            )
            .bind(adapter_id)
            .bind(&pair.instance)
            .bind(pair.event_time)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
