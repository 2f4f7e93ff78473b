use std::sync::Arc;

use crate::store::{StoreError, TriggerKey, TriggerStore};

/// Marks which (instance, event-time) pairs of a poll are newly observed.
///
/// Every examined pair is recorded as seen in the same call, so a repeat call
/// with the same pairs reports nothing new. State only ever grows here;
/// retention is someone else's job.
pub struct TriggerDiff {
    store: Arc<dyn TriggerStore>,
}

impl TriggerDiff {
    pub fn new(store: Arc<dyn TriggerStore>) -> Self {
        Self { store }
    }

    pub async fn diff(
        &self,
        adapter_id: i64,
        pairs: &[TriggerKey],
    ) -> Result<Vec<bool>, StoreError> {
        if pairs.is_empty() {
            return Ok(Vec::new());
        }
        let known = self.store.known(adapter_id, pairs).await?;
        self.store.record(adapter_id, pairs).await?;
        Ok(known.into_iter().map(|seen| !seen).collect())
    }
}
