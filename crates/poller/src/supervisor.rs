use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fs2::FileExt;
use tokio::task::JoinHandle;

use crate::store::{now_epoch_ms, MonitoringStore, StoreError};
use crate::worker::{AdapterWorker, CycleOutcome};

/// Non-blocking exclusive lock guarding single-instance execution. Returns
/// `None` when another supervisor already holds the lock; the caller exits
/// cleanly in that case. The lock is released when the file handle drops.
pub fn acquire_singleton_lock(path: &Path) -> std::io::Result<Option<File>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).write(true).open(path)?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(Some(file)),
        Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Fans one worker task out per non-busy adapter, reaps them on a fixed
/// interval, and sweeps orphaned InProgress cycle records owned by this host.
pub struct Supervisor {
    store: Arc<dyn MonitoringStore>,
    worker: Arc<AdapterWorker>,
    reap_interval: Duration,
    host: String,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn MonitoringStore>,
        worker: Arc<AdapterWorker>,
        reap_interval: Duration,
        host: String,
    ) -> Self {
        Self {
            store,
            worker,
            reap_interval,
            host,
        }
    }

    pub async fn run(&self) -> Result<(), StoreError> {
        // Records still InProgress for this host at entry were orphaned by a
        // crashed run; the singleton lock rules out a live owner. Sweeping
        // before fan-out unblocks those adapters for this run.
        self.recover_orphans().await;

        let adapters = self.store.list_adapters().await?;

        let mut handles: HashMap<i64, JoinHandle<CycleOutcome>> = HashMap::new();
        for adapter in adapters {
            if adapter.busy {
                tracing::debug!(adapter_id = adapter.id, "adapter busy, not spawning");
                continue;
            }
            let worker = self.worker.clone();
            let adapter_id = adapter.id;
            handles.insert(
                adapter_id,
                tokio::spawn(async move { worker.run_cycle(adapter_id).await }),
            );
        }
        tracing::info!(workers = handles.len(), "workers spawned");

        while !handles.is_empty() {
            let finished: Vec<i64> = handles
                .iter()
                .filter(|(_, handle)| handle.is_finished())
                .map(|(id, _)| *id)
                .collect();

            for adapter_id in finished {
                if let Some(handle) = handles.remove(&adapter_id) {
                    match handle.await {
                        Ok(outcome) => {
                            tracing::debug!(adapter_id, ?outcome, "worker reaped");
                        }
                        Err(e) => {
                            tracing::error!(adapter_id, error = %e, "worker task aborted");
                        }
                    }
                }
            }

            if handles.is_empty() {
                break;
            }
            tokio::time::sleep(self.reap_interval).await;
        }

        // A worker that died mid-cycle in this run leaves an InProgress row;
        // best effort, a failure here only logs.
        self.recover_orphans().await;

        Ok(())
    }

    async fn recover_orphans(&self) {
        match self.store.force_close_stale(&self.host, now_epoch_ms()).await {
            Ok(adapter_ids) if !adapter_ids.is_empty() => {
                tracing::warn!(
                    count = adapter_ids.len(),
                    ?adapter_ids,
                    "force-closed orphaned poll cycles"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "recovery sweep failed");
            }
        }
    }
}
