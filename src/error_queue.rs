use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use log::{info, warn};
use mongodb::{Collection, Database};
use tokio::sync::Mutex;

use crate::errors::Result;
use crate::reconciler::Reconciler;
use crate::types::ErrorRecord;

const ERROR_RECORDS: &str = "NxtErrRec";

/// Drops the persistent error collection at boot; per §4.4, errors are
/// reconstructed from the next reconciliation pass rather than replayed
/// from a stale on-disk log.
pub async fn drop_error_collection(db: &Database) -> Result<()> {
    let collection: Collection<ErrorRecord> = db.collection(ERROR_RECORDS);
    match collection.drop(None).await {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("ns not found") => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Per-key ordered queue of failed mutation intents (§3, §4.4). The worker
/// re-derives desired state and replays the reconstructed event through the
/// same [`Reconciler::handle_event`] path the live change stream uses.
pub struct ErrorQueue {
    buckets: Mutex<HashMap<String, VecDeque<ErrorRecord>>>,
    records: Collection<ErrorRecord>,
}

impl ErrorQueue {
    pub fn new(db: &Database) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            records: db.collection(ERROR_RECORDS),
        }
    }

    /// Appends a failed intent to its bucket and best-effort persists it.
    /// Persistence failures are logged, not propagated: the in-memory
    /// bucket is authoritative for retry, the collection exists only so an
    /// operator can inspect it (it is never read back by this process).
    pub async fn push(&self, record: ErrorRecord) {
        let key = ErrorRecord::bucket_key(record.collection, record.tenant.as_deref());
        if let Err(e) = self.records.insert_one(&record, None).await {
            warn!("failed to persist error record under {key}: {e}");
        }
        let mut buckets = self.buckets.lock().await;
        buckets.entry(key).or_default().push_back(record);
    }

    pub async fn dump_to_log(&self) {
        let buckets = self.buckets.lock().await;
        for (key, queue) in buckets.iter() {
            info!("error queue bucket \"{key}\": {} pending", queue.len());
            for record in queue {
                match serde_json::to_string(record) {
                    Ok(json) => info!("  {json}"),
                    Err(e) => warn!("  failed to serialize error record for {key}: {e}"),
                }
            }
        }
    }

    /// One full front-to-back scan of every bucket (§4.4). Held under the
    /// single writer lock for the whole scan, per §5's serialization rule.
    /// Deletions are applied after the scan completes to avoid index drift
    /// while iterating.
    async fn run_once(&self, reconciler: &Reconciler) {
        let mut buckets = self.buckets.lock().await;
        for (key, queue) in buckets.iter_mut() {
            let mut resolved = Vec::new();
            for (idx, record) in queue.iter().enumerate() {
                let outcome = match record.to_event() {
                    Some(event) => reconciler.handle_event(event).await,
                    None => Ok(()),
                };
                match outcome {
                    Ok(()) => resolved.push(idx),
                    Err(e) => warn!("retry still failing in bucket \"{key}\": {e}"),
                }
            }
            for idx in resolved.into_iter().rev() {
                queue.remove(idx);
            }
        }
    }

    /// Long-lived worker task: scans every ≈2 seconds (§5's polling
    /// cadence).
    pub async fn run_worker(&self, reconciler: &Reconciler) -> ! {
        loop {
            tokio::time::sleep(Duration::from_secs(2)).await;
            self.run_once(reconciler).await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::{CollectionKind, OperationKind};
    use chrono::Utc;

    fn sample_record(tenant: &str) -> ErrorRecord {
        ErrorRecord {
            key: ErrorRecord::bucket_key(CollectionKind::Tenants, Some(tenant)),
            op: OperationKind::Update,
            collection: CollectionKind::Tenants,
            tenant: Some(tenant.to_string()),
            connect_id: None,
            error: "simulated".to_string(),
            changed_at: Utc::now(),
        }
    }

    #[test]
    fn bucket_key_groups_gateways_separately_from_tenants() {
        let gw_key = ErrorRecord::bucket_key(CollectionKind::Gateways, None);
        let tenant_key = ErrorRecord::bucket_key(CollectionKind::Tenants, Some("acme"));
        assert_eq!(gw_key, "gateway-");
        assert_eq!(tenant_key, "tenant-acme");
        assert_ne!(gw_key, tenant_key);
    }

    #[test]
    fn record_round_trips_through_to_event() {
        let record = sample_record("acme");
        let event = record.to_event().unwrap();
        assert_eq!(
            event,
            crate::types::DesiredStateEvent::Tenant {
                op: OperationKind::Update,
                id: "acme".to_string(),
            }
        );
    }
}
