use mongodb::bson::doc;
use mongodb::options::ReplaceOptions;
use mongodb::{Collection, Database};

use crate::errors::Result;
use crate::types::TenantSummary;

const TENANT_SUMMARY: &str = "NxtTenantSummary";

/// Read/write view over the last-successfully-applied state per tenant; the
/// crash-recovery log. Callers, not this store, are responsible for
/// sequencing writes against orchestrator mutations (the write-ahead rule).
pub struct SummaryStore {
    collection: Collection<TenantSummary>,
}

impl SummaryStore {
    pub fn new(db: &Database) -> Self {
        Self {
            collection: db.collection(TENANT_SUMMARY),
        }
    }

    pub async fn find_one(&self, tenant: &str) -> Result<Option<TenantSummary>> {
        Ok(self
            .collection
            .find_one(doc! { "_id": tenant }, None)
            .await?)
    }

    pub async fn find_all(&self) -> Result<Vec<TenantSummary>> {
        use futures::stream::StreamExt;
        let mut cursor = self.collection.find(None, None).await?;
        let mut out = Vec::new();
        while let Some(summary) = cursor.try_next().await? {
            out.push(summary);
        }
        Ok(out)
    }

    /// Replaces (or creates) the whole tenant summary document. The
    /// document's `_id` always matches `summary.tenant`.
    pub async fn upsert(&self, summary: &TenantSummary) -> Result<()> {
        let options = ReplaceOptions::builder().upsert(true).build();
        self.collection
            .replace_one(doc! { "_id": &summary.tenant }, summary, options)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, tenant: &str) -> Result<()> {
        self.collection.delete_one(doc! { "_id": tenant }, None).await?;
        Ok(())
    }
}
