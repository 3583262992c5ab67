use futures::stream::StreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType};
use mongodb::change_stream::ChangeStream;
use mongodb::options::{ChangeStreamOptions, FullDocumentType};
use mongodb::{Collection, Database};

use crate::errors::Result;
use crate::types::{ConnectorBundle, DesiredStateEvent, GatewayRecord, OperationKind, TenantConfig};

const TENANTS: &str = "NxtTenants";
const CONNECTORS: &str = "NxtConnectors";
const GATEWAYS: &str = "NxtGateways";

/// Read-only view over desired configuration, plus the database's change
/// stream translated into the tagged [`DesiredStateEvent`] boundary type
/// (Design Notes: "change-stream type coercion").
pub struct DesiredStateStore {
    gateways: Collection<GatewayRecord>,
    tenants: Collection<TenantConfig>,
    connectors: Collection<ConnectorBundle>,
    raw_db: Database,
}

impl DesiredStateStore {
    pub fn new(db: Database) -> Self {
        Self {
            gateways: db.collection(GATEWAYS),
            tenants: db.collection(TENANTS),
            connectors: db.collection(CONNECTORS),
            raw_db: db,
        }
    }

    pub async fn find_gateway_by_name(&self, name: &str) -> Result<Option<GatewayRecord>> {
        Ok(self.gateways.find_one(doc! { "_id": name }, None).await?)
    }

    pub async fn find_tenant_cluster_config_by_tenant(
        &self,
        tenant: &str,
    ) -> Result<Option<TenantConfig>> {
        Ok(self.tenants.find_one(doc! { "_id": tenant }, None).await?)
    }

    pub async fn list_all_tenant_cluster_configs(&self) -> Result<Vec<TenantConfig>> {
        let mut cursor = self.tenants.find(None, None).await?;
        let mut out = Vec::new();
        while let Some(cfg) = cursor.try_next().await? {
            out.push(cfg);
        }
        Ok(out)
    }

    pub async fn find_bundle_by_tenant_and_id(
        &self,
        tenant: &str,
        bundle_id: &str,
    ) -> Result<Option<ConnectorBundle>> {
        let key = ConnectorBundle::key(tenant, bundle_id);
        Ok(self.connectors.find_one(doc! { "_id": key }, None).await?)
    }

    pub async fn list_bundles_by_tenant(&self, tenant: &str) -> Result<Vec<ConnectorBundle>> {
        let mut cursor = self.connectors.find(doc! { "tenant": tenant }, None).await?;
        let mut out = Vec::new();
        while let Some(bundle) = cursor.try_next().await? {
            out.push(bundle);
        }
        Ok(out)
    }

    /// Opens a change stream over the whole database, full documents
    /// requested so inserts/updates carry enough data to translate without
    /// a round-trip fetch. Deletes only carry the document key.
    pub async fn watch(&self) -> Result<DesiredStateChanges> {
        let options = ChangeStreamOptions::builder()
            .full_document(Some(FullDocumentType::UpdateLookup))
            .build();
        let stream = self.raw_db.watch(None, options).await?;
        Ok(DesiredStateChanges { stream })
    }
}

/// Wraps the raw driver change stream and yields only the three watched
/// collections, pre-translated into [`DesiredStateEvent`]; everything else
/// (`drop`, `dropDatabase`, `invalidate`, other collections) is swallowed.
pub struct DesiredStateChanges {
    stream: ChangeStream<ChangeStreamEvent<Document>>,
}

impl DesiredStateChanges {
    /// Returns the next in-scope event, or `None` if the stream ended
    /// (driver-level disconnect; the caller decides whether to reconnect).
    pub async fn next_event(&mut self) -> Result<Option<DesiredStateEvent>> {
        loop {
            let raw = match self.stream.next().await {
                Some(item) => item?,
                None => return Ok(None),
            };
            let coll = raw.ns.as_ref().and_then(|ns| ns.coll.clone());
            let id = raw
                .document_key
                .as_ref()
                .and_then(|key| key.get("_id"))
                .cloned();
            if let Some(event) = translate(raw.operation_type, coll.as_deref(), id) {
                return Ok(Some(event));
            }
        }
    }
}

/// Pure translation step, kept free of the driver's event type so it can be
/// exercised without constructing a real `ChangeStreamEvent`.
fn translate(op: OperationType, coll: Option<&str>, id: Option<Bson>) -> Option<DesiredStateEvent> {
    let op = match op {
        OperationType::Insert => OperationKind::Insert,
        OperationType::Update | OperationType::Replace => OperationKind::Update,
        OperationType::Delete => OperationKind::Delete,
        _ => return None,
    };
    let coll = coll?;
    let id = match id? {
        Bson::String(s) => s,
        other => other.to_string(),
    };
    match coll {
        TENANTS => Some(DesiredStateEvent::Tenant { op, id }),
        GATEWAYS => Some(DesiredStateEvent::Gateway { op, name: id }),
        CONNECTORS => {
            let (tenant, bundle_id) = id.split_once(':')?;
            Some(DesiredStateEvent::Connector {
                op,
                tenant: tenant.to_string(),
                id: bundle_id.to_string(),
            })
        }
        _ => None,
    }
}
