use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Gateway record, keyed by fully-qualified gateway name (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRecord {
    #[serde(rename = "_id")]
    pub name: String,
    pub cluster: String,
    pub version: i64,
    /// remote cluster short-names this gateway must peer with
    pub remotes: Vec<String>,
}

/// Desired tenant footprint in this cluster, keyed by tenant id (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    #[serde(rename = "_id")]
    pub tenant: String,
    pub cluster: String,
    pub image: String,
    pub apod_repl: u32,
    pub apod_sets: u32,
    pub version: i64,
}

/// Desired connector deployment, keyed by `tenant:bundle-id` (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorBundle {
    #[serde(rename = "_id")]
    pub id: String,
    pub tenant: String,
    pub bundle_id: String,
    /// sanitized identifier derived from the bundle id
    pub connect_id: String,
    pub services: Vec<String>,
    pub cpod_repl: u32,
    pub version: i64,
}

impl ConnectorBundle {
    pub fn key(tenant: &str, bundle_id: &str) -> String {
        format!("{tenant}:{bundle_id}")
    }
}

/// Last successfully-applied state of one connector, nested in a
/// [`TenantSummary`] (§3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectorSummary {
    #[serde(rename = "_id")]
    pub id: String,
    pub image: String,
    pub connectid: String,
    pub cpodrepl: u32,
}

/// The durable recovery log for one tenant (§3, §6 document shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantSummary {
    #[serde(rename = "_id")]
    pub tenant: String,
    pub image: String,
    pub apodrepl: u32,
    pub apodsets: u32,
    pub connectors: Vec<ConnectorSummary>,
}

impl TenantSummary {
    pub fn empty(tenant: &str) -> Self {
        Self {
            tenant: tenant.to_string(),
            image: String::new(),
            apodrepl: 0,
            apodsets: 0,
            connectors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Insert,
    Delete,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectionKind {
    Tenants,
    Connectors,
    Gateways,
}

/// One entry in the Error Queue's persisted record (§3, §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub key: String,
    pub op: OperationKind,
    pub collection: CollectionKind,
    pub tenant: Option<String>,
    pub connect_id: Option<String>,
    pub error: String,
    pub changed_at: DateTime<Utc>,
}

impl ErrorRecord {
    /// The key function from §4.4: a single "gateway-" bucket, or a
    /// per-tenant "tenant-<tenant>" bucket.
    pub fn bucket_key(collection: CollectionKind, tenant: Option<&str>) -> String {
        match collection {
            CollectionKind::Gateways => "gateway-".to_string(),
            _ => format!("tenant-{}", tenant.unwrap_or_default()),
        }
    }

    /// Reconstructs the event this record was raised from, so the Error
    /// Queue worker can replay it through the same dispatch path as the
    /// live change-stream consumer.
    /// Builds an error record from one in-flight event and the failure it
    /// produced, for the caller (change-stream consumer or bootstrap sweep)
    /// to push into the Error Queue per §7's propagation policy.
    pub fn from_event(event: &DesiredStateEvent, error: String) -> Self {
        let (op, collection, tenant, connect_id) = match event {
            DesiredStateEvent::Tenant { op, id } => {
                (*op, CollectionKind::Tenants, Some(id.clone()), None)
            }
            DesiredStateEvent::Connector { op, tenant, id } => (
                *op,
                CollectionKind::Connectors,
                Some(tenant.clone()),
                Some(id.clone()),
            ),
            DesiredStateEvent::Gateway { op, .. } => (*op, CollectionKind::Gateways, None, None),
        };
        let key = Self::bucket_key(collection, tenant.as_deref());
        Self {
            key,
            op,
            collection,
            tenant,
            connect_id,
            error,
            changed_at: Utc::now(),
        }
    }

    pub fn to_event(&self) -> Option<DesiredStateEvent> {
        match self.collection {
            CollectionKind::Gateways => Some(DesiredStateEvent::Gateway {
                op: self.op,
                name: String::new(),
            }),
            CollectionKind::Tenants => Some(DesiredStateEvent::Tenant {
                op: self.op,
                id: self.tenant.clone()?,
            }),
            CollectionKind::Connectors => Some(DesiredStateEvent::Connector {
                op: self.op,
                tenant: self.tenant.clone()?,
                id: self.connect_id.clone()?,
            }),
        }
    }
}

/// Tagged variant over raw change-stream documents (Design Notes §9): the
/// Reconciler and the error-queue worker operate purely over this, never
/// over a raw BSON document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DesiredStateEvent {
    Tenant { op: OperationKind, id: String },
    Connector { op: OperationKind, tenant: String, id: String },
    Gateway { op: OperationKind, name: String },
}

/// One connector's in-memory mark-sweep bookkeeping (§3).
#[derive(Debug, Clone, Copy)]
pub struct ConnectorMark {
    pub version: i64,
    pub mark_sweep: bool,
}

/// In-memory per-tenant state (§3). Owned exclusively by the Reconciler;
/// access is serialized per-tenant by the caller (see [`crate::state`]).
#[derive(Debug, Clone)]
pub struct TenantState {
    pub created: bool,
    pub mark_sweep: bool,
    pub deploy_version: i64,
    pub connectors: HashMap<String, ConnectorMark>,
}

impl TenantState {
    pub fn new() -> Self {
        Self {
            created: false,
            mark_sweep: true,
            deploy_version: -1,
            connectors: HashMap::new(),
        }
    }
}

impl Default for TenantState {
    fn default() -> Self {
        Self::new()
    }
}
