use tokio::sync::Mutex;

use crate::config::Config;
use crate::errors::{ClusterMgrError, Result};
use crate::manifest::{ManifestKind, ManifestParams, ManifestRenderer};
use crate::orchestrator::OrchestratorDriver;
use crate::state::TenantTable;
use crate::store::{DesiredStateStore, SummaryStore};
use crate::types::{
    ConnectorMark, ConnectorSummary, DesiredStateEvent, OperationKind, TenantConfig, TenantState,
    TenantSummary,
};

fn apod_pod_name(set_idx: u32) -> String {
    format!("apod{set_idx}")
}

fn apod_host_name(pod: &str, replica: u32) -> String {
    format!("{pod}-{replica}")
}

/// cpod/file naming truncates the bundle id at `@`; the part after it
/// (a mail-style domain suffix on the connector's advertised identity) is
/// not part of the on-disk name. `connect_id`, carried on the bundle
/// itself, is the separately-sanitized identifier used for virtual-service
/// wiring.
fn cpod_pod_name(bundle_id: &str) -> &str {
    bundle_id.split('@').next().unwrap_or(bundle_id)
}

/// The reconciliation engine: translates one desired-state change, or a
/// bootstrap sweep, into a minimal sequence of manifest apply/delete calls,
/// updating the Summary Store ahead of or behind the mutation per the
/// crash-safety rule in each entry point's own ordering.
pub struct Reconciler {
    desired: DesiredStateStore,
    summary: SummaryStore,
    renderer: ManifestRenderer,
    driver: OrchestratorDriver,
    state: TenantTable,
    config: Config,
    /// last successfully-applied gateway peering version; cluster-wide, not
    /// per tenant, so it is guarded independently of the tenant table.
    egw_version: Mutex<i64>,
}

impl Reconciler {
    pub fn new(
        desired: DesiredStateStore,
        summary: SummaryStore,
        renderer: ManifestRenderer,
        driver: OrchestratorDriver,
        state: TenantTable,
        config: Config,
    ) -> Self {
        Self {
            desired,
            summary,
            renderer,
            driver,
            state,
            config,
            egw_version: Mutex::new(-1),
        }
    }

    pub fn state(&self) -> &TenantTable {
        &self.state
    }

    pub fn desired(&self) -> &DesiredStateStore {
        &self.desired
    }

    pub fn summary(&self) -> &SummaryStore {
        &self.summary
    }

    pub fn renderer(&self) -> &ManifestRenderer {
        &self.renderer
    }

    pub fn driver(&self) -> &OrchestratorDriver {
        &self.driver
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    async fn apply(&self, kind: ManifestKind, params: &ManifestParams<'_>) -> Result<()> {
        let (path, body) = self.renderer.render(kind, params)?;
        self.driver.apply_file(&path, &body).await
    }

    async fn delete(&self, kind: ManifestKind, params: &ManifestParams<'_>) -> Result<()> {
        let path = self.renderer.path_for(kind, params);
        let (_, res) = self.driver.delete(&path).await;
        res
    }

    async fn copy_docker_credential(&self, tenant: &str) -> Result<()> {
        let raw = self.driver.fetch_docker_credential_secret().await?;
        let body = raw.replace("namespace: default", &format!("namespace: {tenant}"));
        let path = self.renderer.path_for(
            ManifestKind::DockerCredentialCopy,
            &ManifestParams {
                tenant: Some(tenant),
                ..Default::default()
            },
        );
        self.driver.apply_file(&path, &body).await
    }

    async fn ensure_namespace(&self, cfg: &TenantConfig) -> Result<()> {
        self.driver.create_namespace(&cfg.tenant).await?;
        self.driver
            .label_namespace_for_mesh_injection(&cfg.tenant)
            .await?;
        self.copy_docker_credential(&cfg.tenant).await?;
        self.apply(
            ManifestKind::TenantFlowControl,
            &ManifestParams {
                tenant: Some(&cfg.tenant),
                cluster: Some(&self.config.cluster_name),
                ..Default::default()
            },
        )
        .await?;
        self.apply(
            ManifestKind::RouteReflector,
            &ManifestParams {
                tenant: Some(&cfg.tenant),
                ..Default::default()
            },
        )
        .await
    }

    /// **add-or-update tenant(cfg)**: ensure namespace exists, reshape if
    /// the tenant's deployed version is stale, reconcile connectors, then
    /// reconcile egress gateways.
    pub async fn add_or_update_tenant(&self, cfg: &TenantConfig) -> Result<()> {
        let lock = self.state.entry(&cfg.tenant);
        let mut state = lock.lock().await;
        self.ensure_namespace(cfg).await?;
        state.created = true;
        state.mark_sweep = true;
        if state.deploy_version != cfg.version {
            self.reshape_apods_locked(cfg, &mut state).await?;
        }
        self.reconcile_connectors_locked(cfg, &mut state).await?;
        drop(state);
        self.create_egress_gateways().await
    }

    /// **delete tenant(name)**: refuses while connectors remain, per the
    /// non-empty-before-delete invariant.
    pub async fn delete_tenant(&self, tenant: &str) -> Result<()> {
        let lock = self.state.entry(tenant);
        let state = lock.lock().await;
        let summary = self
            .summary
            .find_one(tenant)
            .await?
            .unwrap_or_else(|| TenantSummary::empty(tenant));
        if !summary.connectors.is_empty() || !state.connectors.is_empty() {
            return Err(ClusterMgrError::SummaryConsistency {
                tenant: tenant.to_string(),
                reason: "tenant still has connectors recorded".to_string(),
            });
        }
        for set_idx in 1..=summary.apodsets {
            let pod = apod_pod_name(set_idx);
            for replica in 0..summary.apodrepl {
                let host = apod_host_name(&pod, replica);
                self.delete(
                    ManifestKind::ApodInService,
                    &ManifestParams {
                        tenant: Some(tenant),
                        host: Some(&host),
                        ..Default::default()
                    },
                )
                .await?;
            }
            self.delete(
                ManifestKind::ApodHeadless,
                &ManifestParams {
                    tenant: Some(tenant),
                    pod: Some(&pod),
                    ..Default::default()
                },
            )
            .await?;
            self.delete(
                ManifestKind::ApodDeployment,
                &ManifestParams {
                    tenant: Some(tenant),
                    pod: Some(&pod),
                    ..Default::default()
                },
            )
            .await?;
        }
        self.delete(
            ManifestKind::TenantFlowControl,
            &ManifestParams {
                tenant: Some(tenant),
                ..Default::default()
            },
        )
        .await?;
        self.delete(
            ManifestKind::DockerCredentialCopy,
            &ManifestParams {
                tenant: Some(tenant),
                ..Default::default()
            },
        )
        .await?;
        self.delete(
            ManifestKind::RouteReflector,
            &ManifestParams {
                tenant: Some(tenant),
                ..Default::default()
            },
        )
        .await?;
        self.driver.delete_namespace(tenant).await?;
        self.summary.delete(tenant).await?;
        let _ = std::fs::remove_dir_all(self.renderer.tenant_dir(tenant));
        drop(state);
        self.state.remove(tenant);
        Ok(())
    }

    pub async fn reshape_apods(&self, cfg: &TenantConfig) -> Result<()> {
        let lock = self.state.entry(&cfg.tenant);
        let mut state = lock.lock().await;
        self.reshape_apods_locked(cfg, &mut state).await
    }

    async fn reshape_apods_locked(&self, cfg: &TenantConfig, state: &mut TenantState) -> Result<()> {
        let tenant = cfg.tenant.as_str();
        let mut summary = self
            .summary
            .find_one(tenant)
            .await?
            .unwrap_or_else(|| TenantSummary::empty(tenant));

        // 1. shrink replicas within existing sets
        for set_idx in 1..=cfg.apod_sets.min(summary.apodsets) {
            let pod = apod_pod_name(set_idx);
            for replica in cfg.apod_repl..summary.apodrepl {
                let host = apod_host_name(&pod, replica);
                self.delete(
                    ManifestKind::ApodInService,
                    &ManifestParams {
                        tenant: Some(tenant),
                        host: Some(&host),
                        ..Default::default()
                    },
                )
                .await?;
                self.delete(
                    ManifestKind::ApodForVirtualService,
                    &ManifestParams {
                        tenant: Some(tenant),
                        host: Some(&host),
                        ..Default::default()
                    },
                )
                .await?;
            }
        }

        // 2. shrink sets
        for set_idx in (cfg.apod_sets + 1)..=summary.apodsets {
            let pod = apod_pod_name(set_idx);
            for replica in 0..summary.apodrepl {
                let host = apod_host_name(&pod, replica);
                self.delete(
                    ManifestKind::ApodInService,
                    &ManifestParams {
                        tenant: Some(tenant),
                        host: Some(&host),
                        ..Default::default()
                    },
                )
                .await?;
                self.delete(
                    ManifestKind::ApodForVirtualService,
                    &ManifestParams {
                        tenant: Some(tenant),
                        host: Some(&host),
                        ..Default::default()
                    },
                )
                .await?;
            }
            let pod_params = ManifestParams {
                tenant: Some(tenant),
                pod: Some(&pod),
                ..Default::default()
            };
            self.delete(ManifestKind::ApodOutService, &pod_params).await?;
            self.delete(ManifestKind::ApodConnectVirtualService, &pod_params)
                .await?;
            self.delete(ManifestKind::ApodHeadless, &pod_params).await?;
            self.delete(ManifestKind::ApodDeployment, &pod_params).await?;
        }

        // 3. write-ahead update summary
        summary.image = cfg.image.clone();
        summary.apodrepl = cfg.apod_repl;
        summary.apodsets = cfg.apod_sets;
        self.summary.upsert(&summary).await?;

        // 4. apply desired shape
        for set_idx in 1..=cfg.apod_sets {
            let pod = apod_pod_name(set_idx);
            self.apply(
                ManifestKind::ApodDeployment,
                &ManifestParams {
                    tenant: Some(tenant),
                    pod: Some(&pod),
                    image: Some(&cfg.image),
                    cluster: Some(&self.config.cluster_name),
                    ..Default::default()
                },
            )
            .await?;
            self.apply(
                ManifestKind::ApodOutService,
                &ManifestParams {
                    tenant: Some(tenant),
                    pod: Some(&pod),
                    ..Default::default()
                },
            )
            .await?;
            for replica in 0..cfg.apod_repl {
                let host = apod_host_name(&pod, replica);
                self.apply(
                    ManifestKind::ApodInService,
                    &ManifestParams {
                        tenant: Some(tenant),
                        host: Some(&host),
                        ..Default::default()
                    },
                )
                .await?;
                self.apply(
                    ManifestKind::ApodForVirtualService,
                    &ManifestParams {
                        tenant: Some(tenant),
                        host: Some(&host),
                        ..Default::default()
                    },
                )
                .await?;
            }
            self.apply(
                ManifestKind::ApodConnectVirtualService,
                &ManifestParams {
                    tenant: Some(tenant),
                    pod: Some(&pod),
                    ..Default::default()
                },
            )
            .await?;
            self.apply(
                ManifestKind::ApodHeadless,
                &ManifestParams {
                    tenant: Some(tenant),
                    pod: Some(&pod),
                    ..Default::default()
                },
            )
            .await?;
        }

        state.deploy_version = cfg.version;
        Ok(())
    }

    pub async fn reconcile_connectors(&self, cfg: &TenantConfig) -> Result<()> {
        let lock = self.state.entry(&cfg.tenant);
        let mut state = lock.lock().await;
        self.reconcile_connectors_locked(cfg, &mut state).await
    }

    async fn reconcile_connectors_locked(
        &self,
        cfg: &TenantConfig,
        state: &mut TenantState,
    ) -> Result<()> {
        let tenant = cfg.tenant.as_str();

        // 1. pre-sweep mark
        for mark in state.connectors.values_mut() {
            mark.mark_sweep = false;
        }

        let mut summary = self
            .summary
            .find_one(tenant)
            .await?
            .unwrap_or_else(|| TenantSummary::empty(tenant));
        let bundles = self.desired.list_bundles_by_tenant(tenant).await?;

        // 2. apply desired
        for bundle in &bundles {
            let mark = state
                .connectors
                .entry(bundle.bundle_id.clone())
                .or_insert(ConnectorMark {
                    version: -1,
                    mark_sweep: true,
                });
            mark.mark_sweep = true;
            if mark.version == bundle.version {
                continue;
            }

            let pod = cpod_pod_name(&bundle.bundle_id).to_string();
            let existing_repl = summary
                .connectors
                .iter()
                .find(|c| c.id == bundle.bundle_id)
                .map(|c| c.cpodrepl)
                .unwrap_or(0);

            for replica in bundle.cpod_repl..existing_repl {
                let host = apod_host_name(&pod, replica);
                self.delete(
                    ManifestKind::CpodForVirtualServiceReplica,
                    &ManifestParams {
                        tenant: Some(tenant),
                        host: Some(&host),
                        ..Default::default()
                    },
                )
                .await?;
                self.delete(
                    ManifestKind::CpodInServiceReplica,
                    &ManifestParams {
                        tenant: Some(tenant),
                        host: Some(&host),
                        ..Default::default()
                    },
                )
                .await?;
            }

            if let Some(existing) = summary.connectors.iter_mut().find(|c| c.id == bundle.bundle_id) {
                existing.image = cfg.image.clone();
                existing.connectid = bundle.connect_id.clone();
                existing.cpodrepl = bundle.cpod_repl;
            } else {
                summary.connectors.push(ConnectorSummary {
                    id: bundle.bundle_id.clone(),
                    image: cfg.image.clone(),
                    connectid: bundle.connect_id.clone(),
                    cpodrepl: bundle.cpod_repl,
                });
            }
            self.summary.upsert(&summary).await?;

            let pod_params = ManifestParams {
                tenant: Some(tenant),
                pod: Some(&pod),
                host: Some(&pod),
                image: Some(&cfg.image),
                agent: Some(&bundle.connect_id),
                ..Default::default()
            };
            self.apply(ManifestKind::CpodDeployment, &pod_params).await?;
            self.apply(ManifestKind::CpodOutService, &pod_params).await?;
            self.apply(ManifestKind::CpodInService, &pod_params).await?;
            for replica in 0..bundle.cpod_repl {
                let host = apod_host_name(&pod, replica);
                let host_params = ManifestParams {
                    tenant: Some(tenant),
                    host: Some(&host),
                    ..Default::default()
                };
                self.apply(ManifestKind::CpodInServiceReplica, &host_params).await?;
                self.apply(ManifestKind::CpodForVirtualServiceReplica, &host_params)
                    .await?;
            }
            self.apply(ManifestKind::CpodForVirtualService, &pod_params).await?;
            self.apply(ManifestKind::CpodConnectVirtualService, &pod_params)
                .await?;
            self.apply(ManifestKind::CpodHealth, &pod_params).await?;
            self.apply(ManifestKind::CpodHeadless, &pod_params).await?;

            mark.version = bundle.version;
        }

        // 3. sweep
        let to_sweep: Vec<String> = state
            .connectors
            .iter()
            .filter(|(_, mark)| !mark.mark_sweep)
            .map(|(id, _)| id.clone())
            .collect();
        for bundle_id in to_sweep {
            self.sweep_one_connector(tenant, &bundle_id, &mut summary).await?;
            state.connectors.remove(&bundle_id);
        }
        Ok(())
    }

    async fn sweep_one_connector(
        &self,
        tenant: &str,
        bundle_id: &str,
        summary: &mut TenantSummary,
    ) -> Result<()> {
        let idx = summary.connectors.iter().position(|c| c.id == bundle_id);
        let cpod_repl = idx.map(|i| summary.connectors[i].cpodrepl).unwrap_or(0);
        self.delete_connector_manifests(tenant, bundle_id, cpod_repl).await?;
        if let Some(idx) = idx {
            let removed = summary.connectors.swap_remove(idx);
            if let Err(e) = self.summary.upsert(summary).await {
                summary.connectors.push(removed);
                return Err(e);
            }
        }
        Ok(())
    }

    async fn delete_connector_manifests(
        &self,
        tenant: &str,
        bundle_id: &str,
        cpod_repl: u32,
    ) -> Result<()> {
        let pod = cpod_pod_name(bundle_id).to_string();
        for replica in 0..cpod_repl {
            let host = apod_host_name(&pod, replica);
            let host_params = ManifestParams {
                tenant: Some(tenant),
                host: Some(&host),
                ..Default::default()
            };
            self.delete(ManifestKind::CpodForVirtualServiceReplica, &host_params)
                .await?;
            self.delete(ManifestKind::CpodInServiceReplica, &host_params).await?;
        }
        let pod_params = ManifestParams {
            tenant: Some(tenant),
            pod: Some(&pod),
            host: Some(&pod),
            ..Default::default()
        };
        self.delete(ManifestKind::CpodInService, &pod_params).await?;
        self.delete(ManifestKind::CpodForVirtualService, &pod_params).await?;
        self.delete(ManifestKind::CpodOutService, &pod_params).await?;
        self.delete(ManifestKind::CpodConnectVirtualService, &pod_params)
            .await?;
        self.delete(ManifestKind::CpodHealth, &pod_params).await?;
        self.delete(ManifestKind::CpodHeadless, &pod_params).await?;
        self.delete(ManifestKind::CpodDeployment, &pod_params).await?;
        Ok(())
    }

    /// **connectors.delete(id)** entry point: tear down one connector's
    /// manifests, then remove it from the summary and from in-memory state,
    /// independent of a wider reconcile-connectors pass.
    pub async fn delete_one_connector(&self, tenant: &str, bundle_id: &str) -> Result<()> {
        let lock = self.state.entry(tenant);
        let mut state = lock.lock().await;
        let mut summary = self
            .summary
            .find_one(tenant)
            .await?
            .unwrap_or_else(|| TenantSummary::empty(tenant));
        self.sweep_one_connector(tenant, bundle_id, &mut summary).await?;
        state.connectors.remove(bundle_id);
        Ok(())
    }

    fn self_gateway_name(&self) -> String {
        format!("gateway.{}.nextensio.net", self.config.cluster_name)
    }

    /// **create-egress-gateways()**: no-ops unless this cluster's gateway
    /// record has advanced past the last applied version. Skips the
    /// gateway's own cluster entry, mirroring
    /// `examples/original_source/mel/mel.go`'s `createEgressGws`.
    pub async fn create_egress_gateways(&self) -> Result<()> {
        let gw = match self.desired.find_gateway_by_name(&self.self_gateway_name()).await? {
            Some(gw) => gw,
            None => return Ok(()),
        };
        let mut last_applied = self.egw_version.lock().await;
        if gw.version == *last_applied {
            return Ok(());
        }
        let own_name = self.self_gateway_name();
        for remote in &gw.remotes {
            let remote_gw_name = format!("gateway.{remote}.nextensio.net");
            if remote_gw_name == own_name {
                continue;
            }
            let params = ManifestParams {
                gateway: Some(&remote_gw_name),
                ..Default::default()
            };
            self.apply(ManifestKind::EgressGateway, &params).await?;
            self.apply(ManifestKind::ExternalService, &params).await?;
            self.apply(ManifestKind::EgressDestination, &params).await?;
        }
        *last_applied = gw.version;
        Ok(())
    }

    /// Dispatches one translated change-stream event, per the Event
    /// handling table: `tenants.insert` fully provisions (add-or-update
    /// already chains reconcile-connectors and create-egress-gateways),
    /// `tenants.update` only reshapes, `connectors.*` affects only the
    /// owning tenant's connectors, `gateways.*` re-checks peering.
    pub async fn handle_event(&self, event: DesiredStateEvent) -> Result<()> {
        match event {
            DesiredStateEvent::Tenant {
                op: OperationKind::Insert,
                id,
            } => match self.desired.find_tenant_cluster_config_by_tenant(&id).await? {
                Some(cfg) => self.add_or_update_tenant(&cfg).await,
                None => Ok(()),
            },
            DesiredStateEvent::Tenant {
                op: OperationKind::Update,
                id,
            } => match self.desired.find_tenant_cluster_config_by_tenant(&id).await? {
                Some(cfg) => self.reshape_apods(&cfg).await,
                None => Ok(()),
            },
            DesiredStateEvent::Tenant {
                op: OperationKind::Delete,
                id,
            } => self.delete_tenant(&id).await,
            DesiredStateEvent::Connector {
                op: OperationKind::Insert | OperationKind::Update,
                tenant,
                ..
            } => match self.desired.find_tenant_cluster_config_by_tenant(&tenant).await? {
                Some(cfg) => self.reconcile_connectors(&cfg).await,
                None => Ok(()),
            },
            DesiredStateEvent::Connector {
                op: OperationKind::Delete,
                tenant,
                id,
            } => self.delete_one_connector(&tenant, &id).await,
            DesiredStateEvent::Gateway { .. } => self.create_egress_gateways().await,
        }
    }
}
