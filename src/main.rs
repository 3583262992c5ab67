mod config;
mod error_queue;
mod errors;
mod manifest;
mod orchestrator;
mod reconciler;
mod state;
mod store;
mod types;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use mongodb::options::ClientOptions;
use mongodb::Client as MongoClient;
use tokio::signal::unix::{signal, SignalKind};
use tokio_retry::strategy::FixedInterval;
use tokio_retry::Retry;

use crate::config::Config;
use crate::error_queue::{drop_error_collection, ErrorQueue};
use crate::errors::Result;
use crate::manifest::{ManifestKind, ManifestParams, ManifestRenderer};
use crate::orchestrator::OrchestratorDriver;
use crate::reconciler::Reconciler;
use crate::state::TenantTable;
use crate::store::{DesiredStateStore, SummaryStore};
use crate::types::ErrorRecord;

/// The one-off cluster-wide service-discovery namespace the manager installs
/// at boot (§1, §4.6 step 1). Distinct from the "ingress service-discovery
/// deployment" which stays an external collaborator per §1's Out of scope
/// list.
const SERVICE_DISCOVERY_NAMESPACE: &str = "consul-system";

/// Retries a fallible bootstrap step at 1-second intervals until it
/// succeeds, per §4.6's "each retried at 1-second intervals until success".
/// Grounded on `conductor/src/main.rs`'s own `Retry::spawn(FixedInterval...)`
/// use, minus its `.take(20)` bound: a bootstrap step has nowhere to give
/// up to, so the interval is left unbounded.
async fn retry_until_ok<F, Fut>(step: &'static str, mut attempt: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let strategy = FixedInterval::from_millis(1000);
    let result = Retry::spawn(strategy, || {
        let fut = attempt();
        async move {
            fut.await.map_err(|e| {
                warn!("bootstrap step \"{step}\" failed, retrying in 1s: {e}");
                e
            })
        }
    })
    .await;
    debug_assert!(result.is_ok(), "unbounded retry strategy never exhausts");
}

async fn install_service_discovery(
    driver: &OrchestratorDriver,
    renderer: &ManifestRenderer,
    config: &Config,
) -> Result<()> {
    driver.create_namespace(SERVICE_DISCOVERY_NAMESPACE).await?;
    let params = ManifestParams {
        cluster: Some(&config.cluster_name),
        wan_ip: Some(&config.wan_ip),
        storage_class: Some(&config.storage_class),
        mongo_uri: Some(&config.mongo_uri),
        ..Default::default()
    };
    let (path, body) = renderer.render(ManifestKind::Consul, &params)?;
    driver.apply_file(&path, &body).await
}

async fn connect_database(uri: &str) -> Result<mongodb::Database> {
    let options = ClientOptions::parse(uri).await?;
    let client = MongoClient::with_options(options)?;
    Ok(client
        .default_database()
        .unwrap_or_else(|| client.database("nextensio")))
}

async fn apply_ingress_gateway(
    driver: &OrchestratorDriver,
    renderer: &ManifestRenderer,
    config: &Config,
) -> Result<()> {
    let params = ManifestParams {
        cluster: Some(&config.cluster_name),
        wan_ip: Some(&config.wan_ip),
        ..Default::default()
    };
    let (path, body) = renderer.render(ManifestKind::IngressGateway, &params)?;
    driver.apply_file(&path, &body).await
}

/// Rehydrates the in-memory tenant table from every persisted [`TenantSummary`]
/// (§4.6 step 3). `deploy_version` is left at -1 (unknown) and every
/// connector's recorded version at -1: the in-memory version bookkeeping is
/// a short-circuit optimization, not durable state, so after a crash the
/// following reconcile pass simply re-issues idempotent applies, per §7's
/// write-ahead recovery rule.
async fn rehydrate_tenant_table(
    summary: &SummaryStore,
    renderer: &ManifestRenderer,
    state: &TenantTable,
) -> Result<()> {
    for tenant_summary in summary.find_all().await? {
        std::fs::create_dir_all(renderer.tenant_dir(&tenant_summary.tenant)).map_err(|e| {
            crate::errors::ClusterMgrError::Filesystem {
                path: renderer.tenant_dir(&tenant_summary.tenant).display().to_string(),
                source: e,
            }
        })?;
        let lock = state.entry(&tenant_summary.tenant);
        let mut tenant_state = lock.lock().await;
        tenant_state.created = true;
        for connector in &tenant_summary.connectors {
            tenant_state.connectors.insert(
                connector.id.clone(),
                crate::types::ConnectorMark {
                    version: -1,
                    mark_sweep: true,
                },
            );
        }
        info!(
            "rehydrated tenant {} ({} connector(s))",
            tenant_summary.tenant,
            tenant_summary.connectors.len()
        );
    }
    Ok(())
}

/// §4.6's boot-time mark-and-sweep, run exactly once: every desired tenant
/// re-asserts `markSweep`, then anything left unmarked is torn down. Per
/// Design Notes §9, this full sweep runs only here, never on every
/// change-stream event.
async fn boot_sweep(reconciler: &Reconciler, error_queue: &ErrorQueue) -> Result<()> {
    for tenant in reconciler.state().tenant_ids() {
        let lock = reconciler.state().entry(&tenant);
        lock.lock().await.mark_sweep = false;
    }

    let configs = reconciler.desired().list_all_tenant_cluster_configs().await?;
    for cfg in &configs {
        if let Err(e) = reconciler.add_or_update_tenant(cfg).await {
            warn!("boot sweep: add-or-update failed for {}: {e}", cfg.tenant);
            error_queue
                .push(ErrorRecord::from_event(
                    &crate::types::DesiredStateEvent::Tenant {
                        op: crate::types::OperationKind::Update,
                        id: cfg.tenant.clone(),
                    },
                    e.to_string(),
                ))
                .await;
        }
    }

    let orphans: Vec<String> = reconciler
        .state()
        .tenant_ids()
        .into_iter()
        .filter(|t| !configs.iter().any(|cfg| &cfg.tenant == t))
        .collect();
    for tenant in orphans {
        let still_unmarked = {
            let lock = reconciler.state().entry(&tenant);
            let guard = lock.lock().await;
            !guard.mark_sweep
        };
        if !still_unmarked {
            continue;
        }
        if let Err(e) = reconciler.delete_tenant(&tenant).await {
            warn!("boot sweep: delete failed for orphan tenant {tenant}: {e}");
            error_queue
                .push(ErrorRecord::from_event(
                    &crate::types::DesiredStateEvent::Tenant {
                        op: crate::types::OperationKind::Delete,
                        id: tenant,
                    },
                    e.to_string(),
                ))
                .await;
        }
    }
    Ok(())
}

/// Long-lived change-stream consumer task. Delivers events in commit order
/// with no reordering (§5); a disconnect that survives five reconnection
/// attempts is fatal (§5).
async fn run_change_stream_consumer(reconciler: Arc<Reconciler>, error_queue: Arc<ErrorQueue>) {
    let mut failed_attempts = 0u32;
    loop {
        let mut changes = match reconciler.desired().watch().await {
            Ok(changes) => {
                failed_attempts = 0;
                changes
            }
            Err(e) => {
                failed_attempts += 1;
                error!("change stream unavailable (attempt {failed_attempts}/5): {e}");
                if failed_attempts >= 5 {
                    error!("change stream unavailable after 5 attempts, terminating");
                    std::process::exit(1);
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };
        loop {
            match changes.next_event().await {
                Ok(Some(event)) => {
                    info!("change-stream event: {event:?}");
                    if let Err(e) = reconciler.handle_event(event.clone()).await {
                        warn!("reconcile failed for {event:?}: {e}");
                        error_queue
                            .push(ErrorRecord::from_event(&event, e.to_string()))
                            .await;
                    }
                }
                Ok(None) => {
                    warn!("change stream closed, reconnecting");
                    break;
                }
                Err(e) => {
                    failed_attempts += 1;
                    error!("change stream error (attempt {failed_attempts}/5): {e}");
                    if failed_attempts >= 5 {
                        error!("change stream unavailable after 5 attempts, terminating");
                        std::process::exit(1);
                    }
                    break;
                }
            }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let config = Config::from_env()?;
    info!("clustermgr starting for cluster {}", config.cluster_name);

    let renderer = ManifestRenderer::new(config.template_dir.clone());
    let driver = if config.test_mode {
        info!("CLUSTERMGR_TEST_MODE enabled: orchestrator driver short-circuited");
        OrchestratorDriver::new_test_mode().0
    } else {
        OrchestratorDriver::new("kubectl")
    };

    // (1) install service-discovery namespace and manifest
    retry_until_ok("install service discovery", || {
        install_service_discovery(&driver, &renderer, &config)
    })
    .await;

    // (2) connect to the database
    let db = Retry::spawn(FixedInterval::from_millis(1000), || async {
        connect_database(&config.mongo_uri).await.map_err(|e| {
            warn!("bootstrap step \"connect to database\" failed, retrying in 1s: {e}");
            e
        })
    })
    .await
    .expect("unbounded retry strategy never exhausts");
    drop_error_collection(&db).await?;

    let desired = DesiredStateStore::new(db.clone());
    let summary = SummaryStore::new(&db);
    let state = TenantTable::new();

    // (3) rehydrate in-memory tenant table from all Tenant Summaries
    retry_until_ok("rehydrate tenant table", || {
        rehydrate_tenant_table(&summary, &renderer, &state)
    })
    .await;

    let reconciler = Arc::new(Reconciler::new(
        desired,
        summary,
        renderer,
        driver,
        state,
        config.clone(),
    ));

    // (4) apply ingress-gateway (once per process)
    retry_until_ok("apply ingress gateway", || {
        apply_ingress_gateway(reconciler.driver(), reconciler.renderer(), &config)
    })
    .await;

    // (5) run create-egress-gateways
    retry_until_ok("create egress gateways", || reconciler.create_egress_gateways()).await;

    let error_queue = Arc::new(ErrorQueue::new(&db));

    // boot-time mark-and-sweep (§4.6, Design Notes §9: runs only here)
    if let Err(e) = boot_sweep(&reconciler, &error_queue).await {
        error!("boot sweep failed to list desired tenant configs: {e}");
    }

    // change-stream consumer and error-queue worker run as background tasks
    let mut consumer_handle = tokio::spawn(run_change_stream_consumer(
        reconciler.clone(),
        error_queue.clone(),
    ));
    let worker_reconciler = reconciler.clone();
    let worker_queue = error_queue.clone();
    let mut worker_handle =
        tokio::spawn(async move { worker_queue.run_worker(&worker_reconciler).await });

    info!("clustermgr bootstrap complete, serving");

    // main task blocks on signal delivery; delivery dumps the Error Queue (§5, §6)
    let mut dump_signal =
        signal(SignalKind::user_defined1()).expect("failed to install SIGUSR1 handler");
    loop {
        tokio::select! {
            _ = dump_signal.recv() => {
                info!("received SIGUSR1, dumping error queue");
                error_queue.dump_to_log().await;
            }
            res = &mut consumer_handle => {
                if let Err(e) = res {
                    error!("change-stream consumer task exited unexpectedly: {e}");
                }
                std::process::exit(1);
            }
            res = &mut worker_handle => {
                if let Err(e) = res {
                    error!("error-queue worker task exited unexpectedly: {e}");
                }
                std::process::exit(1);
            }
        }
    }
}

fn main() {
    env_logger::init();
    info!("starting clustermgr");
    if let Err(e) = run() {
        error!("fatal startup error: {e}");
        std::process::exit(1);
    }
}
