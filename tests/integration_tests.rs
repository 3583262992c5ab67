// Include the #[ignore] macro on slow tests.
// That way, 'cargo test' does not run them by default.
// To run just these tests, use 'cargo test -- --ignored'
// To run all tests, use 'cargo test -- --include-ignored'
//
// https://doc.rust-lang.org/book/ch11-02-running-tests.html
//
// These tests assume a clustermgr process is already running against a real
// kubernetes context and a real MongoDB instance, with CLUSTERMGR_CLUSTER_NAME
// set to "gatewaytesta" as in the spec's concrete scenarios (§8). They drive
// desired state by writing directly to the NxtTenants/NxtConnectors
// collections and observe the resulting manifest files under /tmp, the same
// way a conformance test would observe a running orchestrator from outside.

#[cfg(test)]
mod test {
    use mongodb::bson::doc;
    use mongodb::options::ClientOptions;
    use mongodb::Client;
    use rand::Rng;
    use std::time;

    const CLUSTER: &str = "gatewaytesta";
    const IMAGE: &str = "minion:latest";

    async fn connect() -> mongodb::Database {
        let uri = std::env::var("CLUSTERMGR_MONGO_URI")
            .unwrap_or_else(|_| "mongodb://localhost:27017".to_string());
        let options = ClientOptions::parse(&uri).await.expect("parse mongo uri");
        let client = Client::with_options(options).expect("build mongo client");
        client.database("nextensio")
    }

    fn apod_file_count(tenant: &str) -> usize {
        let dir = format!("/tmp/{tenant}");
        std::fs::read_dir(&dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| {
                        let name = e.file_name().into_string().unwrap_or_default();
                        name.starts_with("deploy-apod")
                            || name.starts_with("headless-apod")
                            || name.starts_with("service-outside-apod")
                            || name.starts_with("service-inside-apod")
                            || name.starts_with("nxtfor-apod")
                            || name.starts_with("nxtconnect-apod")
                    })
                    .count()
            })
            .unwrap_or(0)
    }

    fn files_with_prefix(tenant: &str, prefix: &str) -> usize {
        let dir = format!("/tmp/{tenant}");
        std::fs::read_dir(&dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| {
                        e.file_name()
                            .into_string()
                            .unwrap_or_default()
                            .contains(prefix)
                    })
                    .count()
            })
            .unwrap_or(0)
    }

    async fn wait_until(mut check: impl FnMut() -> bool, retries: u32, delay_secs: u64) -> bool {
        for _ in 0..retries {
            if check() {
                return true;
            }
            tokio::time::sleep(time::Duration::from_secs(delay_secs)).await;
        }
        check()
    }

    async fn summary_exists(summaries: &mongodb::Collection<mongodb::bson::Document>, tenant: &str) -> bool {
        summaries
            .find_one(doc! { "_id": tenant }, None)
            .await
            .expect("query summary")
            .is_some()
    }

    async fn wait_until_summary_gone(
        summaries: &mongodb::Collection<mongodb::bson::Document>,
        tenant: &str,
        retries: u32,
        delay_secs: u64,
    ) -> bool {
        for _ in 0..retries {
            if !summary_exists(summaries, tenant).await {
                return true;
            }
            tokio::time::sleep(time::Duration::from_secs(delay_secs)).await;
        }
        !summary_exists(summaries, tenant).await
    }

    /// Scenario 1/2 (§8): insert a tenant with ApodRepl=1/ApodSets=1, then
    /// scale to 2/2 and back, asserting the exact apod file counts at each
    /// step (6 files at 1x1, 16 files at 2x2).
    #[tokio::test]
    #[ignore]
    async fn scenario_apod_reshape_round_trips() {
        let db = connect().await;
        let tenants = db.collection::<mongodb::bson::Document>("NxtTenants");
        let summaries = db.collection::<mongodb::bson::Document>("NxtTenantSummary");

        let mut rng = rand::thread_rng();
        let tenant = format!("nextensio-{}", rng.gen_range(0..1_000_000));

        tenants
            .insert_one(
                doc! {
                    "_id": &tenant,
                    "cluster": CLUSTER,
                    "image": IMAGE,
                    "apod_repl": 1,
                    "apod_sets": 1,
                    "version": 1,
                },
                None,
            )
            .await
            .expect("insert tenant config");

        let settled = wait_until(|| apod_file_count(&tenant) == 6, 30, 1).await;
        assert!(settled, "expected 6 apod files after initial 1x1 shape");

        let summary = summaries
            .find_one(doc! { "_id": &tenant }, None)
            .await
            .expect("find summary")
            .expect("summary exists after reconcile");
        assert_eq!(summary.get_str("image").unwrap(), IMAGE);
        assert_eq!(summary.get_i32("apodrepl").unwrap(), 1);
        assert_eq!(summary.get_i32("apodsets").unwrap(), 1);

        tenants
            .update_one(
                doc! { "_id": &tenant },
                doc! { "$set": { "apod_repl": 2, "apod_sets": 2, "version": 2 } },
                None,
            )
            .await
            .expect("scale up tenant config");

        let scaled_up = wait_until(|| apod_file_count(&tenant) == 16, 30, 1).await;
        assert!(scaled_up, "expected 16 apod files after 2x2 shape");

        tenants
            .update_one(
                doc! { "_id": &tenant },
                doc! { "$set": { "apod_repl": 1, "apod_sets": 1, "version": 3 } },
                None,
            )
            .await
            .expect("scale down tenant config");

        let scaled_down = wait_until(|| apod_file_count(&tenant) == 6, 30, 1).await;
        assert!(scaled_down, "expected back to 6 apod files after scale-down");

        tenants
            .delete_one(doc! { "_id": &tenant }, None)
            .await
            .expect("clean up tenant config");
    }

    /// Scenario 3/4/5/6 (§8): connector insert/update/delete produces the
    /// expected per-connector file counts and summary entries, and deleting
    /// both connectors then the tenant leaves nothing behind.
    #[tokio::test]
    #[ignore]
    async fn scenario_connector_lifecycle_round_trips() {
        let db = connect().await;
        let tenants = db.collection::<mongodb::bson::Document>("NxtTenants");
        let connectors = db.collection::<mongodb::bson::Document>("NxtConnectors");
        let summaries = db.collection::<mongodb::bson::Document>("NxtTenantSummary");

        let mut rng = rand::thread_rng();
        let tenant = format!("nextensio-{}", rng.gen_range(0..1_000_000));

        tenants
            .insert_one(
                doc! {
                    "_id": &tenant,
                    "cluster": CLUSTER,
                    "image": IMAGE,
                    "apod_repl": 0,
                    "apod_sets": 0,
                    "version": 1,
                },
                None,
            )
            .await
            .expect("insert tenant config");
        assert!(wait_until(|| apod_file_count(&tenant) == 0, 15, 1).await);

        let foobar_key = format!("{tenant}:foobar@nextensio.com");
        connectors
            .insert_one(
                doc! {
                    "_id": &foobar_key,
                    "tenant": &tenant,
                    "bundle_id": "foobar@nextensio.com",
                    "connect_id": format!("{tenant}-foobar-nextensio-com"),
                    "services": ["svc1"],
                    "cpod_repl": 1,
                    "version": 1,
                },
                None,
            )
            .await
            .expect("insert connector");

        let settled = wait_until(|| files_with_prefix(&tenant, "foobar") == 9, 30, 1).await;
        assert!(settled, "expected 9 files with prefix foobar at CpodRepl=1");

        connectors
            .update_one(
                doc! { "_id": &foobar_key },
                doc! { "$set": { "cpod_repl": 2, "version": 2 } },
                None,
            )
            .await
            .expect("scale up connector");
        assert!(wait_until(|| files_with_prefix(&tenant, "foobar") == 11, 30, 1).await);

        connectors
            .update_one(
                doc! { "_id": &foobar_key },
                doc! { "$set": { "cpod_repl": 1, "version": 3 } },
                None,
            )
            .await
            .expect("scale down connector");
        assert!(wait_until(|| files_with_prefix(&tenant, "foobar") == 9, 30, 1).await);

        let kismis_key = format!("{tenant}:kismis@nextensio.com");
        connectors
            .insert_one(
                doc! {
                    "_id": &kismis_key,
                    "tenant": &tenant,
                    "bundle_id": "kismis@nextensio.com",
                    "connect_id": format!("{tenant}-kismis-nextensio-com"),
                    "services": ["svc2"],
                    "cpod_repl": 2,
                    "version": 1,
                },
                None,
            )
            .await
            .expect("insert second connector");
        assert!(wait_until(|| files_with_prefix(&tenant, "kismis") == 11, 30, 1).await);

        let summary = summaries
            .find_one(doc! { "_id": &tenant }, None)
            .await
            .expect("find summary")
            .expect("summary exists");
        let connector_list = summary.get_array("connectors").expect("connectors array");
        assert_eq!(connector_list.len(), 2);

        connectors
            .delete_one(doc! { "_id": &foobar_key }, None)
            .await
            .expect("delete foobar");
        assert!(wait_until(|| files_with_prefix(&tenant, "foobar") == 0, 30, 1).await);

        connectors
            .delete_one(doc! { "_id": &kismis_key }, None)
            .await
            .expect("delete kismis");
        assert!(wait_until(|| files_with_prefix(&tenant, "kismis") == 0, 30, 1).await);

        tenants
            .delete_one(doc! { "_id": &tenant }, None)
            .await
            .expect("delete tenant config");

        let tenant_gone = wait_until(
            || !std::path::Path::new(&format!("/tmp/{tenant}")).exists(),
            30,
            1,
        )
        .await;
        assert!(tenant_gone, "tenant working directory should be removed");

        let summary_gone = wait_until_summary_gone(&summaries, &tenant, 15, 1).await;
        assert!(summary_gone, "tenant summary document should be removed");
    }

    /// Non-empty-before-delete (§8): deleting a tenant config while a
    /// connector is still live must not remove the tenant summary's
    /// connector sequence; the tenant directory survives until the
    /// connector is cleared.
    #[tokio::test]
    #[ignore]
    async fn scenario_delete_refused_while_connectors_remain() {
        let db = connect().await;
        let tenants = db.collection::<mongodb::bson::Document>("NxtTenants");
        let connectors = db.collection::<mongodb::bson::Document>("NxtConnectors");
        let summaries = db.collection::<mongodb::bson::Document>("NxtTenantSummary");

        let mut rng = rand::thread_rng();
        let tenant = format!("nextensio-{}", rng.gen_range(0..1_000_000));

        tenants
            .insert_one(
                doc! {
                    "_id": &tenant,
                    "cluster": CLUSTER,
                    "image": IMAGE,
                    "apod_repl": 1,
                    "apod_sets": 1,
                    "version": 1,
                },
                None,
            )
            .await
            .expect("insert tenant config");
        assert!(wait_until(|| apod_file_count(&tenant) == 6, 30, 1).await);

        let bundle_key = format!("{tenant}:stays@nextensio.com");
        connectors
            .insert_one(
                doc! {
                    "_id": &bundle_key,
                    "tenant": &tenant,
                    "bundle_id": "stays@nextensio.com",
                    "connect_id": format!("{tenant}-stays-nextensio-com"),
                    "services": ["svc"],
                    "cpod_repl": 1,
                    "version": 1,
                },
                None,
            )
            .await
            .expect("insert connector");
        assert!(wait_until(|| files_with_prefix(&tenant, "stays") == 9, 30, 1).await);

        tenants
            .delete_one(doc! { "_id": &tenant }, None)
            .await
            .expect("delete tenant config");

        tokio::time::sleep(time::Duration::from_secs(5)).await;
        let summary = summaries
            .find_one(doc! { "_id": &tenant }, None)
            .await
            .expect("find summary")
            .expect("summary should still exist, delete must be refused");
        assert_eq!(summary.get_array("connectors").unwrap().len(), 1);

        connectors
            .delete_one(doc! { "_id": &bundle_key }, None)
            .await
            .expect("clear connector so delete can proceed");

        let tenant_gone = wait_until_summary_gone(&summaries, &tenant, 30, 1).await;
        assert!(tenant_gone, "tenant summary should be removed once connectors clear");
    }
}
