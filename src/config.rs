use std::env;

use crate::errors::{ClusterMgrError, Result};

/// Process-wide configuration, read once at startup. Every field is a
/// required environment variable per §6; absence of any one is a fatal
/// configuration error and the process aborts before connecting to anything.
#[derive(Clone, Debug)]
pub struct Config {
    pub cluster_name: String,
    pub template_dir: String,
    pub wan_ip: String,
    pub storage_class: String,
    pub mongo_uri: String,
    pub tracing_collector_uri: String,
    /// short-circuits the Orchestrator Driver and the database connection
    /// with programmable in-memory fakes; used by the non-ignored unit tests.
    pub test_mode: bool,
}

fn require_env(key: &str) -> Result<String> {
    env::var(key).map_err(|_| ClusterMgrError::Configuration(key.to_string()))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            cluster_name: require_env("CLUSTERMGR_CLUSTER_NAME")?,
            template_dir: require_env("CLUSTERMGR_TEMPLATE_DIR")?,
            wan_ip: require_env("CLUSTERMGR_WAN_IP")?,
            storage_class: require_env("CLUSTERMGR_STORAGE_CLASS")?,
            mongo_uri: require_env("CLUSTERMGR_MONGO_URI")?,
            tracing_collector_uri: require_env("CLUSTERMGR_TRACING_URI")?,
            test_mode: env::var("CLUSTERMGR_TEST_MODE")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        })
    }
}
