use thiserror::Error;

/// Crate-wide error type. One variant per external failure domain, matching
/// the propagation policy in §7: composite Reconciler operations stop at the
/// first failure and hand one of these back to the caller.
#[derive(Error, Debug)]
pub enum ClusterMgrError {
    /// the desired-state or summary database returned an error
    #[error("database error: {0}")]
    Database(#[from] mongodb::error::Error),

    /// a manifest template could not be read from the configured directory;
    /// always fatal per §4.1
    #[error("template error: cannot read {path}: {source}")]
    Template {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// the orchestrator CLI exited non-zero and the output did not match an
    /// idempotent-no-op pattern
    #[error("orchestrator error running {command}: {output}")]
    Orchestrator { command: String, output: String },

    /// writing or removing a manifest file under /tmp failed
    #[error("filesystem error at {path}: {source}")]
    Filesystem {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// delete tenant was attempted while its summary or in-memory bundle map
    /// was still non-empty (§4.5, §8 Non-empty-before-delete)
    #[error("refusing to delete tenant {tenant}: {reason}")]
    SummaryConsistency { tenant: String, reason: String },

    /// a required environment variable was absent; fatal at boot
    #[error("missing required configuration: {0}")]
    Configuration(String),

    /// json (de)serialization of a stored document failed
    #[error("serialization error: {0}")]
    Serialization(#[from] bson::ser::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] bson::de::Error),
}

pub type Result<T> = std::result::Result<T, ClusterMgrError>;
