use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, warn};

use crate::errors::{ClusterMgrError, Result};

/// Output substrings that mark a connectivity/auth failure (§4.2, §7).
/// Isolated here per Design Notes §9 so the classification rule can be
/// upgraded without touching the Reconciler.
const HARD_ERROR_PATTERNS: [&str; 3] = [
    "connection to the server",
    "must be logged in",
    "error loading config file",
];

fn is_hard_error(output: &str) -> bool {
    HARD_ERROR_PATTERNS.iter().any(|p| output.contains(p))
}

/// Programmable outcomes for the unit-test environment switch (§4.2).
#[derive(Clone, Default)]
pub struct FakeControls {
    pub fail_next_apply: Arc<AtomicBool>,
    pub fail_next_delete: Arc<AtomicBool>,
    pub not_found_on_delete: Arc<AtomicBool>,
}

/// Applies and deletes rendered manifests via the external orchestrator CLI
/// (grounded on `examples/original_source/mel/mel.go`'s `kubectlApply`,
/// generalized to also cover `delete` and the probe-retry hard-error
/// barrier).
pub struct OrchestratorDriver {
    binary: String,
    test_mode: bool,
    fake: FakeControls,
}

impl OrchestratorDriver {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            test_mode: false,
            fake: FakeControls::default(),
        }
    }

    pub fn new_test_mode() -> (Self, FakeControls) {
        let fake = FakeControls::default();
        (
            Self {
                binary: "kubectl".to_string(),
                test_mode: true,
                fake: fake.clone(),
            },
            fake,
        )
    }

    async fn run(&self, args: &[&str]) -> std::io::Result<(bool, String)> {
        let binary = self.binary.clone();
        let owned: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        tokio::task::spawn_blocking(move || {
            let out = Command::new(&binary).args(&owned).output()?;
            let mut combined = String::from_utf8_lossy(&out.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&out.stderr));
            Ok((out.status.success(), combined))
        })
        .await
        .expect("orchestrator command task panicked")
    }

    /// Blocks the caller, retrying a `get pod` probe every two seconds,
    /// until the orchestrator is reachable again (§4.2, §5).
    pub async fn hard_error_barrier(&self) {
        loop {
            match self.run(&["get", "pod"]).await {
                Ok((true, _)) => return,
                Ok((false, out)) => warn!("orchestrator probe still failing: {out}"),
                Err(e) => warn!("orchestrator probe failed to execute: {e}"),
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    /// Writes `body` to `path` then applies it. `AlreadyExists` in the
    /// output is treated as success (§4.2).
    pub async fn apply_file(&self, path: &Path, body: &str) -> Result<()> {
        self.write_manifest(path, body)?;
        self.apply(path).await
    }

    pub async fn apply(&self, path: &Path) -> Result<()> {
        if self.test_mode {
            if self.fake.fail_next_apply.swap(false, Ordering::SeqCst) {
                return Err(ClusterMgrError::Orchestrator {
                    command: format!("apply -f {}", path.display()),
                    output: "simulated apply failure".to_string(),
                });
            }
            return Ok(());
        }
        let path_str = path.display().to_string();
        loop {
            let (ok, out) = self
                .run(&["apply", "-f", &path_str])
                .await
                .map_err(|e| ClusterMgrError::Filesystem {
                    path: path_str.clone(),
                    source: e,
                })?;
            if ok || out.contains("AlreadyExists") {
                return Ok(());
            }
            if is_hard_error(&out) {
                error!("hard orchestrator error applying {path_str}: {out}");
                self.hard_error_barrier().await;
                continue;
            }
            return Err(ClusterMgrError::Orchestrator {
                command: format!("apply -f {path_str}"),
                output: out,
            });
        }
    }

    /// Deletes the orchestrator object for `path`, then best-effort removes
    /// the file. Returns the captured output so callers can distinguish
    /// `NotFound` (idempotent no-op) from a real failure, per §4.2's
    /// contract `delete(path) -> (output, ok | err)`.
    pub async fn delete(&self, path: &Path) -> (String, Result<()>) {
        if self.test_mode {
            if self.fake.not_found_on_delete.swap(false, Ordering::SeqCst) {
                return ("NotFound".to_string(), Ok(()));
            }
            if self.fake.fail_next_delete.swap(false, Ordering::SeqCst) {
                return (
                    "simulated delete failure".to_string(),
                    Err(ClusterMgrError::Orchestrator {
                        command: format!("delete -f {}", path.display()),
                        output: "simulated delete failure".to_string(),
                    }),
                );
            }
            let _ = std::fs::remove_file(path);
            return (String::new(), Ok(()));
        }
        let path_str = path.display().to_string();
        loop {
            let run_result = self.run(&["delete", "-f", &path_str]).await;
            let (ok, out) = match run_result {
                Ok(pair) => pair,
                Err(e) => {
                    return (
                        String::new(),
                        Err(ClusterMgrError::Filesystem {
                            path: path_str,
                            source: e,
                        }),
                    )
                }
            };
            if ok || out.contains("NotFound") {
                let _ = std::fs::remove_file(path);
                return (out, Ok(()));
            }
            if is_hard_error(&out) {
                error!("hard orchestrator error deleting {path_str}: {out}");
                self.hard_error_barrier().await;
                continue;
            }
            return (
                out.clone(),
                Err(ClusterMgrError::Orchestrator {
                    command: format!("delete -f {path_str}"),
                    output: out,
                }),
            );
        }
    }

    /// `create namespace <name>`; `AlreadyExists` is success. Grounded on
    /// `examples/original_source/mel/mel.go`'s `createNamespace`, which
    /// labels the namespace unconditionally on every call, not only on
    /// first creation — callers should follow with
    /// [`Self::label_namespace_for_mesh_injection`] regardless of outcome.
    pub async fn create_namespace(&self, name: &str) -> Result<()> {
        if self.test_mode {
            return self.test_ok_unless_forced_apply_failure(name, "create namespace");
        }
        loop {
            let (ok, out) = self
                .run(&["create", "namespace", name])
                .await
                .map_err(|e| ClusterMgrError::Filesystem {
                    path: name.to_string(),
                    source: e,
                })?;
            if ok || out.contains("AlreadyExists") {
                return Ok(());
            }
            if is_hard_error(&out) {
                error!("hard orchestrator error creating namespace {name}: {out}");
                self.hard_error_barrier().await;
                continue;
            }
            return Err(ClusterMgrError::Orchestrator {
                command: format!("create namespace {name}"),
                output: out,
            });
        }
    }

    pub async fn label_namespace_for_mesh_injection(&self, name: &str) -> Result<()> {
        if self.test_mode {
            return self.test_ok_unless_forced_apply_failure(name, "label namespace");
        }
        loop {
            let (ok, out) = self
                .run(&[
                    "label",
                    "namespace",
                    name,
                    "istio-injection=enabled",
                    "--overwrite",
                ])
                .await
                .map_err(|e| ClusterMgrError::Filesystem {
                    path: name.to_string(),
                    source: e,
                })?;
            if ok {
                return Ok(());
            }
            if is_hard_error(&out) {
                error!("hard orchestrator error labeling namespace {name}: {out}");
                self.hard_error_barrier().await;
                continue;
            }
            return Err(ClusterMgrError::Orchestrator {
                command: format!("label namespace {name}"),
                output: out,
            });
        }
    }

    /// `get secret regcred --namespace=default -o yaml`; the captured
    /// output becomes the body rendered into the docker-credential-copy
    /// manifest for a new tenant namespace.
    pub async fn fetch_docker_credential_secret(&self) -> Result<String> {
        if self.test_mode {
            return Ok("apiVersion: v1\nkind: Secret\nmetadata:\n  name: regcred\n".to_string());
        }
        loop {
            let (ok, out) = self
                .run(&[
                    "get",
                    "secret",
                    "regcred",
                    "--namespace=default",
                    "-o",
                    "yaml",
                ])
                .await
                .map_err(|e| ClusterMgrError::Filesystem {
                    path: "regcred".to_string(),
                    source: e,
                })?;
            if ok {
                return Ok(out);
            }
            if is_hard_error(&out) {
                error!("hard orchestrator error fetching docker credential secret: {out}");
                self.hard_error_barrier().await;
                continue;
            }
            return Err(ClusterMgrError::Orchestrator {
                command: "get secret regcred --namespace=default -o yaml".to_string(),
                output: out,
            });
        }
    }

    /// `delete namespace <name>`; `NotFound` is success.
    pub async fn delete_namespace(&self, name: &str) -> Result<()> {
        if self.test_mode {
            return self.test_ok_unless_forced_apply_failure(name, "delete namespace");
        }
        loop {
            let (ok, out) = self
                .run(&["delete", "namespace", name])
                .await
                .map_err(|e| ClusterMgrError::Filesystem {
                    path: name.to_string(),
                    source: e,
                })?;
            if ok || out.contains("NotFound") {
                return Ok(());
            }
            if is_hard_error(&out) {
                error!("hard orchestrator error deleting namespace {name}: {out}");
                self.hard_error_barrier().await;
                continue;
            }
            return Err(ClusterMgrError::Orchestrator {
                command: format!("delete namespace {name}"),
                output: out,
            });
        }
    }

    fn test_ok_unless_forced_apply_failure(&self, subject: &str, command: &str) -> Result<()> {
        if self.fake.fail_next_apply.swap(false, Ordering::SeqCst) {
            return Err(ClusterMgrError::Orchestrator {
                command: format!("{command} {subject}"),
                output: "simulated failure".to_string(),
            });
        }
        Ok(())
    }

    fn write_manifest(&self, path: &Path, body: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ClusterMgrError::Filesystem {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        std::fs::write(path, body).map_err(|e| ClusterMgrError::Filesystem {
            path: path.display().to_string(),
            source: e,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_mode_apply_succeeds_by_default() {
        let (driver, _fake) = OrchestratorDriver::new_test_mode();
        let res = driver.apply(Path::new("/tmp/nonexistent/foo.yaml")).await;
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn test_mode_apply_can_be_forced_to_fail_once() {
        let (driver, fake) = OrchestratorDriver::new_test_mode();
        fake.fail_next_apply.store(true, Ordering::SeqCst);
        let first = driver.apply(Path::new("/tmp/foo.yaml")).await;
        assert!(first.is_err());
        let second = driver.apply(Path::new("/tmp/foo.yaml")).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_mode_delete_reports_not_found() {
        let (driver, fake) = OrchestratorDriver::new_test_mode();
        fake.not_found_on_delete.store(true, Ordering::SeqCst);
        let (out, res) = driver.delete(Path::new("/tmp/foo.yaml")).await;
        assert_eq!(out, "NotFound");
        assert!(res.is_ok());
    }

    #[test]
    fn hard_error_patterns_match_known_strings() {
        assert!(is_hard_error("Unable to connect to the server: EOF"));
        assert!(is_hard_error("error: You must be logged in to the server"));
        assert!(is_hard_error("error loading config file"));
        assert!(!is_hard_error("Error from server (NotFound): namespaces \"x\" not found"));
    }
}
