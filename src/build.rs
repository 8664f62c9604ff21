//! Image builds.
//!
//! Builds are keyed by a fingerprint of their inputs. A fingerprint is built
//! at most once at a time on a machine: concurrent callers wait on the same
//! lock and then find the image in the cache. Build failures are never
//! retried.

use fs2::FileExt;
use kled_protocol::BuildSpec;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::runtime::{BuildRequest, ContainerRuntime};

/// Repository images are tagged into.
pub const IMAGE_REPOSITORY: &str = "kled-workspace";

/// Hex characters of the digest kept in the fingerprint.
const FINGERPRINT_LEN: usize = 16;

/// The image a workspace container runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub reference: String,
    /// Set for images built from a Dockerfile.
    pub fingerprint: Option<String>,
    /// Whether this call ran the build.
    pub built: bool,
    /// Build output, when a build ran.
    pub log: Option<String>,
}

/// Fingerprint of a Dockerfile build.
///
/// Covers the base image, the Dockerfile content, the context path, the
/// build args and the target. Files in the context are not hashed.
pub fn fingerprint(source_root: &Path, spec: &BuildSpec) -> Result<String> {
    let mut hasher = Sha256::new();

    if let Some(image) = &spec.image {
        hasher.update(format!("image={}\n", image));
    }
    if let Some(dockerfile) = &spec.dockerfile {
        let path = source_root.join(dockerfile);
        let content = std::fs::read(&path).map_err(|e| Error::Build {
            fingerprint: None,
            log: format!("failed to read {}: {}", path.display(), e),
        })?;
        hasher.update(b"dockerfile=");
        hasher.update(&content);
        hasher.update(b"\n");
    }
    hasher.update(format!("context={}\n", spec.context.as_deref().unwrap_or(".")));
    // BTreeMap iterates sorted, so arg order never changes the digest
    for (key, value) in &spec.args {
        hasher.update(format!("arg={}={}\n", key, value));
    }
    if let Some(target) = &spec.target {
        hasher.update(format!("target={}\n", target));
    }

    let digest = format!("{:x}", hasher.finalize());
    Ok(digest[..FINGERPRINT_LEN].to_string())
}

/// Tag of the image built for `fingerprint`.
pub fn image_tag(fingerprint: &str) -> String {
    format!("{}:{}", IMAGE_REPOSITORY, fingerprint)
}

/// Exclusive lock file shared by every kled process on the machine.
struct BuildLock {
    file: std::fs::File,
}

impl BuildLock {
    async fn acquire(path: PathBuf) -> Result<Self> {
        tokio::task::spawn_blocking(move || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)?;
            file.lock_exclusive()?;
            Ok(BuildLock { file })
        })
        .await
        .map_err(|e| Error::runtime(format!("build lock task failed: {}", e)))?
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!(error = %e, "failed to release build lock");
        }
    }
}

type LockMap = Mutex<HashMap<String, Arc<AsyncMutex<()>>>>;

/// A handle on the in-process lock for one fingerprint. The map entry goes
/// away with the last handle.
struct LockEntry<'a> {
    locks: &'a LockMap,
    fingerprint: String,
    lock: Arc<AsyncMutex<()>>,
}

impl Drop for LockEntry<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        // the map and this handle
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.fingerprint);
        }
    }
}

/// Produces container images, at most one build per fingerprint at a time.
pub struct BuildCoordinator {
    runtime: Arc<dyn ContainerRuntime>,
    locks: LockMap,
    lock_dir: Option<PathBuf>,
}

impl BuildCoordinator {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            locks: Mutex::new(HashMap::new()),
            lock_dir: None,
        }
    }

    /// Also serialize builds across processes through lock files in `dir`.
    pub fn with_lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = Some(dir.into());
        self
    }

    fn lock_for(&self, fingerprint: &str) -> LockEntry<'_> {
        let lock = self
            .locks
            .lock()
            .entry(fingerprint.to_string())
            .or_default()
            .clone();
        LockEntry {
            locks: &self.locks,
            fingerprint: fingerprint.to_string(),
            lock,
        }
    }

    /// Make the image for `spec` available, building it if needed.
    ///
    /// `source_root` is where relative Dockerfile paths resolve; it is only
    /// needed for builds.
    pub async fn ensure_image(&self, source_root: Option<&Path>, spec: &BuildSpec) -> Result<ImageRef> {
        if !spec.needs_build() {
            return self.ensure_pulled(spec).await;
        }

        let root = source_root.ok_or_else(|| Error::Build {
            fingerprint: None,
            log: "a Dockerfile build needs workspace source".to_string(),
        })?;
        let fingerprint = fingerprint(root, spec)?;
        let tag = image_tag(&fingerprint);

        let entry = self.lock_for(&fingerprint);
        let _guard = entry.lock.lock().await;
        let _file_lock = match &self.lock_dir {
            Some(dir) => Some(BuildLock::acquire(dir.join(format!("{}.lock", fingerprint))).await?),
            None => None,
        };

        if self.runtime.image_exists(&tag).await? {
            debug!(%fingerprint, "image cache hit");
            return Ok(ImageRef {
                reference: tag,
                fingerprint: Some(fingerprint),
                built: false,
                log: None,
            });
        }

        info!(%fingerprint, %tag, "building image");
        let dockerfile = spec.dockerfile.as_deref().unwrap_or("Dockerfile");
        let request = BuildRequest {
            context: root.join(spec.context.as_deref().unwrap_or(".")),
            dockerfile: root.join(dockerfile),
            args: spec.args.clone(),
            target: spec.target.clone(),
            tag: tag.clone(),
        };

        match self.runtime.build(&request).await {
            Ok(log) => {
                info!(%fingerprint, "image built");
                Ok(ImageRef {
                    reference: tag,
                    fingerprint: Some(fingerprint),
                    built: true,
                    log: Some(log),
                })
            }
            Err(Error::Build { log, .. }) => Err(Error::Build {
                fingerprint: Some(fingerprint),
                log,
            }),
            Err(other) => Err(Error::Build {
                fingerprint: Some(fingerprint),
                log: other.to_string(),
            }),
        }
    }

    async fn ensure_pulled(&self, spec: &BuildSpec) -> Result<ImageRef> {
        let image = spec
            .image
            .clone()
            .ok_or_else(|| Error::config("container has neither an image nor a Dockerfile"))?;
        if !self.runtime.image_exists(&image).await? {
            info!(%image, "pulling image");
            self.runtime.pull(&image).await?;
        }
        Ok(ImageRef {
            reference: image,
            fingerprint: None,
            built: false,
            log: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ContainerStatus, RunSpec};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct FakeRuntime {
        images: Mutex<HashSet<String>>,
        builds: AtomicUsize,
        pulls: AtomicUsize,
        fail_build: bool,
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn ping(&self) -> Result<()> {
            Ok(())
        }

        async fn image_exists(&self, reference: &str) -> Result<bool> {
            Ok(self.images.lock().contains(reference))
        }

        async fn pull(&self, reference: &str) -> Result<()> {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            self.images.lock().insert(reference.to_string());
            Ok(())
        }

        async fn build(&self, request: &BuildRequest) -> Result<String> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fail_build {
                return Err(Error::Build {
                    fingerprint: None,
                    log: "step 2/3: RUN make: exit 2".into(),
                });
            }
            self.images.lock().insert(request.tag.clone());
            Ok("built".into())
        }

        async fn find(&self, _workspace_id: &str) -> Result<Option<ContainerStatus>> {
            Ok(None)
        }

        async fn create(&self, _spec: &RunSpec) -> Result<String> {
            Ok("c1".into())
        }

        async fn start(&self, _id: &str) -> Result<()> {
            Ok(())
        }

        async fn stop(&self, _id: &str) -> Result<()> {
            Ok(())
        }

        async fn remove(&self, _id: &str) -> Result<()> {
            Ok(())
        }

        async fn copy_into(&self, _id: &str, _source: &Path, _dest: &str) -> Result<()> {
            Ok(())
        }

        fn exec_command(&self, _id: &str, _user: Option<&str>, command: &[String]) -> Vec<String> {
            command.to_vec()
        }
    }

    fn dockerfile_spec(dir: &Path, content: &str) -> BuildSpec {
        std::fs::create_dir_all(dir.join(".devcontainer")).unwrap();
        std::fs::write(dir.join(".devcontainer/Dockerfile"), content).unwrap();
        BuildSpec {
            dockerfile: Some(".devcontainer/Dockerfile".into()),
            context: Some(".devcontainer".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_fingerprint_tracks_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let spec = dockerfile_spec(dir.path(), "FROM ubuntu:24.04\n");
        let first = fingerprint(dir.path(), &spec).unwrap();
        assert_eq!(first.len(), FINGERPRINT_LEN);
        assert_eq!(first, fingerprint(dir.path(), &spec).unwrap());

        let mut with_arg = spec.clone();
        with_arg.args.insert("VARIANT".into(), "3.12".into());
        assert_ne!(first, fingerprint(dir.path(), &with_arg).unwrap());

        std::fs::write(dir.path().join(".devcontainer/Dockerfile"), "FROM debian\n").unwrap();
        assert_ne!(first, fingerprint(dir.path(), &spec).unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_builds_run_once() {
        let dir = tempfile::tempdir().unwrap();
        let spec = dockerfile_spec(dir.path(), "FROM ubuntu:24.04\n");
        let runtime = Arc::new(FakeRuntime::default());
        let coordinator = Arc::new(
            BuildCoordinator::new(runtime.clone()).with_lock_dir(dir.path().join("locks")),
        );

        let a = {
            let coordinator = coordinator.clone();
            let spec = spec.clone();
            let root = dir.path().to_path_buf();
            tokio::spawn(async move { coordinator.ensure_image(Some(&root), &spec).await })
        };
        let b = {
            let coordinator = coordinator.clone();
            let spec = spec.clone();
            let root = dir.path().to_path_buf();
            tokio::spawn(async move { coordinator.ensure_image(Some(&root), &spec).await })
        };

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert_eq!(runtime.builds.load(Ordering::SeqCst), 1);
        assert_eq!(a.reference, b.reference);
        assert!(a.built != b.built);
        assert!(coordinator.locks.lock().is_empty());
        assert!(dir.path().join("locks").join(format!("{}.lock", a.fingerprint.unwrap())).exists());
    }

    #[tokio::test]
    async fn test_lock_entry_kept_while_waiters_remain() {
        let runtime = Arc::new(FakeRuntime::default());
        let coordinator = BuildCoordinator::new(runtime);

        let first = coordinator.lock_for("abc");
        let second = coordinator.lock_for("abc");
        drop(first);
        assert!(coordinator.locks.lock().contains_key("abc"));
        drop(second);
        assert!(coordinator.locks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_build_failure_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let spec = dockerfile_spec(dir.path(), "FROM ubuntu:24.04\nRUN make\n");
        let runtime = Arc::new(FakeRuntime {
            fail_build: true,
            ..Default::default()
        });
        let coordinator = BuildCoordinator::new(runtime.clone());

        let err = coordinator
            .ensure_image(Some(dir.path()), &spec)
            .await
            .unwrap_err();
        match err {
            Error::Build { fingerprint, log } => {
                assert_eq!(fingerprint.unwrap().len(), FINGERPRINT_LEN);
                assert!(log.contains("RUN make"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(runtime.builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_image_only_spec_pulls_once() {
        let runtime = Arc::new(FakeRuntime::default());
        let coordinator = BuildCoordinator::new(runtime.clone());
        let spec = BuildSpec {
            image: Some("ubuntu:24.04".into()),
            ..Default::default()
        };

        let image = coordinator.ensure_image(None, &spec).await.unwrap();
        assert_eq!(image.reference, "ubuntu:24.04");
        coordinator.ensure_image(None, &spec).await.unwrap();
        assert_eq!(runtime.pulls.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.builds.load(Ordering::SeqCst), 0);
    }
}
