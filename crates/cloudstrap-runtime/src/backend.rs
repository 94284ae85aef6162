use crate::{RunError, RuntimeError};
use std::path::{Path, PathBuf};

/// A host directory exposed inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    /// Path relative to the container rootfs, e.g. `home/ubuntu/.juju`.
    pub target: String,
}

impl BindMount {
    pub fn new(source: impl Into<PathBuf>, target: &str) -> Self {
        Self {
            source: source.into(),
            target: target.trim_start_matches('/').to_owned(),
        }
    }

    /// The fstab line for this mount.
    pub fn fstab_entry(&self) -> String {
        format!(
            "{} {} none bind,create=dir",
            self.source.display(),
            self.target
        )
    }
}

pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &str;

    fn available(&self) -> bool;

    /// Directory holding the container's configuration and rootfs.
    fn container_path(&self, name: &str) -> PathBuf;

    fn create(&self, name: &str, userdata: &Path) -> Result<(), RuntimeError>;

    fn configure_autostart(&self, name: &str, delay_secs: u32) -> Result<(), RuntimeError>;

    fn add_bind_mounts(&self, name: &str, mounts: &[BindMount]) -> Result<(), RuntimeError>;

    fn start(&self, name: &str, log_path: &Path) -> Result<(), RuntimeError>;

    /// Block until the runtime reports the container as running.
    fn wait_until_running(&self, name: &str, log_path: &Path) -> Result<(), RuntimeError>;

    /// Run a shell command inside the container and return its stdout.
    fn run_command(&self, name: &str, command: &str) -> Result<String, RunError>;
}

pub fn select_runtime(
    name: &str,
    container_root: &Path,
) -> Result<Box<dyn ContainerRuntime>, RuntimeError> {
    match name {
        "lxc" => Ok(Box::new(crate::lxc::LxcRuntime::new(container_root))),
        "mock" => Ok(Box::new(crate::mock::MockRuntime::with_root(container_root))),
        other => Err(RuntimeError::BackendUnavailable(other.to_owned())),
    }
}
