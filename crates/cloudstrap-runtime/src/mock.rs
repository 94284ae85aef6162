use crate::backend::{BindMount, ContainerRuntime};
use crate::{RunError, RuntimeError};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// A call observed by [`MockRuntime`], in issue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Create { name: String, userdata: PathBuf },
    ConfigureAutostart { name: String, delay_secs: u32 },
    AddBindMounts { name: String, mounts: Vec<BindMount> },
    Start { name: String },
    WaitUntilRunning { name: String },
    Run { name: String, command: String },
}

#[derive(Default)]
struct MockState {
    calls: Vec<RuntimeCall>,
    scripts: HashMap<String, VecDeque<Result<String, RunError>>>,
    containers: Vec<String>,
}

/// In-memory runtime for tests and dry runs.
///
/// Commands answer from per-command scripts; the last scripted response of a
/// command repeats once the script runs out, and unscripted commands succeed
/// with empty output.
pub struct MockRuntime {
    root: PathBuf,
    state: Mutex<MockState>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::with_root(std::env::temp_dir().join("cloudstrap-mock-lxc"))
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: Mutex::new(MockState::default()),
        }
    }

    /// Queue responses for an exact command string.
    pub fn script(&self, command: &str, responses: Vec<Result<String, RunError>>) {
        if let Ok(mut state) = self.state.lock() {
            state
                .scripts
                .entry(command.to_owned())
                .or_default()
                .extend(responses);
        }
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.state
            .lock()
            .map(|s| s.calls.clone())
            .unwrap_or_default()
    }

    /// Commands passed to `run_command`, in order.
    pub fn commands(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                RuntimeCall::Run { command, .. } => Some(command),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: RuntimeCall) -> Result<(), RuntimeError> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| RuntimeError::ExecFailed(format!("mutex poisoned: {e}")))?;
        state.calls.push(call);
        Ok(())
    }

    fn require_container(&self, name: &str) -> Result<(), RuntimeError> {
        let state = self
            .state
            .lock()
            .map_err(|e| RuntimeError::ExecFailed(format!("mutex poisoned: {e}")))?;
        if state.containers.iter().any(|c| c == name) {
            Ok(())
        } else {
            Err(RuntimeError::NotFound(name.to_owned()))
        }
    }
}

impl ContainerRuntime for MockRuntime {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn available(&self) -> bool {
        true
    }

    fn container_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn create(&self, name: &str, userdata: &Path) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::Create {
            name: name.to_owned(),
            userdata: userdata.to_path_buf(),
        })?;
        let mut state = self
            .state
            .lock()
            .map_err(|e| RuntimeError::ExecFailed(format!("mutex poisoned: {e}")))?;
        state.containers.push(name.to_owned());
        Ok(())
    }

    fn configure_autostart(&self, name: &str, delay_secs: u32) -> Result<(), RuntimeError> {
        self.require_container(name)?;
        self.record(RuntimeCall::ConfigureAutostart {
            name: name.to_owned(),
            delay_secs,
        })
    }

    fn add_bind_mounts(&self, name: &str, mounts: &[BindMount]) -> Result<(), RuntimeError> {
        self.require_container(name)?;
        self.record(RuntimeCall::AddBindMounts {
            name: name.to_owned(),
            mounts: mounts.to_vec(),
        })
    }

    fn start(&self, name: &str, _log_path: &Path) -> Result<(), RuntimeError> {
        self.require_container(name)?;
        self.record(RuntimeCall::Start {
            name: name.to_owned(),
        })
    }

    fn wait_until_running(&self, name: &str, _log_path: &Path) -> Result<(), RuntimeError> {
        self.require_container(name)?;
        self.record(RuntimeCall::WaitUntilRunning {
            name: name.to_owned(),
        })
    }

    fn run_command(&self, name: &str, command: &str) -> Result<String, RunError> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| RunError::Spawn(format!("mutex poisoned: {e}")))?;
        state.calls.push(RuntimeCall::Run {
            name: name.to_owned(),
            command: command.to_owned(),
        });
        match state.scripts.get_mut(command) {
            Some(queue) if queue.len() > 1 => queue
                .pop_front()
                .unwrap_or_else(|| Ok(String::new())),
            Some(queue) => queue.front().cloned().unwrap_or_else(|| Ok(String::new())),
            None => Ok(String::new()),
        }
    }
}
