//! Container runtime collaborator for cloudstrap.
//!
//! This crate implements the execution layer the installer drives: the
//! `ContainerRuntime` trait with an LXC backend (`lxc-*` tools plus `ssh`
//! into the container) and an in-memory mock that records every call,
//! together with the `RunError` taxonomy used to tell "not reachable yet"
//! apart from real command failures, and host prerequisite checks.

pub mod backend;
pub mod lxc;
pub mod mock;
pub mod prereq;

pub use backend::{select_runtime, BindMount, ContainerRuntime};
pub use lxc::LxcRuntime;
pub use mock::{MockRuntime, RuntimeCall};
pub use prereq::{check_lxc_prereqs, format_missing, MissingPrereq};

use thiserror::Error;

/// Outcome of running a command inside a container that did not produce
/// usable output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    #[error("container '{0}' has no network address yet")]
    NoAddressYet(String),
    #[error("command exited with status {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },
    #[error("failed to launch command: {0}")]
    Spawn(String),
}

impl RunError {
    /// Exit code of the remote command, if it ran at all.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            RunError::NonZeroExit { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("runtime '{0}' is not available on this system")]
    BackendUnavailable(String),
    #[error("container '{0}' not found")]
    NotFound(String),
    #[error("runtime execution failed: {0}")]
    ExecFailed(String),
    #[error("container command failed: {0}")]
    Run(#[from] RunError),
}
