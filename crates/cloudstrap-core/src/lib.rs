//! Core orchestration for cloudstrap.
//!
//! This crate ties the schema, container runtime, and cluster manager together:
//! the `InstallOrchestrator` provisions the bootstrap container and waits on it
//! through the `ReadinessPoller`, and the `DeploymentQueue` drives service units
//! through deployment and relation wiring with retry. It also provides the
//! progress-display and host-preparation seams and the install lock.

pub mod concurrency;
pub mod deploy;
pub mod install;
pub mod prepare;
pub mod progress;
pub mod queue;
pub mod readiness;
pub mod units;

pub use concurrency::{install_signal_handler, shutdown_requested, InstallLock};
pub use deploy::run_deployment;
pub use install::{InstallOptions, InstallOrchestrator, InstallOutcome, InstallPaths, INSTALL_TASKS};
pub use prepare::{FsPreparer, HostPreparer, UserData};
pub use progress::{LogProgress, ProgressDisplay, ProgressEvent, RecordingProgress};
pub use queue::{DeploymentQueue, QueueConfig, QueueItem, QueueReport, Stage, StuckUnit};
pub use readiness::{
    classify_cloud_init, CloudInitResult, PollConfig, ProbeResult, ReadinessError,
    ReadinessPoller,
};
pub use units::{
    wiring_record_hook, Outcome, PostProcessHook, ServiceUnit, Unit, UnitContext, UnitRegistry,
    WIRING_RECORD_DIR,
};

use cloudstrap_runtime::RunError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Schema(#[from] cloudstrap_schema::SchemaError),
    #[error("runtime error: {0}")]
    Runtime(#[from] cloudstrap_runtime::RuntimeError),
    #[error("cluster manager error: {0}")]
    Manager(#[from] cloudstrap_cluster::ManagerError),
    #[error("command '{command}' failed in environment: {source}")]
    Command {
        command: String,
        #[source]
        source: RunError,
    },
    #[error(
        "environment already exists at {0}, please uninstall or kill the existing cloud before proceeding"
    )]
    EnvironmentExists(PathBuf),
    #[error("environment did not become ready: {0}")]
    Readiness(#[from] ReadinessError),
    #[error("another install holds the lock at {0}")]
    InstallLocked(PathBuf),
    #[error("unknown service unit: {0}")]
    UnknownUnit(String),
    #[error("service unit registered twice: {0}")]
    DuplicateUnit(String),
    #[error("post-processing of '{unit}' failed: {reason}")]
    PostProcess { unit: String, reason: String },
    #[error("deployment queue did not settle: {setup} setup and {relation} relation items pending")]
    QueueTimeout { setup: usize, relation: usize },
    #[error("deployment queue already started")]
    QueueStarted,
    #[error("host preparation failed: {0}")]
    Prepare(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_yaml::Error),
}
