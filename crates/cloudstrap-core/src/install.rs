use crate::concurrency::InstallLock;
use crate::prepare::{HostPreparer, UserData};
use crate::progress::ProgressDisplay;
use crate::readiness::{classify_cloud_init, PollConfig, ReadinessPoller, CLOUD_INIT_RESULT_COMMAND};
use crate::CoreError;
use cloudstrap_runtime::{BindMount, ContainerRuntime};
use cloudstrap_schema::{InstallSettings, UnitOverrides};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Task names registered with the progress display, in execution order.
pub const INSTALL_TASKS: [&str; 4] = [
    "Initializing Environment",
    "Creating container",
    "Waiting for container",
    "Bootstrapping Juju",
];

const AUTOSTART_DELAY_SECS: u32 = 5;
const DEFAULT_ADMIN_SECRET: &str = "password";
const BOOTSTRAP_COMMANDS: [&str; 2] = [
    "JUJU_HOME=~/.cloud-install juju bootstrap",
    "JUJU_HOME=~/.cloud-install juju status",
];

/// Host locations used by an install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPaths {
    pub config_dir: PathBuf,
    pub juju_home: PathBuf,
    pub ssh_dir: PathBuf,
}

impl InstallPaths {
    pub fn new(config_dir: impl Into<PathBuf>, home: &Path) -> Self {
        Self {
            config_dir: config_dir.into(),
            juju_home: home.join(".juju"),
            ssh_dir: home.join(".ssh"),
        }
    }

    pub fn userdata(&self) -> PathBuf {
        self.config_dir.join("userdata.yaml")
    }

    pub fn container_log(&self) -> PathBuf {
        self.config_dir.join("lxc.log")
    }

    pub fn unit_config(&self) -> PathBuf {
        self.config_dir.join("units.toml")
    }

    pub fn settings(&self) -> PathBuf {
        self.config_dir.join("settings.toml")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.config_dir.join("install.lock")
    }

    pub fn password_file(&self) -> PathBuf {
        self.config_dir.join("openstack.passwd")
    }

    /// Host directories exposed inside the environment.
    pub fn bind_mounts(&self) -> Vec<BindMount> {
        vec![
            BindMount::new(&self.config_dir, "home/ubuntu/.cloud-install"),
            BindMount::new(&self.juju_home, "home/ubuntu/.juju"),
            BindMount::new(&self.ssh_dir, "home/ubuntu/.ssh"),
            BindMount::new("/var/cache/lxc", "var/cache/lxc"),
        ]
    }

    fn admin_secret(&self) -> Result<String, CoreError> {
        let path = self.password_file();
        if !path.exists() {
            return Ok(DEFAULT_ADMIN_SECRET.to_owned());
        }
        let secret = std::fs::read_to_string(&path)?.trim().to_owned();
        if secret.is_empty() {
            Ok(DEFAULT_ADMIN_SECRET.to_owned())
        } else {
            Ok(secret)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallOptions {
    /// Stop once the environment is ready, before bootstrapping the manager.
    pub install_only: bool,
    /// Local installer package to use instead of the archive copy.
    pub upstream_deb: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Manager bootstrapped and the deploy command (if any) ran.
    Bootstrapped,
    /// Stopped after provisioning as requested.
    ProvisionedOnly,
}

/// Drives a single-host install from an empty machine to a bootstrapped
/// cluster manager running inside a fresh container.
pub struct InstallOrchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    preparer: Arc<dyn HostPreparer>,
    progress: Arc<dyn ProgressDisplay>,
    settings: InstallSettings,
    overrides: Arc<UnitOverrides>,
    paths: InstallPaths,
    options: InstallOptions,
}

impl InstallOrchestrator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        preparer: Arc<dyn HostPreparer>,
        progress: Arc<dyn ProgressDisplay>,
        settings: InstallSettings,
        paths: InstallPaths,
    ) -> Self {
        Self {
            runtime,
            preparer,
            progress,
            settings,
            overrides: Arc::new(UnitOverrides::new()),
            paths,
            options: InstallOptions::default(),
        }
    }

    pub fn with_overrides(mut self, overrides: Arc<UnitOverrides>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_options(mut self, options: InstallOptions) -> Self {
        self.options = options;
        self
    }

    pub fn paths(&self) -> &InstallPaths {
        &self.paths
    }

    fn container(&self) -> &str {
        &self.settings.container_name
    }

    pub fn run(&self) -> Result<InstallOutcome, CoreError> {
        let _lock = InstallLock::acquire(&self.paths.lock_file())?;

        self.progress.register_tasks(&INSTALL_TASKS);
        self.progress.start_task(INSTALL_TASKS[0]);
        self.progress.info_message("Building environment");

        let existing = self.runtime.container_path(self.container());
        if existing.exists() {
            return Err(CoreError::EnvironmentExists(existing));
        }

        self.prepare_host()?;
        self.progress.stop_current_task();

        self.progress.start_task(INSTALL_TASKS[1]);
        self.create_environment()?;
        self.progress.stop_current_task();

        self.progress.start_task(INSTALL_TASKS[2]);
        self.wait_for_environment()?;
        if let Some(deb) = &self.options.upstream_deb {
            self.install_upstream_deb(deb)?;
        }
        self.progress.stop_current_task();

        if self.options.install_only {
            info!("environment provisioned, stopping before bootstrap");
            self.progress
                .info_message("Done installing, stopping here per --install-only.");
            return Ok(InstallOutcome::ProvisionedOnly);
        }

        self.progress.info_message("Bootstrapping Juju");
        self.progress.start_task(INSTALL_TASKS[3]);
        for command in BOOTSTRAP_COMMANDS {
            self.run_in_environment(command)?;
        }
        self.progress.stop_current_task();

        if let Some(command) = &self.settings.deploy_command {
            self.progress.info_message("Starting cloud deployment");
            self.run_in_environment(command)?;
        }
        Ok(InstallOutcome::Bootstrapped)
    }

    fn prepare_host(&self) -> Result<(), CoreError> {
        let key = self.preparer.generate_ssh_key()?;
        let userdata = UserData {
            ssh_keys: vec![key],
            packages: self.settings.extra_packages.clone(),
            extra_ppa: self.settings.extra_ppa.clone(),
        };
        self.preparer
            .write_userdata(&userdata, &self.paths.userdata())?;
        self.preparer
            .write_unit_config(&self.overrides, &self.paths.unit_config())?;
        self.preparer
            .write_manager_environment(&self.paths.admin_secret()?, &self.paths.juju_home)?;
        self.preparer.secure_config_dir(&self.paths.config_dir)
    }

    fn create_environment(&self) -> Result<(), CoreError> {
        let name = self.container();
        info!("creating container {name} with {}", self.runtime.name());
        self.runtime.create(name, &self.paths.userdata())?;
        self.runtime
            .configure_autostart(name, AUTOSTART_DELAY_SECS)?;
        self.runtime
            .add_bind_mounts(name, &self.paths.bind_mounts())?;
        self.runtime.start(name, &self.paths.container_log())?;
        Ok(())
    }

    fn wait_for_environment(&self) -> Result<(), CoreError> {
        let name = self.container();
        self.runtime
            .wait_until_running(name, &self.paths.container_log())?;

        let poller = ReadinessPoller::new(PollConfig {
            leniency: self.settings.leniency,
            interval: self.settings.poll_interval(),
            timeout: self.settings.readiness_timeout(),
        });
        let result = poller.wait(|attempt| {
            debug!("checking cloud-init status in {name}, attempt {attempt}");
            classify_cloud_init(self.runtime.run_command(name, CLOUD_INIT_RESULT_COMMAND))
        })?;
        info!(
            "container {name} initialized (datasource: {})",
            result.datasource.as_deref().unwrap_or("unknown")
        );
        Ok(())
    }

    fn install_upstream_deb(&self, deb: &Path) -> Result<(), CoreError> {
        if !deb.is_file() {
            debug!("no upstream package at {}, using archive", deb.display());
            return Ok(());
        }
        let Some(file_name) = deb.file_name() else {
            return Ok(());
        };
        debug!("found upstream deb, installing that instead");
        std::fs::copy(deb, self.paths.config_dir.join(file_name))?;
        self.run_in_environment(&format!(
            "sudo dpkg -i .cloud-install/{}",
            file_name.to_string_lossy()
        ))?;
        Ok(())
    }

    fn run_in_environment(&self, command: &str) -> Result<String, CoreError> {
        debug!("running in {}: {command}", self.container());
        self.runtime
            .run_command(self.container(), command)
            .map_err(|source| CoreError::Command {
                command: command.to_owned(),
                source,
            })
    }
}
