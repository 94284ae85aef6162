use crate::backend::{BindMount, ContainerRuntime};
use crate::{RunError, RuntimeError};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tracing::debug;

const SSH_USER: &str = "ubuntu";
const WAIT_TIMEOUT_SECS: u32 = 120;

/// LXC backend driving the `lxc-*` command line tools.
///
/// Commands inside the container run over ssh against the address reported
/// by `lxc-info`, so the container needs the operator's key in its
/// `authorized_keys` (done through cloud-init userdata).
pub struct LxcRuntime {
    root: PathBuf,
    use_sudo: bool,
}

impl LxcRuntime {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            use_sudo: true,
        }
    }

    #[must_use]
    pub fn without_sudo(mut self) -> Self {
        self.use_sudo = false;
        self
    }

    fn lxc(&self, tool: &str) -> Command {
        if self.use_sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg(tool);
            cmd
        } else {
            Command::new(tool)
        }
    }

    fn checked(cmd: &mut Command, what: &str) -> Result<Output, RuntimeError> {
        debug!("running {cmd:?}");
        let output = cmd
            .output()
            .map_err(|e| RuntimeError::ExecFailed(format!("{what}: {e}")))?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(RuntimeError::ExecFailed(format!(
                "{what} failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    fn append(path: &Path, content: &str) -> Result<(), RuntimeError> {
        let mut f = OpenOptions::new().create(true).append(true).open(path)?;
        f.write_all(content.as_bytes())?;
        Ok(())
    }

    /// First IPv4/IPv6 address reported by `lxc-info`, if any.
    pub fn address(&self, name: &str) -> Result<Option<String>, RunError> {
        let output = self
            .lxc("lxc-info")
            .args(["-n", name, "-i", "-H"])
            .output()
            .map_err(|e| RunError::Spawn(format!("lxc-info: {e}")))?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(parse_first_address(&String::from_utf8_lossy(&output.stdout)))
    }

    fn log_tail(log_path: &Path) -> String {
        std::fs::read_to_string(log_path)
            .map(|s| {
                let lines: Vec<_> = s.lines().collect();
                lines[lines.len().saturating_sub(5)..].join("\n")
            })
            .unwrap_or_default()
    }
}

pub(crate) fn parse_first_address(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_owned)
}

impl ContainerRuntime for LxcRuntime {
    fn name(&self) -> &'static str {
        "lxc"
    }

    fn available(&self) -> bool {
        Command::new("lxc-create")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn container_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn create(&self, name: &str, userdata: &Path) -> Result<(), RuntimeError> {
        let mut cmd = self.lxc("lxc-create");
        cmd.args(["-t", "ubuntu-cloud", "-n", name, "--", "-u"])
            .arg(userdata);
        Self::checked(&mut cmd, "lxc-create")?;
        Ok(())
    }

    fn configure_autostart(&self, name: &str, delay_secs: u32) -> Result<(), RuntimeError> {
        let config = self.container_path(name).join("config");
        Self::append(
            &config,
            &format!("lxc.start.auto = 1\nlxc.start.delay = {delay_secs}\n"),
        )
    }

    fn add_bind_mounts(&self, name: &str, mounts: &[BindMount]) -> Result<(), RuntimeError> {
        let fstab = self.container_path(name).join("fstab");
        let mut content = String::new();
        for m in mounts {
            content.push_str(&m.fstab_entry());
            content.push('\n');
        }
        Self::append(&fstab, &content)
    }

    fn start(&self, name: &str, log_path: &Path) -> Result<(), RuntimeError> {
        let mut cmd = self.lxc("lxc-start");
        cmd.args(["-n", name, "-d", "-o"]).arg(log_path);
        Self::checked(&mut cmd, "lxc-start")?;
        Ok(())
    }

    fn wait_until_running(&self, name: &str, log_path: &Path) -> Result<(), RuntimeError> {
        let mut cmd = self.lxc("lxc-wait");
        cmd.args(["-n", name, "-s", "RUNNING", "-t"])
            .arg(WAIT_TIMEOUT_SECS.to_string());
        Self::checked(&mut cmd, "lxc-wait").map_err(|e| {
            RuntimeError::ExecFailed(format!("{e}\n{}", Self::log_tail(log_path)))
        })?;
        Ok(())
    }

    fn run_command(&self, name: &str, command: &str) -> Result<String, RunError> {
        let ip = self
            .address(name)?
            .ok_or_else(|| RunError::NoAddressYet(name.to_owned()))?;
        debug!("ssh {SSH_USER}@{ip}: {command}");
        let output = Command::new("ssh")
            .args([
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-o",
                "ConnectTimeout=10",
                "-o",
                "LogLevel=ERROR",
            ])
            .arg(format!("{SSH_USER}@{ip}"))
            .arg(command)
            .output()
            .map_err(|e| RunError::Spawn(format!("ssh: {e}")))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(RunError::NonZeroExit {
                // killed by signal
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            })
        }
    }
}
