use crate::CoreError;
use cloudstrap_schema::UnitOverrides;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// Parameters for the container's cloud-init userdata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserData {
    pub ssh_keys: Vec<String>,
    pub packages: Vec<String>,
    pub extra_ppa: Option<String>,
}

#[derive(Serialize)]
struct CloudConfig<'a> {
    ssh_authorized_keys: &'a [String],
    packages: &'a [String],
    package_update: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    apt_sources: Vec<AptSource<'a>>,
    output: BTreeMap<&'static str, &'static str>,
}

#[derive(Serialize)]
struct AptSource<'a> {
    source: &'a str,
}

const CLOUD_INIT_OUTPUT: &str = "| tee -a /var/log/cloud-init-output.log";

impl UserData {
    pub fn render(&self) -> Result<String, CoreError> {
        let doc = CloudConfig {
            ssh_authorized_keys: &self.ssh_keys,
            packages: &self.packages,
            package_update: true,
            apt_sources: self
                .extra_ppa
                .as_deref()
                .map(|source| AptSource { source })
                .into_iter()
                .collect(),
            output: BTreeMap::from([("all", CLOUD_INIT_OUTPUT)]),
        };
        Ok(format!("#cloud-config\n{}", serde_yaml::to_string(&doc)?))
    }
}

/// Host-side preparation before the container is created: credentials,
/// rendered configuration, and permissions.
pub trait HostPreparer: Send + Sync {
    /// Ensure an operator key pair exists and return the public key.
    fn generate_ssh_key(&self) -> Result<String, CoreError>;

    fn write_userdata(&self, data: &UserData, dest: &Path) -> Result<(), CoreError>;

    fn write_unit_config(&self, overrides: &UnitOverrides, dest: &Path) -> Result<(), CoreError>;

    fn write_manager_environment(&self, admin_secret: &str, juju_home: &Path)
        -> Result<(), CoreError>;

    fn secure_config_dir(&self, dir: &Path) -> Result<(), CoreError>;
}

/// Writes everything to the local filesystem.
pub struct FsPreparer {
    ssh_dir: PathBuf,
}

impl FsPreparer {
    pub fn new(ssh_dir: impl Into<PathBuf>) -> Self {
        Self {
            ssh_dir: ssh_dir.into(),
        }
    }

    fn write(dest: &Path, content: &str) -> Result<(), CoreError> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(dest, content)?;
        Ok(())
    }
}

#[derive(Serialize)]
struct ManagerEnvironments<'a> {
    default: &'static str,
    environments: BTreeMap<&'static str, LocalEnvironment<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct LocalEnvironment<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    container: &'static str,
    admin_secret: &'a str,
    default_series: &'static str,
}

/// `environments.yaml` for a local provider using LXC containers.
pub(crate) fn manager_environment(admin_secret: &str) -> Result<String, CoreError> {
    let doc = ManagerEnvironments {
        default: "local",
        environments: BTreeMap::from([(
            "local",
            LocalEnvironment {
                kind: "local",
                container: "lxc",
                admin_secret,
                default_series: "trusty",
            },
        )]),
    };
    Ok(serde_yaml::to_string(&doc)?)
}

impl HostPreparer for FsPreparer {
    fn generate_ssh_key(&self) -> Result<String, CoreError> {
        let private = self.ssh_dir.join("id_rsa");
        let public = self.ssh_dir.join("id_rsa.pub");
        if !public.exists() {
            fs::create_dir_all(&self.ssh_dir)?;
            fs::set_permissions(&self.ssh_dir, fs::Permissions::from_mode(0o700))?;
            debug!("generating ssh key at {}", private.display());
            let output = Command::new("ssh-keygen")
                .args(["-q", "-N", "", "-t", "rsa", "-f"])
                .arg(&private)
                .output()
                .map_err(|e| CoreError::Prepare(format!("cannot run ssh-keygen: {e}")))?;
            if !output.status.success() {
                return Err(CoreError::Prepare(format!(
                    "ssh-keygen failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
        }
        Ok(fs::read_to_string(&public)?.trim().to_owned())
    }

    fn write_userdata(&self, data: &UserData, dest: &Path) -> Result<(), CoreError> {
        debug!("userdata options: {data:?}");
        Self::write(dest, &data.render()?)
    }

    fn write_unit_config(&self, overrides: &UnitOverrides, dest: &Path) -> Result<(), CoreError> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        overrides.save(dest)?;
        Ok(())
    }

    fn write_manager_environment(
        &self,
        admin_secret: &str,
        juju_home: &Path,
    ) -> Result<(), CoreError> {
        Self::write(
            &juju_home.join("environments.yaml"),
            &manager_environment(admin_secret)?,
        )
    }

    fn secure_config_dir(&self, dir: &Path) -> Result<(), CoreError> {
        secure_tree(dir)
            .map_err(|e| CoreError::Prepare(format!("unable to set permissions on {}: {e}", dir.display())))
    }
}

/// Directories 0700, files 0600.
fn secure_tree(dir: &Path) -> std::io::Result<()> {
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            secure_tree(&entry.path())?;
        } else if file_type.is_file() {
            fs::set_permissions(entry.path(), fs::Permissions::from_mode(0o600))?;
        }
    }
    Ok(())
}
