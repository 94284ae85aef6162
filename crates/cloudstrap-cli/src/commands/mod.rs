pub mod completions;
pub mod deploy;
pub mod doctor;
pub mod install;
pub mod units;

use cloudstrap_schema::{
    builtin_topology, parse_topology_file, InstallSettings, TopologyFile, UnitOverrides,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_ENV_EXISTS: u8 = 3;
pub const EXIT_INSTALL_ONLY: u8 = 4;

#[derive(Debug, Clone)]
pub struct InstallArgs {
    pub install_only: bool,
    pub upstream_deb: Option<PathBuf>,
    pub extra_ppa: Option<String>,
    pub container_name: Option<String>,
    pub container_root: Option<PathBuf>,
    pub runtime: String,
}

#[derive(Debug, Clone)]
pub struct DeployArgs {
    pub units: Vec<String>,
    pub topology: Option<PathBuf>,
    pub manager: String,
    pub timeout: Option<u64>,
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
}

fn done_style() -> ProgressStyle {
    ProgressStyle::with_template("{msg}").unwrap_or_else(|_| ProgressStyle::default_spinner())
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(spinner_style());
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(done_style());
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(done_style());
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn home_dir() -> Result<PathBuf, String> {
    std::env::var("HOME")
        .map(PathBuf::from)
        .map_err(|_| "HOME is not set".to_owned())
}

pub fn load_settings(config_dir: &Path) -> Result<InstallSettings, String> {
    InstallSettings::load_or_default(&config_dir.join("settings.toml"))
        .map_err(|e| format!("configuration error: {e}"))
}

pub fn load_overrides(config_dir: &Path) -> Result<UnitOverrides, String> {
    UnitOverrides::load_or_default(&config_dir.join("units.toml"))
        .map_err(|e| format!("configuration error: {e}"))
}

pub fn load_topology(path: Option<&Path>) -> Result<TopologyFile, String> {
    let topology = match path {
        Some(p) => parse_topology_file(p),
        None => builtin_topology(),
    };
    topology.map_err(|e| format!("configuration error: {e}"))
}
