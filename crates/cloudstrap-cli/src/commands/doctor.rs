use super::{json_pretty, load_overrides, load_settings, EXIT_FAILURE, EXIT_SUCCESS};
use cloudstrap_core::{InstallLock, InstallPaths};
use std::path::{Path, PathBuf};

pub fn run(config_dir: &Path, json_output: bool) -> Result<u8, String> {
    let mut checks: Vec<Check> = Vec::new();
    let mut all_pass = true;

    check_prereqs(&mut checks, &mut all_pass);

    if config_dir.exists() {
        checks.push(Check::pass(
            "config_dir",
            &format!("Config directory {}", config_dir.display()),
        ));
    } else {
        checks.push(Check::info(
            "config_dir",
            "Config directory not created yet (will be created on install)",
        ));
    }

    match load_settings(config_dir) {
        Ok(settings) => {
            checks.push(Check::pass("settings", "settings.toml valid"));
            check_container(
                &PathBuf::from(&settings.container_root).join(&settings.container_name),
                &mut checks,
            );
        }
        Err(e) => {
            all_pass = false;
            checks.push(Check::fail("settings", &e));
        }
    }

    match load_overrides(config_dir) {
        Ok(overrides) => checks.push(Check::pass(
            "unit_overrides",
            &format!(
                "units.toml valid ({} unit(s) overridden)",
                overrides.unit_names().count()
            ),
        )),
        Err(e) => {
            all_pass = false;
            checks.push(Check::fail("unit_overrides", &e));
        }
    }

    check_lock(config_dir, &mut checks, &mut all_pass);

    print_results(&checks, all_pass, json_output)
}

fn check_prereqs(checks: &mut Vec<Check>, all_pass: &mut bool) {
    let missing = cloudstrap_runtime::check_lxc_prereqs();
    if missing.is_empty() {
        checks.push(Check::pass(
            "runtime_prereqs",
            "Container runtime prerequisites satisfied",
        ));
    } else {
        *all_pass = false;
        checks.push(Check::fail(
            "runtime_prereqs",
            &cloudstrap_runtime::format_missing(&missing),
        ));
    }
}

fn check_container(path: &Path, checks: &mut Vec<Check>) {
    if path.exists() {
        checks.push(Check::warn(
            "environment",
            &format!(
                "Environment already exists at {}; uninstall it before installing again",
                path.display()
            ),
        ));
    } else {
        checks.push(Check::pass("environment", "No previous environment found"));
    }
}

fn check_lock(config_dir: &Path, checks: &mut Vec<Check>, all_pass: &mut bool) {
    if !config_dir.exists() {
        return;
    }
    let lock_path = InstallPaths::new(config_dir, Path::new("/")).lock_file();
    match InstallLock::try_acquire(&lock_path) {
        Ok(Some(_)) => checks.push(Check::pass("install_lock", "Install lock is free")),
        Ok(None) => checks.push(Check::warn(
            "install_lock",
            "Install lock is held by another process",
        )),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "install_lock",
                &format!("Cannot check install lock: {e}"),
            ));
        }
    }
}

fn print_results(checks: &[Check], all_pass: bool, json_output: bool) -> Result<u8, String> {
    if json_output {
        let json = serde_json::json!({
            "healthy": all_pass,
            "checks": checks.iter().map(|c| serde_json::json!({
                "name": c.name,
                "status": c.status,
                "message": c.message,
            })).collect::<Vec<_>>(),
        });
        println!("{}", json_pretty(&json)?);
    } else {
        println!("cloudstrap doctor\n");
        for check in checks {
            let icon = match check.status {
                "pass" => "✓",
                "fail" => "✗",
                "warn" => "⚠",
                _ => "ℹ",
            };
            println!("  {icon} {}", check.message);
        }
        println!();
        if all_pass {
            println!("All checks passed.");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }
    Ok(if all_pass { EXIT_SUCCESS } else { EXIT_FAILURE })
}

struct Check {
    name: &'static str,
    status: &'static str,
    message: String,
}

impl Check {
    fn new(name: &'static str, status: &'static str, message: &str) -> Self {
        Self {
            name,
            status,
            message: message.to_owned(),
        }
    }

    fn pass(name: &'static str, message: &str) -> Self {
        Self::new(name, "pass", message)
    }

    fn fail(name: &'static str, message: &str) -> Self {
        Self::new(name, "fail", message)
    }

    fn warn(name: &'static str, message: &str) -> Self {
        Self::new(name, "warn", message)
    }

    fn info(name: &'static str, message: &str) -> Self {
        Self::new(name, "info", message)
    }
}
