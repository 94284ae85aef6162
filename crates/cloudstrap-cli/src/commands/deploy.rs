use super::{
    json_pretty, load_overrides, load_settings, load_topology, spin_fail, spin_ok, spinner,
    DeployArgs, EXIT_FAILURE, EXIT_SUCCESS,
};
use cloudstrap_cluster::{ClusterManager, JujuClient, MockManager};
use cloudstrap_core::{
    run_deployment, LogProgress, ProgressDisplay, QueueConfig, QueueReport, UnitContext,
    UnitRegistry, WIRING_RECORD_DIR,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

fn select_manager(name: &str, config_dir: &Path) -> Result<Arc<dyn ClusterManager>, String> {
    match name {
        "juju" => Ok(Arc::new(JujuClient::new().with_home(config_dir))),
        "mock" => Ok(Arc::new(MockManager::new())),
        other => Err(format!("unknown cluster manager '{other}'")),
    }
}

pub fn run(config_dir: &Path, args: DeployArgs, json: bool) -> Result<u8, String> {
    let settings = load_settings(config_dir)?;
    let overrides = load_overrides(config_dir)?;
    let mut topology = load_topology(args.topology.as_deref())?;
    if !args.units.is_empty() {
        topology = topology
            .select(&args.units)
            .map_err(|e| format!("configuration error: {e}"))?;
    }
    let registry =
        UnitRegistry::from_topology_with_records(&topology, &config_dir.join(WIRING_RECORD_DIR))
            .map_err(|e| e.to_string())?;
    debug!(
        "deploying {} through {}",
        registry.names().collect::<Vec<_>>().join(", "),
        args.manager
    );

    let progress: Arc<dyn ProgressDisplay> = Arc::new(LogProgress::new());
    let ctx = UnitContext {
        manager: select_manager(&args.manager, config_dir)?,
        overrides: Arc::new(overrides),
        progress,
    };
    let config = QueueConfig {
        settle_interval: settings.settle_interval(),
        retry: settings.retry,
        ..QueueConfig::default()
    };

    let pb = if json {
        None
    } else {
        Some(spinner(&format!("deploying {} service unit(s)...", registry.len())))
    };
    let report = match run_deployment(
        &registry,
        ctx,
        config,
        args.timeout.map(Duration::from_secs),
    ) {
        Ok(r) => r,
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "deployment did not settle");
            }
            return Err(e.to_string());
        }
    };
    if let Some(ref pb) = pb {
        if report.is_clean() {
            spin_ok(pb, "all service units deployed and related");
        } else {
            spin_fail(pb, "some service units are stuck");
        }
    }

    print_report(&report, json)?;
    Ok(if report.is_clean() {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    })
}

fn print_report(report: &QueueReport, json: bool) -> Result<(), String> {
    if json {
        let payload = serde_json::json!({
            "deployed": report.deployed,
            "wired": report.wired,
            "stuck": report.stuck.iter().map(|s| serde_json::json!({
                "name": s.name,
                "stage": s.stage.to_string(),
                "attempts": s.attempts,
                "reason": s.reason,
            })).collect::<Vec<_>>(),
        });
        println!("{}", json_pretty(&payload)?);
        return Ok(());
    }
    println!("deployed: {}", report.deployed.join(", "));
    println!("related:  {}", report.wired.join(", "));
    for stuck in &report.stuck {
        println!(
            "stuck:    {} ({} after {} attempt(s)): {}",
            stuck.name, stuck.stage, stuck.attempts, stuck.reason
        );
    }
    Ok(())
}
