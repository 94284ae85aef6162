use super::{
    home_dir, json_pretty, load_overrides, load_settings, InstallArgs, EXIT_INSTALL_ONLY,
    EXIT_SUCCESS,
};
use crate::display::TerminalProgress;
use cloudstrap_core::{
    FsPreparer, InstallOptions, InstallOrchestrator, InstallOutcome, InstallPaths,
    ProgressDisplay, ProgressEvent, RecordingProgress,
};
use cloudstrap_runtime::select_runtime;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

pub fn run(config_dir: &Path, args: InstallArgs, json: bool) -> Result<u8, String> {
    let mut settings = load_settings(config_dir)?;
    if let Some(name) = args.container_name {
        settings.container_name = name;
    }
    if let Some(root) = &args.container_root {
        settings.container_root = root.to_string_lossy().into_owned();
    }
    if args.extra_ppa.is_some() {
        settings.extra_ppa = args.extra_ppa;
    }
    settings
        .validate()
        .map_err(|e| format!("configuration error: {e}"))?;
    let overrides = load_overrides(config_dir)?;

    let home = home_dir()?;
    debug!("config dir {}, runtime {}", config_dir.display(), args.runtime);
    let paths = InstallPaths::new(config_dir, &home);
    let runtime = select_runtime(&args.runtime, &PathBuf::from(&settings.container_root))
        .map_err(|e| e.to_string())?;
    if !runtime.available() {
        return Err(format!("runtime '{}' is not available", runtime.name()));
    }

    let recording = Arc::new(RecordingProgress::new());
    let terminal = Arc::new(TerminalProgress::new());
    let progress: Arc<dyn ProgressDisplay> = if json {
        recording.clone()
    } else {
        terminal.clone()
    };

    let orchestrator = InstallOrchestrator::new(
        Arc::from(runtime),
        Arc::new(FsPreparer::new(&paths.ssh_dir)),
        progress,
        settings.clone(),
        paths,
    )
    .with_overrides(Arc::new(overrides))
    .with_options(InstallOptions {
        install_only: args.install_only,
        upstream_deb: args.upstream_deb,
    });

    let outcome = orchestrator.run();
    if outcome.is_err() && !json {
        terminal.fail_current_task();
    }
    let outcome = outcome.map_err(|e| e.to_string())?;

    if json {
        let payload = serde_json::json!({
            "container": settings.container_name,
            "config_dir": orchestrator.paths().config_dir,
            "status": match outcome {
                InstallOutcome::Bootstrapped => "bootstrapped",
                InstallOutcome::ProvisionedOnly => "provisioned",
            },
            "tasks": recording.started(),
            "messages": recording
                .events()
                .into_iter()
                .filter_map(|e| match e {
                    ProgressEvent::Info(m) => Some(m),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        });
        println!("{}", json_pretty(&payload)?);
    } else if outcome == InstallOutcome::Bootstrapped {
        println!(
            "cloud installed in container '{}', configuration in {}",
            settings.container_name,
            orchestrator.paths().config_dir.display()
        );
    } else {
        println!(
            "container '{}' provisioned, stopped before bootstrap",
            settings.container_name
        );
    }

    Ok(match outcome {
        InstallOutcome::Bootstrapped => EXIT_SUCCESS,
        InstallOutcome::ProvisionedOnly => EXIT_INSTALL_ONLY,
    })
}
