mod commands;
mod display;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{
    expand_tilde, DeployArgs, InstallArgs, EXIT_CONFIG_ERROR, EXIT_ENV_EXISTS, EXIT_FAILURE,
};
use cloudstrap_core::install_signal_handler;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "cloudstrap",
    version,
    about = "Single-host private cloud installer"
)]
struct Cli {
    /// Installer configuration directory.
    #[arg(long, default_value = "~/.cloud-install", global = true)]
    config_dir: String,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Provision the bootstrap container and bootstrap the cluster manager in it.
    Install {
        /// Stop once the container is ready, before bootstrapping.
        #[arg(long, default_value_t = false)]
        install_only: bool,
        /// Install this local package in the container instead of the archive copy.
        #[arg(long)]
        upstream_deb: Option<PathBuf>,
        /// Extra package archive enabled in the container.
        #[arg(long)]
        extra_ppa: Option<String>,
        /// Container name (overrides settings.toml).
        #[arg(long)]
        container_name: Option<String>,
        /// Directory holding containers (overrides settings.toml).
        #[arg(long)]
        container_root: Option<PathBuf>,
        /// Container runtime backend.
        #[arg(long, default_value = "lxc")]
        runtime: String,
    },
    /// Deploy service units and wire their relations.
    Deploy {
        /// Units to deploy, with everything they relate to. Defaults to all.
        units: Vec<String>,
        /// Topology file to deploy instead of the built-in one.
        #[arg(long)]
        topology: Option<PathBuf>,
        /// Cluster manager backend (`juju` or `mock`).
        #[arg(long, default_value = "juju")]
        manager: String,
        /// Give up waiting after this many seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// List service units in display order.
    Units {
        /// Topology file to list instead of the built-in one.
        #[arg(long)]
        topology: Option<PathBuf>,
    },
    /// Run diagnostic checks on the host and configuration.
    Doctor,
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("CLOUDSTRAP_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    install_signal_handler();

    let config_dir = expand_tilde(&cli.config_dir);
    let json_output = cli.json;

    let needs_lxc = matches!(&cli.command, Commands::Install { runtime, .. } if runtime == "lxc");
    if needs_lxc && std::env::var("CLOUDSTRAP_SKIP_PREREQS").as_deref() != Ok("1") {
        let missing = cloudstrap_runtime::check_lxc_prereqs();
        if !missing.is_empty() {
            eprintln!("error: {}", cloudstrap_runtime::format_missing(&missing));
            return ExitCode::from(EXIT_FAILURE);
        }
    }

    let result = match cli.command {
        Commands::Install {
            install_only,
            upstream_deb,
            extra_ppa,
            container_name,
            container_root,
            runtime,
        } => commands::install::run(
            &config_dir,
            InstallArgs {
                install_only,
                upstream_deb,
                extra_ppa,
                container_name,
                container_root,
                runtime,
            },
            json_output,
        ),
        Commands::Deploy {
            units,
            topology,
            manager,
            timeout,
        } => commands::deploy::run(
            &config_dir,
            DeployArgs {
                units,
                topology,
                manager,
                timeout,
            },
            json_output,
        ),
        Commands::Units { topology } => commands::units::run(topology.as_deref(), json_output),
        Commands::Doctor => commands::doctor::run(&config_dir, json_output),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("configuration error:") {
                EXIT_CONFIG_ERROR
            } else if msg.starts_with("environment already exists") {
                EXIT_ENV_EXISTS
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}
