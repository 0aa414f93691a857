//! VLESS Manager - command line front end
//!
//! Loads configuration, prepares on-disk state, and runs or inspects the
//! sing-box data plane through the core state manager.

mod shutdown;

use clap::{Parser, Subcommand};
use env_logger::Env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use vless_manager_core::{Error, GlobalConfig, Result, StartOutcome, StateManager};

/// How often `run` checks for a shutdown request while the data plane runs
const SHUTDOWN_POLL: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(name = "vless-manager")]
#[command(about = "Manage VLESS clients and the sing-box data plane")]
#[command(version)]
struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create state directories, TLS material, and the default client
    Init,

    /// Initialize, start the data plane, and stay in the foreground until it exits
    Run {
        /// Start the data plane even when auto start is disabled
        #[arg(long)]
        start: bool,
    },

    /// Print the status as JSON
    Status,

    /// Create a client and print its sing-box config
    CreateClient {
        /// Display name; the id is derived from it
        #[arg(short, long, default_value = "")]
        name: String,
    },

    /// Print the sing-box config of a client
    ClientConfig {
        /// Client id
        id: String,
    },

    /// Print the vless:// link of a client
    ShareUri {
        /// Client id
        id: String,
    },

    /// Write the effective configuration as TOML
    WriteConfig {
        /// Output path (defaults to the config file in use)
        output: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<GlobalConfig> {
    let mut config = match path {
        Some(path) => GlobalConfig::load(path)?,
        None => GlobalConfig::load_or_default()?,
    };
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_ref())?;

    if let Commands::WriteConfig { output } = &cli.command {
        let path = output
            .clone()
            .or_else(|| cli.config.clone())
            .unwrap_or_else(GlobalConfig::default_path);
        config.save_to(&path)?;
        log::info!("configuration written to {}", path.display());
        return Ok(());
    }

    if config.client.insecure_tls {
        log::warn!("client documents skip TLS certificate verification (insecure_tls = true)");
    }

    let manager = StateManager::new(config);
    match cli.command {
        Commands::Init => manager.initialize_state(),
        Commands::Run { start } => run_foreground(&manager, start),
        Commands::Status => {
            let status = manager.get_status()?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Commands::CreateClient { name } => {
            let created = manager.create_client(&name)?;
            log::info!(
                "client '{}' written to {}",
                created.record.id,
                created.record.config_path.display()
            );
            print!("{}", created.config);
            Ok(())
        }
        Commands::ClientConfig { id } => {
            print!("{}", manager.get_client_config(&id)?.config);
            Ok(())
        }
        Commands::ShareUri { id } => {
            println!("{}", manager.share_uri(&id)?);
            Ok(())
        }
        Commands::WriteConfig { .. } => Ok(()),
    }
}

fn run_foreground(manager: &StateManager, force_start: bool) -> Result<()> {
    manager.initialize_state()?;

    match manager.check_data_plane() {
        Ok(version) => log::info!("data plane: {}", version),
        Err(e) => log::warn!("data plane check failed: {}", e),
    }

    if !manager.config().data_plane.auto_start && !force_start {
        log::info!("auto start disabled; state is initialized, nothing to run");
        return Ok(());
    }

    shutdown::install()?;
    if let StartOutcome::Started { pid } = manager.start_interface()? {
        log::info!(
            "serving on {}:{} (pid={})",
            manager.config().server.listen_address,
            manager.config().server.listen_port,
            pid
        );
    }

    loop {
        if let Some(report) = manager.wait_for_exit(Some(SHUTDOWN_POLL)) {
            if report.success {
                return Ok(());
            }
            return Err(Error::process(
                format!("data plane exited ({})", report),
                "",
            ));
        }
        if shutdown::requested() {
            log::info!("shutdown requested");
            manager.stop_interface();
            return Ok(());
        }
        if !manager.interface_state().is_running() {
            return Err(Error::process("data plane is no longer running", ""));
        }
    }
}
