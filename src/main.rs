use clap::{Parser, Subcommand};
use log::{error, info};
use sniff::configuration::config::Config;
use sniff::controller::Controller;
use sniff::daemon::{self, DaemonStatus};
use sniff::error_handling::types::{ControllerError, DaemonError};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "sniff")]
#[command(version)]
#[command(about = "Network capture with hourly rotation and pluggable analysis")]
struct Args {
    /// TOML configuration file
    config_file: PathBuf,

    /// Overrides `[capture] interface`
    #[arg(short, long, env = "SNIFF_INTERFACE")]
    interface: Option<String>,

    /// Overrides `[capture] filter`
    #[arg(short, long)]
    filter: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Capture in the foreground until interrupted
    Run,
    /// Capture in the background, guarded by the PID file
    Daemon,
    /// Stop the background capture
    Stop,
    /// Report whether the background capture is running
    Status,
}

fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .init();

    let args = Args::parse();
    let code = match execute(args) {
        Ok(()) => 0,
        Err(e) => {
            error!("{}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn execute(args: Args) -> Result<(), ControllerError> {
    info!("Importing configuration from {}", args.config_file.display());
    let mut config = Config::from_file(&args.config_file)?;
    config.apply_overrides(args.interface, args.filter);

    match args.command {
        Command::Status => {
            let status = daemon::daemon_status(&config.daemon.pid_file)?;
            println!("sniff: {}", status);
            Ok(())
        }
        Command::Stop => {
            let grace = Duration::from_secs(config.daemon.stop_grace_secs);
            let status = runtime()?.block_on(daemon::stop_daemon(&config.daemon.pid_file, grace))?;
            match status {
                DaemonStatus::Running(pid) => Err(ControllerError::InitializationFailed(format!(
                    "daemon (PID {}) did not stop",
                    pid
                ))),
                _ => {
                    println!("sniff: stopped");
                    Ok(())
                }
            }
        }
        Command::Run | Command::Daemon => {
            let controller = Controller::new(config)?;
            let daemonize = args.command == Command::Daemon;
            if daemonize {
                if let DaemonStatus::Running(pid) = daemon::daemon_status(&controller.config().daemon.pid_file)? {
                    return Err(DaemonError::AlreadyRunning(pid).into());
                }
                if !daemon::detach()? {
                    return Ok(());
                }
            }
            let runtime = runtime()?;
            let summary = runtime.block_on(async {
                if daemonize {
                    controller.run_daemon().await
                } else {
                    controller.run().await
                }
            })?;
            info!(
                "Captured {} packets into {} files",
                summary.stats.packets_written, summary.rotator.files_completed
            );
            Ok(())
        }
    }
}

fn runtime() -> Result<tokio::runtime::Runtime, ControllerError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| ControllerError::InitializationFailed(e.to_string()))
}
