use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use campus_grid::config::{CoordinatorConfig, SandboxConfig, WorkerConfig};
use campus_grid::coordinator::Coordinator;
use campus_grid::shutdown::install_shutdown_handler;
use campus_grid::worker::run_worker;

#[derive(Parser, Debug)]
#[command(name = "campus-grid")]
#[command(about = "A campus-scale peer-to-peer compute exchange")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the coordinator: worker sessions, scheduler, and submission API
    Coordinator {
        /// Address workers connect to
        #[arg(long, default_value = "0.0.0.0:9999")]
        bind: SocketAddr,

        /// Address the dashboard API listens on
        #[arg(long, default_value = "0.0.0.0:5001")]
        api_bind: SocketAddr,

        /// SQLite database path
        #[arg(long, default_value = "campus_grid.db")]
        db: PathBuf,

        /// Directory job artifact files are stored under
        #[arg(long, default_value = "job_outputs")]
        artifacts_dir: PathBuf,

        /// Expected seconds between worker heartbeats
        #[arg(long, default_value_t = 30)]
        heartbeat_interval: u64,

        /// Seconds a running job's worker may be gone before the job is
        /// failed and refunded (default: 2x the heartbeat interval)
        #[arg(long)]
        stall_grace: Option<u64>,

        /// Credits granted to new users
        #[arg(long, default_value_t = 100)]
        starting_credits: i64,
    },

    /// Run a worker that contributes this machine's compute
    Worker {
        /// Coordinator address, host:port
        #[arg(short, long, default_value = "localhost:9999")]
        manager: String,

        /// Worker name (default: worker-<pid>)
        #[arg(short, long)]
        name: Option<String>,

        /// Owner username; credits earned go to this account
        #[arg(short, long)]
        owner: Option<String>,

        /// Run jobs as plain subprocesses instead of containers (unsafe)
        #[arg(long)]
        no_sandbox: bool,

        /// Container image jobs run in
        #[arg(long, default_value = "python:3.11-slim")]
        image: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cancel = install_shutdown_handler();

    match cli.command {
        Command::Coordinator {
            bind,
            api_bind,
            db,
            artifacts_dir,
            heartbeat_interval,
            stall_grace,
            starting_credits,
        } => {
            let heartbeat_interval = Duration::from_secs(heartbeat_interval);
            let mut config = CoordinatorConfig {
                worker_listen_addr: bind,
                api_listen_addr: api_bind,
                db_path: db,
                artifacts_dir,
                heartbeat_interval,
                stall_grace: stall_grace
                    .map(Duration::from_secs)
                    .unwrap_or(heartbeat_interval * 2),
                ..CoordinatorConfig::default()
            };
            config.credits.starting_balance = starting_credits;

            tracing::info!(
                worker_addr = %config.worker_listen_addr,
                api_addr = %config.api_listen_addr,
                db = %config.db_path.display(),
                "Starting coordinator"
            );

            let coordinator = Coordinator::new(config).await?;
            coordinator.run(cancel).await?;
        }
        Command::Worker {
            manager,
            name,
            owner,
            no_sandbox,
            image,
        } => {
            let mut config = WorkerConfig {
                manager_addr: manager,
                owner_token: owner.filter(|o| !o.is_empty()),
                sandbox: SandboxConfig {
                    enabled: !no_sandbox,
                    image,
                    ..SandboxConfig::default()
                },
                ..WorkerConfig::default()
            };
            if let Some(name) = name {
                config.name = name;
            }

            tracing::info!(
                name = %config.name,
                manager = %config.manager_addr,
                sandbox = config.sandbox.enabled,
                "Starting worker"
            );

            run_worker(config, cancel).await?;
        }
    }

    Ok(())
}
