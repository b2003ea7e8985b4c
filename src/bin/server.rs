use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use gauntlet::{logger::init_logger, prelude::*};
use tracing::{info, warn, Level};

/// Scheduler of a gauntlet fleet. Every flag overrides the matching `GAUNTLET_*` variable.
#[derive(Parser, Debug)]
#[command(name = "gauntlet-server", version, about)]
struct Cli {
    /// Address to listen on
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// TOML user table; without it any non-empty credentials are accepted
    #[arg(long)]
    users: Option<PathBuf>,

    /// Seconds without news after which a task is handed to another worker
    #[arg(long)]
    dead_task_secs: Option<u64>,

    /// Request handling threads
    #[arg(long)]
    http_threads: Option<usize>,

    /// Write logs to a file in this directory instead of stderr
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[arg(long)]
    log_level: Option<Level>,
}

impl Cli {
    fn configuration(self) -> Configuration {
        let mut config = Configuration::from_env();
        if let Some(bind) = self.bind {
            config = config.with_bind(bind);
        }
        if self.users.is_some() {
            config = config.with_users_file(self.users);
        }
        if let Some(secs) = self.dead_task_secs {
            config = config.with_dead_task_timeout(Duration::from_secs(secs));
        }
        if let Some(threads) = self.http_threads {
            config = config.with_http_threads(threads);
        }
        if self.log_dir.is_some() {
            config = config.with_log_dir(self.log_dir);
        }
        if let Some(level) = self.log_level {
            config = config.with_log_level(level);
        }
        config
    }
}

fn serve<A: Authenticator + 'static>(
    scheduler: TaskScheduler<InMemoryRepository>,
    auth: A,
    config: &Configuration,
) -> anyhow::Result<()> {
    let service = Arc::new(ApiService::new(scheduler, auth).with_configuration(config));
    let handle = gauntlet::server::spawn(service, config)?;
    gauntlet::signal::on_termination(handle.stopper())?;
    handle.join()?;
    info!("Scheduler stopped");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let config = Cli::parse().configuration();
    if let Some(path) = init_logger(&config.log_target(), config.log_level(), "server")? {
        eprintln!("Logging to {}", path.display());
    }

    let repository = Arc::new(InMemoryRepository::new());
    let scheduler = TaskScheduler::new(repository).with_dead_task_timeout(config.dead_task_timeout());
    match config.users_file() {
        Some(path) => {
            let users = UserTable::load(path)?;
            info!(path = %path.display(), "User table loaded");
            serve(scheduler, users, &config)
        }
        None => {
            warn!("No user table, any non-empty credentials are accepted");
            serve(scheduler, OpenAccess, &config)
        }
    }
}
