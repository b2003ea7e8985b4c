use std::{fs, path::PathBuf, sync::Arc};

use anyhow::{bail, Context};
use clap::Parser;
use gauntlet::{
    logger::{init_logger, LogTarget},
    worker::{
        build_worker_info,
        config::{self, ConfigOverrides, WorkerConfig},
        system, verify_credentials, HttpSchedulerClient, LockFile, ProcessGameRunner, SharedState,
        WorkerAgent, LOCK_FILE,
    },
};
use tracing::{error, info, warn, Level};

/// Worker of a gauntlet fleet. Options given here are saved to the worker's config file.
#[derive(Parser, Debug)]
#[command(name = "gauntlet-worker", version, about)]
struct Cli {
    #[arg(short, long)]
    username: Option<String>,

    #[arg(short, long)]
    password: Option<String>,

    /// Protocol of the scheduler
    #[arg(short = 'P', long, value_parser = ["http", "https"])]
    protocol: Option<String>,

    /// Host of the scheduler
    #[arg(short = 'n', long)]
    host: Option<String>,

    /// Port of the scheduler
    #[arg(short = 'o', long)]
    port: Option<u16>,

    /// Cores to use, an expression in MAX (the number of cores) such as "MAX-1"
    #[arg(short, long)]
    concurrency: Option<String>,

    /// Memory for the games in MiB, an expression in MAX (the total memory) such as "MAX/2"
    #[arg(short, long)]
    max_memory: Option<String>,

    /// Only accept tasks using at least this many threads per game
    #[arg(short = 't', long)]
    min_threads: Option<u32>,

    /// Exit on the first failure instead of waiting and retrying
    #[arg(short, long)]
    fleet: Option<bool>,

    /// Compiler used to build the programs under test
    #[arg(short = 'C', long)]
    compiler: Option<String>,

    /// Write the config file and exit
    #[arg(short = 'w', long)]
    only_config: bool,

    /// Skip the credential check at startup
    #[arg(short = 'v', long)]
    no_validation: bool,

    /// Directory holding the config file, the lock and the games
    #[arg(long, env = "GAUNTLET_WORKER_DIR", default_value = ".")]
    worker_dir: PathBuf,

    /// Match program called for every batch of games
    #[arg(long, env = "GAUNTLET_MATCH_PROGRAM", default_value = "gauntlet-match")]
    match_program: String,

    /// Write logs to a file in this directory instead of stderr
    #[arg(long, env = "GAUNTLET_LOG_DIR")]
    log_dir: Option<PathBuf>,

    #[arg(long, env = "GAUNTLET_LOG_LEVEL", default_value = "info")]
    log_level: Level,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            username: self.username.clone(),
            password: self.password.clone(),
            protocol: self.protocol.clone(),
            host: self.host.clone(),
            port: self.port,
            concurrency: self.concurrency.clone(),
            max_memory: self.max_memory.clone(),
            min_threads: self.min_threads,
            fleet: self.fleet,
            compiler: self.compiler.clone(),
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    fs::create_dir_all(&cli.worker_dir)
        .with_context(|| format!("could not create {}", cli.worker_dir.display()))?;
    let worker_dir = cli
        .worker_dir
        .canonicalize()
        .with_context(|| format!("could not resolve {}", cli.worker_dir.display()))?;

    let lock = LockFile::acquire(worker_dir.join(LOCK_FILE))?;
    let state = Arc::new(SharedState::new());
    gauntlet::signal::on_termination({
        let state = Arc::clone(&state);
        move || state.stop()
    })?;

    let facts = system::probe_host()?;
    let (table, read_notices) = config::read_table(&worker_dir);
    let (mut table, notices) = config::validate(&table, &config::schema(&facts));
    for notice in read_notices.iter().chain(&notices) {
        warn!("{notice}");
    }
    cli.overrides().apply(&mut table);
    let (config, notices) =
        WorkerConfig::resolve(&table, &facts).context("Error parsing options. Config file not written.")?;
    for notice in &notices {
        info!("{notice}");
    }
    config.save(&worker_dir)?;
    info!(
        concurrency = config.concurrency,
        max_memory = config.max_memory,
        compiler = %config.compiler.name,
        remote = %config.remote(),
        "Config file written"
    );
    if cli.only_config {
        return Ok(0);
    }
    if config.username.is_empty() || config.password.is_empty() {
        bail!("Invalid or missing credentials");
    }

    let unique_key = system::load_or_create_unique_key(&worker_dir)?;
    let worker_info = build_worker_info(&config, unique_key);
    let client = Arc::new(HttpSchedulerClient::new(&config.remote(), &config.password)?);
    if !cli.no_validation {
        if let Err(e) = verify_credentials(client.as_ref(), &worker_info) {
            error!("{e}");
            return Ok(1);
        }
    }

    let runner = ProcessGameRunner::new(&cli.match_program, &worker_dir.join("games"));
    let reason = WorkerAgent::new(client, runner, worker_info, &worker_dir)
        .with_fleet(config.fleet)
        .with_lock(lock)
        .with_state(state)
        .run();
    info!(?reason, "Worker stopped");
    Ok(reason.exit_code())
}

fn main() {
    let cli = Cli::parse();
    let target = match &cli.log_dir {
        Some(dir) => LogTarget::Directory(dir.clone()),
        None => LogTarget::Stderr,
    };
    if let Err(e) = init_logger(&target, cli.log_level, "worker") {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            1
        }
    };
    std::process::exit(code);
}
