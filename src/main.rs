use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::info;

use build_monitor::builder::{BuildCommand, ProcessBuilder};
use build_monitor::clock::RealClock;
use build_monitor::config;
use build_monitor::fetcher::HttpRefFetcher;
use build_monitor::supervisor::Supervisor;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML config file.
    #[arg(short, long)]
    config: PathBuf,

    /// GitHub API token, overriding $GITHUB_TOKEN.
    #[arg(long)]
    token: Option<String>,

    /// Poll exactly once, wait for every launched build to settle, then exit.
    /// Useful for smoke-testing a config.
    #[arg(long)]
    once: bool,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = config::load(&args.config)?;
    let token = args.token.or_else(|| std::env::var("GITHUB_TOKEN").ok());

    let fetcher = HttpRefFetcher::new(
        &config.api_base,
        &config.repo_owner,
        &config.repo_name,
        token,
    );
    let command: BuildCommand = config.build.command.into();
    let builder = ProcessBuilder::new(config.build.name, command);
    let poll_interval = Duration::from_secs(config.poll_interval_secs);

    let runtime = tokio::runtime::Runtime::new().context("starting async runtime")?;
    runtime.block_on(async move {
        let supervisor = Supervisor::new(
            fetcher,
            config.max_concurrent,
            poll_interval,
            builder,
            RealClock,
        )
        .context("invalid configuration")?;

        if let Some(seed_file) = &config.seed_file {
            let shas = config::load_seed_file(std::path::Path::new(seed_file))?;
            info!("preloading {} SHAs from {seed_file}", shas.len());
            supervisor.seed(shas);
        }

        supervisor.start();
        info!(
            "watching {}/{}, polling every {poll_interval:?}",
            config.repo_owner, config.repo_name
        );

        if args.once {
            tokio::time::sleep(poll_interval + Duration::from_secs(1)).await;
            while supervisor.stats().live() > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            supervisor.dispose().await;
        } else {
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            supervisor.dispose().await;
        }
        Ok(())
    })
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
}
