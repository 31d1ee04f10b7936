use std::{env, path::Path, sync::Arc, time::Duration};

use clap::{Args, Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use strata::{
    blobs::LevelStores,
    clock::RealClock,
    config::Config,
    coordinator::{Coordinator, NoAlerts},
    scheduler::Scheduler,
    store::SqliteStore,
};
use strata_signal::{Drain, Watcher};
use tokio::{
    runtime::Builder,
    signal,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Invalid configuration: {0}")]
    Config(#[from] strata::config::Error),
    #[error("Unable to allocate capped store: {0}")]
    Capped(#[from] strata_capped::Error),
    #[error("Unable to open row store: {0}")]
    Store(#[from] strata::store::Error),
    #[error("Unable to start task: {0}")]
    Register(#[from] strata_signal::RegisterError),
    #[error("Failed to install prometheus recorder: {0}")]
    Prometheus(#[from] metrics_exporter_prometheus::BuildError),
}

const CAPPED_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

fn default_config_path() -> String {
    "/etc/strata/strata.yaml".to_string()
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the rollup driver with the specified configuration
    Run(RunCommand),
    /// Validate configuration file and exit
    ConfigCheck(ConfigCheckCommand),
}

#[derive(Args)]
struct RunCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
    /// the maximum time to wait, in seconds, for controlled shutdown
    #[clap(long, default_value_t = 30)]
    max_shutdown_delay: u16,
}

#[derive(Args)]
struct ConfigCheckCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
}

fn load_config(config_path: &str) -> Result<Config, Error> {
    if let Ok(contents) = env::var("STRATA_CONFIG") {
        debug!("Using config from env var 'STRATA_CONFIG'");
        Ok(Config::from_yaml(&contents)?)
    } else {
        debug!("Attempting to open configuration file at: {config_path}");
        Ok(Config::load(Path::new(config_path))?)
    }
}

async fn flush_capped(capped: Arc<LevelStores>, mut watcher: Watcher) {
    let mut ticker = interval(CAPPED_FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;

            () = watcher.recv() => {
                debug!("capped store flusher stopping");
                return;
            }
            _ = ticker.tick() => {
                if let Err(err) = capped.flush() {
                    warn!("capped store flush failed: {err}");
                }
            }
        }
    }
}

async fn inner_main(config: Config, max_shutdown_delay: Duration) -> Result<(), Error> {
    if let Some(addr) = config.telemetry.prometheus_addr {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!("prometheus exporter listening on {addr}");
    }

    std::fs::create_dir_all(&config.data_dir)?;
    let capped = Arc::new(LevelStores::open(
        &config.data_dir,
        &config.capped_store_sizes(),
    )?);
    let store = Arc::new(SqliteStore::open(
        config.data_dir.join("strata.db"),
        config.rollup_levels.len(),
    )?);
    let scheduler = Scheduler::new(store, Arc::clone(&capped), config.intervals(), config.limits());
    let coordinator = Coordinator::new(scheduler, RealClock, NoAlerts, config.coordinator.clone());

    let (shutdown_watcher, shutdown_broadcast) = strata_signal::signal();
    let flusher = tokio::spawn(flush_capped(Arc::clone(&capped), shutdown_watcher.register()?));
    let driver = tokio::spawn(coordinator.run(shutdown_watcher));

    match signal::ctrl_c().await {
        Ok(()) => info!("received ctrl-c"),
        Err(err) => error!("unable to listen for ctrl-c, shutting down: {err}"),
    }
    match shutdown_broadcast.signal_and_wait(max_shutdown_delay).await {
        Drain::Complete => {
            if let Err(err) = driver.await {
                error!("rollup driver did not exit cleanly: {err}");
            }
            if let Err(err) = flusher.await {
                error!("capped store flusher did not exit cleanly: {err}");
            }
        }
        Drain::Abandoned { peers } => {
            warn!(peers, "rollup driver still running, leaving it to runtime shutdown");
        }
    }
    capped.flush()?;
    Ok(())
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting strata {version}.");

    let run = match Cli::parse().command {
        Commands::Run(run) => run,
        Commands::ConfigCheck(check) => match load_config(&check.config_path) {
            Ok(_) => {
                info!("configuration is valid");
                return Ok(());
            }
            Err(err) => {
                error!("{err}");
                std::process::exit(1);
            }
        },
    };

    let config = load_config(&run.config_path)?;
    let max_shutdown_delay = Duration::from_secs(run.max_shutdown_delay.into());
    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(config, max_shutdown_delay));
    info!(
        "Shutting down runtime with a {} second delay. May leave orphaned tasks.",
        max_shutdown_delay.as_secs(),
    );
    runtime.shutdown_timeout(max_shutdown_delay);
    info!("Bye. :)");
    res
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, Commands};

    #[test]
    fn run_defaults() {
        let cli = Cli::try_parse_from(["strata", "run"]).expect("parse");
        let Commands::Run(run) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(run.config_path, "/etc/strata/strata.yaml");
        assert_eq!(run.max_shutdown_delay, 30);
    }

    #[test]
    fn config_check_takes_a_path() {
        let cli = Cli::try_parse_from(["strata", "config-check", "--config-path", "/tmp/s.yaml"]).expect("parse");
        assert!(matches!(cli.command, Commands::ConfigCheck(check) if check.config_path == "/tmp/s.yaml"));
    }
}
