use std::{env, path::PathBuf};

use clap::{Args, Parser, Subcommand};
use jemallocator::Jemalloc;
use metrics_exporter_prometheus::PrometheusBuilder;
use surge::{
    broker::mqtt::Mqtt,
    config::{self, Config},
    engine::{self, Engine},
};
use tokio::{
    runtime::Builder,
    signal,
    task::JoinError,
    time::{Duration, sleep},
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Failed to load surge config: {0}")]
    Config(#[from] config::Error),
    #[error("Surge engine returned an error: {0}")]
    Engine(#[from] engine::Error),
    #[error("Could not join the engine task: {0}")]
    Join(#[from] JoinError),
    #[error("Failed to install prometheus exporter: {0}")]
    Prometheus(#[from] metrics_exporter_prometheus::BuildError),
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run surge with specified configuration
    Run(RunCommand),
    /// Validate configuration and exit
    ConfigCheck(ConfigCheckCommand),
}

#[derive(Args)]
struct RunCommand {
    /// path on disk to the configuration file, overridden by `SURGE_CONFIG`
    #[clap(long)]
    config_path: Option<PathBuf>,
    /// the time, in seconds, to run before shutting down; unbounded if unset
    #[clap(long)]
    experiment_duration_seconds: Option<u64>,
    /// the maximum time to wait, in seconds, for controlled shutdown
    #[clap(long, default_value_t = 30)]
    max_shutdown_delay: u16,
}

#[derive(Args)]
struct ConfigCheckCommand {
    /// path on disk to the configuration file, overridden by `SURGE_CONFIG`
    #[clap(long)]
    config_path: Option<PathBuf>,
}

fn load_config(path: Option<&PathBuf>) -> Result<Config, Error> {
    Config::load(path.map(PathBuf::as_path), |key| env::var(key).ok()).map_err(|err| {
        error!("Configuration validation failed: {err}");
        Error::Config(err)
    })
}

async fn inner_main(config: Config, experiment_duration: Option<Duration>) -> Result<(), Error> {
    if let Some(addr) = config.prometheus_addr {
        info!("Serving prometheus metrics on {addr}");
        PrometheusBuilder::new().with_http_listener(addr).install()?;
    }

    let (shutdown_watcher, shutdown_broadcast) = surge_signal::signal();
    let connector = Mqtt::new(config.broker.clone());
    let mut engine = tokio::spawn(Engine::new(config, connector, shutdown_watcher).run());

    let experiment = async {
        match experiment_duration {
            Some(duration) => sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(experiment);

    let early_exit = tokio::select! {
        res = signal::ctrl_c() => {
            if let Err(err) = res {
                error!("Could not listen for ctrl-c: {err}");
            }
            info!("received ctrl-c");
            None
        }
        () = &mut experiment => {
            info!("experiment duration exceeded, signaling for shutdown");
            None
        }
        res = &mut engine => Some(res),
    };

    shutdown_broadcast.signal_and_wait().await;
    let res = match early_exit {
        Some(res) => res,
        None => engine.await,
    };
    res??;
    Ok(())
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting surge {version} run.");

    let args = match Cli::parse().command {
        Commands::Run(args) => args,
        Commands::ConfigCheck(check) => match load_config(check.config_path.as_ref()) {
            Ok(config) => {
                info!("Configuration is valid: {config:?}");
                std::process::exit(0)
            }
            Err(_) => std::process::exit(1),
        },
    };

    let config = load_config(args.config_path.as_ref())?;
    info!("Effective configuration: {config:?}");

    let experiment_duration = args.experiment_duration_seconds.map(Duration::from_secs);
    let max_shutdown_delay = Duration::from_secs(args.max_shutdown_delay.into());

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(config, experiment_duration));
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
    use super::*;

    #[test]
    fn run_arguments_parse() {
        let cli = Cli::try_parse_from([
            "surge",
            "run",
            "--config-path",
            "/etc/surge/surge.yaml",
            "--experiment-duration-seconds",
            "600",
        ])
        .expect("valid arguments");
        let Commands::Run(run) = cli.command else {
            panic!("expected run subcommand");
        };
        assert_eq!(
            run.config_path,
            Some(PathBuf::from("/etc/surge/surge.yaml"))
        );
        assert_eq!(run.experiment_duration_seconds, Some(600));
        assert_eq!(run.max_shutdown_delay, 30);
    }

    #[test]
    fn run_is_unbounded_by_default() {
        let cli = Cli::try_parse_from(["surge", "run"]).expect("valid arguments");
        let Commands::Run(run) = cli.command else {
            panic!("expected run subcommand");
        };
        assert!(run.config_path.is_none());
        assert!(run.experiment_duration_seconds.is_none());
    }

    #[test]
    fn config_check_parses() {
        let cli = Cli::try_parse_from(["surge", "config-check", "--config-path", "surge.yaml"])
            .expect("valid arguments");
        assert!(matches!(cli.command, Commands::ConfigCheck(_)));
    }

    #[test]
    fn unknown_subcommand_is_rejected() {
        assert!(Cli::try_parse_from(["surge", "blast"]).is_err());
    }
}
