use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

use vigil_poller::backend::HttpBackend;
use vigil_poller::config;
use vigil_poller::dispatch::HttpDispatcher;
use vigil_poller::store::PgStore;
use vigil_poller::supervisor::{acquire_singleton_lock, Supervisor};
use vigil_poller::trigger::TriggerDiff;
use vigil_poller::worker::AdapterWorker;

struct Args {
    config_path: PathBuf,
}

fn parse_args() -> Args {
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("vigil-poller {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                println!("Usage: vigil-poller [OPTIONS]\n");
                println!("Options:");
                println!("  -c, --config <PATH>  Configuration file path");
                println!("  -V, --version        Print version");
                println!("  -h, --help           Print help");
                std::process::exit(0);
            }
            "--config" | "-c" => {
                let path = args.next().unwrap_or_else(|| {
                    eprintln!("error: --config requires a path argument");
                    std::process::exit(2);
                });
                return Args {
                    config_path: PathBuf::from(path),
                };
            }
            other => {
                eprintln!("error: unknown argument '{other}'");
                std::process::exit(2);
            }
        }
    }

    eprintln!("error: --config <path> is required");
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let args = parse_args();
    let cfg = config::load_from_file(&args.config_path)
        .with_context(|| format!("loading config from {}", args.config_path.display()))?;

    let Some(lock) = acquire_singleton_lock(Path::new(&cfg.lock_file))
        .with_context(|| format!("opening lock file {}", cfg.lock_file))?
    else {
        tracing::info!(lock_file = %cfg.lock_file, "another poller holds the lock, exiting");
        return Ok(());
    };

    let host = sysinfo::System::host_name().unwrap_or_else(|| "unknown".into());
    tracing::info!(%host, "vigil poller starting");

    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(&cfg.database_url)
        .await
        .context("connecting to database")?;
    let store = Arc::new(PgStore::new(pool));

    let backend = Arc::new(
        HttpBackend::new(
            Duration::from_secs(cfg.http_timeout_seconds),
            cfg.query_step.clone(),
        )
        .context("building backend HTTP client")?,
    );
    let dispatcher = Arc::new(HttpDispatcher::new(cfg.dispatch_url.clone()));

    let worker = Arc::new(AdapterWorker::new(
        store.clone(),
        TriggerDiff::new(store.clone()),
        backend,
        dispatcher,
        host.clone(),
    ));

    let supervisor = Supervisor::new(
        store,
        worker,
        Duration::from_secs(cfg.reap_interval_seconds),
        host,
    );
    supervisor.run().await.context("supervisor run failed")?;

    tracing::info!("vigil poller done");
    drop(lock);
    Ok(())
}
