//! Giles archiver binary.
//!
//! Usage:
//!   giles --config giles.toml [--log-level debug]
//!
//! Exit codes: 0 on clean shutdown, 1 when the configuration is missing or
//! invalid, 2 when the engine or metadata store cannot be reached at startup.

use clap::Parser;
use giles::archiver::Archiver;
use giles::config::{Config, EngineKind};
use giles::error::{GilesError, Result};
use giles::frontends::{self, ShutdownSignal};
use giles::metadata::{MemoryMetadataStore, MetadataStore};
use giles::pool::{ConnectionPool, TcpConnector};
use giles::tsengine::{BtrdbClient, MemoryTimeseries, TimeseriesStore};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// How long frontends get to finish in-flight work after the shutdown signal.
const FRONTEND_DRAIN: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "giles")]
#[command(about = "Time-series archiver with coalesced ingest and continuous queries", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "giles.toml")]
    config: PathBuf,

    /// Overrides `[archiver] log_level`. `RUST_LOG` overrides both.
    #[arg(short, long)]
    log_level: Option<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("giles: {}", e);
            return ExitCode::from(1);
        }
    };
    giles::logging::init(args.log_level.as_deref().unwrap_or(&config.archiver.log_level));

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Cannot start the async runtime");
            return ExitCode::from(2);
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Giles stopped");
            ExitCode::from(exit_code(&e))
        }
    }
}

fn exit_code(err: &GilesError) -> u8 {
    match err {
        GilesError::Config(_) => 1,
        _ => 2,
    }
}

fn open_metadata(config: &Config) -> Result<Arc<dyn MetadataStore>> {
    if let Some(address) = &config.mongo.address {
        warn!(%address, "External metadata stores are not bundled; using the in-process store");
    }
    let store = match &config.mongo.snapshot {
        Some(path) => MemoryMetadataStore::open(path)
            .map_err(|e| GilesError::FatalStartup(format!("cannot open metadata snapshot: {}", e)))?,
        None => MemoryMetadataStore::new(),
    };
    Ok(Arc::new(store))
}

async fn open_engine(config: &Config) -> Result<Arc<dyn TimeseriesStore>> {
    match config.archiver.engine {
        EngineKind::Memory => {
            info!("Using the in-process time-series engine");
            Ok(Arc::new(MemoryTimeseries::new()))
        }
        EngineKind::Btrdb => {
            let connector = TcpConnector::new(config.btrdb.address.clone());
            let pool = ConnectionPool::new(connector, config.btrdb.connections, config.btrdb.backoff()).await?;
            info!(address = %config.btrdb.address, connections = config.btrdb.connections, "Connected to the time-series engine");
            Ok(Arc::new(BtrdbClient::new(Arc::new(pool))))
        }
    }
}

fn spawn_frontends(
    config: &Config,
    archiver: &Arc<Archiver>,
    shutdown: &ShutdownSignal,
    tasks: &mut JoinSet<Result<()>>,
) {
    if config.http.enabled {
        let addr = format!("{}:{}", config.http.address, config.http.port);
        let (archiver, shutdown) = (Arc::clone(archiver), shutdown.clone());
        tasks.spawn(async move { frontends::http::start_server(&addr, archiver, shutdown).await });
    }
    if config.websocket.enabled {
        let addr = format!("{}:{}", config.websocket.address, config.websocket.port);
        let capacity = config.archiver.subscriber_capacity;
        let (archiver, shutdown) = (Arc::clone(archiver), shutdown.clone());
        tasks.spawn(async move { frontends::websocket::start_server(&addr, archiver, capacity, shutdown).await });
    }
    if config.tcpjson.enabled {
        let addr = format!("{}:{}", config.tcpjson.address, config.tcpjson.port);
        let (archiver, shutdown) = (Arc::clone(archiver), shutdown.clone());
        tasks.spawn(async move { frontends::tcpjson::start_server(&addr, archiver, shutdown).await });
    }
    if config.bosswave.enabled {
        let section = config.bosswave.clone();
        let (archiver, shutdown) = (Arc::clone(archiver), shutdown.clone());
        tasks.spawn(async move { frontends::bus::run(section, archiver, shutdown).await });
    }
    if config.msgpackudp.enabled {
        warn!(port = config.msgpackudp.port, "The MsgPack/UDP frontend is not available in this build");
    }
}

fn spawn_profiler(config: &Config, archiver: &Arc<Archiver>, mut shutdown: ShutdownSignal) {
    if !config.profile.enabled {
        return;
    }
    let archiver = Arc::clone(archiver);
    let mut ticker = tokio::time::interval(config.profile.interval());
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stats = archiver.stats();
                    info!(
                        target: "giles::profile",
                        stats = %serde_json::to_string(&stats).unwrap_or_default(),
                        "Archiver statistics"
                    );
                }
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
        }
    });
}

async fn run(config: Config) -> Result<()> {
    let metadata = open_metadata(&config)?;
    let engine = open_engine(&config).await?;
    let archiver = Arc::new(Archiver::new(metadata, engine, config.archiver.options())?);

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();
    spawn_frontends(&config, &archiver, &stop_rx, &mut tasks);
    spawn_profiler(&config, &archiver, stop_rx.clone());
    info!(frontends = tasks.len(), "Giles started");

    let mut outcome = Ok(());
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "Cannot listen for the interrupt signal");
            }
            info!("Shutdown signal received");
        }
        Some(joined) = tasks.join_next() => {
            outcome = match joined {
                Ok(result) => result,
                Err(e) => Err(GilesError::FatalStartup(format!("frontend task failed: {}", e))),
            };
        }
    }

    let _ = stop_tx.send(true);
    let drained = tokio::time::timeout(FRONTEND_DRAIN, async {
        while let Some(joined) = tasks.join_next().await {
            if let Ok(Err(e)) = joined {
                warn!(error = %e, "Frontend stopped with error");
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!("Frontends did not stop in time");
        tasks.abort_all();
    }

    archiver.shutdown().await?;
    info!("Giles stopped cleanly");
    outcome
}
