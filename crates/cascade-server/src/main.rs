use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use cascade::config::{apply_env_overrides, validate_config};
use cascade::db::default_database_path;
use cascade::{load_config, Config, Database, HttpGenerator};
use cascade_server::{build_router, AppState, Services};

#[derive(Debug, Parser)]
#[command(name = "cascade-server", version, about = "Resumable job orchestration server")]
struct Args {
    /// Config file (JSON or YAML). Defaults apply when omitted.
    #[arg(short, long, env = "CASCADE_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `server.port`.
    #[arg(short, long)]
    port: Option<u16>,
}

fn load(args: &Args) -> Result<Config, cascade::ConfigError> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => {
            let mut config = Config::default();
            apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
            config
        }
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }
    validate_config(&config)?;
    Ok(config)
}

fn open_database(config: &Config) -> Result<Database, Box<dyn std::error::Error>> {
    let path = match &config.database.path {
        Some(path) => PathBuf::from(path),
        None => default_database_path().ok_or("Could not determine home directory")?,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    log::info!("Using database at {:?}", path);
    Ok(Database::open(&path)?)
}

/// Runs the sweeper on a fixed interval until the process exits.
fn spawn_sweeper(state: AppState, every: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick fires immediately; recover leftovers from a crash.
        loop {
            ticker.tick().await;
            match state.sweeper.sweep(false).await {
                Ok(report) if !report.requeued.is_empty() => state.wake_workers(),
                Ok(_) => {}
                Err(e) => log::error!("Sweep failed: {}", e),
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    log::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let config = load(&args)?;
    cascade::logging::init(&config.logging);

    log::info!("Starting cascade-server v{}", env!("CARGO_PKG_VERSION"));

    let db = open_database(&config)?;
    let generator = Arc::new(HttpGenerator::from_config(
        &config.collaborator,
        &config.retry,
    )?);

    let Services {
        state,
        pool,
        sweep_interval,
    } = Services::build(&config, db, generator)?;

    if let Some(every) = sweep_interval {
        spawn_sweeper(state.clone(), every);
    }

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("Listening on {}", addr);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(pool) = pool {
        log::info!("Stopping workers");
        pool.shutdown();
        tokio::task::spawn_blocking(move || pool.wait()).await?;
    }

    Ok(())
}
