use anyhow::{Context as _, Result};

use clap::Parser;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use voters::{
    config::{Cli, Command, Config},
    store::VoterStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let cmd = cli.command.clone().unwrap_or(Command::Run);

    match cmd {
        Command::Run => run_server(cli.config).await,
        Command::Ping => ping(&cli.config).await,
    }
}

async fn connect_store(config: &Config) -> Result<VoterStore> {
    VoterStore::connect(config)
        .await
        .with_context(|| format!("connect {:?} backend", config.backend))
}

async fn ping(config: &Config) -> Result<()> {
    let store = connect_store(config).await?;
    let voters = store.list_voters().await.context("list voters")?;
    println!("{}: ok, {} voter(s)", store.medium_name(), voters.len());
    Ok(())
}

async fn run_server(config: Config) -> Result<()> {
    // A medium that is unreachable at startup is fatal; we never serve against it.
    let store = connect_store(&config).await?;

    let app = voters::http::build_router(store.clone())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    info!(
        bind = %config.bind,
        backend = store.medium_name(),
        "starting voters"
    );
    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("bind {}", config.bind))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).compact().init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
