//! Call distributor service
//!
//! Connects to Redis, PostgreSQL and Kafka, rebuilds the agent pool, runs the
//! assignment and agent sync loops, and serves the distributor health endpoint
//! and the agent WebSocket gateway until Ctrl-C or SIGTERM.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use call_engine::broker::KafkaBroker;
use call_engine::delivery::CredentialVerifier;
use call_engine::logging::{setup_logging, LoggingConfig};
use call_engine::pool::RedisAgentPool;
use call_engine::server::{
    agent_router, distributor_router, serve, AgentGatewayState, DistributorHealth,
};
use call_engine::store::PostgresCallStore;
use call_engine::{CallEngineConfig, Distributor};

#[derive(Debug, Parser)]
#[command(name = "distributor", version, about = "Round-robin call distributor")]
struct Args {
    /// Configuration file (TOML, YAML or JSON); environment variables still apply on top
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address of the health endpoint
    #[arg(long)]
    distributor_addr: Option<SocketAddr>,

    /// Bind address of the agent WebSocket gateway
    #[arg(long)]
    agent_addr: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = CallEngineConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.distributor_addr {
        config.server.distributor_addr = addr;
    }
    if let Some(addr) = args.agent_addr {
        config.server.agent_addr = addr;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if args.json_logs {
        config.logging.json = true;
    }
    config.validate()?;

    setup_logging(&LoggingConfig::from_section(&config.logging, "distributor")?)?;

    let pool = Arc::new(
        RedisAgentPool::connect(config.pool.connection_info()?, config.pool.key.clone())
            .await
            .context("Failed to connect to Redis")?,
    );
    let store = Arc::new(
        PostgresCallStore::connect(&config.database.url(), config.database.max_connections)
            .await
            .context("Failed to connect to database")?,
    );
    let broker = Arc::new(
        KafkaBroker::connect(&config.broker.brokers).context("Failed to create Kafka clients")?,
    );

    let shutdown = CancellationToken::new();

    let mut distributor = Distributor::builder()
        .with_pool(pool)
        .with_publisher(broker.clone())
        .with_subscriber(broker.clone())
        .with_store(store.clone())
        .with_broker_config(config.broker.clone())
        .with_assignment_mode(config.assignment.mode)
        .with_cancellation(shutdown.child_token())
        .build()?;

    let pooled = distributor
        .bootstrap()
        .await
        .context("Failed to sync agents to the pool")?;
    info!("👥 {} agents available at startup", pooled);

    distributor.start().await.context("Failed to start consumer loops")?;

    let gateway = AgentGatewayState::new(
        broker,
        store,
        CredentialVerifier::new(&config.server.jwt_secret),
        shutdown.clone(),
    )
    .with_group_prefix(config.broker.bridge_group_prefix.clone());

    let distributor_listener = TcpListener::bind(config.server.distributor_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.distributor_addr))?;
    let agent_listener = TcpListener::bind(config.server.agent_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.agent_addr))?;

    let servers = [
        spawn_server(
            distributor_listener,
            distributor_router(DistributorHealth::new(&distributor)),
            shutdown.clone(),
        ),
        spawn_server(agent_listener, agent_router(gateway), shutdown.clone()),
    ];

    info!("✅ Distributor ready");

    tokio::select! {
        _ = shutdown_signal() => info!("Shutdown signal received"),
        _ = shutdown.cancelled() => {}
    }

    shutdown.cancel();
    distributor.stop().await;
    for server in servers {
        if let Err(e) = server.await {
            error!("Server task ended abnormally: {}", e);
        }
    }

    info!("👋 Distributor exited");
    Ok(())
}

fn spawn_server(
    listener: TcpListener,
    router: axum::Router,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = serve(listener, router, shutdown.clone()).await {
            error!("{}", e);
            shutdown.cancel();
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
