//! alertwatch service entry point.

use alertwatch::alert::AlertAgent;
use alertwatch::bus::{Bus, MemoryBus};
use alertwatch::config::{AgentConfig, ServerConfig};
use alertwatch::db::Store;
use alertwatch::scheduler::TickScheduler;
use alertwatch::web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("alertwatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting alertwatch {} on port {}...", cfg.identity, cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    let agent_config = AgentConfig::load(&cfg.config_path, cfg.config_path_explicit)?;
    tracing::info!(
        "Loaded {} group(s) from {} (local={}, remote={})",
        agent_config.groups.len(),
        cfg.config_path,
        agent_config.publish.publish_local,
        agent_config.publish.publish_remote,
    );

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
    let agent = Arc::new(AlertAgent::start(
        agent_config,
        &cfg.identity,
        store.clone(),
        bus.clone(),
    ));

    // Start ticking
    let scheduler = TickScheduler::new(agent.clone());
    scheduler.start().await;

    // Serve until Ctrl-C
    let server = Server::new(cfg, agent.clone(), bus, store);
    let served = server
        .start(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutting down");
        })
        .await;

    scheduler.stop().await;
    agent.shutdown()?;
    served
}
