use std::{net::SocketAddr, sync::Arc};

use knowledge_exchange_mcp::{
    auth::StaticTokenValidator,
    build_app,
    config::{Config, SingleExchange},
    exchange::{Exchange, ExchangeStore, InMemoryExchangeStore},
    logging,
    provisioning::{spawn_sandbox_reconciler, Provisioner},
    registry::AdapterRegistry,
    sandbox::{runtime::DockerCli, SandboxManager},
    session::{spawn_idle_sweeper, SessionManager},
    AppState,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();

    let config = Config::from_env()?;
    let bind_socket = config.bind_socket()?;

    let store: Arc<dyn ExchangeStore> = Arc::new(load_store(&config).await?);
    let registry = Arc::new(AdapterRegistry::with_builtin_backends());

    // A single-exchange instance is itself the sandbox; it never nests.
    let sandbox = (config.sandbox.enabled && config.single_exchange.is_none()).then(|| {
        Arc::new(SandboxManager::new(
            config.sandbox.clone(),
            Arc::new(DockerCli::default()),
            config.api_tokens_env(),
        ))
    });

    let provisioner = Arc::new(Provisioner::new(
        Arc::clone(&registry),
        Arc::clone(&store),
        sandbox,
    ));
    let activated = provisioner.activate_all().await?;
    let total = store.list().await?.len();
    if activated < total {
        warn!(activated, total, "some exchanges failed to activate");
    }

    let sessions = Arc::new(SessionManager::new(config.session.clone()));
    let shutdown = CancellationToken::new();
    let sweeper = spawn_idle_sweeper(Arc::clone(&sessions), shutdown.clone());
    let reconciler = spawn_sandbox_reconciler(Arc::clone(&provisioner), shutdown.clone());

    let state = AppState::new(
        store,
        registry,
        Arc::clone(&sessions),
        provisioner,
        Arc::new(StaticTokenValidator::new(&config.api_tokens)),
        config.public_base_url.clone(),
        config.sandbox.host.clone(),
    );
    let app = build_app(state);
    let listener = tokio::net::TcpListener::bind(bind_socket).await?;

    info!(
        bind_addr = %config.bind_addr,
        bind_port = config.bind_port,
        public_base_url = %config.public_base_url,
        exchanges = total,
        sandboxing = config.sandbox.enabled,
        "server starting"
    );

    let signal = shutdown.clone();
    let closing = Arc::clone(&sessions);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for shutdown signal");
        }
        signal.cancel();
        // Closing sessions ends their open streams.
        let closed = closing.shutdown();
        info!(sessions_closed = closed, "shutdown requested");
    })
    .await?;

    shutdown.cancel();
    let _ = sweeper.await;
    if let Some(reconciler) = reconciler {
        let _ = reconciler.await;
    }
    info!("server stopped");
    Ok(())
}

async fn load_store(config: &Config) -> Result<InMemoryExchangeStore, Box<dyn std::error::Error>> {
    if let Some(single) = &config.single_exchange {
        return Ok(InMemoryExchangeStore::from_exchanges(vec![single_exchange(
            single,
        )])?);
    }

    match &config.exchanges_file {
        Some(path) => {
            let store = InMemoryExchangeStore::load(path).await?;
            info!(path = %path.display(), "exchanges loaded");
            Ok(store)
        }
        None => {
            warn!("EXCHANGES_FILE is not set; starting without exchanges");
            Ok(InMemoryExchangeStore::new())
        }
    }
}

fn single_exchange(single: &SingleExchange) -> Exchange {
    let mut exchange =
        Exchange::new(single.slug.clone(), single.backend.clone(), single.config.clone()).trusted();
    if let Some(id) = single.id {
        exchange.id = id;
    }
    exchange
}
