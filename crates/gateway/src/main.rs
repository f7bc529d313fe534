//! Gateway service entry point.
//!
//! WebSocket gateway multiplexing client connections onto an AMQP broker.

use amqp_client::{BrokerClient, LapinTransport, Topology};
use anyhow::{Context, Result};
use gateway::{
    create_router, AppState, AuthMode, Authenticator, Config, ConnectionConfig,
    ConnectionRegistry, MessageRouter, MysqlAuth, OpenAuth, RedisAccounts, RouterConfig,
    SubscriptionRouter, TokenAuth,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Gateway service");

    let config = Config::from_env().context("loading configuration")?;
    let rabbitmq = &config.rabbitmq;

    info!("Configuration:");
    info!("  HOST_NAME: {}", config.host.name);
    info!("  HOST_PORT: {}", config.host.port);
    info!("  HOST_AUTH: {}", config.host.auth);
    info!("  METRICS_PORT: {}", config.host.metrics_port);
    info!("  RABBITMQ: {}:{}", rabbitmq.host, rabbitmq.port);
    info!("  RABBITMQ_PUBLISH_TOPIC: {}", rabbitmq.publish_topic);
    info!("  RABBITMQ_SUBSCRIBE_TOPIC: {}", rabbitmq.subscribe_topic);

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.host.metrics_port))
        .install()
        .context("starting Prometheus exporter")?;
    info!(
        "Prometheus metrics server started on port {}",
        config.host.metrics_port
    );

    let topology = match &rabbitmq.topology_file {
        Some(path) => Topology::load_list(path)
            .with_context(|| format!("loading topology from {}", path.display()))?,
        None => Vec::new(),
    };

    let broker = BrokerClient::init(
        Arc::new(LapinTransport::new(rabbitmq.endpoint())),
        rabbitmq.broker_config(),
        &topology,
    )
    .await
    .context("connecting to AMQP broker")?;

    let router = Arc::new(MessageRouter::new(
        broker.clone(),
        Arc::new(SubscriptionRouter::new()),
        RouterConfig {
            publish_topic: rabbitmq.publish_topic.clone(),
            subscribe_topic: rabbitmq.subscribe_topic.clone(),
        },
    ));
    router
        .start()
        .await
        .context("subscribing to inbound queue")?;

    let mut accounts = None;
    let mut tokens = None;
    let auth: Arc<dyn Authenticator> = match config.host.auth {
        AuthMode::Open => Arc::new(OpenAuth),
        AuthMode::Redis => {
            let store = Arc::new(
                RedisAccounts::connect(&config.redis)
                    .await
                    .context("connecting to Redis")?,
            );
            accounts = Some(store.clone());
            store
        }
        AuthMode::Mysql => Arc::new(
            MysqlAuth::connect(&config.mysql)
                .await
                .context("connecting to MySQL")?,
        ),
        AuthMode::Token => {
            let issuer = Arc::new(TokenAuth::new(&config.token));
            tokens = Some(issuer.clone());
            issuer
        }
    };
    if auth.mode() == AuthMode::Open {
        warn!("HOST_AUTH=open: every client is admitted without credentials");
    }

    let registry = Arc::new(ConnectionRegistry::new());
    let state = Arc::new(AppState {
        registry: registry.clone(),
        router,
        auth,
        accounts,
        tokens,
        connection: ConnectionConfig::default(),
        host_name: config.host.name.clone(),
        debug: config.host.debug,
    });
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.host.port));
    let listener = TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", addr);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
    }

    info!("Closing {} client connection(s)", registry.len());
    registry.clear();
    broker.close().await;

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
