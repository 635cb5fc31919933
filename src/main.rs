mod app_state;
mod bus;
mod cardconfig;
mod config;
mod crypto;
mod db;
mod error;
mod handlers;
mod identity;
mod lightning;
mod limits;
mod nostr;
mod payment_requests;
mod subscription;
mod suuid;
mod verifier;

use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use app_state::{AppState, ModuleKeys};
use bus::{EventBus, HttpEventBus};
use config::Config;
use db::{init_pool, registry};
use identity::{HttpIdentityApi, IdentityApi};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lawallet_card_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Parse configuration and key material
    let config = Arc::new(Config::parse());
    let keypair = config.keypair()?;
    let aes_k1 = config.aes_key()?;
    // Fail fast on a malformed DEFAULT_LIMITS value.
    config.default_limit_list()?;

    // Initialize database
    let pool = init_pool(&config.database_url).await?;
    registry::seed_merchants(&pool, &config.default_trusted_merchant_list()).await?;

    // External collaborators
    let bus: Arc<dyn EventBus> = Arc::new(HttpEventBus::new(&config.lawallet_api_base_url)?);
    let identity: Arc<dyn IdentityApi> =
        Arc::new(HttpIdentityApi::new(&config.identity_provider_api_base)?);

    // Create shared state
    let state = AppState {
        pool,
        config: config.clone(),
        keys: Arc::new(ModuleKeys {
            keypair,
            pubkey: config.nostr_public_key.clone(),
            aes_k1,
        }),
        bus,
        identity,
    };

    // Background work: config-change consumer and expired-token collector
    tokio::spawn(subscription::run(state.clone()));
    tokio::spawn(collect_garbage(state.clone()));

    // Build router
    let app = Router::new()
        .route(
            "/ntag424",
            post(handlers::ntag424::initialize)
                .patch(handlers::ntag424::associate)
                .delete(handlers::ntag424::delete),
        )
        .route("/card", post(handlers::card::card_request))
        .route("/card/scan", get(handlers::scan::scan))
        .route(
            "/card/pay",
            get(handlers::pay::withdraw_callback).post(handlers::pay::extended_withdraw),
        )
        .route("/card/data/request", post(handlers::config::card_data_request))
        .route(
            "/card/config/request",
            post(handlers::config::card_config_request),
        )
        .route("/card/publish-data", post(handlers::config::publish_data))
        .route("/card/reset/request", post(handlers::reset::reset_request))
        .route("/card/reset/claim", post(handlers::reset::reset_claim))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.socket_addr()).await?;

    tracing::info!("Server running on {}", config.socket_addr());
    tracing::info!("Callback base: {}", config.base_url);

    axum::serve(listener, app).await?;

    Ok(())
}

async fn collect_garbage(state: AppState) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    loop {
        ticker.tick().await;
        if let Err(err) = registry::collect_garbage(
            &state.pool,
            state.config.payment_request_expiry_seconds,
            config::RESET_TOKEN_TTL_SECS,
        )
        .await
        {
            tracing::warn!(error = %err, "garbage collection failed");
        }
    }
}
