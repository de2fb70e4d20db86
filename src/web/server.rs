//! Web server using Axum.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

use super::router::create_app_router;
use super::AppState;
use crate::bus::EventBus;
use crate::config::Settings;
use crate::core::{FacadeOptions, RoutingFacade, SystemClock};
use crate::error::{Error, Result};
use crate::identity::JwtGateway;
use crate::store::SqliteStore;
use crate::sweeper::ExpirySweeper;

/// Open the configured store and wire the engine around it.
pub fn build_facade(settings: &Settings) -> Result<Arc<RoutingFacade>> {
    let path = settings.database_path()?;
    let store = SqliteStore::open(
        &path,
        Duration::from_millis(settings.database.busy_timeout_ms),
    )?;
    let gateway = JwtGateway::new(&settings.auth.jwt_secret, settings.auth.token_ttl_secs);

    Ok(Arc::new(RoutingFacade::new(
        Arc::new(store),
        Arc::new(gateway),
        Arc::new(EventBus::new(settings.presence.channel_capacity)),
        Arc::new(SystemClock),
        FacadeOptions::from_settings(settings),
    )))
}

/// Run the web server and the typing sweeper until Ctrl+C.
pub async fn run_server(settings: Settings) -> Result<()> {
    let facade = build_facade(&settings)?;

    let sweeper = Arc::new(ExpirySweeper::new(
        facade.clone(),
        Duration::from_secs(settings.presence.sweep_interval_secs.max(1)),
    ));
    let sweeper_task = {
        let sweeper = sweeper.clone();
        tokio::spawn(async move {
            if let Err(e) = sweeper.start().await {
                tracing::error!("Typing sweeper error: {}", e);
            }
        })
    };

    let state = AppState::new(facade, settings.queue.default_limit);
    let app = create_app_router(state, settings.web.max_body_bytes).layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    );

    let addr: SocketAddr = format!("{}:{}", settings.web.host, settings.web.port)
        .parse()
        .map_err(|e| Error::Config(format!("Invalid address: {}", e)))?;

    tracing::info!("Starting web server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown requested");
        })
        .await?;

    sweeper.stop().await;
    sweeper_task.abort();
    Ok(())
}
