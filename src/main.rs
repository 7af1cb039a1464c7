use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use uuid::Uuid;

use parlor_server::auth;
use parlor_server::calls::lifecycle;
use parlor_server::calls::relay::RelayClient;
use parlor_server::config::{generate_config_template, Config};
use parlor_server::db;
use parlor_server::notify::{push::PushSender, Notifier};
use parlor_server::presence::PresenceRegistry;
use parlor_server::routes;
use parlor_server::state::AppState;
use parlor_server::ws;
use parlor_server::ws::rooms::RoomRouter;

/// Interval between presence-registry expiry sweeps.
const PRESENCE_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "parlor_server=info".parse().unwrap()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "parlor_server=info".parse().unwrap()),
            )
            .init();
    }

    tracing::info!("Parlor server v{} starting", env!("CARGO_PKG_VERSION"));

    // Initialize SQLite database
    let db = db::init_db(&config.data_dir)?;

    // Load or generate JWT signing key (256-bit random, stored in data_dir)
    let jwt_secret = auth::jwt::load_or_generate_jwt_secret(&config.data_dir)?;

    // Identifies this process's rows in the cross-process presence registry
    let process_id = Uuid::now_v7().to_string();

    let connections = ws::new_connection_registry();
    let rooms = Arc::new(RoomRouter::new());
    let presence = PresenceRegistry::new(db.clone(), process_id.clone());
    let push = PushSender::new(config.push.clone());
    let notifier = Notifier::new(db.clone(), rooms.clone(), connections.clone(), push);
    let relay = RelayClient::new(config.relay.clone());

    if relay.enabled() {
        tracing::info!("media relay provisioning enabled");
    } else {
        tracing::info!("media relay not configured, calls run signaling-only");
    }

    let app_state = AppState {
        db,
        jwt_secret,
        connections,
        rooms,
        presence,
        notifier,
        relay,
        calls_config: config.calls.clone(),
        process_id,
    };

    // Periodic sweep for presence rows left behind by crashed processes
    let presence_state = app_state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PRESENCE_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            match presence_state.presence.sweep_expired().await {
                Ok(0) => {}
                Ok(n) => tracing::info!(removed = n, "swept expired presence entries"),
                Err(e) => tracing::warn!(error = %e, "presence sweep failed"),
            }
        }
    });

    // Periodic sweep marking unanswered calls as missed
    let sweep_state = app_state.clone();
    let sweep_interval = Duration::from_secs(config.calls.sweep_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        loop {
            interval.tick().await;
            lifecycle::sweep_stale_calls(&sweep_state).await;
        }
    });

    // Build router
    let app = routes::build_router(app_state);

    // Bind and serve
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
