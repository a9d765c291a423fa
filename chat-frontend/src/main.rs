use chat_core::observability::init_tracing;
use chat_frontend::config::get_configuration;
use chat_frontend::startup::build_router;
use chat_frontend::AppState;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let configuration = get_configuration().map_err(|e| {
        eprintln!("Failed to read configuration: {}", e);
        anyhow::anyhow!("Configuration error: {}", e)
    })?;

    init_tracing("chat-frontend", &configuration.telemetry)?;

    chat_frontend::services::metrics::init_metrics()
        .map_err(|e| anyhow::anyhow!("Failed to register metrics: {}", e))?;

    let state = AppState::from_settings(&configuration)?;
    spawn_sweeper(
        state.clone(),
        Duration::from_secs(configuration.server.sweep_interval_secs),
        Duration::from_secs(configuration.server.session_idle_hours.max(1) as u64 * 3600),
    );

    let app = build_router(state);

    let address = format!(
        "{}:{}",
        configuration.server.host, configuration.server.port
    );
    let listener = tokio::net::TcpListener::bind(&address).await.map_err(|e| {
        tracing::error!("Failed to bind TCP listener to {}: {}", address, e);
        anyhow::anyhow!("Failed to bind to address {}: {}", address, e)
    })?;

    info!("Starting chat-frontend on {}", address);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|e| {
        tracing::error!("Server error: {}", e);
        anyhow::anyhow!("Server error: {}", e)
    })?;

    Ok(())
}

/// Periodically drop idle chat sessions and expired cached grants.
fn spawn_sweeper(state: AppState, every: Duration, idle: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let sessions = state.sessions.sweep_idle(idle);
            let grants = state.chat.identity().broker().evict_expired();
            if sessions > 0 || grants > 0 {
                info!(sessions, grants, active = state.sessions.len(), "Swept idle state");
            }
        }
    });
}
