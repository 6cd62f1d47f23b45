//! Form Collab relay server
//!
//! Serves the per-room WebSocket fan-out used by the form builder's
//! collaborative editing: `/ws/:room`, `/ws?room=` and `/api/health`.

use anyhow::Context;
use tracing::info;

use form_collab::{relay, RelayHub, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "form_collab=info,tower_http=info".into()),
        )
        .init();

    let config = ServerConfig::from_env().context("Invalid server configuration")?;
    let addr = config.socket_addr();
    let app = relay::router(RelayHub::new());

    info!("Form collab relay v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Listening on: http://{}", addr);
    info!("   WebSocket: ws://{}/ws/:room", addr);
    info!("   Health check: http://{}/api/health", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
