use std::sync::Arc;
use std::time::Duration;

use axum::extract::Request;
use axum::ServiceExt;
use tokio::sync::RwLock;
use tower::Layer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::normalize_path::NormalizePathLayer;
use tracing::{error, info};

use edmo_backend::backend::{EdmoBackend, SharedBackend};
use edmo_backend::handlers;
use edmo_backend::serial_link::SerialConfig;
use edmo_backend::tasks::load_tasks;
use edmo_backend::udp_link::UdpConfig;

/// Floor of the supervisor tick; the loop never runs faster than this.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "edmo_backend=info".into()),
        )
        .init();

    info!(
        "🤖 EDMO Backend v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    // Process-wide task catalog, shared by every session
    let catalog = load_tasks("tasks.json").await;

    // Transports; a UDP bind failure is the one fatal startup condition
    let backend =
        EdmoBackend::new(SerialConfig::default(), UdpConfig::default(), catalog, "./SessionLogs")
            .await?;
    let shared: SharedBackend = Arc::new(RwLock::new(backend));

    // HTTP: CORS allow-all, no trailing slashes
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let app = handlers::router(shared.clone()).layer(cors);
    let app = NormalizePathLayer::trim_trailing_slash().layer(app);

    let port = std::env::var("PORT").unwrap_or_else(|_| "8080".to_string());
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("🚀 Listening on {addr}");

    tokio::spawn(async move {
        let service = ServiceExt::<Request>::into_make_service(app);
        if let Err(e) = axum::serve(listener, service).await {
            error!("http server: {e}");
        }
    });

    // Supervisor tick loop: transports, sessions and a concurrent rate floor.
    // Ctrl-C breaks out for a graceful shutdown.
    let mut shutdown = Box::pin(tokio::signal::ctrl_c());
    loop {
        let floor = tokio::time::sleep(TICK_INTERVAL);
        shared.write().await.update().await;
        tokio::select! {
            _ = &mut shutdown => break,
            _ = floor => {}
        }
    }

    info!("Shutting down gracefully...");
    shared.write().await.close().await;
    Ok(())
}
