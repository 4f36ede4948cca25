use axum::{
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::api::handler::{
    abandon_nonces, create_claim, get_claim, health_check, list_nonces, run_settlement,
    settlement_stats, AppState,
};

pub fn create_app(state: AppState) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let app = Router::new()
        // Public health check endpoint
        .route("/health", get(health_check))
        .nest(
            "/api/v1",
            Router::new()
                // Claim endpoints
                .route("/claims", post(create_claim))
                .route("/claims/:id", get(get_claim))
                // Settlement endpoints
                .route("/settlement/run", post(run_settlement))
                .route("/settlement/stats", get(settlement_stats))
                // Admin endpoints
                .route("/admin/nonces", get(list_nonces))
                .route("/admin/nonces/abandon", post(abandon_nonces)),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::very_permissive())
                .layer(CompressionLayer::new()),
        )
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(
    app: Router,
    bind_address: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app).await?;
    Ok(())
}
