//! SmartBuket Ingest API Library

pub mod config;
pub mod error;
pub mod ingest;
mod routes;

use axum::Router;
use axum::extract::FromRef;
use smartbuket_core::CoreConfig;
use sqlx::PgPool;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: CoreConfig,
}

impl FromRef<AppState> for PgPool {
    fn from_ref(state: &AppState) -> Self {
        state.pool.clone()
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        routes::health::health_check,
        routes::events::ingest_events,
        routes::privacy::opt_out,
        routes::privacy::privacy_delete,
    ),
    components(
        schemas(
            routes::health::HealthResponse,
            routes::privacy::OptOutResponse,
            routes::privacy::PrivacyDeleteResponse,
            ingest::IngestOutcome,
            ingest::RejectedDocument,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "ingest", description = "Event ingestion"),
        (name = "privacy", description = "Opt-out and data deletion"),
    )
)]
pub struct ApiDoc;

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(routes::health::routes())
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(routes::events::routes())
        .merge(routes::privacy::routes())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        uri = %request.uri(),
                    )
                })
                .on_response(
                    |response: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     _span: &tracing::Span| {
                        tracing::info!(
                            latency_ms = %latency.as_millis(),
                            status = %response.status(),
                            "finished processing request"
                        );
                    },
                ),
        )
        .with_state(state)
}

/// Run the ingest API server
///
/// Starts the HTTP server and blocks until it exits.
pub async fn run_api(state: AppState, config: &config::Config) -> Result<(), std::io::Error> {
    let app = create_router(state);
    let addr = format!("{}:{}", config.host, config.port);

    tracing::info!("Ingest API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await
}
