pub mod handlers;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use meshgate_services::MemoryDirectory;

pub use handlers::ApiState;

fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Local control API, nested under `/api`.
pub fn api_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/status", get(handlers::handle_status))
        .route("/schema", get(handlers::handle_schema_list))
        .route("/daemon/shutdown", post(handlers::handle_shutdown))
        .with_state(state);

    Router::new().nest("/api", api_routes).layer(cors())
}

/// Directory records over HTTP, the counterpart of `HttpDirectory`.
pub fn directory_router(directory: MemoryDirectory) -> Router {
    Router::new()
        .route(
            "/records",
            get(handlers::handle_records_list).post(handlers::handle_record_publish),
        )
        .route("/records/{address}", get(handlers::handle_record_find))
        .with_state(directory)
        .layer(cors())
}

pub async fn serve(state: ApiState, port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "API listening on 127.0.0.1");
    axum::serve(listener, api_router(state)).await?;
    Ok(())
}

pub async fn serve_directory(directory: MemoryDirectory, port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    tracing::info!(port, "directory listening on 0.0.0.0");
    axum::serve(listener, directory_router(directory)).await?;
    Ok(())
}
