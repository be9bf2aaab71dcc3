//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Plain HTTP side of the server, built with Axum. Everything except the hijacked stream endpoint
// is answered here.
//
// | Component      | Description                                                |
// |----------------|------------------------------------------------------------|
// | router         | Builds the Router: health checks and the stream fallback   |
// | Routes         | Handler functions for the endpoints                        |
// | Error          | API error types                                            |
//
//--------------------------------------------------------------------------------------------------

mod error;
mod routes;

use axum::{
    Router,
    routing::{any, get},
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

pub use error::{ApiError, ApiResult};

/// Creates all routes for the API
///
/// # Arguments
/// * `stream_path` - Path of the event stream; must not be `/` or `/health`
/// * `cors` - Echo the caller's origin and allow credentials
pub fn router(stream_path: &str, cors: bool) -> Router {
    let router = Router::new()
        // Health check
        .route("/", get(routes::health))
        .route("/health", get(routes::health))
        // Stream requests the listener did not take over
        .route(stream_path, any(routes::stream_unavailable))
        .layer(TraceLayer::new_for_http());

    if cors {
        router.layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::mirror_request())
                .allow_credentials(true),
        )
    } else {
        router
    }
}
