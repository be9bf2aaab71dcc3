//--------------------------------------------------------------------------------------------------
// TEST MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Integration tests for the HTTP router: health checks, the stream path reached without a
// hijackable socket, and CORS.
//--------------------------------------------------------------------------------------------------

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use tower::ServiceExt;

use eventsource_server::api;
use eventsource_server::inbounds::HIJACKING_ERROR;

const STREAM_PATH: &str = "/subscribe";

fn setup_test_router(cors: bool) -> Router {
    api::router(STREAM_PATH, cors)
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    // Setup
    let app = setup_test_router(true);

    for path in ["/", "/health"] {
        // Execute
        let response = app
            .clone()
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();

        // Verify
        assert_eq!(response.status(), StatusCode::OK, "path {}", path);
        assert_eq!(body_text(response).await, "");
    }
}

#[tokio::test]
async fn test_stream_path_without_hijacking() {
    // Setup
    let app = setup_test_router(true);

    // Execute
    let response = app
        .oneshot(
            Request::builder()
                .uri("/subscribe?channels=orders")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    // Verify
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_text(response).await, HIJACKING_ERROR);
}

#[tokio::test]
async fn test_unknown_path_is_not_found() {
    // Setup
    let app = setup_test_router(false);

    // Execute
    let response = app
        .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
        .await
        .unwrap();

    // Verify
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cors_echoes_the_origin() {
    // Setup
    let app = setup_test_router(true);

    // Execute
    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .header(header::ORIGIN, "https://app.example")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    // Verify
    let headers = response.headers();
    assert_eq!(
        headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
        "https://app.example"
    );
    assert_eq!(
        headers.get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS).unwrap(),
        "true"
    );
}

#[tokio::test]
async fn test_cors_disabled_sends_no_headers() {
    // Setup
    let app = setup_test_router(false);

    // Execute
    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .header(header::ORIGIN, "https://app.example")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    // Verify
    assert!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .is_none()
    );
}
