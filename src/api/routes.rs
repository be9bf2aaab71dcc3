//--------------------------------------------------------------------------------------------------
// FUNCTIONS
//--------------------------------------------------------------------------------------------------
// | Name                  | Description                                   | Return Type         |
// |-----------------------|-----------------------------------------------|---------------------|
// | health                | Health check, empty 200                       | StatusCode          |
// | stream_unavailable    | Stream path reached without a raw socket      | ApiResult<()>       |
//--------------------------------------------------------------------------------------------------

use axum::http::StatusCode;

use super::{ApiError, ApiResult};

/// Health check endpoint
pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// The stream endpoint needs the raw socket, which only the listener can
/// hand out. Requests that reach the router for it (for instance a second
/// request on a keep-alive connection) are refused.
pub async fn stream_unavailable() -> ApiResult<()> {
    Err(ApiError::HijackingUnsupported)
}
