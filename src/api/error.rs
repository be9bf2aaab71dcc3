//--------------------------------------------------------------------------------------------------
// ENUMS
//--------------------------------------------------------------------------------------------------
// | Name            | Description                                      | Key Methods         |
// |-----------------|--------------------------------------------------|---------------------|
// | ApiError        | Errors answered by the HTTP router               | into_response       |
//--------------------------------------------------------------------------------------------------

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::inbounds::HIJACKING_ERROR;

/// Type alias for Result with ApiError
pub type ApiResult<T> = Result<T, ApiError>;

/// API-specific error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The stream endpoint was reached through the router, which cannot hand
    /// out the raw socket
    #[error("{}", HIJACKING_ERROR)]
    HijackingUnsupported,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::HijackingUnsupported => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_display() {
        assert_eq!(
            ApiError::HijackingUnsupported.to_string(),
            "webserver doesn't support hijacking"
        );
        assert_eq!(
            ApiError::HijackingUnsupported.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
