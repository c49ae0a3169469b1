use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::invoke::InvokeError;

/// Stable numeric codes carried in every error body; clients branch on these
/// rather than on messages.
const CODE_UNAUTHORIZED: u16 = 1;
const CODE_BAD_REQUEST: u16 = 2;
const CODE_GENERIC: u16 = 3;

#[derive(Debug, thiserror::Error)]
pub(super) enum ApiError {
    #[error("unauthorized: {reason}")]
    Unauthorized { reason: &'static str },
    #[error("bad request: {error_cause}")]
    BadRequest { error_cause: String },
    #[error(transparent)]
    Invoke(#[from] InvokeError),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized { .. } => StatusCode::FORBIDDEN,
            ApiError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::Invoke(
                InvokeError::Execution(_) | InvokeError::ContractNotFound(_),
            ) => StatusCode::BAD_REQUEST,
            ApiError::Invoke(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> u16 {
        match self {
            ApiError::Unauthorized { .. } => CODE_UNAUTHORIZED,
            ApiError::BadRequest { .. } => CODE_BAD_REQUEST,
            ApiError::Invoke(_) => CODE_GENERIC,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::warn!(error = %self, "request failed");
        let body = serde_json::json!({
            "errorCode": self.error_code(),
            "errorMessage": self.to_string(),
        });
        (self.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_the_error_class() {
        let unauthorized = ApiError::Unauthorized {
            reason: "missing token",
        };
        assert_eq!(unauthorized.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(unauthorized.error_code(), 1);

        let bad = ApiError::BadRequest {
            error_cause: "not json".into(),
        };
        assert_eq!(bad.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(bad.error_code(), 2);

        let rejected = ApiError::Invoke(InvokeError::Execution("rejected".into()));
        assert_eq!(rejected.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(rejected.error_code(), 3);

        let sync = ApiError::Invoke(InvokeError::WalletSyncTimeout { percent_synced: 42 });
        assert_eq!(sync.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(sync.to_string().contains("42/100"));
    }
}
