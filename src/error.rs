use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("User credentials required")]
    CredentialsRequired,
    #[error("Invalid user credentials")]
    InvalidCredentials,
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{message}")]
    CsrfUnavailable {
        message: String,
        status: Option<u16>,
    },
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    UpstreamTimeout(String),
    #[error("{message}")]
    UpstreamBusiness {
        status: u16,
        message: String,
        raw: serde_json::Value,
    },
    #[error("{0}")]
    UpstreamUnreachable(String),
    #[error("{0}")]
    NotConfigured(String),
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    raw: Option<serde_json::Value>,
}

impl AppError {
    pub fn bad_request<T: Into<String>>(message: T) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn not_found<T: Into<String>>(message: T) -> Self {
        Self::NotFound(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::CredentialsRequired | AppError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            AppError::Validation(_) | AppError::BadRequest(_) | AppError::CsrfUnavailable { .. } => {
                StatusCode::BAD_REQUEST
            }
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::UpstreamTimeout(_) => StatusCode::REQUEST_TIMEOUT,
            AppError::UpstreamBusiness { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            AppError::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            AppError::NotConfigured(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Whether a gateway attempt that failed this way may be retried against the direct backend.
    pub fn allows_fallback(&self) -> bool {
        matches!(
            self,
            AppError::CsrfUnavailable { .. }
                | AppError::UpstreamTimeout(_)
                | AppError::UpstreamUnreachable(_)
        )
    }

    /// Render the error, attaching the error chain of internal failures when `diagnostics` is on.
    pub fn into_response_with(self, diagnostics: bool) -> Response {
        let status = self.status();
        let error = self.to_string();

        let (details, raw) = match self {
            AppError::CsrfUnavailable { status, .. } => {
                (status.map(|code| format!("Status: {code}")), None)
            }
            AppError::UpstreamBusiness { raw, .. } => (None, Some(raw)),
            AppError::Internal(source) => {
                tracing::error!(error = ?source, "unhandled error");
                (diagnostics.then(|| format!("{source:?}")), None)
            }
            _ => (None, None),
        };

        let body = ErrorBody {
            success: false,
            error,
            details,
            raw,
        };

        (status, Json(body)).into_response()
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        self.into_response_with(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_taxonomy_onto_status_codes() {
        assert_eq!(AppError::CredentialsRequired.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::InvalidCredentials.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            AppError::Validation("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::CsrfUnavailable {
                message: "none".into(),
                status: Some(200),
            }
            .status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::UpstreamTimeout("slow".into()).status(),
            StatusCode::REQUEST_TIMEOUT
        );
        assert_eq!(
            AppError::UpstreamBusiness {
                status: 503,
                message: "down".into(),
                raw: serde_json::Value::Null,
            }
            .status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::UpstreamUnreachable("refused".into()).status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn only_transport_and_csrf_failures_allow_fallback() {
        assert!(AppError::CsrfUnavailable {
            message: "none".into(),
            status: None,
        }
        .allows_fallback());
        assert!(AppError::UpstreamTimeout("slow".into()).allows_fallback());
        assert!(!AppError::UpstreamBusiness {
            status: 400,
            message: "bad".into(),
            raw: serde_json::Value::Null,
        }
        .allows_fallback());
        assert!(!AppError::Validation("x".into()).allows_fallback());
    }
}
