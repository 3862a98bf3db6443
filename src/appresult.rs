use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{message}")]
    Invalid {
        code: &'static str,
        message: String,
        hint: Option<String>,
    },

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn invalid(code: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            code,
            message: message.into(),
            hint: None,
        }
    }

    pub fn with_hint(self, hint: impl Into<String>) -> Self {
        match self {
            Self::Invalid { code, message, .. } => Self::Invalid {
                code,
                message,
                hint: Some(hint.into()),
            },
            other => other,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Invalid { code, .. } => code,
            Self::NotAuthenticated => "NOT_AUTHENTICATED",
            Self::Storage(_) => "SERVICE_ERROR",
            Self::Internal(_) => "INTERNAL",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Invalid { .. } => StatusCode::BAD_REQUEST,
            Self::NotAuthenticated => StatusCode::UNAUTHORIZED,
            Self::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Body of every failed REST call.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            Self::NotFound(what) => ErrorBody {
                code: "NOT_FOUND",
                message: format!("{what} not found."),
                hint: None,
            },
            Self::Invalid {
                code,
                message,
                hint,
            } => ErrorBody {
                code,
                message,
                hint,
            },
            Self::NotAuthenticated => ErrorBody {
                code: "NOT_AUTHENTICATED",
                message: "A valid session token is required.".to_owned(),
                hint: Some("Send `Authorization: Bearer <token>`.".to_owned()),
            },
            Self::Storage(err) => {
                tracing::error!(error = %err, "storage failure");
                ErrorBody {
                    code: "SERVICE_ERROR",
                    message: "The request could not be completed. Please try again.".to_owned(),
                    hint: None,
                }
            }
            Self::Internal(err) => {
                tracing::error!(error = ?err, "internal error");
                ErrorBody {
                    code: "INTERNAL",
                    message: "Internal server error.".to_owned(),
                    hint: None,
                }
            }
        };

        (status, Json(body)).into_response()
    }
}
