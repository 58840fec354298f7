use std::path::PathBuf;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use scanbroker_core::api::{ErrorBody, ERR_INCOMPATIBLE, ERR_INTERNAL, ERR_INVALID_SECRET};
use thiserror::Error;

/// Outcome of resolving a scope secret that did not yield a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("invalid scope secret")]
    InvalidSecret,
    #[error("scope currently unavailable")]
    Unavailable,
}

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("manager unreachable: {0}")]
    Connectivity(String),
    #[error("manager rejected the privilege secret")]
    Unauthorized,
    #[error("manager returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("undecodable manager response: {0}")]
    Decode(String),
}

impl ManagerError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, ManagerError::Connectivity(_))
    }
}

impl From<reqwest::Error> for ManagerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return ManagerError::Decode(e.to_string());
        }
        if let Some(status) = e.status() {
            return match status.as_u16() {
                401 | 403 => ManagerError::Unauthorized,
                code => ManagerError::Status {
                    status: code,
                    body: e.to_string(),
                },
            };
        }
        ManagerError::Connectivity(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Errors surfaced to agents. Internal details are never included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("{}", ERR_INVALID_SECRET)]
    InvalidSecret,
    #[error("{}", ERR_INCOMPATIBLE)]
    Incompatible,
    #[error("{}", ERR_INTERNAL)]
    Internal,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidSecret => StatusCode::FORBIDDEN,
            ApiError::Incompatible => StatusCode::BAD_REQUEST,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}
