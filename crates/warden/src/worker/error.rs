use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Errors returned by the worker's file routes.
#[derive(Error, Debug)]
pub enum WorkerHttpError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Path is outside root directory")]
    PathTraversal,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

impl IntoResponse for WorkerHttpError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            WorkerHttpError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            WorkerHttpError::PathTraversal => (StatusCode::FORBIDDEN, "PATH_TRAVERSAL"),
            WorkerHttpError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR"),
        };

        let body = ErrorResponse {
            error: self.to_string(),
            code,
        };

        (status, Json(body)).into_response()
    }
}
