use crate::BackupError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Backup(BackupError::Unauthorized(_)) => StatusCode::UNAUTHORIZED,
            ApiError::Backup(BackupError::JobNotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Backup(BackupError::NotComplete(_)) => StatusCode::CONFLICT,
            ApiError::Backup(BackupError::InvalidJobId(_))
            | ApiError::Backup(BackupError::UnrecoverableCheckpoint { .. }) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let msg = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Internal error: {self}");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };
        (status, Json(json!({ "error": msg }))).into_response()
    }
}
