//! Request authorization for the job endpoints.
//!
//! The phase driver never checks credentials; the HTTP layer asks an
//! [`Authorizer`] before touching a job.

use crate::job::JobId;
use crate::{BackupError, Result};
use axum::http::{header, HeaderMap};

pub trait Authorizer: Send + Sync {
    /// Accept or reject `token` for operations on `job`
    fn authorize(&self, job: &JobId, token: &str) -> Result<()>;
}

/// Accepts one pre-shared token for every job. An empty configured token
/// rejects everything.
pub struct StaticTokenAuthorizer {
    token: String,
}

impl StaticTokenAuthorizer {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

impl Authorizer for StaticTokenAuthorizer {
    fn authorize(&self, job: &JobId, token: &str) -> Result<()> {
        if self.token.is_empty() || token != self.token {
            tracing::warn!("Rejected token for job {}", job);
            return Err(BackupError::Unauthorized("invalid token".to_string()));
        }
        Ok(())
    }
}

/// Token from an `Authorization: Bearer <token>` header
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}
