//! Bearer-token authentication.
//!
//! Tokens are configured statically; each grants one role and acts as one
//! subject (an admin id or a driver id).

use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts};

use super::error::AppError;
use super::state::AppState;
use crate::config::Role;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub role: Role,
    pub subject: String,
}

impl Caller {
    /// Forbid callers whose role is not in `allowed`.
    pub fn require(&self, allowed: &[Role]) -> Result<&str, AppError> {
        if allowed.contains(&self.role) {
            Ok(&self.subject)
        } else {
            Err(AppError::Forbidden(format!(
                "role {:?} may not call this endpoint",
                self.role
            )))
        }
    }
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    let value = parts.headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

impl FromRequestParts<AppState> for Caller {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .ok_or_else(|| AppError::Unauthorized("missing bearer token".to_string()))?;
        let grant = state
            .tokens
            .get(token)
            .ok_or_else(|| AppError::Unauthorized("unknown token".to_string()))?;
        Ok(Caller {
            role: grant.role,
            subject: grant.subject.clone(),
        })
    }
}
