//! Bearer-token authentication for the ingress.
//!
//! Every `/api/*` route requires a valid HS256 JWT signed with `JWT_SECRET`.
//! Fleet-administration routes (`/api/servers*`) additionally require the
//! `admin` role claim. Token issuance happens elsewhere; this module only
//! validates.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::ApiError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    pub iat: usize,
    pub role: Option<String>,
}

pub struct AuthState {
    decoding: DecodingKey,
    validation: Validation,
}

impl AuthState {
    pub fn new(secret: &str) -> Arc<Self> {
        Arc::new(Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        })
    }
}

/// Validates the `Authorization: Bearer` header and stashes the claims in
/// the request extensions for downstream role checks.
pub async fn require_auth(
    State(auth): State<Arc<AuthState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    let claims = decode::<Claims>(token, &auth.decoding, &auth.validation)
        .map_err(|err| {
            tracing::debug!("rejected bearer token: {}", err);
            ApiError::Unauthorized
        })?
        .claims;

    request.extensions_mut().insert(claims);

    Ok(next.run(request).await)
}

/// Rejects requests whose validated claims lack the `admin` role.
pub async fn require_admin(request: Request, next: Next) -> Result<Response, ApiError> {
    let is_admin = request
        .extensions()
        .get::<Claims>()
        .and_then(|claims| claims.role.as_deref())
        .map(|role| role == "admin")
        .unwrap_or(false);

    if !is_admin {
        return Err(ApiError::Forbidden);
    }

    Ok(next.run(request).await)
}
