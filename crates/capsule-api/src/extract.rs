//! Request extractors: verified identity and client address.

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use std::net::SocketAddr;
use tracing::debug;

use capsule_auth::{AuthError, Identity};
use capsule_guard::Viewer;

use crate::error::ApiError;
use crate::state::AppState;

fn bearer(parts: &Parts) -> Option<&str> {
    let value = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
}

/// A verified caller. Rejects with 401 when the token is absent or invalid.
pub struct AuthUser(pub Identity);

impl AuthUser {
    pub fn viewer(&self) -> Viewer {
        Viewer {
            user: Some(self.0.user_id.clone()),
            moderator: self.0.moderator,
        }
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer(parts).ok_or(AuthError::MissingToken)?;
        let identity = state.verifier.verify(token).await?;
        Ok(AuthUser(identity))
    }
}

/// An optional caller. A missing token is anonymous; a present but invalid
/// one is still rejected.
pub struct MaybeAuth(pub Option<Identity>);

impl MaybeAuth {
    pub fn viewer(&self) -> Viewer {
        match &self.0 {
            Some(identity) => Viewer {
                user: Some(identity.user_id.clone()),
                moderator: identity.moderator,
            },
            None => Viewer::anonymous(),
        }
    }
}

impl FromRequestParts<AppState> for MaybeAuth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        match bearer(parts) {
            Some(token) => Ok(MaybeAuth(Some(state.verifier.verify(token).await?))),
            None => Ok(MaybeAuth(None)),
        }
    }
}

/// Client address for per-IP limits: the first `X-Forwarded-For` hop,
/// else the socket peer, else `unknown`.
pub struct ClientIp(pub String);

impl<S: Send + Sync> FromRequestParts<S> for ClientIp {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(String::from);
        let ip = forwarded
            .or_else(|| {
                parts
                    .extensions
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip().to_string())
            })
            .unwrap_or_else(|| "unknown".to_string());
        debug!(client_ip = %ip, "client address");
        Ok(ClientIp(ip))
    }
}
