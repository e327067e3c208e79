//! Caller identity verification.
//!
//! Identity is established upstream. In `api_key` mode a trusted caller
//! presents the shared key and forwards the acting user in `X-User-Id`; in
//! `jwt` mode the bearer token's `sub` claim is the user id.

use axum::async_trait;
use axum::extract::FromRef;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use clap::ValueEnum;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ApiError;

pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "snake_case")]
pub enum AuthMode {
    ApiKey,
    Jwt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JwtKeyKind {
    Secret,
    Rsa,
    Ec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lowercase")]
pub enum JwtAlgorithm {
    Hs256,
    Hs384,
    Hs512,
    Rs256,
    Es256,
}

impl JwtAlgorithm {
    pub fn key_kind(self) -> JwtKeyKind {
        match self {
            JwtAlgorithm::Hs256 | JwtAlgorithm::Hs384 | JwtAlgorithm::Hs512 => JwtKeyKind::Secret,
            JwtAlgorithm::Rs256 => JwtKeyKind::Rsa,
            JwtAlgorithm::Es256 => JwtKeyKind::Ec,
        }
    }

    fn algorithm(self) -> Algorithm {
        match self {
            JwtAlgorithm::Hs256 => Algorithm::HS256,
            JwtAlgorithm::Hs384 => Algorithm::HS384,
            JwtAlgorithm::Hs512 => Algorithm::HS512,
            JwtAlgorithm::Rs256 => Algorithm::RS256,
            JwtAlgorithm::Es256 => Algorithm::ES256,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub mode: AuthMode,
    pub api_key: Option<String>,
    pub jwt_secret: Option<String>,
    pub jwt_public_key: Option<String>,
    pub jwt_algorithm: JwtAlgorithm,
}

impl AuthConfig {
    pub fn api_key(key: &str) -> Self {
        Self {
            mode: AuthMode::ApiKey,
            api_key: Some(key.to_string()),
            jwt_secret: None,
            jwt_public_key: None,
            jwt_algorithm: JwtAlgorithm::Hs256,
        }
    }

    /// Reject configurations that could never authenticate anyone.
    pub fn validate(&self) -> Result<(), ApiError> {
        match self.mode {
            AuthMode::ApiKey if self.api_key.as_deref().is_none_or(str::is_empty) => Err(
                ApiError::BadRequest("BIDVET_API_KEY is required when AUTH_MODE=api_key".into()),
            ),
            AuthMode::Jwt => match self.jwt_algorithm.key_kind() {
                JwtKeyKind::Secret if self.jwt_secret.is_none() => Err(ApiError::BadRequest(
                    "JWT_SECRET is required when AUTH_MODE=jwt with symmetric algorithms".into(),
                )),
                JwtKeyKind::Rsa | JwtKeyKind::Ec if self.jwt_public_key.is_none() => {
                    Err(ApiError::BadRequest(
                        "JWT_PUBLIC_KEY is required when AUTH_MODE=jwt with asymmetric algorithms"
                            .into(),
                    ))
                }
                _ => Ok(()),
            },
            AuthMode::ApiKey => Ok(()),
        }
    }
}

/// The verified acting user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[allow(dead_code)]
    exp: Option<usize>,
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    AuthConfig: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let config = AuthConfig::from_ref(state);

        match config.mode {
            AuthMode::ApiKey => authorize_api_key(parts, &config),
            AuthMode::Jwt => authorize_jwt(parts, &config),
        }
    }
}

fn parse_user_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| ApiError::Unauthorized("user id is not a valid uuid".into()))
}

fn authorize_api_key(parts: &Parts, config: &AuthConfig) -> Result<AuthUser, ApiError> {
    let expected = config
        .api_key
        .as_deref()
        .ok_or_else(|| ApiError::Unauthorized("missing BIDVET_API_KEY".into()))?;

    let provided = parts
        .headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("missing X-API-Key header".into()))?;

    if provided != expected {
        return Err(ApiError::Unauthorized("invalid API key".into()));
    }

    let user = parts
        .headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("missing X-User-Id header".into()))?;

    Ok(AuthUser {
        user_id: parse_user_id(user)?,
    })
}

fn decoding_key(config: &AuthConfig) -> Result<DecodingKey, ApiError> {
    let missing = |what: &str| ApiError::Unauthorized(format!("missing {what}"));
    match config.jwt_algorithm.key_kind() {
        JwtKeyKind::Secret => {
            let secret = config.jwt_secret.as_deref().ok_or_else(|| missing("JWT_SECRET"))?;
            Ok(DecodingKey::from_secret(secret.as_bytes()))
        }
        JwtKeyKind::Rsa => {
            let pem = config.jwt_public_key.as_deref().ok_or_else(|| missing("JWT_PUBLIC_KEY"))?;
            DecodingKey::from_rsa_pem(pem.as_bytes())
                .map_err(|err| ApiError::Unauthorized(format!("invalid JWT_PUBLIC_KEY: {err}")))
        }
        JwtKeyKind::Ec => {
            let pem = config.jwt_public_key.as_deref().ok_or_else(|| missing("JWT_PUBLIC_KEY"))?;
            DecodingKey::from_ec_pem(pem.as_bytes())
                .map_err(|err| ApiError::Unauthorized(format!("invalid JWT_PUBLIC_KEY: {err}")))
        }
    }
}

fn authorize_jwt(parts: &Parts, config: &AuthConfig) -> Result<AuthUser, ApiError> {
    let header = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("missing Authorization header".into()))?;

    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::Unauthorized("expected Bearer token".into()))?;

    let validation = Validation::new(config.jwt_algorithm.algorithm());
    let data = decode::<Claims>(token, &decoding_key(config)?, &validation)
        .map_err(|err| ApiError::Unauthorized(format!("invalid token: {err}")))?;

    Ok(AuthUser {
        user_id: parse_user_id(&data.claims.sub)?,
    })
}
