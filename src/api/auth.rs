//! Bearer-token verification against the auth service's public key
//!
//! The orchestrator trusts the verified claims; it performs no user
//! management of its own. Production deployments verify RS256 signatures
//! with the auth service's public key; dev deployments may configure a
//! shared HS256 secret instead.

use super::error::ApiError;
use crate::config::AuthConfig;
use crate::error::{ConfigError, Result};
use axum::http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

/// The authenticated caller.
#[derive(Debug, Clone)]
pub struct Principal {
    pub subject: String,
    pub admin: bool,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    roles: Vec<String>,
}

pub struct AuthVerifier {
    key: DecodingKey,
    algorithm: Algorithm,
}

impl AuthVerifier {
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        if let Some(path) = &config.public_key_path {
            let pem = std::fs::read(path)?;
            let key = DecodingKey::from_rsa_pem(&pem).map_err(|e| {
                ConfigError::InvalidValue {
                    field: "auth.public_key_path".to_string(),
                    reason: e.to_string(),
                }
            })?;
            return Ok(Self {
                key,
                algorithm: Algorithm::RS256,
            });
        }
        if let Some(secret) = &config.dev_secret {
            return Ok(Self {
                key: DecodingKey::from_secret(secret.as_bytes()),
                algorithm: Algorithm::HS256,
            });
        }
        Err(ConfigError::MissingField(
            "auth.public_key_path or auth.dev_secret".to_string(),
        )
        .into())
    }

    pub fn verify(&self, token: &str) -> std::result::Result<Principal, ApiError> {
        let validation = Validation::new(self.algorithm);
        let data = decode::<Claims>(token, &self.key, &validation)
            .map_err(|e| ApiError::unauthorized(format!("token rejected: {e}")))?;
        Ok(Principal {
            subject: data.claims.sub,
            admin: data.claims.roles.iter().any(|r| r == "admin"),
        })
    }

    /// Pull and verify the bearer token from request headers.
    pub fn authenticate(&self, headers: &HeaderMap) -> std::result::Result<Principal, ApiError> {
        let header = headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::unauthorized("malformed authorization header"))?;
        self.verify(token)
    }
}
