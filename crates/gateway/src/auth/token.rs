//! Signed-token (HS256 JWT) authentication and issuance.
//!
//! In token mode the admission `username` carries the token itself.

use super::{AuthMode, AuthOutcome, Authenticator};
use crate::config::TokenConfig;
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Token payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "ID")]
    pub id: i64,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

pub struct TokenAuth {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    expire: Duration,
}

impl TokenAuth {
    pub fn new(config: &TokenConfig) -> Self {
        Self {
            encoding: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.secret.as_bytes()),
            issuer: config.issuer.clone(),
            expire: config.expire,
        }
    }

    /// Sign a token for `id`, valid for the configured lifetime.
    pub fn issue(&self, id: i64) -> Result<String> {
        let now = Utc::now().timestamp();
        let exp = i64::try_from(self.expire.as_secs())
            .ok()
            .and_then(|lifetime| now.checked_add(lifetime))
            .ok_or_else(|| {
                GatewayError::Config(format!(
                    "token lifetime of {}s is out of range",
                    self.expire.as_secs()
                ))
            })?;
        let claims = Claims {
            id,
            iss: self.issuer.clone(),
            iat: now,
            exp,
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }

    /// Check signature, issuer and expiry.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[self.issuer.as_str()]);
        let data = decode::<Claims>(token, &self.decoding, &validation)?;
        Ok(data.claims)
    }
}

#[async_trait]
impl Authenticator for TokenAuth {
    fn mode(&self) -> AuthMode {
        AuthMode::Token
    }

    async fn authenticate(&self, username: &str, _password: &str) -> Result<AuthOutcome> {
        match self.verify(username) {
            Ok(claims) => {
                debug!("Token accepted for id {}", claims.id);
                Ok(AuthOutcome::Granted)
            }
            Err(e) => Ok(AuthOutcome::Denied(e.to_string())),
        }
    }
}
