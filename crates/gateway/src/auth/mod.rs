//! Credential verification for `/mqtt` admission.
//!
//! The backend is chosen by `HOST_AUTH`:
//!
//! | mode    | username              | password                 |
//! |---------|-----------------------|--------------------------|
//! | `open`  | ignored               | ignored                  |
//! | `redis` | account key           | `password` hash field    |
//! | `mysql` | username column       | password column          |
//! | `wjt`   | signed token          | ignored                  |

pub mod mysql;
pub mod redis;
pub mod token;

use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;

pub use self::mysql::MysqlAuth;
pub use self::redis::RedisAccounts;
pub use self::token::TokenAuth;

/// Authentication backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Open,
    Redis,
    Mysql,
    Token,
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::Open => "open",
            AuthMode::Redis => "redis",
            AuthMode::Mysql => "mysql",
            AuthMode::Token => "wjt",
        }
    }

    /// Whether admission requires a non-empty username.
    pub fn requires_username(&self) -> bool {
        !matches!(self, AuthMode::Open)
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthMode {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "open" => Ok(AuthMode::Open),
            "redis" => Ok(AuthMode::Redis),
            "mysql" => Ok(AuthMode::Mysql),
            "wjt" => Ok(AuthMode::Token),
            other => Err(GatewayError::Config(format!("unknown HOST_AUTH mode `{}`", other))),
        }
    }
}

/// Result of checking a credential pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Granted,
    /// No such account.
    UnknownAccount,
    /// Account exists but the credential is wrong.
    Denied(String),
}

/// Verifies admission credentials.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    fn mode(&self) -> AuthMode;

    /// Backend failures are `Err`; a rejected credential is `Ok`.
    async fn authenticate(&self, username: &str, password: &str) -> Result<AuthOutcome>;
}

/// Admits everyone.
pub struct OpenAuth;

#[async_trait]
impl Authenticator for OpenAuth {
    fn mode(&self) -> AuthMode {
        AuthMode::Open
    }

    async fn authenticate(&self, _username: &str, _password: &str) -> Result<AuthOutcome> {
        Ok(AuthOutcome::Granted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_auth_mode() {
        assert_eq!("".parse::<AuthMode>().unwrap(), AuthMode::Open);
        assert_eq!("Redis".parse::<AuthMode>().unwrap(), AuthMode::Redis);
        assert_eq!("mysql".parse::<AuthMode>().unwrap(), AuthMode::Mysql);
        assert_eq!("wjt".parse::<AuthMode>().unwrap(), AuthMode::Token);
        assert!("ldap".parse::<AuthMode>().is_err());
        assert!(!AuthMode::Open.requires_username());
        assert!(AuthMode::Token.requires_username());
    }

    #[tokio::test]
    async fn test_open_admits_anyone() {
        assert_eq!(
            OpenAuth.authenticate("", "").await.unwrap(),
            AuthOutcome::Granted
        );
    }
}
