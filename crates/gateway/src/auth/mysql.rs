//! MySQL table authentication.
//!
//! Counts rows in `MYSQL_AUTH_TABLE` whose username and password columns match
//! the supplied credentials. Table and column names come from configuration
//! and are checked once at startup; the credentials themselves are bound as
//! query parameters.

use super::{AuthMode, AuthOutcome, Authenticator};
use crate::config::MysqlConfig;
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use tracing::info;

pub struct MysqlAuth {
    pool: MySqlPool,
    query: String,
}

impl MysqlAuth {
    pub async fn connect(config: &MysqlConfig) -> Result<Self> {
        let query = build_query(
            &config.auth_table,
            &config.field_username,
            &config.field_password,
        )?;

        info!("Connecting to MySQL at {}:{}", config.host, config.port);
        let options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.database);
        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_open.max(1))
            .connect_with(options)
            .await?;
        info!("Connected to MySQL");

        Ok(Self { pool, query })
    }
}

#[async_trait]
impl Authenticator for MysqlAuth {
    fn mode(&self) -> AuthMode {
        AuthMode::Mysql
    }

    async fn authenticate(&self, username: &str, password: &str) -> Result<AuthOutcome> {
        let matches = sqlx::query_scalar::<_, i64>(&self.query)
            .bind(username)
            .bind(password)
            .fetch_one(&self.pool)
            .await?;
        if matches > 0 {
            Ok(AuthOutcome::Granted)
        } else {
            Ok(AuthOutcome::UnknownAccount)
        }
    }
}

/// Build the credential query, rejecting unsafe identifiers.
fn build_query(table: &str, username_field: &str, password_field: &str) -> Result<String> {
    for (key, value) in [
        ("MYSQL_AUTH_TABLE", table),
        ("MYSQL_AUTH_FIELD_USERNAME", username_field),
        ("MYSQL_AUTH_FIELD_PASSWORD", password_field),
    ] {
        if !is_identifier(value) {
            return Err(GatewayError::Config(format!(
                "{} is not a valid identifier: `{}`",
                key, value
            )));
        }
    }
    Ok(format!(
        "SELECT count(1) FROM `{}` WHERE `{}` = ? AND `{}` = ?",
        table, username_field, password_field
    ))
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}
