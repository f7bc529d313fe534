//! Gateway configuration loaded from the environment.
//!
//! `main` loads `.env` with dotenvy first, so every key below can live either
//! in the process environment or in that file.

use crate::auth::AuthMode;
use crate::error::{GatewayError, Result};
use amqp_client::{AmqpEndpoint, BrokerConfig, DEFAULT_RECONNECT_DELAY};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// HTTP listener settings.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub name: String,
    pub port: u16,
    /// Enables per-request tracing.
    pub debug: bool,
    pub auth: AuthMode,
    pub metrics_port: u16,
}

#[derive(Debug, Clone)]
pub struct RabbitConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Queue client publishes go to.
    pub publish_topic: String,
    /// Queue the gateway consumes.
    pub subscribe_topic: String,
    pub topology_file: Option<PathBuf>,
    pub reconnect_delay: Duration,
    pub wait_limit: Option<Duration>,
}

impl RabbitConfig {
    pub fn endpoint(&self) -> AmqpEndpoint {
        AmqpEndpoint {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
            vhost: self.vhost.clone(),
        }
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            reconnect_delay: self.reconnect_delay,
            wait_limit: self.wait_limit,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub db: i64,
    /// Prepended to every account key.
    pub prefix: String,
}

impl RedisConfig {
    pub fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}:{}/{}", self.host, self.port, self.db)
        } else {
            format!(
                "redis://:{}@{}:{}/{}",
                self.password, self.host, self.port, self.db
            )
        }
    }
}

#[derive(Debug, Clone)]
pub struct MysqlConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub max_open: u32,
    pub auth_table: String,
    pub field_username: String,
    pub field_password: String,
}

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub secret: String,
    pub expire: Duration,
    pub issuer: String,
}

/// Complete gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: HostConfig,
    pub rabbitmq: RabbitConfig,
    pub redis: RedisConfig,
    pub mysql: MysqlConfig,
    pub token: TokenConfig,
}

impl Config {
    /// Read configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let host = HostConfig {
            name: env.string("HOST_NAME", "gateway"),
            port: env.parse("HOST_PORT", 8000)?,
            debug: env.flag("HOST_DEBUG", true)?,
            auth: env.string("HOST_AUTH", "open").parse()?,
            metrics_port: env.parse("METRICS_PORT", 9093)?,
        };

        let rabbitmq = RabbitConfig {
            host: env.string("RABBITMQ_HOST", "localhost"),
            port: env.parse("RABBITMQ_PORT", 5672)?,
            user: env.string("RABBITMQ_USER", "guest"),
            password: env.string("RABBITMQ_PASSWORD", "guest"),
            vhost: env.string("RABBITMQ_VHOST", "/"),
            publish_topic: env.required("RABBITMQ_PUBLISH_TOPIC")?,
            subscribe_topic: env.required("RABBITMQ_SUBSCRIBE_TOPIC")?,
            topology_file: env.optional("RABBITMQ_TOPOLOGY_FILE").map(PathBuf::from),
            reconnect_delay: Duration::from_secs(
                env.parse("RABBITMQ_RECONNECT_DELAY", DEFAULT_RECONNECT_DELAY.as_secs())?,
            ),
            wait_limit: env
                .optional("RABBITMQ_WAIT_LIMIT")
                .map(|raw| parse_value::<u64>("RABBITMQ_WAIT_LIMIT", &raw))
                .transpose()?
                .map(Duration::from_secs),
        };

        let redis = RedisConfig {
            host: env.string("REDIS_HOST", "localhost"),
            port: env.parse("REDIS_PORT", 6379)?,
            password: env.string("REDIS_PASSWD", ""),
            db: env.parse("REDIS_DB", 0)?,
            prefix: env.string("REDIS_PREFIX", ""),
        };

        let mysql = MysqlConfig {
            host: env.string("MYSQL_HOST", "localhost"),
            port: env.parse("MYSQL_PORT", 3306)?,
            user: env.string("MYSQL_USER", "root"),
            password: env.string("MYSQL_PASSWD", ""),
            database: env.string("MYSQL_DATABASE", ""),
            max_open: env.parse("MYSQL_MAX_OPEN", 10)?,
            auth_table: env.string("MYSQL_AUTH_TABLE", ""),
            field_username: env.string("MYSQL_AUTH_FIELD_USERNAME", "username"),
            field_password: env.string("MYSQL_AUTH_FIELD_PASSWORD", "password"),
        };

        let token = TokenConfig {
            secret: env.string("WJT_SECRET", ""),
            expire: parse_expire(&env.string("WJT_EXPIRE", "5m"))?,
            issuer: env.string("WJT_ISSUER", "gateway"),
        };

        if host.auth == AuthMode::Token && token.secret.is_empty() {
            return Err(GatewayError::Config(
                "WJT_SECRET must be set when HOST_AUTH=wjt".to_string(),
            ));
        }

        Ok(Self {
            host,
            rabbitmq,
            redis,
            mysql,
            token,
        })
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn required(&self, key: &str) -> Result<String> {
        self.optional(key)
            .ok_or_else(|| GatewayError::Config(format!("{} must be set", key)))
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
        match self.optional(key) {
            Some(raw) => parse_value(key, &raw),
            None => Ok(default),
        }
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool> {
        match self.optional(key).map(|v| v.to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
            Some(v) => Err(GatewayError::Config(format!(
                "{} must be a boolean, got `{}`",
                key, v
            ))),
        }
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| GatewayError::Config(format!("{} has invalid value `{}`", key, raw)))
}

/// Parse a token lifetime such as `300s`, `5m`, `1h` or `1h30m`. A bare
/// number is seconds.
pub fn parse_expire(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let invalid = || GatewayError::Config(format!("WJT_EXPIRE has invalid value `{}`", raw));
    if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
        let seconds: u64 = raw.parse().map_err(|_| invalid())?;
        return if seconds == 0 {
            Err(invalid())
        } else {
            Ok(Duration::from_secs(seconds))
        };
    }

    let mut seconds: u64 = 0;
    let mut rest = raw;
    while !rest.is_empty() {
        let split = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(invalid)?;
        let (digits, tail) = rest.split_at(split);
        let amount: u64 = digits.parse().map_err(|_| invalid())?;
        let scale = match tail.as_bytes()[0] {
            b's' => 1,
            b'm' => 60,
            b'h' => 3600,
            _ => return Err(invalid()),
        };
        seconds = amount
            .checked_mul(scale)
            .and_then(|part| seconds.checked_add(part))
            .ok_or_else(invalid)?;
        rest = &tail[1..];
    }
    if seconds == 0 {
        return Err(invalid());
    }
    Ok(Duration::from_secs(seconds))
}
