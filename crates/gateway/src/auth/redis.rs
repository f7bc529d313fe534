//! Redis-backed accounts.
//!
//! Each account is a hash stored under `<REDIS_PREFIX><username>` with at
//! least a `password` field. Accounts may carry an expiry.

use super::{AuthMode, AuthOutcome, Authenticator};
use crate::config::RedisConfig;
use crate::error::Result;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::HashMap;
use tracing::{debug, info};

/// Hash field holding the account password.
pub const PASSWORD_FIELD: &str = "password";

/// Request field carrying the expiry in seconds; never stored.
pub const EXPIRE_FIELD: &str = "expire_time";

/// Account store and authenticator on Redis.
pub struct RedisAccounts {
    conn: MultiplexedConnection,
    prefix: String,
}

impl RedisAccounts {
    /// Connect and verify the server answers.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        info!("Connecting to Redis at {}:{}", config.host, config.port);
        let client = redis::Client::open(config.url())?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!("Connected to Redis");
        Ok(Self {
            conn,
            prefix: config.prefix.clone(),
        })
    }

    fn key(&self, username: &str) -> String {
        account_key(&self.prefix, username)
    }

    pub async fn exists(&self, username: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(self.key(username)).await?)
    }

    /// Create an account, replacing any existing one.
    pub async fn create(
        &self,
        username: &str,
        fields: &HashMap<String, String>,
        expire: Option<i64>,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let () = create_pipeline(&self.key(username), fields, expire)
            .query_async(&mut conn)
            .await?;
        info!("Account {} created", username);
        Ok(())
    }

    /// All fields of an account; empty when it does not exist.
    pub async fn get(&self, username: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(self.key(username)).await?)
    }

    /// Update fields and expiry of an existing account.
    ///
    /// Returns `false` when the account is missing or already expired.
    pub async fn update(
        &self,
        username: &str,
        fields: &HashMap<String, String>,
        expire: Option<i64>,
    ) -> Result<bool> {
        let key = self.key(username);
        let mut conn = self.conn.clone();

        // -2: no such key. -1: key without expiry.
        let ttl: i64 = conn.ttl(&key).await?;
        if ttl == -2 {
            return Ok(false);
        }
        if let Some(pipe) = update_pipeline(&key, fields, expire) {
            let () = pipe.query_async(&mut conn).await?;
        }
        debug!("Account {} updated", username);
        Ok(true)
    }

    /// Returns `false` when there was nothing to delete.
    pub async fn delete(&self, username: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(self.key(username)).await?;
        if removed > 0 {
            info!("Account {} deleted", username);
        }
        Ok(removed > 0)
    }
}

#[async_trait]
impl Authenticator for RedisAccounts {
    fn mode(&self) -> AuthMode {
        AuthMode::Redis
    }

    async fn authenticate(&self, username: &str, password: &str) -> Result<AuthOutcome> {
        let mut conn = self.conn.clone();
        let stored: Option<String> = conn.hget(self.key(username), PASSWORD_FIELD).await?;
        Ok(check_password(stored.as_deref(), password))
    }
}

pub fn account_key(prefix: &str, username: &str) -> String {
    format!("{}{}", prefix, username)
}

/// Replace the account hash and set its expiry in one MULTI/EXEC block.
fn create_pipeline(
    key: &str,
    fields: &HashMap<String, String>,
    expire: Option<i64>,
) -> redis::Pipeline {
    let pairs: Vec<(&String, &String)> = fields.iter().collect();
    let mut pipe = redis::pipe();
    pipe.atomic()
        .del(key)
        .ignore()
        .hset_multiple(key, &pairs[..])
        .ignore();
    if let Some(seconds) = expire {
        pipe.expire(key, seconds).ignore();
    }
    pipe
}

/// Field and expiry changes as one MULTI/EXEC block; `None` when there is
/// nothing to change.
fn update_pipeline(
    key: &str,
    fields: &HashMap<String, String>,
    expire: Option<i64>,
) -> Option<redis::Pipeline> {
    if fields.is_empty() && expire.is_none() {
        return None;
    }
    let mut pipe = redis::pipe();
    pipe.atomic();
    if !fields.is_empty() {
        let pairs: Vec<(&String, &String)> = fields.iter().collect();
        pipe.hset_multiple(key, &pairs[..]).ignore();
    }
    if let Some(seconds) = expire {
        pipe.expire(key, seconds).ignore();
    }
    Some(pipe)
}

fn check_password(stored: Option<&str>, supplied: &str) -> AuthOutcome {
    match stored {
        None => AuthOutcome::UnknownAccount,
        Some(stored) if stored == supplied => AuthOutcome::Granted,
        Some(_) => AuthOutcome::Denied("password is wrong".to_string()),
    }
}

/// Remove `expire_time` from an account request body.
///
/// Non-numeric or non-positive values mean "no expiry".
pub fn take_expire(fields: &mut HashMap<String, String>) -> Option<i64> {
    fields
        .remove(EXPIRE_FIELD)
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .filter(|seconds| *seconds > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_key_uses_prefix() {
        assert_eq!(account_key("gw:acct:", "alice"), "gw:acct:alice");
        assert_eq!(account_key("", "alice"), "alice");
    }

    #[test]
    fn test_check_password() {
        assert_eq!(check_password(None, "x"), AuthOutcome::UnknownAccount);
        assert_eq!(check_password(Some("x"), "x"), AuthOutcome::Granted);
        assert!(matches!(
            check_password(Some("x"), "y"),
            AuthOutcome::Denied(_)
        ));
    }

    fn packed(pipe: &redis::Pipeline) -> String {
        String::from_utf8_lossy(&pipe.get_packed_pipeline()).into_owned()
    }

    fn account_fields() -> HashMap<String, String> {
        [("username", "alice"), ("password", "pw")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_create_runs_in_one_transaction() {
        let wire = packed(&create_pipeline("acct:alice", &account_fields(), Some(600)));
        let multi = wire.find("MULTI").unwrap();
        let del = wire.find("DEL").unwrap();
        let expire = wire.find("EXPIRE").unwrap();
        let exec = wire.find("EXEC").unwrap();
        assert!(multi < del && del < expire && expire < exec);
        assert!(wire.contains("600"));

        let wire = packed(&create_pipeline("acct:alice", &account_fields(), None));
        assert!(wire.contains("MULTI") && wire.contains("EXEC"));
        assert!(!wire.contains("EXPIRE"));
    }

    #[test]
    fn test_update_runs_in_one_transaction() {
        assert!(update_pipeline("acct:alice", &HashMap::new(), None).is_none());

        let wire = packed(&update_pipeline("acct:alice", &account_fields(), Some(60)).unwrap());
        assert!(wire.contains("MULTI") && wire.contains("EXPIRE") && wire.contains("EXEC"));
        assert!(!wire.contains("DEL"));

        let wire = packed(&update_pipeline("acct:alice", &HashMap::new(), Some(60)).unwrap());
        assert!(wire.contains("EXPIRE"));
    }

    #[test]
    fn test_take_expire() {
        let mut fields: HashMap<String, String> = [
            ("username", "alice"),
            ("password", "pw"),
            ("expire_time", "600"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        assert_eq!(take_expire(&mut fields), Some(600));
        assert!(!fields.contains_key(EXPIRE_FIELD));
        assert_eq!(take_expire(&mut fields), None);

        fields.insert(EXPIRE_FIELD.to_string(), "-5".to_string());
        assert_eq!(take_expire(&mut fields), None);
        fields.insert(EXPIRE_FIELD.to_string(), "soon".to_string());
        assert_eq!(take_expire(&mut fields), None);
        assert!(!fields.contains_key(EXPIRE_FIELD));
    }
}
