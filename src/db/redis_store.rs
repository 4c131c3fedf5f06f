use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::debug;
use tracing::info;

use super::CasReply;
use super::HashStore;
use super::RedisField;
use crate::constants::CAS_LUA_SCRIPT;
use crate::RedisConfig;
use crate::Result;
use crate::StorageError;

/// [`HashStore`] over a single Redis endpoint.
///
/// The connection manager reconnects on its own and is cheap to clone per command.
#[derive(Clone)]
pub struct RedisHashStore {
    connection: ConnectionManager,
    cas_script: Script,
}

impl RedisHashStore {
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str()).map_err(StorageError::from)?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(StorageError::from)?;
        info!(url = %config.url, "redis connected");
        Ok(Self {
            connection,
            cas_script: Script::new(CAS_LUA_SCRIPT),
        })
    }

    fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }
}

#[async_trait]
impl HashStore for RedisHashStore {
    async fn load_cas_script(&self) -> Result<String> {
        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(CAS_LUA_SCRIPT)
            .query_async(&mut self.connection())
            .await
            .map_err(StorageError::from)?;
        if sha != self.cas_script.get_hash() {
            return Err(StorageError::UnexpectedReply(format!(
                "script sha {sha} differs from local {}",
                self.cas_script.get_hash()
            ))
            .into());
        }
        Ok(sha)
    }

    async fn hgetall(
        &self,
        key: &str,
    ) -> Result<HashMap<String, Vec<u8>>> {
        let reply: HashMap<String, Vec<u8>> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut self.connection())
            .await
            .map_err(StorageError::from)?;
        Ok(reply)
    }

    async fn hmget(
        &self,
        key: &str,
        fields: &[String],
    ) -> Result<Vec<Option<Vec<u8>>>> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let reply: Vec<Option<Vec<u8>>> = redis::cmd("HMGET")
            .arg(key)
            .arg(fields)
            .query_async(&mut self.connection())
            .await
            .map_err(StorageError::from)?;
        Ok(reply)
    }

    async fn hset(
        &self,
        key: &str,
        fields: &[RedisField],
    ) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(field).arg(value.as_slice());
        }
        let _: i64 = cmd
            .query_async(&mut self.connection())
            .await
            .map_err(StorageError::from)?;
        Ok(())
    }

    async fn hdel(
        &self,
        key: &str,
        fields: &[String],
    ) -> Result<u64> {
        if fields.is_empty() {
            return Ok(0);
        }
        let removed: u64 = redis::cmd("HDEL")
            .arg(key)
            .arg(fields)
            .query_async(&mut self.connection())
            .await
            .map_err(StorageError::from)?;
        Ok(removed)
    }

    async fn del(
        &self,
        key: &str,
    ) -> Result<u64> {
        let removed: u64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut self.connection())
            .await
            .map_err(StorageError::from)?;
        Ok(removed)
    }

    async fn hincrby(
        &self,
        key: &str,
        field: &str,
        delta: i64,
    ) -> Result<i64> {
        let value: i64 = redis::cmd("HINCRBY")
            .arg(key)
            .arg(field)
            .arg(delta)
            .query_async(&mut self.connection())
            .await
            .map_err(StorageError::from)?;
        Ok(value)
    }

    async fn eval_cas(
        &self,
        key: &str,
        fields: &[RedisField],
    ) -> Result<CasReply> {
        let mut invocation = self.cas_script.key(key);
        for (field, value) in fields {
            invocation.arg(field).arg(value.as_slice());
        }
        // EVALSHA first; a NOSCRIPT reply reloads the script and retries
        let (applied, version): (i64, String) = invocation
            .invoke_async(&mut self.connection())
            .await
            .map_err(StorageError::from)?;
        debug!(key, applied, version = %version, "cas script replied");
        let version = version
            .parse::<u64>()
            .map_err(|_| StorageError::UnexpectedReply(format!("cas version {version}")))?;
        Ok(CasReply {
            applied: applied == 1,
            version,
        })
    }
}
