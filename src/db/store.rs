use std::collections::HashMap;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use super::RedisField;
use crate::Result;

/// Hash commands the persistence layer issues. Only ever called from the app loop.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HashStore: Send + Sync + 'static {
    /// Loads the CAS script and returns its SHA.
    async fn load_cas_script(&self) -> Result<String>;

    async fn hgetall(
        &self,
        key: &str,
    ) -> Result<HashMap<String, Vec<u8>>>;

    async fn hmget(
        &self,
        key: &str,
        fields: &[String],
    ) -> Result<Vec<Option<Vec<u8>>>>;

    async fn hset(
        &self,
        key: &str,
        fields: &[RedisField],
    ) -> Result<()>;

    /// Returns the number of removed fields.
    async fn hdel(
        &self,
        key: &str,
        fields: &[String],
    ) -> Result<u64>;

    /// Returns the number of removed keys.
    async fn del(
        &self,
        key: &str,
    ) -> Result<u64>;

    async fn hincrby(
        &self,
        key: &str,
        field: &str,
        delta: i64,
    ) -> Result<i64>;

    /// Runs the CAS script. `fields[0]` is the version pair.
    async fn eval_cas(
        &self,
        key: &str,
        fields: &[RedisField],
    ) -> Result<CasReply>;
}

/// Outcome of one CAS script call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CasReply {
    /// Whether the fields were written
    pub applied: bool,
    /// Stored version after the call
    pub version: u64,
}
