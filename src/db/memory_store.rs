use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::trace;

use super::CasReply;
use super::HashStore;
use super::RedisField;
use crate::constants::FORCE_UPDATE_VERSION;
use crate::Result;
use crate::StorageError;

/// In-process [`HashStore`] with the same CAS semantics as the Lua script.
///
/// Used by local runs without Redis and by tests.
#[derive(Debug, Default)]
pub struct MemoryHashStore {
    data: RwLock<HashMap<String, HashMap<String, Vec<u8>>>>,
    script_loads: AtomicUsize,
}

impl MemoryHashStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of one hash, `None` when the key does not exist.
    pub fn snapshot(
        &self,
        key: &str,
    ) -> Option<HashMap<String, Vec<u8>>> {
        self.data.read().get(key).cloned()
    }

    pub fn field(
        &self,
        key: &str,
        field: &str,
    ) -> Option<Vec<u8>> {
        self.data.read().get(key).and_then(|hash| hash.get(field).cloned())
    }

    pub fn key_count(&self) -> usize {
        self.data.read().len()
    }

    pub fn script_loads(&self) -> usize {
        self.script_loads.load(Ordering::Relaxed)
    }
}

fn parse_number(value: &[u8]) -> Option<i64> {
    std::str::from_utf8(value).ok()?.trim().parse::<i64>().ok()
}

#[async_trait]
impl HashStore for MemoryHashStore {
    async fn load_cas_script(&self) -> Result<String> {
        self.script_loads.fetch_add(1, Ordering::Relaxed);
        Ok(redis::Script::new(crate::constants::CAS_LUA_SCRIPT)
            .get_hash()
            .to_string())
    }

    async fn hgetall(
        &self,
        key: &str,
    ) -> Result<HashMap<String, Vec<u8>>> {
        Ok(self.data.read().get(key).cloned().unwrap_or_default())
    }

    async fn hmget(
        &self,
        key: &str,
        fields: &[String],
    ) -> Result<Vec<Option<Vec<u8>>>> {
        let data = self.data.read();
        let hash = data.get(key);
        Ok(fields
            .iter()
            .map(|field| hash.and_then(|h| h.get(field).cloned()))
            .collect())
    }

    async fn hset(
        &self,
        key: &str,
        fields: &[RedisField],
    ) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut data = self.data.write();
        let hash = data.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        trace!(key, count = fields.len(), "memory hset");
        Ok(())
    }

    async fn hdel(
        &self,
        key: &str,
        fields: &[String],
    ) -> Result<u64> {
        let mut data = self.data.write();
        let Some(hash) = data.get_mut(key) else {
            return Ok(0);
        };
        let removed = fields.iter().filter(|field| hash.remove(*field).is_some()).count();
        if hash.is_empty() {
            data.remove(key);
        }
        Ok(removed as u64)
    }

    async fn del(
        &self,
        key: &str,
    ) -> Result<u64> {
        Ok(self.data.write().remove(key).map(|_| 1).unwrap_or(0))
    }

    async fn hincrby(
        &self,
        key: &str,
        field: &str,
        delta: i64,
    ) -> Result<i64> {
        let mut data = self.data.write();
        let hash = data.entry(key.to_string()).or_default();
        let current = match hash.get(field) {
            Some(value) => parse_number(value).ok_or_else(|| {
                StorageError::UnexpectedReply("hash value is not an integer".to_string())
            })?,
            None => 0,
        };
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string().into_bytes());
        Ok(next)
    }

    async fn eval_cas(
        &self,
        key: &str,
        fields: &[RedisField],
    ) -> Result<CasReply> {
        let Some((version_field, expected)) = fields.first() else {
            return Err(StorageError::UnexpectedReply("cas without version field".to_string()).into());
        };
        let expected = if expected.as_slice() == FORCE_UPDATE_VERSION.as_bytes() {
            -1
        } else {
            parse_number(expected).ok_or_else(|| {
                StorageError::UnexpectedReply("cas expected version is not an integer".to_string())
            })?
        };

        let mut data = self.data.write();
        let hash = data.entry(key.to_string()).or_default();
        let real_version = hash
            .get(version_field)
            .and_then(|value| parse_number(value))
            .unwrap_or(0);

        if real_version == 0 || expected == -1 || expected == real_version {
            let next = real_version + 1;
            hash.insert(version_field.clone(), next.to_string().into_bytes());
            for (field, value) in &fields[1..] {
                hash.insert(field.clone(), value.clone());
            }
            Ok(CasReply {
                applied: true,
                version: next as u64,
            })
        } else {
            Ok(CasReply {
                applied: false,
                version: real_version as u64,
            })
        }
    }
}
