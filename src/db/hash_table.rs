//! Task-level persistence operations over Redis hashes.
//!
//! Every call reserves a wait id on the [`RedisMessageDispatcher`], runs its Redis command on
//! the app loop and suspends the calling task until the reply is decoded. Outside a task every
//! operation fails with `RpcNoTask`.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::constants::HASH_TABLE_BATCH_SIZE;
use crate::proto::error::ErrorCode;
use crate::async_invoke;
use crate::await_tasks;
use crate::list_slice_keys;
use crate::list_value_field;
use crate::list_version_field;
use crate::pb_map_to_redis_kl;
use crate::pb_map_to_redis_kv;
use crate::redis_kl_map_to_pb;
use crate::redis_kv_map_to_pb;
use crate::redis_slice_kl_map_to_pb;
use crate::redis_slice_kv_map_to_pb;
use crate::AwaitableContext;
use crate::CasReply;
use crate::CodecError;
use crate::Error;
use crate::HashRecord;
use crate::ListIndexMessage;
use crate::RedisField;
use crate::RedisMessageDispatcher;
use crate::RpcError;
use crate::RpcResult;
use crate::SystemError;
use crate::TaskHandle;

/// Outcome of one index of a batch read.
#[derive(Debug, Clone)]
pub struct RedisSetIndexMessage<M> {
    pub result: RpcResult<()>,
    pub message: Option<M>,
    pub cas_version: u64,
}

impl<M> Default for RedisSetIndexMessage<M> {
    fn default() -> Self {
        Self {
            result: Err(RpcError::new(ErrorCode::Unknown)),
            message: None,
            cas_version: 0,
        }
    }
}

fn storage_error(
    table: &str,
    seq: u64,
    command: &'static str,
    err: Error,
) -> RpcError {
    error!(table, seq, command, error = %err, "redis command failed");
    err.into()
}

fn codec_error(
    table: &str,
    seq: u64,
    err: CodecError,
) -> RpcError {
    error!(table, seq, error = %err, "redis reply decode failed");
    err.into()
}

fn record_not_found(
    table: &str,
    seq: u64,
    key: &str,
) -> RpcError {
    info!(table, seq, key, "record not found");
    RpcError::new(ErrorCode::DbRecordNotFound)
}

/// Reads a whole record. Returns the message and its CAS version.
pub async fn hash_table_load<M: HashRecord>(
    ctx: &AwaitableContext,
    dispatcher: &RedisMessageDispatcher,
    table: &str,
    index: &str,
) -> RpcResult<(M, u64)> {
    let table = table.to_string();
    let key = index.to_string();
    dispatcher
        .execute(ctx, "hash_table_load", move |store, seq| async move {
            debug!(table = %table, seq, key = %key, "hgetall send");
            let data = store
                .hgetall(&key)
                .await
                .map_err(|e| storage_error(&table, seq, "hgetall", e))?;
            if data.is_empty() {
                return Err(record_not_found(&table, seq, &key));
            }

            let mut message = M::default();
            let cas_version = redis_kv_map_to_pb(&data, &mut message).map_err(|e| codec_error(&table, seq, e))?;
            debug!(table = %table, seq, cas_version, "hgetall parsed");
            Ok((message, cas_version))
        })
        .await
}

/// Reads the listed fields of a record. A record with none of them is reported as not found.
pub async fn hash_table_partly_get<M: HashRecord>(
    ctx: &AwaitableContext,
    dispatcher: &RedisMessageDispatcher,
    table: &str,
    index: &str,
    fields: &[&str],
) -> RpcResult<(M, u64)> {
    let table = table.to_string();
    let key = index.to_string();
    let fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
    dispatcher
        .execute(ctx, "hash_table_partly_get", move |store, seq| async move {
            debug!(table = %table, seq, key = %key, fields = fields.len(), "hmget send");
            let values = store
                .hmget(&key, &fields)
                .await
                .map_err(|e| storage_error(&table, seq, "hmget", e))?;

            let mut message = M::default();
            let (cas_version, exists) =
                redis_slice_kv_map_to_pb(&fields, &values, &mut message).map_err(|e| codec_error(&table, seq, e))?;
            if !exists {
                return Err(record_not_found(&table, seq, &key));
            }
            debug!(table = %table, seq, cas_version, "hmget parsed");
            Ok((message, cas_version))
        })
        .await
}

/// Reads every sub-record of a list-indexed hash, sorted by list index.
pub async fn hash_table_load_list_all<M: prost::Message + Default + Send + 'static>(
    ctx: &AwaitableContext,
    dispatcher: &RedisMessageDispatcher,
    table: &str,
    index: &str,
) -> RpcResult<Vec<ListIndexMessage<M>>> {
    let table = table.to_string();
    let key = index.to_string();
    dispatcher
        .execute(ctx, "hash_table_load_list_all", move |store, seq| async move {
            debug!(table = %table, seq, key = %key, "hgetall list send");
            let data = store
                .hgetall(&key)
                .await
                .map_err(|e| storage_error(&table, seq, "hgetall", e))?;
            if data.is_empty() {
                return Err(record_not_found(&table, seq, &key));
            }

            let messages = redis_kl_map_to_pb::<M>(&data).map_err(|e| codec_error(&table, seq, e))?;
            debug!(table = %table, seq, count = messages.len(), "hgetall list parsed");
            Ok(messages)
        })
        .await
}

/// Reads the chosen list indices, with their versions when `with_version` is set.
///
/// Every requested index is reported; an index with nothing stored has no table.
pub async fn hash_table_load_list_index<M: prost::Message + Default + Send + 'static>(
    ctx: &AwaitableContext,
    dispatcher: &RedisMessageDispatcher,
    table: &str,
    index: &str,
    list_indices: &[u64],
    with_version: bool,
) -> RpcResult<Vec<ListIndexMessage<M>>> {
    let table = table.to_string();
    let key = index.to_string();
    let slice_keys = list_slice_keys(list_indices, with_version);
    dispatcher
        .execute(ctx, "hash_table_load_list_index", move |store, seq| async move {
            let fields: Vec<String> = slice_keys.iter().map(|k| k.field_name()).collect();
            debug!(table = %table, seq, key = %key, fields = fields.len(), "hmget list send");
            let values = store
                .hmget(&key, &fields)
                .await
                .map_err(|e| storage_error(&table, seq, "hmget", e))?;
            if values.iter().all(Option::is_none) {
                return Err(record_not_found(&table, seq, &key));
            }

            let messages =
                redis_slice_kl_map_to_pb::<M>(&slice_keys, &values).map_err(|e| codec_error(&table, seq, e))?;
            debug!(table = %table, seq, count = messages.len(), "hmget list parsed");
            Ok(messages)
        })
        .await
}

/// Writes a whole record without a version check.
pub async fn hash_table_update<M: HashRecord>(
    ctx: &AwaitableContext,
    dispatcher: &RedisMessageDispatcher,
    table: &str,
    index: &str,
    message: &M,
) -> RpcResult<()> {
    let table = table.to_string();
    let key = index.to_string();
    let fields = pb_map_to_redis_kv(message, None, false);
    dispatcher
        .execute(ctx, "hash_table_update", move |store, seq| async move {
            debug!(table = %table, seq, key = %key, fields = fields.len(), "hset send");
            store
                .hset(&key, &fields)
                .await
                .map_err(|e| storage_error(&table, seq, "hset", e))?;
            debug!(table = %table, seq, "hset done");
            Ok(())
        })
        .await
}

/// Runs the CAS script and checks the stored version against `expected`.
///
/// `cas_version` always ends up holding the stored version, also on conflict, so the caller
/// can re-read and retry.
#[allow(clippy::too_many_arguments)]
async fn update_with_cas(
    ctx: &AwaitableContext,
    dispatcher: &RedisMessageDispatcher,
    name: &'static str,
    table: String,
    key: String,
    fields: Vec<RedisField>,
    cas_version: &mut u64,
    force_update: bool,
) -> RpcResult<()> {
    let expected = *cas_version;
    let log_table = table.clone();
    let reply: CasReply = dispatcher
        .execute(ctx, name, move |store, seq| async move {
            debug!(table = %table, seq, key = %key, expected, force_update, "evalsha send");
            let reply = store
                .eval_cas(&key, &fields)
                .await
                .map_err(|e| storage_error(&table, seq, "evalsha", e))?;
            debug!(table = %table, seq, applied = reply.applied, version = reply.version, "evalsha done");
            Ok(reply)
        })
        .await?;

    *cas_version = reply.version;
    if !force_update && (!reply.applied || reply.version != expected + 1) {
        info!(
            table = %log_table,
            expected,
            stored = reply.version,
            "cas check failed"
        );
        return Err(RpcError::new(ErrorCode::DbCasCheckFailed));
    }
    Ok(())
}

/// Writes a whole record guarded by its CAS version.
///
/// `cas_version` holds the version the caller read; afterwards it holds the stored version. A
/// forced update resets it to 0 first and overwrites whatever is stored.
pub async fn hash_table_update_cas<M: HashRecord>(
    ctx: &AwaitableContext,
    dispatcher: &RedisMessageDispatcher,
    table: &str,
    index: &str,
    message: &M,
    cas_version: &mut u64,
    force_update: bool,
) -> RpcResult<()> {
    if force_update {
        *cas_version = 0;
    }
    let fields = pb_map_to_redis_kv(message, Some(*cas_version), force_update);
    update_with_cas(
        ctx,
        dispatcher,
        "hash_table_update_cas",
        table.to_string(),
        index.to_string(),
        fields,
        cas_version,
        force_update,
    )
    .await
}

/// Writes one list-indexed sub-record without a version check.
pub async fn hash_table_update_list<M: prost::Message>(
    ctx: &AwaitableContext,
    dispatcher: &RedisMessageDispatcher,
    table: &str,
    index: &str,
    message: &M,
    list_index: u64,
) -> RpcResult<()> {
    let table = table.to_string();
    let key = index.to_string();
    let fields = pb_map_to_redis_kl(message, None, false, list_index);
    dispatcher
        .execute(ctx, "hash_table_update_list", move |store, seq| async move {
            debug!(table = %table, seq, key = %key, list_index, "hset list send");
            store
                .hset(&key, &fields)
                .await
                .map_err(|e| storage_error(&table, seq, "hset", e))?;
            Ok(())
        })
        .await
}

/// Writes one list-indexed sub-record guarded by the version at `V<list_index>`.
#[allow(clippy::too_many_arguments)]
pub async fn hash_table_update_list_cas<M: prost::Message>(
    ctx: &AwaitableContext,
    dispatcher: &RedisMessageDispatcher,
    table: &str,
    index: &str,
    message: &M,
    list_index: u64,
    cas_version: &mut u64,
    force_update: bool,
) -> RpcResult<()> {
    if force_update {
        *cas_version = 0;
    }
    let fields = pb_map_to_redis_kl(message, Some(*cas_version), force_update, list_index);
    update_with_cas(
        ctx,
        dispatcher,
        "hash_table_update_list_cas",
        table.to_string(),
        index.to_string(),
        fields,
        cas_version,
        force_update,
    )
    .await
}

/// Drops a whole record. Deleting a missing record succeeds.
pub async fn hash_table_del(
    ctx: &AwaitableContext,
    dispatcher: &RedisMessageDispatcher,
    table: &str,
    index: &str,
) -> RpcResult<()> {
    let table = table.to_string();
    let key = index.to_string();
    dispatcher
        .execute(ctx, "hash_table_del", move |store, seq| async move {
            debug!(table = %table, seq, key = %key, "del send");
            let removed = store
                .del(&key)
                .await
                .map_err(|e| storage_error(&table, seq, "del", e))?;
            debug!(table = %table, seq, removed, "del done");
            Ok(())
        })
        .await
}

/// Drops `v<i>` of each listed index, plus `V<i>` when `with_version` is set.
pub async fn hash_table_del_list_index(
    ctx: &AwaitableContext,
    dispatcher: &RedisMessageDispatcher,
    table: &str,
    index: &str,
    list_indices: &[u64],
    with_version: bool,
) -> RpcResult<()> {
    if list_indices.is_empty() {
        return Ok(());
    }

    let table = table.to_string();
    let key = index.to_string();
    let mut fields = Vec::with_capacity(list_indices.len() * 2);
    for &list_index in list_indices {
        if with_version {
            fields.push(list_version_field(list_index));
        }
        fields.push(list_value_field(list_index));
    }
    dispatcher
        .execute(ctx, "hash_table_del_list_index", move |store, seq| async move {
            debug!(table = %table, seq, key = %key, fields = fields.len(), "hdel send");
            let removed = store
                .hdel(&key, &fields)
                .await
                .map_err(|e| storage_error(&table, seq, "hdel", e))?;
            debug!(table = %table, seq, removed, "hdel done");
            Ok(())
        })
        .await
}

/// Adds `delta` to a counter field and returns the new value. A negative counter is a `System`
/// failure.
pub async fn hash_table_atomic_inc(
    ctx: &AwaitableContext,
    dispatcher: &RedisMessageDispatcher,
    table: &str,
    index: &str,
    field: &str,
    delta: i64,
) -> RpcResult<u64> {
    let table = table.to_string();
    let key = index.to_string();
    let field = field.to_string();
    dispatcher
        .execute(ctx, "hash_table_atomic_inc", move |store, seq| async move {
            debug!(table = %table, seq, key = %key, field = %field, delta, "hincrby send");
            let value = store
                .hincrby(&key, &field, delta)
                .await
                .map_err(|e| storage_error(&table, seq, "hincrby", e))?;
            if value < 0 {
                return Err(storage_error(
                    &table,
                    seq,
                    "hincrby",
                    SystemError::NegativeCounter { field, value }.into(),
                ));
            }
            debug!(table = %table, seq, value, "hincrby done");
            Ok(value as u64)
        })
        .await
}

/// Loads many records with at most [`HASH_TABLE_BATCH_SIZE`] sub-tasks in flight.
///
/// The result has one entry per index, in order, each with its own result. The call itself
/// fails only when the batch could not be driven (the current task is exiting, a sub-task could
/// not start).
pub async fn hash_table_batch_load<M: HashRecord>(
    ctx: &AwaitableContext,
    dispatcher: &Arc<RedisMessageDispatcher>,
    table: &str,
    indices: &[String],
) -> RpcResult<Vec<RedisSetIndexMessage<M>>> {
    run_batch(ctx, "hash_table_batch_load", indices, {
        let dispatcher = dispatcher.clone();
        let table = table.to_string();
        move |child: AwaitableContext, index: String| {
            let dispatcher = dispatcher.clone();
            let table = table.clone();
            async move { hash_table_load::<M>(&child, &dispatcher, &table, &index).await }
        }
    })
    .await
}

/// [`hash_table_batch_load`] with a field projection per record.
pub async fn hash_table_batch_partly_get<M: HashRecord>(
    ctx: &AwaitableContext,
    dispatcher: &Arc<RedisMessageDispatcher>,
    table: &str,
    indices: &[String],
    fields: &[&str],
) -> RpcResult<Vec<RedisSetIndexMessage<M>>> {
    let fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
    run_batch(ctx, "hash_table_batch_partly_get", indices, {
        let dispatcher = dispatcher.clone();
        let table = table.to_string();
        move |child: AwaitableContext, index: String| {
            let dispatcher = dispatcher.clone();
            let table = table.clone();
            let fields = fields.clone();
            async move {
                let fields: Vec<&str> = fields.iter().map(String::as_str).collect();
                hash_table_partly_get::<M>(&child, &dispatcher, &table, &index, &fields).await
            }
        }
    })
    .await
}

async fn run_batch<M, F, Fut>(
    ctx: &AwaitableContext,
    name: &'static str,
    indices: &[String],
    leaf: F,
) -> RpcResult<Vec<RedisSetIndexMessage<M>>>
where
    M: Send + 'static,
    F: Fn(AwaitableContext, String) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = RpcResult<(M, u64)>> + Send + 'static,
{
    let current = ctx.require_task()?.clone();
    let slots: Vec<Arc<Mutex<RedisSetIndexMessage<M>>>> = indices
        .iter()
        .map(|_| Arc::new(Mutex::new(RedisSetIndexMessage::default())))
        .collect();

    let mut running: Vec<TaskHandle> = Vec::with_capacity(HASH_TABLE_BATCH_SIZE);
    for (index, slot) in indices.iter().zip(&slots) {
        if current.is_exiting() {
            return Err(RpcError::new(ErrorCode::Timeout));
        }

        let slot = slot.clone();
        let index = index.clone();
        let leaf = leaf.clone();
        let child = async_invoke(ctx, name, current.actor().cloned(), move |child_ctx| async move {
            let outcome = leaf(child_ctx, index).await;
            let mut slot = slot.lock();
            match outcome {
                Ok((message, cas_version)) => {
                    slot.result = Ok(());
                    slot.message = Some(message);
                    slot.cas_version = cas_version;
                }
                Err(e) => slot.result = Err(e),
            }
            Ok(())
        })?;
        running.push(child);

        if running.len() >= HASH_TABLE_BATCH_SIZE {
            if let Err(e) = await_tasks(ctx, &running).await {
                error!(name, error = %e, "batch await failed");
                return Err(e);
            }
            running.clear();
        }
    }
    if let Err(e) = await_tasks(ctx, &running).await {
        error!(name, error = %e, "batch await failed");
        return Err(e);
    }

    Ok(slots
        .into_iter()
        .map(|slot| std::mem::take(&mut *slot.lock()))
        .collect())
}
