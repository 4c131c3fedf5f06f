//! Game Service Runtime Error Hierarchy
//!
//! Two layers live here:
//! - [`Error`]: rich, typed failures raised by infrastructure (config, codec, storage, tasks).
//! - [`RpcError`]: the response-code carrying error every task, persistence and router operation
//!   returns. It keeps the originating [`Error`] as its source when there is one.

use std::fmt;
use std::sync::Arc;

use config::ConfigError;

use crate::proto::error::ErrorCode;
use crate::AwaitDescriptor;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

/// Result of every RPC-shaped operation: persistence calls, router mutations and task bodies.
pub type RpcResult<T = ()> = std::result::Result<T, RpcError>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Internal invariant broken (wrong private data, stopped loop, bad registration)
    #[error(transparent)]
    System(#[from] SystemError),

    /// Configuration loading or validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Task runtime misuse and delivery failures
    #[error(transparent)]
    Task(#[from] TaskError),

    /// Protobuf <-> Redis hash mapping failures
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Backing store (Redis) failures
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Unrecoverable failures requiring process termination
    #[error("Fatal error: {0}")]
    Fatal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    #[error("Resume private data is missing, expected {expected}")]
    MissingPrivateData { expected: &'static str },

    #[error("Resume private data type mismatch, expected {expected}")]
    PrivateDataMismatch { expected: &'static str },

    #[error("App loop is stopped")]
    AppLoopStopped,

    /// Actor executor refused a callback because its queue is full
    #[error("Actor {actor} queue is full ({pending} pending actions)")]
    ActorQueueFull { actor: String, pending: usize },

    #[error("Router manager type id {0} is out of range")]
    ManagerTypeOutOfRange(u32),

    #[error("Router manager type id {0} is already registered")]
    ManagerAlreadyRegistered(u32),

    #[error("Router object does not belong to manager {manager}")]
    RouterObjectTypeMismatch { manager: String },

    #[error("Message type {got} does not match dispatcher instance {expected}")]
    MessageTypeMismatch { expected: u64, got: u64 },

    #[error("Rpc {0} has no registered task action")]
    RpcNotRegistered(String),

    #[error("Method {method} is not declared by service {service}")]
    MethodNotFound { service: String, method: String },

    #[error("Counter {field} became negative: {value}")]
    NegativeCounter { field: String, value: i64 },
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// Operation requires being called from inside a task action
    #[error("No task in current context")]
    NoTask,

    #[error("Task {task_id} is already waiting on {current:?}")]
    AlreadyWaiting {
        task_id: u64,
        current: AwaitDescriptor,
    },

    #[error("Task {0} already finished")]
    TaskFinished(u64),

    #[error("Task {0} resume channel closed")]
    ChannelClosed(u64),

    #[error("Task {0} has no pending action to run")]
    NothingToRun(u64),
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Field {0} not found in message")]
    FieldNotFound(String),

    #[error("Field {0} value is missing the '&' marker")]
    MissingMarker(String),

    #[error("Field {field} has invalid value: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Invalid list field name {0}")]
    InvalidListField(String),

    #[error("Requested {keys} fields but got {values} values")]
    LengthMismatch { keys: usize, values: usize },

    #[error(transparent)]
    Decode(#[from] prost::DecodeError),
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error(transparent)]
    Redis(#[from] redis::RedisError),

    #[error("Unexpected store reply: {0}")]
    UnexpectedReply(String),

    /// Request dropped because the calling task was cancelled
    #[error("Store request cancelled")]
    Cancelled,
}

impl Error {
    /// Response code used when this error crosses an RPC boundary.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Error::Codec(_) => ErrorCode::SystemBadPackage,
            Error::Task(TaskError::NoTask) => ErrorCode::RpcNoTask,
            Error::Task(TaskError::TaskFinished(_)) => ErrorCode::RpcExiting,
            Error::Storage(StorageError::Cancelled) => ErrorCode::RpcExiting,
            Error::System(SystemError::ActorQueueFull { .. }) => ErrorCode::Busy,
            _ => ErrorCode::System,
        }
    }
}

/// Error half of [`RpcResult`]: a response code plus an optional cause.
#[derive(Debug, Clone)]
pub struct RpcError {
    code: ErrorCode,
    source: Option<Arc<Error>>,
}

impl RpcError {
    pub fn new(code: ErrorCode) -> Self {
        Self { code, source: None }
    }

    pub fn with_source(
        code: ErrorCode,
        err: impl Into<Error>,
    ) -> Self {
        Self {
            code,
            source: Some(Arc::new(err.into())),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Numeric code written into responses. An error without a code reports `Unknown`.
    pub fn response_code(&self) -> i32 {
        match self.code {
            ErrorCode::Success => ErrorCode::Unknown as i32,
            code => code as i32,
        }
    }

    pub fn cause(&self) -> Option<&Error> {
        self.source.as_deref()
    }

    pub fn is(
        &self,
        code: ErrorCode,
    ) -> bool {
        self.code == code
    }
}

impl fmt::Display for RpcError {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "rpc error {:?}({})", self.code, self.response_code())?;
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_deref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<ErrorCode> for RpcError {
    fn from(code: ErrorCode) -> Self {
        RpcError::new(code)
    }
}

impl From<Error> for RpcError {
    fn from(err: Error) -> Self {
        RpcError::with_source(err.error_code(), err)
    }
}

macro_rules! rpc_error_from {
    ($($ty:ty),*) => {
        $(impl From<$ty> for RpcError {
            fn from(err: $ty) -> Self {
                Error::from(err).into()
            }
        })*
    };
}

rpc_error_from!(SystemError, TaskError, CodecError, StorageError);

/// Inspection helpers mirroring the `IsOK` / `IsError` / `GetResponseCode` surface.
pub trait RpcResultExt {
    fn response_code(&self) -> i32;

    fn is_code(
        &self,
        code: ErrorCode,
    ) -> bool;
}

impl<T> RpcResultExt for RpcResult<T> {
    fn response_code(&self) -> i32 {
        match self {
            Ok(_) => ErrorCode::Success as i32,
            Err(e) => e.response_code(),
        }
    }

    fn is_code(
        &self,
        code: ErrorCode,
    ) -> bool {
        match self {
            Ok(_) => code == ErrorCode::Success,
            Err(e) => e.code() == code,
        }
    }
}
