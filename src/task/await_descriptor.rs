use std::any::Any;
use std::fmt;

use crate::proto::error::ErrorCode;
use crate::RpcError;
use crate::RpcResult;
use crate::SystemError;

/// What a blocked task is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WaitType {
    #[default]
    None,
    /// Another task finishing, or a plain sleep
    Normal,
    Rpc,
    /// IO slot of the router object with this handle id
    Io(u64),
    /// Dispatcher defined, usually the dispatcher instance ident
    Custom(u64),
}

/// `(waitType, waitId)` pair. Resumes are delivered only on an exact match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AwaitDescriptor {
    pub wait_type: WaitType,
    pub wait_id: u64,
}

impl AwaitDescriptor {
    pub const fn new(
        wait_type: WaitType,
        wait_id: u64,
    ) -> Self {
        Self { wait_type, wait_id }
    }

    pub fn is_none(&self) -> bool {
        self.wait_type == WaitType::None && self.wait_id == 0
    }
}

/// Payload handed to a suspended task when it is resumed.
pub struct ResumeData {
    pub descriptor: AwaitDescriptor,
    pub result: RpcResult<()>,
    private_data: Option<Box<dyn Any + Send>>,
}

impl ResumeData {
    pub fn ok(descriptor: AwaitDescriptor) -> Self {
        Self {
            descriptor,
            result: Ok(()),
            private_data: None,
        }
    }

    pub fn error(
        descriptor: AwaitDescriptor,
        error: RpcError,
    ) -> Self {
        Self {
            descriptor,
            result: Err(error),
            private_data: None,
        }
    }

    pub fn with_private_data<T: Send + 'static>(
        mut self,
        data: T,
    ) -> Self {
        self.private_data = Some(Box::new(data));
        self
    }

    /// Extracts the typed payload. A missing or mistyped payload is a `System` failure.
    pub fn take_private_data<T: Send + 'static>(&mut self) -> RpcResult<T> {
        let expected = std::any::type_name::<T>();
        let data = self
            .private_data
            .take()
            .ok_or_else(|| RpcError::with_source(ErrorCode::System, SystemError::MissingPrivateData { expected }))?;
        data.downcast::<T>()
            .map(|b| *b)
            .map_err(|_| RpcError::with_source(ErrorCode::System, SystemError::PrivateDataMismatch { expected }))
    }
}

impl fmt::Debug for ResumeData {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("ResumeData")
            .field("descriptor", &self.descriptor)
            .field("result", &self.result)
            .field("has_private_data", &self.private_data.is_some())
            .finish()
    }
}
