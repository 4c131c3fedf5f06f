//! Inbound message routing: service/method registration, message filters and task creation.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;

use super::DispatcherAwaitOptions;
use crate::constants::TASK_ID_EPOCH_SECS;
use crate::run_task_action;
use crate::utils::time::get_nanos_since;
use crate::AppRuntime;
use crate::Result;
use crate::SystemError;
use crate::TaskAction;
use crate::TaskHandle;
use crate::TaskOptions;
use crate::WaitType;

/// A message as it arrives from a transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatcherRawMessage {
    /// Instance ident of the dispatcher the message is meant for
    pub message_type: u64,
    /// Method full name, e.g. `game.LobbyService.login`
    pub rpc_name: String,
    /// Non-zero when the message answers a suspended task
    pub task_id: u64,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub name: String,
    pub input_type: String,
    pub output_type: String,
}

impl MethodDescriptor {
    pub fn new(
        name: impl Into<String>,
        input_type: impl Into<String>,
        output_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            input_type: input_type.into(),
            output_type: output_type.into(),
        }
    }
}

/// Protobuf service as seen by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub full_name: String,
    pub methods: Vec<MethodDescriptor>,
}

impl ServiceDescriptor {
    pub fn new(
        full_name: impl Into<String>,
        methods: Vec<MethodDescriptor>,
    ) -> Self {
        Self {
            full_name: full_name.into(),
            methods,
        }
    }

    pub fn method_by_name(
        &self,
        name: &str,
    ) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn method_full_name(
        &self,
        method: &MethodDescriptor,
    ) -> String {
        format!("{}.{}", self.full_name, method.name)
    }
}

/// Everything a creator gets to build the task of one inbound message.
#[derive(Debug, Clone)]
pub struct DispatcherStartData {
    pub message: DispatcherRawMessage,
    pub method: MethodDescriptor,
}

pub type TaskActionCreator = Arc<dyn Fn(&DispatcherStartData) -> Result<Box<dyn TaskAction>> + Send + Sync>;

/// Returns `false` to drop the message.
pub type MessageFilter = Arc<dyn Fn(&DispatcherRawMessage) -> bool + Send + Sync>;

#[derive(Clone)]
struct RegisteredAction {
    method: MethodDescriptor,
    creator: TaskActionCreator,
}

/// Common dispatcher state: instance ident, await sequence, registered actions and filters.
pub struct MessageDispatcher {
    name: &'static str,
    instance_ident: u64,
    sequence: AtomicU64,
    services: RwLock<HashMap<String, ServiceDescriptor>>,
    actions: RwLock<HashMap<String, RegisteredAction>>,
    filters: RwLock<VecDeque<MessageFilter>>,
}

impl MessageDispatcher {
    pub fn new(
        name: &'static str,
        instance_ident: u64,
    ) -> Self {
        Self {
            name,
            instance_ident,
            sequence: AtomicU64::new(get_nanos_since(TASK_ID_EPOCH_SECS)),
            services: RwLock::new(HashMap::new()),
            actions: RwLock::new(HashMap::new()),
            filters: RwLock::new(VecDeque::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn instance_ident(&self) -> u64 {
        self.instance_ident
    }

    pub fn alloc_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Reserves a fresh wait id on this dispatcher.
    pub fn create_await_options(
        &self,
        timeout: Option<Duration>,
    ) -> DispatcherAwaitOptions {
        DispatcherAwaitOptions {
            wait_type: WaitType::Custom(self.instance_ident),
            sequence: self.alloc_sequence(),
            timeout,
        }
    }

    /// Binds `rpc_full_name` to `creator`. The short name after the last `.` must be a method of
    /// `service`.
    pub fn register_action(
        &self,
        service: &ServiceDescriptor,
        rpc_full_name: &str,
        creator: TaskActionCreator,
    ) -> Result<()> {
        let short_name = rpc_full_name.rsplit('.').next().unwrap_or(rpc_full_name);
        let Some(method) = service.method_by_name(short_name) else {
            error!(method = short_name, service = %service.full_name, "register action method not found");
            return Err(SystemError::MethodNotFound {
                service: service.full_name.clone(),
                method: short_name.to_string(),
            }
            .into());
        };

        let full_name = service.method_full_name(method);
        self.services
            .write()
            .insert(service.full_name.clone(), service.clone());
        self.actions.write().insert(
            full_name.clone(),
            RegisteredAction {
                method: method.clone(),
                creator,
            },
        );
        debug!(dispatcher = self.name, rpc = %full_name, "action registered");
        Ok(())
    }

    pub fn registered_service(
        &self,
        service_full_name: &str,
    ) -> Option<ServiceDescriptor> {
        self.services.read().get(service_full_name).cloned()
    }

    pub fn registered_method(
        &self,
        method_full_name: &str,
    ) -> Option<MethodDescriptor> {
        self.actions
            .read()
            .get(method_full_name)
            .map(|action| action.method.clone())
    }

    pub fn push_front_message_filter(
        &self,
        filter: MessageFilter,
    ) {
        self.filters.write().push_front(filter);
    }

    pub fn push_back_message_filter(
        &self,
        filter: MessageFilter,
    ) {
        self.filters.write().push_back(filter);
    }

    /// Builds the task of `message` with the client-message timeout. The task is not started.
    pub fn create_task(
        &self,
        app: &Arc<AppRuntime>,
        message: DispatcherRawMessage,
        parent: Option<&CancellationToken>,
    ) -> Result<TaskHandle> {
        let action = self
            .actions
            .read()
            .get(&message.rpc_name)
            .cloned()
            .ok_or_else(|| SystemError::RpcNotRegistered(message.rpc_name.clone()))?;

        let name = message.rpc_name.clone();
        let start_data = DispatcherStartData {
            message,
            method: action.method,
        };
        let task_action = (action.creator)(&start_data)?;

        let mut options = TaskOptions::with_timeout(app.settings().task.csmsg_timeout()).name(name);
        if let Some(parent) = parent {
            options = options.parent(parent);
        }
        Ok(app.task_manager().create_boxed_task(task_action, options))
    }

    /// Filters `message`, then creates and starts its task.
    ///
    /// `Ok(None)` means a filter dropped the message or it answers an existing task.
    pub fn on_receive_message(
        &self,
        app: &Arc<AppRuntime>,
        message: DispatcherRawMessage,
        parent: Option<&CancellationToken>,
    ) -> Result<Option<TaskHandle>> {
        if message.message_type != self.instance_ident {
            error!(
                dispatcher = self.name,
                expected = self.instance_ident,
                got = message.message_type,
                "message type mismatch"
            );
            return Err(SystemError::MessageTypeMismatch {
                expected: self.instance_ident,
                got: message.message_type,
            }
            .into());
        }

        let filters: Vec<MessageFilter> = self.filters.read().iter().cloned().collect();
        if filters.iter().any(|filter| !filter(&message)) {
            debug!(dispatcher = self.name, rpc = %message.rpc_name, "message filtered");
            return Ok(None);
        }

        if message.task_id != 0 {
            debug!(dispatcher = self.name, task_id = message.task_id, "message answers a running task");
            return Ok(None);
        }

        let rpc_name = message.rpc_name.clone();
        let task = match self.create_task(app, message, parent) {
            Ok(task) => task,
            Err(e) => {
                error!(dispatcher = self.name, rpc = %rpc_name, error = %e, "create task failed");
                return Err(e);
            }
        };
        run_task_action(app, &task)?;
        Ok(Some(task))
    }
}

impl fmt::Debug for MessageDispatcher {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("MessageDispatcher")
            .field("name", &self.name)
            .field("instance_ident", &self.instance_ident)
            .field("actions", &self.actions.read().len())
            .finish()
    }
}
