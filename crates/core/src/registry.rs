//! 任务注册表
//!
//! 在进程启动阶段通过 [`TaskRegistryBuilder`] 注册所有任务处理函数，随后调用
//! [`TaskRegistryBuilder::build`] 冻结为只读的 [`TaskRegistry`]，以 `Arc` 的形式注入
//! 处理器。冻结后注册表不再变化，因此查询无需加锁。
//!
//! ## 使用示例
//!
//! ```rust
//! use std::sync::Arc;
//! use processor_core::registry::{Arity, TaskHandler, TaskRegistryBuilder};
//! use processor_core::models::TaskArguments;
//!
//! let handler: Arc<dyn TaskHandler> = Arc::new(|arguments: TaskArguments| async move {
//!     let name: String = arguments.arg(0)?;
//!     tracing::info!("创建组织: {name}");
//!     anyhow::Ok(())
//! });
//!
//! let mut builder = TaskRegistryBuilder::new();
//! builder
//!     .register("organisations.create_organisation", handler, Arity::Exact(1))
//!     .unwrap();
//!
//! let registry = builder.build();
//! assert!(registry.contains("organisations.create_organisation"));
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use processor_errors::{ProcessorError, ProcessorResult};
use tracing::debug;

use crate::models::TaskArguments;

/// 任务处理函数
///
/// 返回的错误会被处理器记录为一次失败的执行，不会中断整个批次。
/// 任何满足 `Fn(TaskArguments) -> impl Future<Output = anyhow::Result<()>>` 的闭包
/// 都自动实现了该接口。
///
/// 处理函数可能被执行不止一次（执行中进程崩溃时任务会被重新认领），
/// 因此必须是幂等的，或者能容忍重复的副作用。
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, arguments: TaskArguments) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(TaskArguments) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, arguments: TaskArguments) -> anyhow::Result<()> {
        (self)(arguments).await
    }
}

/// 处理函数接受的位置参数数量
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Arity {
    #[default]
    Any,
    Exact(usize),
}

impl Arity {
    pub fn check(&self, arguments: &TaskArguments) -> ProcessorResult<()> {
        match self {
            Arity::Exact(expected) if arguments.args.len() != *expected => {
                Err(ProcessorError::invalid_arguments(format!(
                    "期望{}个位置参数，实际收到{}个",
                    expected,
                    arguments.args.len()
                )))
            }
            _ => Ok(()),
        }
    }
}

/// 已注册的任务
#[derive(Clone)]
pub struct RegisteredTask {
    pub identifier: String,
    pub handler: Arc<dyn TaskHandler>,
    pub arity: Arity,
}

impl std::fmt::Debug for RegisteredTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredTask")
            .field("identifier", &self.identifier)
            .field("arity", &self.arity)
            .finish_non_exhaustive()
    }
}

impl RegisteredTask {
    /// 校验参数后调用处理函数
    pub async fn invoke(&self, arguments: TaskArguments) -> ProcessorResult<()> {
        self.arity.check(&arguments)?;
        self.handler
            .handle(arguments)
            .await
            .map_err(|e| ProcessorError::handler_failed(format!("{e:?}")))
    }
}

/// 由模块路径和名称推导任务标识：`<模块最后一段>.<名称>`
///
/// ```rust
/// use processor_core::registry::derive_task_identifier;
///
/// assert_eq!(
///     derive_task_identifier("task_processor::app_analytics", "track_request"),
///     "app_analytics.track_request"
/// );
/// assert_eq!(derive_task_identifier("organisations.tasks", "send"), "tasks.send");
/// ```
pub fn derive_task_identifier(module_path: &str, name: &str) -> String {
    let module = module_path
        .rsplit("::")
        .next()
        .and_then(|segment| segment.rsplit('.').next())
        .unwrap_or(module_path);
    format!("{module}.{name}")
}

/// 启动阶段使用的可变注册表
#[derive(Default)]
pub struct TaskRegistryBuilder {
    tasks: HashMap<String, RegisteredTask>,
}

impl TaskRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册任务处理函数
    ///
    /// 同一标识重复注册同一个处理函数是幂等的；注册到不同的处理函数则返回
    /// [`ProcessorError::TaskAlreadyRegistered`]，避免不同模块之间意外冲突。
    pub fn register(
        &mut self,
        identifier: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
        arity: Arity,
    ) -> ProcessorResult<RegisteredTask> {
        let identifier = identifier.into();

        if let Some(existing) = self.tasks.get(&identifier) {
            if Arc::ptr_eq(&existing.handler, &handler) {
                debug!("任务 '{}' 已注册，忽略重复注册", identifier);
                return Ok(existing.clone());
            }
            return Err(ProcessorError::TaskAlreadyRegistered { identifier });
        }

        debug!("注册任务处理函数: {}", identifier);
        let task = RegisteredTask {
            identifier: identifier.clone(),
            handler,
            arity,
        };
        self.tasks.insert(identifier, task.clone());
        Ok(task)
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.tasks.contains_key(identifier)
    }

    pub fn build(self) -> TaskRegistry {
        TaskRegistry { tasks: self.tasks }
    }
}

/// 冻结后的只读注册表
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, RegisteredTask>,
}

impl TaskRegistry {
    pub fn builder() -> TaskRegistryBuilder {
        TaskRegistryBuilder::new()
    }

    pub fn resolve(&self, identifier: &str) -> ProcessorResult<&RegisteredTask> {
        self.tasks
            .get(identifier)
            .ok_or_else(|| ProcessorError::unknown_task(identifier))
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.tasks.contains_key(identifier)
    }

    /// 按字典序返回所有已注册的标识
    pub fn identifiers(&self) -> Vec<&str> {
        let mut identifiers: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        identifiers.sort_unstable();
        identifiers
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
