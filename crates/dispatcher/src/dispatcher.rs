use std::sync::Arc;

use chrono::Duration;
use processor_core::config::{AppConfig, TaskRunMethod};
use processor_core::models::{RecurringTask, TaskArguments};
use processor_core::registry::{derive_task_identifier, Arity, TaskHandler, TaskRegistryBuilder};
use processor_core::traits::TaskStore;
use processor_errors::ProcessorResult;
use tracing::{debug, info};

use crate::handle::TaskHandle;

/// 任务分派器
///
/// 持有进程级的执行方式和任务存储，负责注册处理函数并生成 [`TaskHandle`]。
///
/// # 使用示例
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use processor_core::config::TaskRunMethod;
/// use processor_core::models::TaskArguments;
/// use processor_core::registry::{TaskHandler, TaskRegistryBuilder};
/// use processor_core::traits::TaskStore;
/// use processor_dispatcher::TaskDispatcher;
///
/// # async fn example(store: Arc<dyn TaskStore>) -> processor_errors::ProcessorResult<()> {
/// let dispatcher = TaskDispatcher::new(store, TaskRunMethod::TaskProcessor, false);
/// let mut builder = TaskRegistryBuilder::new();
///
/// let handler: Arc<dyn TaskHandler> = Arc::new(|_arguments: TaskArguments| async {
///     anyhow::Ok(())
/// });
/// let send_email = dispatcher.register_task(&mut builder, module_path!(), "send_email", handler)?;
///
/// send_email
///     .delay(TaskArguments::new().with_arg("user@example.com"), None)
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TaskDispatcher {
    store: Arc<dyn TaskStore>,
    run_method: TaskRunMethod,
    run_by_processor: bool,
}

impl TaskDispatcher {
    pub fn new(store: Arc<dyn TaskStore>, run_method: TaskRunMethod, run_by_processor: bool) -> Self {
        Self {
            store,
            run_method,
            run_by_processor,
        }
    }

    pub fn from_config(store: Arc<dyn TaskStore>, config: &AppConfig) -> Self {
        Self::new(
            store,
            config.dispatch.task_run_method,
            config.processor.run_by_processor,
        )
    }

    pub fn run_method(&self) -> TaskRunMethod {
        self.run_method
    }

    /// 当前进程是否承担处理器角色
    pub fn is_run_by_processor(&self) -> bool {
        self.run_by_processor
    }

    pub(crate) fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// 注册处理函数，标识为 `<模块路径最后一段>.<name>`
    pub fn register_task(
        &self,
        builder: &mut TaskRegistryBuilder,
        module_path: &str,
        name: &str,
        handler: Arc<dyn TaskHandler>,
    ) -> ProcessorResult<TaskHandle> {
        self.register_task_with_arity(builder, module_path, name, handler, Arity::Any)
    }

    pub fn register_task_with_arity(
        &self,
        builder: &mut TaskRegistryBuilder,
        module_path: &str,
        name: &str,
        handler: Arc<dyn TaskHandler>,
        arity: Arity,
    ) -> ProcessorResult<TaskHandle> {
        let identifier = derive_task_identifier(module_path, name);
        let task = builder.register(identifier, handler, arity)?;
        Ok(TaskHandle::new(task, self.clone()))
    }

    /// 注册周期任务
    ///
    /// 只有处理器角色的进程才会注册处理函数并写入周期任务记录，其他进程直接返回
    /// `Ok(None)`，避免每个定义了处理函数的进程都去写表。同一标识和执行间隔的记录
    /// 只会存在一条，重复注册时更新其参数。
    pub async fn register_recurring_task(
        &self,
        builder: &mut TaskRegistryBuilder,
        module_path: &str,
        name: &str,
        run_every: Duration,
        arguments: TaskArguments,
        handler: Arc<dyn TaskHandler>,
    ) -> ProcessorResult<Option<RecurringTask>> {
        let identifier = derive_task_identifier(module_path, name);
        if !self.run_by_processor {
            debug!("当前进程不是处理器角色，跳过周期任务 '{}' 的注册", identifier);
            return Ok(None);
        }

        builder.register(identifier.as_str(), handler, Arity::Any)?;

        let task = RecurringTask::new(identifier, run_every, &arguments)?;
        let stored = self.store.upsert_recurring_task(&task).await?;
        info!(
            "周期任务 '{}' 已注册 (ID: {}, 间隔: {}秒)",
            stored.base.task_identifier,
            stored.base.id,
            stored.run_every_seconds()
        );
        Ok(Some(stored))
    }
}
