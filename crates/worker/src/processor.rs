//! 认领并执行任务
//!
//! 一轮处理的流程：
//!
//! 1. 通过 [`TaskStore`] 打开认领事务，跳过其他 Worker 已锁定的行；
//! 2. 对每个锁定的任务解析处理函数并执行，期间一直持有行锁；
//! 3. 成功则标记完成，失败（处理函数返回错误、标识未注册、参数无效或 panic）
//!    则失败次数加一；两种情况都写入一条执行记录；
//! 4. 整批任务记录完毕后提交事务并返回本轮产生的执行记录。
//!
//! 单个任务的失败不会中断本轮处理，只有存储层错误才会向调用方返回。

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::FutureExt;
use metrics::{counter, histogram};
use processor_core::models::{QueuedTask, RecurringTaskRun, RunAttempt, TaskRun};
use processor_core::registry::TaskRegistry;
use processor_core::traits::{TaskClaim, TaskStore};
use processor_errors::{ProcessorError, ProcessorResult};
use tracing::{debug, info, instrument, warn};

use crate::recurring::select_due_tasks;

pub struct TaskProcessor {
    store: Arc<dyn TaskStore>,
    registry: Arc<TaskRegistry>,
}

impl TaskProcessor {
    pub fn new(store: Arc<dyn TaskStore>, registry: Arc<TaskRegistry>) -> Self {
        Self { store, registry }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// 认领并执行最多 `batch_size` 个到期的一次性任务
    #[instrument(skip(self), fields(batch_size = batch_size))]
    pub async fn run_tasks(&self, batch_size: usize) -> ProcessorResult<Vec<TaskRun>> {
        let mut claim = self.store.claim_tasks(batch_size, Utc::now()).await?;
        let tasks = claim.tasks().to_vec();
        if tasks.is_empty() {
            claim.commit().await?;
            return Ok(Vec::new());
        }

        debug!("本轮认领到 {} 个任务", tasks.len());
        let mut runs = Vec::with_capacity(tasks.len());
        for task in tasks {
            runs.push(self.execute(claim.as_mut(), task).await?);
        }

        claim.commit().await?;
        Ok(runs)
    }

    /// 执行最多 `batch_size` 个到期的周期任务
    #[instrument(skip(self), fields(batch_size = batch_size))]
    pub async fn run_recurring_tasks(
        &self,
        batch_size: usize,
    ) -> ProcessorResult<Vec<RecurringTaskRun>> {
        let now = Utc::now();
        let mut claim = self.store.claim_recurring_tasks(batch_size, now).await?;
        let due = select_due_tasks(claim.as_mut(), batch_size, now).await?;

        let mut runs = Vec::with_capacity(due.len());
        for task in due {
            runs.push(self.execute(claim.as_mut(), task).await?);
        }

        claim.commit().await?;
        Ok(runs)
    }

    async fn execute<T, C>(&self, claim: &mut C, mut task: T) -> ProcessorResult<T::Run>
    where
        T: QueuedTask,
        C: TaskClaim<T> + ?Sized,
    {
        let timer = Instant::now();
        let attempt = RunAttempt::start(Utc::now());

        let attempt = match self.invoke(&task).await {
            Ok(()) => {
                task.mark_success();
                info!(
                    task_id = task.id(),
                    kind = T::KIND,
                    "任务 '{}' 执行成功",
                    task.task_identifier()
                );
                attempt.succeed(Utc::now())
            }
            Err(e) => {
                task.mark_failure();
                warn!(
                    task_id = task.id(),
                    kind = T::KIND,
                    error = %e,
                    "任务 '{}' 执行失败",
                    task.task_identifier()
                );
                attempt.fail(error_details(e))
            }
        };

        let result = if attempt.is_successful() { "SUCCESS" } else { "FAILURE" };
        counter!("task_processor_runs_total", "kind" => T::KIND, "result" => result).increment(1);
        histogram!("task_processor_run_duration_ms", "kind" => T::KIND)
            .record(timer.elapsed().as_millis() as f64);

        claim.record_run(&task, attempt).await
    }

    async fn invoke<T: QueuedTask>(&self, task: &T) -> ProcessorResult<()> {
        let registered = self.registry.resolve(task.task_identifier())?;
        let arguments = task.base().arguments()?;

        match AssertUnwindSafe(registered.invoke(arguments)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(ProcessorError::handler_failed(format!(
                "处理函数 panic: {}",
                panic_message(panic.as_ref())
            ))),
        }
    }
}

fn error_details(error: ProcessorError) -> String {
    match error {
        ProcessorError::HandlerFailed(details) => details,
        other => other.to_string(),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "未知 panic"
    }
}
