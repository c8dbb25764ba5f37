use chrono::{DateTime, Utc};
use processor_core::config::TaskRunMethod;
use processor_core::models::{Task, TaskArguments};
use processor_core::registry::RegisteredTask;
use processor_errors::{ProcessorError, ProcessorResult};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::dispatcher::TaskDispatcher;

/// 已注册任务的调用句柄
#[derive(Clone)]
pub struct TaskHandle {
    task: RegisteredTask,
    dispatcher: TaskDispatcher,
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("task_identifier", &self.task.identifier)
            .field("run_method", &self.dispatcher.run_method())
            .finish()
    }
}

impl TaskHandle {
    pub(crate) fn new(task: RegisteredTask, dispatcher: TaskDispatcher) -> Self {
        Self { task, dispatcher }
    }

    pub fn task_identifier(&self) -> &str {
        &self.task.identifier
    }

    /// 按进程配置的执行方式执行任务
    ///
    /// - `SYNCHRONOUSLY`：立即执行，处理函数的错误返回给调用方；
    /// - `SEPARATE_THREAD`：在后台执行，失败只记录日志；
    /// - `TASK_PROCESSOR`：写入任务表，`delay_until` 为空时立即可被认领，返回写入的记录。
    ///
    /// 非处理器模式下无法兑现 `delay_until`：记录警告后直接返回 `Ok(None)`，
    /// 既不执行处理函数也不写入任务。
    pub async fn delay(
        &self,
        arguments: TaskArguments,
        delay_until: Option<DateTime<Utc>>,
    ) -> ProcessorResult<Option<Task>> {
        let run_method = self.dispatcher.run_method();
        if delay_until.is_some() && !run_method.supports_delay() {
            warn!(
                "执行方式为 {} 时无法延迟执行任务 '{}'，需要使用任务处理器",
                run_method, self.task.identifier
            );
            return Ok(None);
        }

        match run_method {
            TaskRunMethod::Synchronously => {
                self.task.invoke(arguments).await?;
                Ok(None)
            }
            TaskRunMethod::SeparateThread => {
                self.run_in_thread(arguments)?;
                Ok(None)
            }
            TaskRunMethod::TaskProcessor => {
                let task = match delay_until {
                    Some(schedule_for) => {
                        Task::schedule(schedule_for, self.task.identifier.as_str(), &arguments)?
                    }
                    None => Task::create(self.task.identifier.as_str(), &arguments)?,
                };
                let created = self.dispatcher.store().create_task(&task).await?;
                info!(
                    "任务 '{}' 已入队 (ID: {}, 计划执行时间: {})",
                    created.base.task_identifier, created.base.id, created.scheduled_for
                );
                Ok(Some(created))
            }
        }
    }

    /// 在后台执行任务，调用方无法观察到处理函数的失败
    ///
    /// 返回的 `JoinHandle` 只用于等待执行结束。
    pub fn run_in_thread(&self, arguments: TaskArguments) -> ProcessorResult<JoinHandle<()>> {
        let runtime = Handle::try_current().map_err(|e| {
            ProcessorError::Internal(format!("后台执行任务需要 tokio 运行时: {e}"))
        })?;

        let task = self.task.clone();
        Ok(runtime.spawn(async move {
            if let Err(e) = task.invoke(arguments).await {
                error!("后台执行任务 '{}' 失败: {}", task.identifier, e);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use processor_core::registry::{TaskHandler, TaskRegistryBuilder};
    use processor_core::traits::TaskStore;
    use processor_infrastructure::InMemoryTaskStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Fixture {
        store: InMemoryTaskStore,
        calls: Arc<AtomicUsize>,
        handle: TaskHandle,
    }

    fn setup(run_method: TaskRunMethod, fails: bool) -> Fixture {
        let store = InMemoryTaskStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler: Arc<dyn TaskHandler> = Arc::new(move |_arguments: TaskArguments| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if fails {
                    return Err(anyhow::anyhow!("Exception()"));
                }
                anyhow::Ok(())
            }
        });

        let dispatcher = TaskDispatcher::new(Arc::new(store.clone()), run_method, false);
        let mut builder = TaskRegistryBuilder::new();
        let handle = dispatcher
            .register_task(&mut builder, "organisations::tasks", "rebuild", handler)
            .unwrap();

        Fixture {
            store,
            calls,
            handle,
        }
    }

    #[tokio::test]
    async fn test_handle_identifier() {
        let fixture = setup(TaskRunMethod::Synchronously, false);
        assert_eq!(fixture.handle.task_identifier(), "tasks.rebuild");
    }

    #[tokio::test]
    async fn test_synchronous_delay_runs_inline_and_propagates_errors() {
        let fixture = setup(TaskRunMethod::Synchronously, false);
        assert!(fixture.handle.delay(TaskArguments::new(), None).await.unwrap().is_none());
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 1);

        let fixture = setup(TaskRunMethod::Synchronously, true);
        let result = fixture.handle.delay(TaskArguments::new(), None).await;
        assert!(matches!(result, Err(ProcessorError::HandlerFailed(_))));
    }

    #[tokio::test]
    async fn test_separate_thread_swallows_errors() {
        let fixture = setup(TaskRunMethod::SeparateThread, true);

        let join = fixture.handle.run_in_thread(TaskArguments::new()).unwrap();
        join.await.unwrap();
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 1);

        assert!(fixture.handle.delay(TaskArguments::new(), None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_task_processor_delay_persists_task() {
        let fixture = setup(TaskRunMethod::TaskProcessor, false);
        let delay_until = Utc::now() + Duration::minutes(5);

        let task = fixture
            .handle
            .delay(TaskArguments::new().with_arg("test-org"), Some(delay_until))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(task.base.task_identifier, "tasks.rebuild");
        assert_eq!(task.scheduled_for, delay_until);
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            fixture.store.get_task(task.base.id).await.unwrap().unwrap(),
            task
        );
    }

    #[tokio::test]
    async fn test_delay_until_refused_without_task_processor() {
        for run_method in [TaskRunMethod::Synchronously, TaskRunMethod::SeparateThread] {
            let fixture = setup(run_method, false);

            let result = fixture
                .handle
                .delay(TaskArguments::new(), Some(Utc::now() + Duration::minutes(1)))
                .await
                .unwrap();

            assert!(result.is_none());
            tokio::task::yield_now().await;
            assert_eq!(fixture.calls.load(Ordering::SeqCst), 0);
            assert!(fixture.store.get_task(1).await.unwrap().is_none());
        }
    }
}
