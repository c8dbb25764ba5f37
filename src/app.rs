use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use processor_core::config::AppConfig;
use processor_core::registry::{TaskRegistry, TaskRegistryBuilder};
use processor_core::traits::TaskStore;
use processor_dispatcher::TaskDispatcher;
use processor_infrastructure::DatabaseManager;
use processor_worker::{ProcessorRunner, TaskProcessor};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::analytics::{
    register_recurring_tasks, register_tasks, AnalyticsTasks, InMemoryUsageStore,
    PostgresUsageStore, UsageStore,
};

/// 任务处理器进程
///
/// 启动时完成数据库迁移、任务注册，并在承担处理器角色时创建 [`ProcessorRunner`]。
pub struct Application {
    config: AppConfig,
    database: DatabaseManager,
    dispatcher: TaskDispatcher,
    registry: Arc<TaskRegistry>,
    analytics: AnalyticsTasks,
    runner: Option<ProcessorRunner>,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("初始化任务处理器");

        let database = DatabaseManager::new(&config.database)
            .await
            .context("连接数据库失败")?;
        database.run_migrations().await.context("运行数据库迁移失败")?;

        let task_store = database.task_store();
        let usage_store = create_usage_store(&database).await?;
        let dispatcher = TaskDispatcher::from_config(Arc::clone(&task_store), &config);

        let mut builder = TaskRegistryBuilder::new();
        let analytics = register_tasks(&dispatcher, &mut builder, Arc::clone(&usage_store))
            .context("注册使用量统计任务失败")?;
        register_recurring_tasks(&dispatcher, &mut builder, usage_store)
            .await
            .context("注册分桶统计周期任务失败")?;

        let registry = Arc::new(builder.build());
        info!("已注册 {} 个任务: {:?}", registry.len(), registry.identifiers());

        let runner = if config.processor.run_by_processor {
            Some(create_runner(&config, task_store, Arc::clone(&registry))?)
        } else {
            None
        };

        Ok(Self {
            config,
            database,
            dispatcher,
            registry,
            analytics,
            runner,
        })
    }

    pub fn dispatcher(&self) -> &TaskDispatcher {
        &self.dispatcher
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn analytics(&self) -> &AnalyticsTasks {
        &self.analytics
    }

    pub fn runner(&self) -> Option<&ProcessorRunner> {
        self.runner.as_ref()
    }

    /// 运行到收到关闭信号为止
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let Some(runner) = &self.runner else {
            warn!("当前进程未承担处理器角色，不会执行任何任务");
            let _ = shutdown_rx.recv().await;
            self.database.close().await;
            return Ok(());
        };

        runner.start().await?;

        let check_interval = Duration::from_millis(
            self.config.processor.sleep_interval_ms + self.config.processor.grace_period_ms,
        );
        let mut health_check = tokio::time::interval(check_interval);
        health_check.tick().await;

        loop {
            tokio::select! {
                _ = health_check.tick() => {
                    if !runner.is_healthy().await {
                        warn!(
                            "处理循环在 {}ms 内没有检查任务: {:?}",
                            check_interval.as_millis(),
                            runner.last_checked_for_tasks().await
                        );
                    }
                    if let Err(e) = self.database.health_check().await {
                        warn!("数据库健康检查失败: {e}");
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        runner.stop().await?;
        self.database.close().await;
        Ok(())
    }
}

async fn create_usage_store(database: &DatabaseManager) -> Result<Arc<dyn UsageStore>> {
    match database.pg_pool() {
        Some(pool) => {
            let store = PostgresUsageStore::new(pool.clone());
            store
                .run_migrations()
                .await
                .context("运行使用量统计表迁移失败")?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(InMemoryUsageStore::new())),
    }
}

fn create_runner(
    config: &AppConfig,
    task_store: Arc<dyn TaskStore>,
    registry: Arc<TaskRegistry>,
) -> Result<ProcessorRunner> {
    let processor = Arc::new(TaskProcessor::new(task_store, registry));
    ProcessorRunner::builder(processor)
        .config(config.processor.clone())
        .build()
        .context("创建处理器服务失败")
}

#[cfg(test)]
mod tests {
    use super::*;
    use processor_core::config::TaskRunMethod;
    use processor_core::models::TaskArguments;

    fn memory_config(run_by_processor: bool) -> AppConfig {
        let mut config = AppConfig::default();
        config.database.url = "memory://".to_string();
        config.processor.run_by_processor = run_by_processor;
        config.processor.num_workers = 1;
        config.processor.sleep_interval_ms = 20;
        config.dispatch.task_run_method = TaskRunMethod::TaskProcessor;
        config
    }

    #[tokio::test]
    async fn test_processor_role_registers_recurring_tasks() {
        let app = Application::new(memory_config(true)).await.unwrap();

        assert!(app.runner().is_some());
        assert!(app
            .registry()
            .contains("app_analytics.populate_api_usage_bucket"));
        assert!(app
            .registry()
            .contains("app_analytics.populate_feature_evaluation_bucket"));
        assert!(app.registry().contains("app_analytics.track_request"));
    }

    #[tokio::test]
    async fn test_non_processor_role_only_registers_one_shot_tasks() {
        let app = Application::new(memory_config(false)).await.unwrap();

        assert!(app.runner().is_none());
        assert!(app.registry().contains("app_analytics.track_feature_evaluation"));
        assert!(!app
            .registry()
            .contains("app_analytics.populate_api_usage_bucket"));
    }

    #[tokio::test]
    async fn test_run_processes_enqueued_tasks_until_shutdown() {
        let app = Arc::new(Application::new(memory_config(true)).await.unwrap());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = {
            let app = Arc::clone(&app);
            tokio::spawn(async move { app.run(shutdown_rx).await })
        };

        let task = app
            .analytics()
            .track_request
            .delay(
                TaskArguments::new()
                    .with_arg(1)
                    .with_arg("api.example.com")
                    .with_arg(42),
                None,
            )
            .await
            .unwrap()
            .unwrap();

        let store = app.runner().unwrap().processor().store().clone();
        let mut completed = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if store.get_task(task.base.id).await.unwrap().unwrap().completed {
                completed = true;
                break;
            }
        }
        assert!(completed);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert!(!app.runner().unwrap().is_running().await);
    }
}
