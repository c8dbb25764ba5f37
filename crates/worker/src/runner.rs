//! 处理器后台服务
//!
//! 启动 `num_workers` 个互相独立的处理循环。每个循环依次执行一次性任务和周期任务，
//! 一轮没有处理到任何任务时休眠 `sleep_interval_ms`。循环之间不做任何协调，
//! 互斥完全依赖存储层的认领。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use processor_core::config::ProcessorConfig;
use processor_errors::{ProcessorError, ProcessorResult};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::processor::TaskProcessor;

type LastChecked = Arc<RwLock<Option<DateTime<Utc>>>>;

struct WorkerLoop {
    last_checked_for_tasks: LastChecked,
    handle: JoinHandle<()>,
}

/// 处理器服务构建器
pub struct ProcessorRunnerBuilder {
    processor: Arc<TaskProcessor>,
    config: ProcessorConfig,
    name: String,
}

impl ProcessorRunnerBuilder {
    pub fn new(processor: Arc<TaskProcessor>) -> Self {
        Self {
            processor,
            config: ProcessorConfig::default(),
            name: hostname::get()
                .unwrap_or_else(|_| "unknown".into())
                .to_string_lossy()
                .to_string(),
        }
    }

    pub fn config(mut self, config: ProcessorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.config.num_workers = num_workers;
        self
    }

    pub fn sleep_interval_ms(mut self, sleep_interval_ms: u64) -> Self {
        self.config.sleep_interval_ms = sleep_interval_ms;
        self
    }

    pub fn queue_pop_size(mut self, queue_pop_size: usize) -> Self {
        self.config.queue_pop_size = queue_pop_size;
        self
    }

    /// 用于日志区分不同进程，默认为主机名
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn build(self) -> ProcessorResult<ProcessorRunner> {
        self.config
            .validate()
            .map_err(|e| ProcessorError::config_error(e.to_string()))?;

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(ProcessorRunner {
            processor: self.processor,
            config: self.config,
            name: self.name,
            shutdown_tx,
            workers: RwLock::new(Vec::new()),
        })
    }
}

pub struct ProcessorRunner {
    processor: Arc<TaskProcessor>,
    config: ProcessorConfig,
    name: String,
    shutdown_tx: broadcast::Sender<()>,
    workers: RwLock<Vec<WorkerLoop>>,
}

impl ProcessorRunner {
    pub fn builder(processor: Arc<TaskProcessor>) -> ProcessorRunnerBuilder {
        ProcessorRunnerBuilder::new(processor)
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn processor(&self) -> &Arc<TaskProcessor> {
        &self.processor
    }

    pub async fn start(&self) -> ProcessorResult<()> {
        let mut workers = self.workers.write().await;
        if !workers.is_empty() {
            return Err(ProcessorError::Internal(format!(
                "处理器服务 {} 已在运行",
                self.name
            )));
        }

        info!(
            "启动处理器服务 {}: {} 个处理循环, 每轮认领 {} 个任务, 空闲休眠 {}ms",
            self.name,
            self.config.num_workers,
            self.config.queue_pop_size,
            self.config.sleep_interval_ms
        );

        for index in 0..self.config.num_workers {
            let last_checked_for_tasks: LastChecked = Arc::new(RwLock::new(None));
            let handle = tokio::spawn(Self::run_loop(
                index,
                Arc::clone(&self.processor),
                self.config.clone(),
                Arc::clone(&last_checked_for_tasks),
                self.shutdown_tx.subscribe(),
            ));
            workers.push(WorkerLoop {
                last_checked_for_tasks,
                handle,
            });
        }

        Ok(())
    }

    /// 发送关闭信号并等待所有循环完成当前一轮
    pub async fn stop(&self) -> ProcessorResult<()> {
        let workers = std::mem::take(&mut *self.workers.write().await);
        if workers.is_empty() {
            return Ok(());
        }

        info!("停止处理器服务: {}", self.name);
        let _ = self.shutdown_tx.send(());

        for (index, worker) in workers.into_iter().enumerate() {
            if let Err(e) = worker.handle.await {
                error!("处理循环 {} 异常退出: {}", index, e);
            }
        }

        info!("处理器服务 {} 已停止", self.name);
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        !self.workers.read().await.is_empty()
    }

    /// 每个处理循环最近一次检查任务的时间
    pub async fn last_checked_for_tasks(&self) -> Vec<Option<DateTime<Utc>>> {
        let workers = self.workers.read().await;
        let mut checked = Vec::with_capacity(workers.len());
        for worker in workers.iter() {
            checked.push(*worker.last_checked_for_tasks.read().await);
        }
        checked
    }

    /// 所有循环都在 `sleep_interval_ms + grace_period_ms` 内检查过任务时视为健康
    pub async fn is_healthy(&self) -> bool {
        let threshold = chrono::Duration::milliseconds(
            (self.config.sleep_interval_ms + self.config.grace_period_ms) as i64,
        );
        let now = Utc::now();

        let checked = self.last_checked_for_tasks().await;
        !checked.is_empty()
            && checked
                .iter()
                .all(|last| last.is_some_and(|last| now - last <= threshold))
    }

    async fn run_loop(
        index: usize,
        processor: Arc<TaskProcessor>,
        config: ProcessorConfig,
        last_checked_for_tasks: LastChecked,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        debug!("处理循环 {} 已启动", index);
        let sleep_interval = Duration::from_millis(config.sleep_interval_ms);

        loop {
            let processed = Self::run_pass(index, &processor, config.queue_pop_size).await;
            *last_checked_for_tasks.write().await = Some(Utc::now());

            if processed > 0 {
                match shutdown_rx.try_recv() {
                    Err(TryRecvError::Empty) => continue,
                    _ => break,
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(sleep_interval) => {}
                _ = shutdown_rx.recv() => break,
            }
        }

        debug!("处理循环 {} 已退出", index);
    }

    async fn run_pass(index: usize, processor: &TaskProcessor, batch_size: usize) -> usize {
        let mut processed = 0;

        match processor.run_tasks(batch_size).await {
            Ok(runs) => processed += runs.len(),
            Err(e) => warn!("处理循环 {} 执行一次性任务失败: {}", index, e),
        }

        match processor.run_recurring_tasks(batch_size).await {
            Ok(runs) => processed += runs.len(),
            Err(e) => warn!("处理循环 {} 执行周期任务失败: {}", index, e),
        }

        if processed > 0 {
            debug!("处理循环 {} 本轮处理了 {} 个任务", index, processed);
        }
        processed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use processor_core::models::{Task, TaskArguments};
    use processor_core::registry::{Arity, TaskHandler, TaskRegistryBuilder};
    use processor_core::traits::TaskStore;
    use processor_infrastructure::InMemoryTaskStore;

    fn runner_for(store: &InMemoryTaskStore) -> ProcessorRunner {
        let handler: Arc<dyn TaskHandler> =
            Arc::new(|_arguments: TaskArguments| async { anyhow::Ok(()) });
        let mut builder = TaskRegistryBuilder::new();
        builder.register("tasks.noop", handler, Arity::Any).unwrap();

        let processor = TaskProcessor::new(Arc::new(store.clone()), Arc::new(builder.build()));
        ProcessorRunner::builder(Arc::new(processor))
            .num_workers(2)
            .sleep_interval_ms(20)
            .queue_pop_size(5)
            .name("test-runner")
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let store = InMemoryTaskStore::new();
        let processor = TaskProcessor::new(
            Arc::new(store),
            Arc::new(TaskRegistryBuilder::new().build()),
        );

        let result = ProcessorRunner::builder(Arc::new(processor))
            .num_workers(0)
            .build();
        assert!(matches!(result, Err(ProcessorError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_runner_processes_tasks_until_stopped() {
        let store = InMemoryTaskStore::new();
        let runner = runner_for(&store);

        let mut ids = Vec::new();
        for _ in 0..3 {
            let task = Task::create("tasks.noop", &TaskArguments::new()).unwrap();
            ids.push(store.create_task(&task).await.unwrap().base.id);
        }

        assert!(!runner.is_healthy().await);
        runner.start().await.unwrap();
        assert!(runner.start().await.is_err());

        let mut completed = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let mut all = true;
            for id in &ids {
                all &= store.get_task(*id).await.unwrap().unwrap().completed;
            }
            if all {
                completed = true;
                break;
            }
        }
        assert!(completed);
        assert!(runner.is_healthy().await);
        assert_eq!(runner.last_checked_for_tasks().await.len(), 2);

        runner.stop().await.unwrap();
        assert!(!runner.is_running().await);
        assert!(!runner.is_healthy().await);
    }
}
