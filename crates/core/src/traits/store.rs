//! 任务存储接口定义
//!
//! 处理器不直接依赖具体数据库，而是通过 [`TaskStore`] 访问四张表：
//! `tasks`、`recurring_tasks`、`task_runs`、`recurring_task_runs`。
//!
//! ## 认领
//!
//! 认领是整个系统唯一的并发控制手段。`claim_*` 打开一个事务，用"跳过已被锁定行"
//! 的方式锁住一批任务，并以 [`TaskClaim`] 的形式交给处理器。锁会一直持有到
//! [`TaskClaim::commit`] 提交，或者认领对象被丢弃（事务回滚）为止：
//!
//! - 并发的 Worker 互不等待，只是各自拿到不相交的任务；
//! - 执行过程中进程崩溃时事务回滚，任务重新变为可认领（至少一次语义）；
//! - 认领期间写入的执行记录与任务状态只有在提交后才对其他 Worker 可见。
//!
//! ## 使用示例
//!
//! ```rust,no_run
//! use chrono::Utc;
//! use processor_core::models::RunAttempt;
//! use processor_core::traits::TaskStore;
//! use processor_core::ProcessorResult;
//!
//! async fn complete_next(store: &dyn TaskStore) -> ProcessorResult<()> {
//!     let mut claim = store.claim_tasks(1, Utc::now()).await?;
//!     let tasks = claim.tasks().to_vec();
//!     for mut task in tasks {
//!         task.completed = true;
//!         let attempt = RunAttempt::start(Utc::now()).succeed(Utc::now());
//!         claim.record_run(&task, attempt).await?;
//!     }
//!     claim.commit().await
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use processor_errors::ProcessorResult;

use crate::models::{
    QueuedTask, RecurringTask, RecurringTaskRun, RunAttempt, RunHistory, Task, TaskRun,
};

/// 一次认领持有的锁和事务
#[async_trait]
pub trait TaskClaim<T: QueuedTask>: Send {
    /// 本次认领锁定的任务
    fn tasks(&self) -> &[T];

    /// 在认领事务内写回任务状态并插入一条执行记录
    async fn record_run(&mut self, task: &T, attempt: RunAttempt) -> ProcessorResult<T::Run>;

    /// 提交事务并释放锁
    async fn commit(self: Box<Self>) -> ProcessorResult<()>;
}

/// 周期任务的认领，额外提供事务内的执行历史查询
#[async_trait]
pub trait RecurringTaskClaim: TaskClaim<RecurringTask> {
    /// 查询最近一次执行以及 `since` 之后启动的执行次数
    async fn run_history(&mut self, task_id: i64, since: DateTime<Utc>) -> ProcessorResult<RunHistory>;
}

/// 任务存储接口
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// 持久化一个新的一次性任务，返回带有数据库 ID 的记录
    async fn create_task(&self, task: &Task) -> ProcessorResult<Task>;

    async fn get_task(&self, id: i64) -> ProcessorResult<Option<Task>>;

    /// 按 `started_at` 升序返回任务的全部执行记录
    async fn list_task_runs(&self, task_id: i64) -> ProcessorResult<Vec<TaskRun>>;

    /// 认领最多 `batch_size` 个到期任务
    ///
    /// 条件为 `completed = false`、`num_failures < 3`、`scheduled_for <= now`，
    /// 按 `scheduled_for` 升序，跳过其他事务已锁定的行。
    async fn claim_tasks(
        &self,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> ProcessorResult<Box<dyn TaskClaim<Task>>>;

    /// 按 (`task_identifier`, `run_every`) 插入或更新周期任务，保证只存在一条记录
    async fn upsert_recurring_task(&self, task: &RecurringTask) -> ProcessorResult<RecurringTask>;

    async fn get_recurring_task(&self, id: i64) -> ProcessorResult<Option<RecurringTask>>;

    /// 按 `started_at` 升序返回周期任务的全部执行记录
    async fn list_recurring_task_runs(&self, task_id: i64) -> ProcessorResult<Vec<RecurringTaskRun>>;

    /// 认领最多 `batch_size` 个到期的周期任务
    ///
    /// 只锁定按 [`RunHistory::is_due`] 判断为到期的行，未到期的行和超出批量的行
    /// 留给其他 Worker。筛选先于加锁，调用方应在认领事务内用
    /// [`RecurringTaskClaim::run_history`] 复核。
    ///
    /// [`RunHistory::is_due`]: crate::models::RunHistory::is_due
    async fn claim_recurring_tasks(
        &self,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> ProcessorResult<Box<dyn RecurringTaskClaim>>;
}
