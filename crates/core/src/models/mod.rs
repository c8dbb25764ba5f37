//! # 数据模型
//!
//! 定义任务处理器的持久化记录：一次性任务 [`Task`]、周期任务 [`RecurringTask`]，
//! 以及它们各自的执行记录 [`TaskRun`] / [`RecurringTaskRun`]。
//!
//! ## 共享结构
//!
//! 两种任务都内嵌同一个 [`TaskBase`]（标识、参数、创建时间），两种执行记录都内嵌
//! 同一个 [`RunAttempt`]（开始/结束时间、结果、错误详情）。处理器通过 [`QueuedTask`]
//! 这个小接口统一对待两种任务，而不是依赖继承式的分派。
//!
//! ## 任务状态流转
//!
//! ```text
//! PENDING ──认领──▶ RUNNING ──成功──▶ SUCCEEDED (completed = true)
//!    ▲                 │
//!    └──失败次数 < 3 ───┤
//!                      └──失败次数 >= 3──▶ ABANDONED（不再被认领，不删除）
//! ```
//!
//! ## 数据库映射
//!
//! ### tasks 表
//! - `id`, `uuid`, `task_identifier`, `serialized_args`, `serialized_kwargs`
//! - `created_at`, `scheduled_for`, `num_failures`, `completed`
//!
//! ### recurring_tasks 表
//! - 与 tasks 相同的基础字段，外加 `run_every_seconds`
//! - (`task_identifier`, `run_every_seconds`) 唯一
//!
//! ### task_runs / recurring_task_runs 表
//! - `id`, `task_id`, `started_at`, `finished_at`, `result`, `error_details`

pub mod recurring_task;
pub mod task;
pub mod task_run;

pub use recurring_task::*;
pub use task::*;
pub use task_run::*;

/// 一次性任务失败达到该次数后被视为放弃，认领查询永久跳过它
pub const MAX_TASK_FAILURES: i32 = 3;

/// 周期任务在一个 `run_every` 窗口内最多启动的运行次数（失败重试的上限）
pub const MAX_RECURRING_RUNS_PER_WINDOW: i64 = 3;

/// 可被处理器认领执行的任务记录
///
/// `Task` 与 `RecurringTask` 共享认领、执行、记录结果的流程，差别只在于
/// 成功/失败后如何更新自身状态，以及对应的执行记录类型。
pub trait QueuedTask: Clone + Send + Sync + 'static {
    /// 该任务对应的执行记录类型
    type Run: Clone + Send + Sync + 'static;

    /// 用于日志和指标的任务种类名
    const KIND: &'static str;

    fn base(&self) -> &TaskBase;

    /// 执行成功后的状态变更
    fn mark_success(&mut self);

    /// 执行失败后的状态变更
    fn mark_failure(&mut self);

    fn id(&self) -> i64 {
        self.base().id
    }

    fn task_identifier(&self) -> &str {
        &self.base().task_identifier
    }
}
