//! 周期任务到期复核
//!
//! 周期任务不存储下一次执行时间。存储层认领时已按执行历史筛掉未到期的任务，
//! 但筛选发生在加锁之前：另一个 Worker 可能恰好在此期间提交了同一任务的执行。
//! 因此加锁后在认领事务内重新读取历史，用 [`RunHistory::is_due`] 复核一次。
//!
//! [`RunHistory::is_due`]: processor_core::models::RunHistory::is_due

use chrono::{DateTime, Utc};
use processor_core::models::RecurringTask;
use processor_core::traits::RecurringTaskClaim;
use processor_errors::ProcessorResult;
use tracing::debug;

/// 从已锁定的周期任务中挑出最多 `batch_size` 个仍然到期的任务
pub async fn select_due_tasks(
    claim: &mut dyn RecurringTaskClaim,
    batch_size: usize,
    now: DateTime<Utc>,
) -> ProcessorResult<Vec<RecurringTask>> {
    let candidates = claim.tasks().to_vec();
    let mut due = Vec::new();

    for task in candidates {
        if due.len() >= batch_size {
            break;
        }

        let history = claim
            .run_history(task.base.id, task.window_start(now))
            .await?;
        if history.is_due(task.run_every, now) {
            due.push(task);
        } else {
            debug!(
                "周期任务 '{}' (ID: {}) 已被其他 Worker 执行，窗口内已执行 {} 次",
                task.base.task_identifier, task.base.id, history.runs_in_window
            );
        }
    }

    Ok(due)
}
