//! 基于行锁的认领
//!
//! 认领对象持有打开的事务。被选中的行在 `SELECT ... FOR UPDATE SKIP LOCKED`
//! 时加锁，直到 [`TaskClaim::commit`] 提交；认领对象被丢弃时 sqlx 会回滚事务，
//! 锁随之释放，事务内写入的执行记录也一并撤销。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use processor_core::models::{
    QueuedTask, RecurringTask, RecurringTaskRun, RunAttempt, RunHistory, Task, TaskRun,
};
use processor_core::traits::{RecurringTaskClaim, TaskClaim};
use processor_errors::ProcessorResult;
use sqlx::postgres::{PgConnection, PgRow};
use sqlx::{Postgres, Transaction};
use tracing::{debug, instrument};

use super::mapping::MappingHelpers;
use super::RUN_COLUMNS;
use crate::error_handling::{RepositoryErrorHelpers, RepositoryOperation};
use crate::store_context;

async fn insert_run(
    conn: &mut PgConnection,
    table: &str,
    task_id: i64,
    attempt: &RunAttempt,
) -> Result<PgRow, sqlx::Error> {
    let sql = format!(
        "INSERT INTO {table} (task_id, started_at, finished_at, result, error_details) \
         VALUES ($1, $2, $3, $4, $5) RETURNING {RUN_COLUMNS}"
    );
    sqlx::query(&sql)
        .bind(task_id)
        .bind(attempt.started_at)
        .bind(attempt.finished_at)
        .bind(attempt.result)
        .bind(&attempt.error_details)
        .fetch_one(conn)
        .await
}

/// 一次性任务的认领
pub struct PostgresTaskClaim {
    tx: Transaction<'static, Postgres>,
    tasks: Vec<Task>,
}

impl PostgresTaskClaim {
    pub(crate) fn new(tx: Transaction<'static, Postgres>, tasks: Vec<Task>) -> Self {
        Self { tx, tasks }
    }
}

#[async_trait]
impl TaskClaim<Task> for PostgresTaskClaim {
    fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    #[instrument(skip(self, task, attempt), fields(
        task_id = task.id(),
        task_identifier = %task.task_identifier(),
        result = ?attempt.result,
    ))]
    async fn record_run(&mut self, task: &Task, attempt: RunAttempt) -> ProcessorResult<TaskRun> {
        let context = store_context!(
            RepositoryOperation::RecordRun,
            "tasks",
            task_id = task.id(),
            identifier = task.task_identifier()
        );

        sqlx::query("UPDATE tasks SET completed = $1, num_failures = $2 WHERE id = $3")
            .bind(task.completed)
            .bind(task.num_failures)
            .bind(task.id())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

        let row = insert_run(&mut self.tx, "task_runs", task.id(), &attempt)
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

        let run = MappingHelpers::row_to_task_run(&row)?;
        debug!(
            "记录任务执行结果: 任务ID {}, 执行ID {}, 失败次数 {}, 已完成 {}",
            task.id(),
            run.id,
            task.num_failures,
            task.completed
        );
        Ok(run)
    }

    async fn commit(self: Box<Self>) -> ProcessorResult<()> {
        let context = store_context!(RepositoryOperation::Commit, "tasks");
        self.tx
            .commit()
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))
    }
}

/// 周期任务的认领
pub struct PostgresRecurringTaskClaim {
    tx: Transaction<'static, Postgres>,
    tasks: Vec<RecurringTask>,
}

impl PostgresRecurringTaskClaim {
    pub(crate) fn new(tx: Transaction<'static, Postgres>, tasks: Vec<RecurringTask>) -> Self {
        Self { tx, tasks }
    }
}

#[async_trait]
impl TaskClaim<RecurringTask> for PostgresRecurringTaskClaim {
    fn tasks(&self) -> &[RecurringTask] {
        &self.tasks
    }

    #[instrument(skip(self, task, attempt), fields(
        task_id = task.id(),
        task_identifier = %task.task_identifier(),
        result = ?attempt.result,
    ))]
    async fn record_run(
        &mut self,
        task: &RecurringTask,
        attempt: RunAttempt,
    ) -> ProcessorResult<RecurringTaskRun> {
        let context = store_context!(
            RepositoryOperation::RecordRun,
            "recurring_task_runs",
            task_id = task.id(),
            identifier = task.task_identifier()
        );

        let row = insert_run(&mut self.tx, "recurring_task_runs", task.id(), &attempt)
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

        MappingHelpers::row_to_recurring_task_run(&row)
    }

    async fn commit(self: Box<Self>) -> ProcessorResult<()> {
        let context = store_context!(RepositoryOperation::Commit, "recurring_tasks");
        self.tx
            .commit()
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))
    }
}

#[async_trait]
impl RecurringTaskClaim for PostgresRecurringTaskClaim {
    #[instrument(skip(self), fields(task_id = task_id))]
    async fn run_history(
        &mut self,
        task_id: i64,
        since: DateTime<Utc>,
    ) -> ProcessorResult<RunHistory> {
        let context = store_context!(RepositoryOperation::Read, "recurring_task_runs", task_id = task_id);

        let last_run = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM recurring_task_runs WHERE task_id = $1 \
             ORDER BY started_at DESC, id DESC LIMIT 1"
        ))
        .bind(task_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?
        .map(|row| MappingHelpers::row_to_attempt(&row))
        .transpose()?;

        let runs_in_window: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM recurring_task_runs WHERE task_id = $1 AND started_at >= $2",
        )
        .bind(task_id)
        .bind(since)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

        Ok(RunHistory {
            last_run,
            runs_in_window,
        })
    }
}
