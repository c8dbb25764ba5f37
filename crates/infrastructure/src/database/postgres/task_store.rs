use async_trait::async_trait;
use chrono::{DateTime, Utc};
use processor_core::models::{
    RecurringTask, RecurringTaskRun, Task, TaskResult, TaskRun, MAX_RECURRING_RUNS_PER_WINDOW,
    MAX_TASK_FAILURES,
};
use processor_core::traits::{RecurringTaskClaim, TaskClaim, TaskStore};
use processor_errors::ProcessorResult;
use sqlx::PgPool;
use tracing::{debug, instrument};

use super::claim::{PostgresRecurringTaskClaim, PostgresTaskClaim};
use super::mapping::MappingHelpers;
use super::{RECURRING_TASK_COLUMNS, RUN_COLUMNS, TASK_COLUMNS};
use crate::error_handling::{RepositoryErrorHelpers, RepositoryOperation};
use crate::store_context;

/// PostgreSQL 任务存储
///
/// 认领依赖 `FOR UPDATE SKIP LOCKED`：并发的认领事务互不阻塞，各自拿到不相交的行。
pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    #[instrument(skip(self, task), fields(task_identifier = %task.base.task_identifier))]
    async fn create_task(&self, task: &Task) -> ProcessorResult<Task> {
        let context = store_context!(RepositoryOperation::Create, "tasks")
            .with_task_identifier(task.base.task_identifier.as_str());

        let row = sqlx::query(&format!(
            "INSERT INTO tasks (uuid, task_identifier, serialized_args, serialized_kwargs, created_at, scheduled_for, num_failures, completed) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING {TASK_COLUMNS}"
        ))
        .bind(task.base.uuid)
        .bind(&task.base.task_identifier)
        .bind(&task.base.serialized_args)
        .bind(&task.base.serialized_kwargs)
        .bind(task.base.created_at)
        .bind(task.scheduled_for)
        .bind(task.num_failures)
        .bind(task.completed)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

        let created = MappingHelpers::row_to_task(&row)?;
        RepositoryErrorHelpers::log_operation_success(
            &context.with_task_id(created.base.id),
            Some(&format!("计划执行时间: {}", created.scheduled_for)),
        );
        Ok(created)
    }

    #[instrument(skip(self), fields(task_id = id))]
    async fn get_task(&self, id: i64) -> ProcessorResult<Option<Task>> {
        let context = store_context!(RepositoryOperation::Read, "tasks", task_id = id);

        sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?
            .map(|row| MappingHelpers::row_to_task(&row))
            .transpose()
    }

    #[instrument(skip(self), fields(task_id = task_id))]
    async fn list_task_runs(&self, task_id: i64) -> ProcessorResult<Vec<TaskRun>> {
        let context = store_context!(RepositoryOperation::Read, "task_runs", task_id = task_id);

        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM task_runs WHERE task_id = $1 ORDER BY started_at, id"
        ))
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

        rows.iter().map(MappingHelpers::row_to_task_run).collect()
    }

    #[instrument(skip(self), fields(batch_size = batch_size))]
    async fn claim_tasks(
        &self,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> ProcessorResult<Box<dyn TaskClaim<Task>>> {
        let context = store_context!(RepositoryOperation::Claim, "tasks");

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE NOT completed AND num_failures < $1 AND scheduled_for <= $2 \
             ORDER BY scheduled_for, id \
             LIMIT $3 \
             FOR UPDATE SKIP LOCKED"
        ))
        .bind(MAX_TASK_FAILURES)
        .bind(now)
        .bind(batch_size as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

        let tasks = rows
            .iter()
            .map(MappingHelpers::row_to_task)
            .collect::<ProcessorResult<Vec<_>>>()?;

        debug!("认领到 {} 个任务", tasks.len());
        Ok(Box::new(PostgresTaskClaim::new(tx, tasks)))
    }

    #[instrument(skip(self, task), fields(
        task_identifier = %task.base.task_identifier,
        run_every_seconds = task.run_every_seconds(),
    ))]
    async fn upsert_recurring_task(&self, task: &RecurringTask) -> ProcessorResult<RecurringTask> {
        let context = store_context!(RepositoryOperation::Upsert, "recurring_tasks")
            .with_task_identifier(task.base.task_identifier.as_str());

        // DO NOTHING 不等待行锁，执行中的周期任务不会阻塞重启后的注册
        let inserted = sqlx::query(&format!(
            "INSERT INTO recurring_tasks (uuid, task_identifier, serialized_args, serialized_kwargs, created_at, run_every_seconds) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT ON CONSTRAINT unique_run_every_tasks DO NOTHING \
             RETURNING {RECURRING_TASK_COLUMNS}"
        ))
        .bind(task.base.uuid)
        .bind(&task.base.task_identifier)
        .bind(&task.base.serialized_args)
        .bind(&task.base.serialized_kwargs)
        .bind(task.base.created_at)
        .bind(task.run_every_seconds())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

        let row = match inserted {
            Some(row) => row,
            None => {
                let existing = sqlx::query(&format!(
                    "SELECT {RECURRING_TASK_COLUMNS} FROM recurring_tasks \
                     WHERE task_identifier = $1 AND run_every_seconds = $2"
                ))
                .bind(&task.base.task_identifier)
                .bind(task.run_every_seconds())
                .fetch_one(&self.pool)
                .await
                .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

                let stored = MappingHelpers::row_to_recurring_task(&existing)?;
                if stored.base.serialized_args == task.base.serialized_args
                    && stored.base.serialized_kwargs == task.base.serialized_kwargs
                {
                    debug!("周期任务 '{}' 参数未变化", stored.base.task_identifier);
                    return Ok(stored);
                }

                sqlx::query(&format!(
                    "UPDATE recurring_tasks SET serialized_args = $1, serialized_kwargs = $2 \
                     WHERE id = $3 RETURNING {RECURRING_TASK_COLUMNS}"
                ))
                .bind(&task.base.serialized_args)
                .bind(&task.base.serialized_kwargs)
                .bind(stored.base.id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?
            }
        };

        let stored = MappingHelpers::row_to_recurring_task(&row)?;
        RepositoryErrorHelpers::log_operation_success(&context.with_task_id(stored.base.id), None);
        Ok(stored)
    }

    #[instrument(skip(self), fields(task_id = id))]
    async fn get_recurring_task(&self, id: i64) -> ProcessorResult<Option<RecurringTask>> {
        let context = store_context!(RepositoryOperation::Read, "recurring_tasks", task_id = id);

        sqlx::query(&format!(
            "SELECT {RECURRING_TASK_COLUMNS} FROM recurring_tasks WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?
        .map(|row| MappingHelpers::row_to_recurring_task(&row))
        .transpose()
    }

    #[instrument(skip(self), fields(task_id = task_id))]
    async fn list_recurring_task_runs(&self, task_id: i64) -> ProcessorResult<Vec<RecurringTaskRun>> {
        let context =
            store_context!(RepositoryOperation::Read, "recurring_task_runs", task_id = task_id);

        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM recurring_task_runs WHERE task_id = $1 ORDER BY started_at, id"
        ))
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

        rows.iter()
            .map(MappingHelpers::row_to_recurring_task_run)
            .collect()
    }

    #[instrument(skip(self), fields(batch_size = batch_size))]
    async fn claim_recurring_tasks(
        &self,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> ProcessorResult<Box<dyn RecurringTaskClaim>> {
        let context = store_context!(RepositoryOperation::Claim, "recurring_tasks");

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

        // 到期条件与 RunHistory::is_due 一致，只锁定会被执行的行
        let rows = sqlx::query(&format!(
            "SELECT {RECURRING_TASK_COLUMNS} FROM recurring_tasks rt \
             LEFT JOIN LATERAL ( \
                 SELECT started_at, result FROM recurring_task_runs \
                 WHERE task_id = rt.id ORDER BY started_at DESC, id DESC LIMIT 1 \
             ) last_run ON TRUE \
             WHERE last_run.started_at IS NULL \
                OR last_run.started_at <= $1 - rt.run_every_seconds * INTERVAL '1 second' \
                OR (last_run.result IS DISTINCT FROM $2 \
                    AND (SELECT COUNT(*) FROM recurring_task_runs w \
                         WHERE w.task_id = rt.id \
                           AND w.started_at >= $1 - rt.run_every_seconds * INTERVAL '1 second') < $3) \
             ORDER BY rt.id \
             LIMIT $4 \
             FOR UPDATE OF rt SKIP LOCKED"
        ))
        .bind(now)
        .bind(TaskResult::Success)
        .bind(MAX_RECURRING_RUNS_PER_WINDOW)
        .bind(batch_size as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

        let tasks = rows
            .iter()
            .map(MappingHelpers::row_to_recurring_task)
            .collect::<ProcessorResult<Vec<_>>>()?;

        debug!("认领到 {} 个到期周期任务", tasks.len());
        Ok(Box::new(PostgresRecurringTaskClaim::new(tx, tasks)))
    }
}
