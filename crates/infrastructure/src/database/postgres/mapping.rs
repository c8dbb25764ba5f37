//! PostgreSQL 行到领域模型的映射

use chrono::Duration;
use processor_core::models::{RecurringTask, RecurringTaskRun, RunAttempt, Task, TaskBase, TaskRun};
use processor_errors::{ProcessorError, ProcessorResult};
use sqlx::postgres::PgRow;
use sqlx::Row;

pub struct MappingHelpers;

impl MappingHelpers {
    fn row_to_base(row: &PgRow) -> ProcessorResult<TaskBase> {
        Ok(TaskBase {
            id: row.try_get("id")?,
            uuid: row.try_get("uuid")?,
            task_identifier: row.try_get("task_identifier")?,
            serialized_args: row.try_get("serialized_args")?,
            serialized_kwargs: row.try_get("serialized_kwargs")?,
            created_at: row.try_get("created_at")?,
        })
    }

    pub fn row_to_task(row: &PgRow) -> ProcessorResult<Task> {
        Ok(Task {
            base: Self::row_to_base(row)?,
            scheduled_for: row.try_get("scheduled_for")?,
            num_failures: row.try_get("num_failures")?,
            completed: row.try_get("completed")?,
        })
    }

    pub fn row_to_recurring_task(row: &PgRow) -> ProcessorResult<RecurringTask> {
        let run_every_seconds: i64 = row.try_get("run_every_seconds")?;
        if run_every_seconds <= 0 {
            return Err(ProcessorError::database_error(format!(
                "周期任务的执行间隔无效: {}秒",
                run_every_seconds
            )));
        }
        Ok(RecurringTask {
            base: Self::row_to_base(row)?,
            run_every: Duration::seconds(run_every_seconds),
        })
    }

    pub fn row_to_attempt(row: &PgRow) -> ProcessorResult<RunAttempt> {
        Ok(RunAttempt {
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            result: row.try_get("result")?,
            error_details: row.try_get("error_details")?,
        })
    }

    pub fn row_to_task_run(row: &PgRow) -> ProcessorResult<TaskRun> {
        Ok(TaskRun {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            attempt: Self::row_to_attempt(row)?,
        })
    }

    pub fn row_to_recurring_task_run(row: &PgRow) -> ProcessorResult<RecurringTaskRun> {
        Ok(RecurringTaskRun {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            attempt: Self::row_to_attempt(row)?,
        })
    }
}
