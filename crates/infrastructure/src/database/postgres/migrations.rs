use processor_core::models::MAX_TASK_FAILURES;
use processor_errors::ProcessorResult;
use sqlx::PgPool;
use tracing::{debug, info};

use crate::error_handling::{RepositoryErrorHelpers, RepositoryOperation};
use crate::store_context;

/// 创建任务处理器所需的表和索引，可重复执行
pub async fn run_migrations(pool: &PgPool) -> ProcessorResult<()> {
    debug!("运行任务处理器数据库迁移");

    let statements = [
        (
            "tasks",
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id BIGSERIAL PRIMARY KEY,
                uuid UUID NOT NULL UNIQUE,
                task_identifier VARCHAR(200) NOT NULL,
                serialized_args TEXT,
                serialized_kwargs TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                scheduled_for TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                num_failures INTEGER NOT NULL DEFAULT 0,
                completed BOOLEAN NOT NULL DEFAULT FALSE
            )
            "#
            .to_string(),
        ),
        (
            "tasks",
            format!(
                "CREATE INDEX IF NOT EXISTS incomplete_tasks_idx ON tasks (scheduled_for, id) \
                 WHERE NOT completed AND num_failures < {MAX_TASK_FAILURES}"
            ),
        ),
        (
            "recurring_tasks",
            r#"
            CREATE TABLE IF NOT EXISTS recurring_tasks (
                id BIGSERIAL PRIMARY KEY,
                uuid UUID NOT NULL UNIQUE,
                task_identifier VARCHAR(200) NOT NULL,
                serialized_args TEXT,
                serialized_kwargs TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                run_every_seconds BIGINT NOT NULL CHECK (run_every_seconds > 0),
                CONSTRAINT unique_run_every_tasks UNIQUE (task_identifier, run_every_seconds)
            )
            "#
            .to_string(),
        ),
        (
            "task_runs",
            r#"
            CREATE TABLE IF NOT EXISTS task_runs (
                id BIGSERIAL PRIMARY KEY,
                task_id BIGINT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                started_at TIMESTAMPTZ NOT NULL,
                finished_at TIMESTAMPTZ,
                result VARCHAR(50),
                error_details TEXT
            )
            "#
            .to_string(),
        ),
        (
            "recurring_task_runs",
            r#"
            CREATE TABLE IF NOT EXISTS recurring_task_runs (
                id BIGSERIAL PRIMARY KEY,
                task_id BIGINT NOT NULL REFERENCES recurring_tasks(id) ON DELETE CASCADE,
                started_at TIMESTAMPTZ NOT NULL,
                finished_at TIMESTAMPTZ,
                result VARCHAR(50),
                error_details TEXT
            )
            "#
            .to_string(),
        ),
        (
            "task_runs",
            "CREATE INDEX IF NOT EXISTS idx_task_runs_task_id ON task_runs(task_id, started_at)"
                .to_string(),
        ),
        (
            "recurring_task_runs",
            "CREATE INDEX IF NOT EXISTS idx_recurring_task_runs_task_id ON recurring_task_runs(task_id, started_at)"
                .to_string(),
        ),
    ];

    for (table, sql) in statements {
        sqlx::query(&sql).execute(pool).await.map_err(|e| {
            RepositoryErrorHelpers::database_error(
                &store_context!(RepositoryOperation::Migrate, table),
                e,
            )
        })?;
    }

    info!("任务处理器数据库迁移完成");
    Ok(())
}
