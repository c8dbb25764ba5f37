//! 存储操作的错误上下文
//!
//! 为数据库错误附加操作类型、表名、任务ID等上下文，统一转换为
//! [`ProcessorError`] 并输出结构化日志。

use chrono::{DateTime, Utc};
use processor_errors::ProcessorError;
use sqlx::Error as SqlxError;
use std::fmt;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryOperation {
    Create,
    Read,
    Upsert,
    Claim,
    RecordRun,
    Commit,
    Migrate,
}

impl fmt::Display for RepositoryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepositoryOperation::Create => write!(f, "创建"),
            RepositoryOperation::Read => write!(f, "查询"),
            RepositoryOperation::Upsert => write!(f, "写入或更新"),
            RepositoryOperation::Claim => write!(f, "认领"),
            RepositoryOperation::RecordRun => write!(f, "记录执行结果"),
            RepositoryOperation::Commit => write!(f, "提交"),
            RepositoryOperation::Migrate => write!(f, "迁移"),
        }
    }
}

/// 一次存储操作的上下文
#[derive(Debug, Clone)]
pub struct StoreOperationContext {
    pub operation: RepositoryOperation,
    pub table: &'static str,
    pub task_id: Option<i64>,
    pub task_identifier: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StoreOperationContext {
    pub fn new(operation: RepositoryOperation, table: &'static str) -> Self {
        Self {
            operation,
            table,
            task_id: None,
            task_identifier: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_task_id(mut self, task_id: i64) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_task_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.task_identifier = Some(identifier.into());
        self
    }

    pub fn entity_description(&self) -> String {
        match (&self.task_id, &self.task_identifier) {
            (Some(id), Some(identifier)) => {
                format!("{} 中的任务 '{}' (ID: {})", self.table, identifier, id)
            }
            (Some(id), None) => format!("{} 中的任务 (ID: {})", self.table, id),
            (None, Some(identifier)) => format!("{} 中的任务 '{}'", self.table, identifier),
            (None, None) => self.table.to_string(),
        }
    }
}

pub struct RepositoryErrorHelpers;

impl RepositoryErrorHelpers {
    /// 将 sqlx 错误转换为带上下文的处理器错误
    pub fn database_error(context: &StoreOperationContext, error: SqlxError) -> ProcessorError {
        let entity_desc = context.entity_description();
        let operation_desc = context.operation.to_string();

        let error_msg = match &error {
            SqlxError::Database(db_error) => match db_error.constraint() {
                Some("unique_run_every_tasks") => format!(
                    "{}{}时发生唯一约束冲突: 相同标识和执行间隔的周期任务已存在",
                    operation_desc, entity_desc
                ),
                Some(constraint) if constraint.ends_with("task_id_fkey") => format!(
                    "{}{}时发生外键约束冲突: 关联的任务ID {} 不存在",
                    operation_desc,
                    entity_desc,
                    context.task_id.unwrap_or(0)
                ),
                Some(constraint) => format!(
                    "{}{}时发生数据库约束冲突: {}",
                    operation_desc, entity_desc, constraint
                ),
                None => format!("{}{}时发生数据库错误: {}", operation_desc, entity_desc, db_error),
            },
            SqlxError::PoolClosed => format!("{}{}时数据库连接池已关闭", operation_desc, entity_desc),
            SqlxError::PoolTimedOut => format!("{}{}时数据库连接池超时", operation_desc, entity_desc),
            SqlxError::Io(io_error) => {
                format!("{}{}时发生I/O错误: {}", operation_desc, entity_desc, io_error)
            }
            _ => format!("{}{}时发生未知数据库错误: {}", operation_desc, entity_desc, error),
        };

        error!(
            error = %error,
            operation = %context.operation,
            table = context.table,
            task_id = ?context.task_id,
            "{}",
            error_msg
        );
        ProcessorError::database_error(error_msg)
    }

    pub fn log_operation_success(context: &StoreOperationContext, additional_info: Option<&str>) {
        let base_msg = format!("{}{}成功", context.operation, context.entity_description());
        match additional_info {
            Some(info) => debug!("{}: {}", base_msg, info),
            None => debug!("{}", base_msg),
        }
    }
}

/// 快速构造存储操作上下文
#[macro_export]
macro_rules! store_context {
    ($operation:expr, $table:expr) => {
        $crate::error_handling::StoreOperationContext::new($operation, $table)
    };
    ($operation:expr, $table:expr, task_id = $task_id:expr) => {
        $crate::error_handling::StoreOperationContext::new($operation, $table).with_task_id($task_id)
    };
    ($operation:expr, $table:expr, task_id = $task_id:expr, identifier = $identifier:expr) => {
        $crate::error_handling::StoreOperationContext::new($operation, $table)
            .with_task_id($task_id)
            .with_task_identifier($identifier)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_description() {
        let context = store_context!(RepositoryOperation::Claim, "tasks");
        assert_eq!(context.entity_description(), "tasks");

        let context = store_context!(
            RepositoryOperation::RecordRun,
            "tasks",
            task_id = 7,
            identifier = "tasks.noop"
        );
        assert_eq!(context.entity_description(), "tasks 中的任务 'tasks.noop' (ID: 7)");
    }

    #[test]
    fn test_pool_errors_keep_context() {
        let context = store_context!(RepositoryOperation::Read, "task_runs", task_id = 3);
        let error = RepositoryErrorHelpers::database_error(&context, SqlxError::PoolTimedOut);

        match error {
            ProcessorError::DatabaseOperation(message) => {
                assert!(message.contains("查询"));
                assert!(message.contains("连接池超时"));
            }
            other => panic!("期望 DatabaseOperation, 实际: {other:?}"),
        }
    }
}
