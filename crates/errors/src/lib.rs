use thiserror::Error;

/// 任务处理器错误类型定义
///
/// 处理器本身只会把 `UnknownTask`、`InvalidTaskArguments` 和 `HandlerFailed`
/// 记录为一次失败的运行，不会向认领循环传播。其余变体属于存储、配置等周边错误。
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),
    #[error("任务未找到: {id}")]
    TaskNotFound { id: i64 },
    #[error("周期任务未找到: {id}")]
    RecurringTaskNotFound { id: i64 },
    #[error("未注册的任务标识: '{identifier}'，请确认处理函数已通过 register_task 注册")]
    UnknownTask { identifier: String },
    #[error("任务标识 '{identifier}' 已注册到其他处理函数")]
    TaskAlreadyRegistered { identifier: String },
    #[error("无效的任务参数: {0}")]
    InvalidTaskArguments(String),
    #[error("任务处理函数执行失败: {0}")]
    HandlerFailed(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type ProcessorResult<T> = Result<T, ProcessorError>;

impl ProcessorError {
    pub fn database_error<S: Into<String>>(msg: S) -> Self {
        Self::DatabaseOperation(msg.into())
    }
    pub fn task_not_found(id: i64) -> Self {
        Self::TaskNotFound { id }
    }
    pub fn recurring_task_not_found(id: i64) -> Self {
        Self::RecurringTaskNotFound { id }
    }
    pub fn unknown_task<S: Into<String>>(identifier: S) -> Self {
        Self::UnknownTask {
            identifier: identifier.into(),
        }
    }
    pub fn invalid_arguments<S: Into<String>>(msg: S) -> Self {
        Self::InvalidTaskArguments(msg.into())
    }
    pub fn handler_failed<S: Into<String>>(msg: S) -> Self {
        Self::HandlerFailed(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// 是否属于单个任务执行层面的失败（记录为 FAILURE 运行而不是中断处理循环）
    pub fn is_task_failure(&self) -> bool {
        matches!(
            self,
            ProcessorError::UnknownTask { .. }
                | ProcessorError::InvalidTaskArguments(_)
                | ProcessorError::HandlerFailed(_)
        )
    }
}

impl From<serde_json::Error> for ProcessorError {
    fn from(err: serde_json::Error) -> Self {
        ProcessorError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for ProcessorError {
    fn from(err: anyhow::Error) -> Self {
        ProcessorError::Internal(err.to_string())
    }
}
