use chrono::{DateTime, Utc};
use processor_errors::{ProcessorError, ProcessorResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::{QueuedTask, TaskRun, MAX_TASK_FAILURES};

/// 任务参数
///
/// 对应处理函数的位置参数与关键字参数，持久化时分别序列化为 JSON 文本。
///
/// # 使用示例
///
/// ```rust
/// use processor_core::models::TaskArguments;
///
/// let arguments = TaskArguments::new()
///     .with_arg("test-org")
///     .with_kwarg("notify", true);
///
/// assert_eq!(arguments.arg::<String>(0).unwrap(), "test-org");
/// assert_eq!(arguments.kwarg::<bool>("notify").unwrap(), Some(true));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskArguments {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl TaskArguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn positional(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: Map::new(),
        }
    }

    pub fn with_arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn with_kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// 读取指定位置的参数
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> ProcessorResult<T> {
        let value = self.args.get(index).ok_or_else(|| {
            ProcessorError::invalid_arguments(format!(
                "缺少第{}个位置参数，实际只有{}个",
                index + 1,
                self.args.len()
            ))
        })?;
        serde_json::from_value(value.clone()).map_err(|e| {
            ProcessorError::invalid_arguments(format!("第{}个位置参数类型不匹配: {e}", index + 1))
        })
    }

    /// 读取关键字参数，不存在或为 null 时返回 `None`
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> ProcessorResult<Option<T>> {
        match self.kwargs.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| {
                    ProcessorError::invalid_arguments(format!("关键字参数 '{name}' 类型不匹配: {e}"))
                }),
        }
    }

    /// 将全部关键字参数反序列化为一个结构体
    pub fn kwargs_as<T: DeserializeOwned>(&self) -> ProcessorResult<T> {
        serde_json::from_value(Value::Object(self.kwargs.clone()))
            .map_err(|e| ProcessorError::invalid_arguments(format!("关键字参数无效: {e}")))
    }

    pub fn serialize_args(&self) -> ProcessorResult<String> {
        Ok(serde_json::to_string(&self.args)?)
    }

    pub fn serialize_kwargs(&self) -> ProcessorResult<String> {
        Ok(serde_json::to_string(&self.kwargs)?)
    }

    /// 从持久化的 JSON 文本恢复参数，空值视为没有参数
    pub fn deserialize(
        serialized_args: Option<&str>,
        serialized_kwargs: Option<&str>,
    ) -> ProcessorResult<Self> {
        let args = match serialized_args {
            Some(data) if !data.trim().is_empty() => serde_json::from_str(data)?,
            _ => Vec::new(),
        };
        let kwargs = match serialized_kwargs {
            Some(data) if !data.trim().is_empty() => serde_json::from_str(data)?,
            _ => Map::new(),
        };
        Ok(Self { args, kwargs })
    }
}

/// 一次性任务与周期任务共享的基础字段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskBase {
    pub id: i64,
    pub uuid: Uuid,
    pub task_identifier: String,
    pub serialized_args: Option<String>,
    pub serialized_kwargs: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TaskBase {
    pub fn new(task_identifier: impl Into<String>, arguments: &TaskArguments) -> ProcessorResult<Self> {
        Ok(Self {
            id: 0, // 将由数据库生成
            uuid: Uuid::new_v4(),
            task_identifier: task_identifier.into(),
            serialized_args: Some(arguments.serialize_args()?),
            serialized_kwargs: Some(arguments.serialize_kwargs()?),
            created_at: Utc::now(),
        })
    }

    pub fn arguments(&self) -> ProcessorResult<TaskArguments> {
        TaskArguments::deserialize(
            self.serialized_args.as_deref(),
            self.serialized_kwargs.as_deref(),
        )
    }
}

/// 一次性任务
///
/// 由调用方创建后只会被处理器修改：成功时 `completed = true`，失败时
/// `num_failures` 加一。失败次数达到 [`MAX_TASK_FAILURES`] 的任务被放弃，
/// 但记录会保留用于审计。
///
/// # 使用示例
///
/// ```rust
/// use chrono::{Duration, Utc};
/// use processor_core::models::{Task, TaskArguments};
///
/// let task = Task::schedule(
///     Utc::now() + Duration::minutes(5),
///     "organisations.create_organisation",
///     &TaskArguments::new().with_arg("test-org"),
/// )
/// .unwrap();
///
/// assert!(!task.completed);
/// assert!(!task.is_claimable(Utc::now()));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(flatten)]
    pub base: TaskBase,
    pub scheduled_for: DateTime<Utc>,
    pub num_failures: i32,
    pub completed: bool,
}

impl Task {
    /// 创建立即可执行的任务
    pub fn create(task_identifier: impl Into<String>, arguments: &TaskArguments) -> ProcessorResult<Self> {
        let base = TaskBase::new(task_identifier, arguments)?;
        Ok(Self {
            scheduled_for: base.created_at,
            base,
            num_failures: 0,
            completed: false,
        })
    }

    /// 创建在指定时间之后才可执行的任务
    pub fn schedule(
        schedule_for: DateTime<Utc>,
        task_identifier: impl Into<String>,
        arguments: &TaskArguments,
    ) -> ProcessorResult<Self> {
        let mut task = Self::create(task_identifier, arguments)?;
        task.scheduled_for = schedule_for;
        Ok(task)
    }

    /// 失败次数已用尽，不会再被认领
    pub fn is_abandoned(&self) -> bool {
        !self.completed && self.num_failures >= MAX_TASK_FAILURES
    }

    /// 未完成、未放弃且已到期
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        !self.completed && self.num_failures < MAX_TASK_FAILURES && self.scheduled_for <= now
    }
}

impl QueuedTask for Task {
    type Run = TaskRun;

    const KIND: &'static str = "task";

    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn mark_success(&mut self) {
        self.completed = true;
    }

    fn mark_failure(&mut self) {
        self.num_failures += 1;
    }
}
