use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// 单次执行的结果
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskResult {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAILURE")]
    Failure,
}

impl TaskResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskResult::Success => "SUCCESS",
            TaskResult::Failure => "FAILURE",
        }
    }
}

impl std::fmt::Display for TaskResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(TaskResult::Success),
            "FAILURE" => Ok(TaskResult::Failure),
            _ => Err(format!("Invalid task result: {s}")),
        }
    }
}

impl sqlx::Type<sqlx::Postgres> for TaskResult {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("VARCHAR")
    }

    fn compatible(ty: &sqlx::postgres::PgTypeInfo) -> bool {
        <&str as sqlx::Type<sqlx::Postgres>>::compatible(ty)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for TaskResult {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        Ok(s.parse()?)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for TaskResult {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
    }
}

/// 执行记录的共享部分
///
/// `finished_at` 只有在执行成功结束时才会写入：失败的执行保留 `finished_at = None`，
/// 以此和正常结束的执行区分开。`result` 为 `None` 表示仍在执行中。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunAttempt {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<TaskResult>,
    pub error_details: Option<String>,
}

impl RunAttempt {
    pub fn start(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            finished_at: None,
            result: None,
            error_details: None,
        }
    }

    pub fn succeed(mut self, finished_at: DateTime<Utc>) -> Self {
        self.finished_at = Some(finished_at);
        self.result = Some(TaskResult::Success);
        self.error_details = None;
        self
    }

    pub fn fail(mut self, error_details: impl Into<String>) -> Self {
        self.finished_at = None;
        self.result = Some(TaskResult::Failure);
        self.error_details = Some(error_details.into());
        self
    }

    pub fn is_running(&self) -> bool {
        self.result.is_none()
    }

    pub fn is_successful(&self) -> bool {
        matches!(self.result, Some(TaskResult::Success))
    }

    pub fn execution_duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|finished| (finished - self.started_at).num_milliseconds())
    }
}

/// 一次性任务的执行记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: i64,
    pub task_id: i64,
    #[serde(flatten)]
    pub attempt: RunAttempt,
}

/// 周期任务的执行记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringTaskRun {
    pub id: i64,
    pub task_id: i64,
    #[serde(flatten)]
    pub attempt: RunAttempt,
}

/// 判断周期任务是否到期所需的执行历史
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunHistory {
    /// 按 `started_at` 最近的一次执行
    pub last_run: Option<RunAttempt>,
    /// 回看窗口内启动过的执行次数
    pub runs_in_window: i64,
}

impl RunHistory {
    /// 周期任务是否到期
    ///
    /// - 从未执行过：到期；
    /// - 距最近一次执行的开始时间已超过 `run_every`：到期；
    /// - 最近一次执行未成功，且回看窗口 `[now - run_every, now]` 内启动的执行少于
    ///   [`MAX_RECURRING_RUNS_PER_WINDOW`] 次：到期（窗口内有限次重试）；
    /// - 其余情况：未到期。
    ///
    /// [`MAX_RECURRING_RUNS_PER_WINDOW`]: super::MAX_RECURRING_RUNS_PER_WINDOW
    pub fn is_due(&self, run_every: Duration, now: DateTime<Utc>) -> bool {
        let Some(last_run) = &self.last_run else {
            return true;
        };

        if now - last_run.started_at >= run_every {
            return true;
        }

        !last_run.is_successful() && self.runs_in_window < super::MAX_RECURRING_RUNS_PER_WINDOW
    }
}
