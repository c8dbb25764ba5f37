use chrono::{Duration, Utc};
use processor_errors::{ProcessorError, ProcessorResult};
use serde::{Deserialize, Serialize};

use super::{QueuedTask, RecurringTaskRun, TaskArguments, TaskBase};

/// 周期任务
///
/// 每个 (`task_identifier`, `run_every`) 组合最多存在一条记录。周期任务没有
/// `scheduled_for`，是否到期由调度器根据最近的执行记录实时计算，
/// 成功或失败都不会改变记录本身。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringTask {
    #[serde(flatten)]
    pub base: TaskBase,
    #[serde(with = "duration_seconds")]
    pub run_every: Duration,
}

impl RecurringTask {
    pub fn new(
        task_identifier: impl Into<String>,
        run_every: Duration,
        arguments: &TaskArguments,
    ) -> ProcessorResult<Self> {
        if run_every <= Duration::zero() {
            return Err(ProcessorError::invalid_arguments(format!(
                "周期任务的执行间隔必须大于0，实际: {}秒",
                run_every.num_seconds()
            )));
        }
        Ok(Self {
            base: TaskBase::new(task_identifier, arguments)?,
            run_every,
        })
    }

    pub fn run_every_seconds(&self) -> i64 {
        self.run_every.num_seconds()
    }

    /// 当前时刻所在的回看窗口起点
    pub fn window_start(&self, now: chrono::DateTime<Utc>) -> chrono::DateTime<Utc> {
        now - self.run_every
    }
}

impl QueuedTask for RecurringTask {
    type Run = RecurringTaskRun;

    const KIND: &'static str = "recurring_task";

    fn base(&self) -> &TaskBase {
        &self.base
    }

    // 周期任务没有终态，是否再次执行完全由执行记录决定
    fn mark_success(&mut self) {}

    fn mark_failure(&mut self) {}
}

mod duration_seconds {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(value.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let seconds = i64::deserialize(deserializer)?;
        Ok(Duration::seconds(seconds))
    }
}
