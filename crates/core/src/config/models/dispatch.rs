use serde::{Deserialize, Serialize};

/// 任务的执行方式，整个部署统一配置而不是逐次调用指定
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum TaskRunMethod {
    /// 在调用方上下文中立即执行，错误直接返回给调用方
    #[serde(rename = "SYNCHRONOUSLY")]
    Synchronously,
    /// 在后台任务中执行，调用方观察不到失败
    #[default]
    #[serde(rename = "SEPARATE_THREAD")]
    SeparateThread,
    /// 持久化到任务表，由处理器认领执行
    #[serde(rename = "TASK_PROCESSOR")]
    TaskProcessor,
}

impl TaskRunMethod {
    /// 只有处理器模式能够兑现延迟执行
    pub fn supports_delay(&self) -> bool {
        matches!(self, TaskRunMethod::TaskProcessor)
    }
}

impl std::fmt::Display for TaskRunMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskRunMethod::Synchronously => "SYNCHRONOUSLY",
            TaskRunMethod::SeparateThread => "SEPARATE_THREAD",
            TaskRunMethod::TaskProcessor => "TASK_PROCESSOR",
        };
        f.write_str(s)
    }
}

/// 分派配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub task_run_method: TaskRunMethod,
}

impl DispatchConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
