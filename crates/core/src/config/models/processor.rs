use serde::{Deserialize, Serialize};

/// 任务处理器运行配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// 并行运行的处理循环数量
    pub num_workers: usize,
    /// 一轮没有处理到任何任务时的休眠时间（毫秒）
    pub sleep_interval_ms: u64,
    /// 每轮认领的最大任务数
    pub queue_pop_size: usize,
    /// 健康检查容忍的额外延迟（毫秒）
    pub grace_period_ms: u64,
    /// 当前进程是否承担处理器角色，只有处理器角色才会写入周期任务
    pub run_by_processor: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            num_workers: 5,
            sleep_interval_ms: 2000,
            queue_pop_size: 10,
            grace_period_ms: 20000,
            run_by_processor: false,
        }
    }
}

impl ProcessorConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.num_workers == 0 {
            return Err(anyhow::anyhow!("处理循环数量必须大于0"));
        }

        if self.sleep_interval_ms == 0 {
            return Err(anyhow::anyhow!("休眠间隔必须大于0"));
        }

        if self.queue_pop_size == 0 {
            return Err(anyhow::anyhow!("每轮认领数量必须大于0"));
        }

        Ok(())
    }
}
