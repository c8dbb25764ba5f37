//! # 任务处理器
//!
//! - [`processor`]：认领并执行一批到期任务，记录执行结果；
//! - [`recurring`]：周期任务在认领事务内的到期复核；
//! - [`runner`]：按配置启动多个处理循环的后台服务。

pub mod processor;
pub mod recurring;
pub mod runner;

pub use processor::TaskProcessor;
pub use recurring::select_due_tasks;
pub use runner::{ProcessorRunner, ProcessorRunnerBuilder};
