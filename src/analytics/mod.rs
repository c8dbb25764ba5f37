//! 使用量统计
//!
//! 原始请求与功能求值记录由一次性任务写入，再由周期任务按固定大小的时间桶聚合。
//! 对任务处理器而言这些都是普通的任务，正确性完全依赖周期调度与认领。

pub mod buckets;
pub mod models;
pub mod store;
pub mod tasks;

pub use buckets::{bucket_windows, start_of_current_bucket, BucketWindow};
pub use models::*;
pub use store::{InMemoryUsageStore, PostgresUsageStore, UsageStore};
pub use tasks::{register_recurring_tasks, register_tasks, AnalyticsTasks, PopulateBucketArguments};
