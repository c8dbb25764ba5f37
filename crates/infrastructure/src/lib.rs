//! # 任务存储实现
//!
//! 提供 [`processor_core::traits::TaskStore`] 的两种实现：
//!
//! - [`PostgresTaskStore`]：生产环境使用，基于 `FOR UPDATE SKIP LOCKED` 认领任务；
//! - [`InMemoryTaskStore`]：单进程测试和本地开发使用，用锁集合模拟跳过已锁定行的语义。
//!
//! [`DatabaseManager`] 根据连接串自动选择实现。

pub mod database;
pub mod error_handling;

pub use database::*;
