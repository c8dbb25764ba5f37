//! 配置管理
//!
//! 配置按以下优先级合并（后者覆盖前者）：
//!
//! 1. 内置默认值
//! 2. TOML 配置文件（默认查找 `config/task_processor.toml`）
//! 3. 以 `TASK_PROCESSOR_` 为前缀、`__` 分隔层级的环境变量，
//!    例如 `TASK_PROCESSOR_DATABASE__URL`
//!
//! 另外兼容 `RUN_BY_PROCESSOR` 环境变量：只要设置了非空值，就等同于
//! `processor.run_by_processor = true`。
//!
//! ```rust,no_run
//! use processor_core::config::AppConfig;
//!
//! let config = AppConfig::load(Some("config/task_processor.toml")).unwrap();
//! println!("数据库: {}", config.database.url);
//! ```

pub mod models;

pub use models::*;
