pub mod app_config;
pub mod database;
pub mod dispatch;
pub mod observability;
pub mod processor;

pub use app_config::AppConfig;
pub use database::DatabaseConfig;
pub use dispatch::{DispatchConfig, TaskRunMethod};
pub use observability::ObservabilityConfig;
pub use processor::ProcessorConfig;
