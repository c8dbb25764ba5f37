use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    database::DatabaseConfig,
    dispatch::{DispatchConfig, TaskRunMethod},
    observability::ObservabilityConfig,
    processor::ProcessorConfig,
};

const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "config/task_processor.toml",
    "task_processor.toml",
    "/etc/task_processor/config.toml",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub processor: ProcessorConfig,
    pub dispatch: DispatchConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults = Self::default();
        let mut builder = ConfigBuilder::builder()
            .set_default("database.url", defaults.database.url.as_str())?
            .set_default("database.max_connections", defaults.database.max_connections as i64)?
            .set_default("database.min_connections", defaults.database.min_connections as i64)?
            .set_default(
                "database.connection_timeout_seconds",
                defaults.database.connection_timeout_seconds as i64,
            )?
            .set_default(
                "database.idle_timeout_seconds",
                defaults.database.idle_timeout_seconds as i64,
            )?
            .set_default("processor.num_workers", defaults.processor.num_workers as i64)?
            .set_default(
                "processor.sleep_interval_ms",
                defaults.processor.sleep_interval_ms as i64,
            )?
            .set_default(
                "processor.queue_pop_size",
                defaults.processor.queue_pop_size as i64,
            )?
            .set_default("processor.grace_period_ms", defaults.processor.grace_period_ms as i64)?
            .set_default(
                "processor.run_by_processor",
                defaults.processor.run_by_processor,
            )?
            .set_default(
                "dispatch.task_run_method",
                defaults.dispatch.task_run_method.to_string(),
            )?
            .set_default("observability.log_level", defaults.observability.log_level.as_str())?
            .set_default(
                "observability.log_format",
                defaults.observability.log_format.as_str(),
            )?
            .set_default(
                "observability.metrics_enabled",
                defaults.observability.metrics_enabled,
            )?
            .set_default(
                "observability.metrics_bind_address",
                defaults.observability.metrics_bind_address.as_str(),
            )?;

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else if let Some(path) = DEFAULT_CONFIG_PATHS
            .iter()
            .find(|path| Path::new(path).exists())
        {
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("TASK_PROCESSOR")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        if std::env::var("RUN_BY_PROCESSOR").is_ok_and(|value| !value.is_empty()) {
            config.processor.run_by_processor = true;
        }

        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.database.validate()?;
        self.processor.validate()?;
        self.dispatch.validate()?;
        self.observability.validate()?;

        if self.processor.run_by_processor
            && self.dispatch.task_run_method != TaskRunMethod::TaskProcessor
        {
            tracing::warn!(
                "当前进程承担处理器角色，但任务执行方式为 {}，延迟任务将不会被持久化",
                self.dispatch.task_run_method
            );
        }

        Ok(())
    }
}
