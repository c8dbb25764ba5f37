//! 使用量统计的任务处理函数
//!
//! - `app_analytics.track_request` / `app_analytics.track_feature_evaluation`：写入原始记录，
//!   由 Web 进程通过 [`TaskHandle::delay`] 分派；
//! - `app_analytics.populate_api_usage_bucket` / `app_analytics.populate_feature_evaluation_bucket`：
//!   周期任务，关键字参数为 `bucket_size`、`run_every`（分钟）以及可选的
//!   `source_bucket_size`，把原始记录（或更小的分桶）聚合为分桶统计。

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use processor_core::models::TaskArguments;
use processor_core::registry::{Arity, TaskHandler, TaskRegistryBuilder};
use processor_dispatcher::{TaskDispatcher, TaskHandle};
use processor_errors::{ProcessorError, ProcessorResult};
use serde::Deserialize;
use tracing::{debug, info};

use super::buckets::bucket_windows;
use super::models::{ApiUsageBucket, ApiUsageRaw, FeatureEvaluationBucket, FeatureEvaluationRaw};
use super::store::UsageStore;

/// 任务标识的模块前缀
pub const TASK_MODULE: &str = "app_analytics";

/// 周期任务默认每小时运行一次，统计最近一小时的 15 分钟分桶
pub const DEFAULT_BUCKET_SIZE_MINUTES: i64 = 15;
pub const DEFAULT_RUN_EVERY_MINUTES: i64 = 60;

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PopulateBucketArguments {
    pub bucket_size: i64,
    pub run_every: i64,
    #[serde(default)]
    pub source_bucket_size: Option<i32>,
}

impl PopulateBucketArguments {
    fn to_task_arguments(self) -> TaskArguments {
        let arguments = TaskArguments::new()
            .with_kwarg("bucket_size", self.bucket_size)
            .with_kwarg("run_every", self.run_every);
        match self.source_bucket_size {
            Some(size) => arguments.with_kwarg("source_bucket_size", size),
            None => arguments,
        }
    }
}

/// Web 进程用来分派原始记录写入的句柄
#[derive(Debug, Clone)]
pub struct AnalyticsTasks {
    pub track_request: TaskHandle,
    pub track_feature_evaluation: TaskHandle,
}

/// 写入一条 API 请求记录，位置参数为 `(resource, host, environment_id)`
pub async fn track_request(store: &dyn UsageStore, arguments: TaskArguments) -> anyhow::Result<()> {
    let usage = ApiUsageRaw {
        resource: arguments.arg(0)?,
        host: arguments.arg(1)?,
        environment_id: arguments.arg(2)?,
        created_at: Utc::now(),
    };
    store.insert_api_usage(&usage).await?;
    Ok(())
}

/// 写入一批功能开关求值次数，位置参数为 `(environment_id, {feature_name: count})`
pub async fn track_feature_evaluation(
    store: &dyn UsageStore,
    arguments: TaskArguments,
) -> anyhow::Result<()> {
    let environment_id: i64 = arguments.arg(0)?;
    let feature_evaluations: BTreeMap<String, i64> = arguments.arg(1)?;

    let created_at = Utc::now();
    let evaluations: Vec<FeatureEvaluationRaw> = feature_evaluations
        .into_iter()
        .map(|(feature_name, evaluation_count)| FeatureEvaluationRaw {
            environment_id,
            feature_name,
            evaluation_count,
            created_at,
        })
        .collect();

    store.insert_feature_evaluations(&evaluations).await?;
    Ok(())
}

/// 重新统计 `now` 之前 `run_every` 分钟内的请求分桶，返回写入的分桶数
pub async fn populate_api_usage_bucket(
    store: &dyn UsageStore,
    now: DateTime<Utc>,
    arguments: PopulateBucketArguments,
) -> ProcessorResult<usize> {
    let bucket_size = i32::try_from(arguments.bucket_size).map_err(|_| {
        ProcessorError::invalid_arguments(format!(
            "bucket_size 超出范围: {}",
            arguments.bucket_size
        ))
    })?;

    let mut written = 0;
    for window in bucket_windows(now, arguments.bucket_size, arguments.run_every)? {
        let counts = store
            .api_usage_counts(window, arguments.source_bucket_size)
            .await?;
        for count in counts {
            store
                .upsert_api_usage_bucket(&ApiUsageBucket {
                    environment_id: count.environment_id,
                    resource: count.resource,
                    total_count: count.count,
                    bucket_size,
                    created_at: window.start,
                })
                .await?;
            written += 1;
        }
    }

    counter!("analytics_buckets_written_total", "kind" => "api_usage").increment(written as u64);
    debug!("写入 {} 个 {} 分钟的请求分桶", written, bucket_size);
    Ok(written)
}

/// 重新统计 `now` 之前 `run_every` 分钟内的功能求值分桶，返回写入的分桶数
pub async fn populate_feature_evaluation_bucket(
    store: &dyn UsageStore,
    now: DateTime<Utc>,
    arguments: PopulateBucketArguments,
) -> ProcessorResult<usize> {
    let bucket_size = i32::try_from(arguments.bucket_size).map_err(|_| {
        ProcessorError::invalid_arguments(format!(
            "bucket_size 超出范围: {}",
            arguments.bucket_size
        ))
    })?;

    let mut written = 0;
    for window in bucket_windows(now, arguments.bucket_size, arguments.run_every)? {
        let counts = store
            .feature_evaluation_counts(window, arguments.source_bucket_size)
            .await?;
        for count in counts {
            store
                .upsert_feature_evaluation_bucket(&FeatureEvaluationBucket {
                    environment_id: count.environment_id,
                    feature_name: count.feature_name,
                    total_count: count.count,
                    bucket_size,
                    created_at: window.start,
                })
                .await?;
            written += 1;
        }
    }

    counter!("analytics_buckets_written_total", "kind" => "feature_evaluation")
        .increment(written as u64);
    debug!("写入 {} 个 {} 分钟的功能求值分桶", written, bucket_size);
    Ok(written)
}

/// 注册原始记录写入任务
pub fn register_tasks(
    dispatcher: &TaskDispatcher,
    builder: &mut TaskRegistryBuilder,
    store: Arc<dyn UsageStore>,
) -> ProcessorResult<AnalyticsTasks> {
    let usage_store = Arc::clone(&store);
    let track_request_handler: Arc<dyn TaskHandler> = Arc::new(move |arguments: TaskArguments| {
        let store = Arc::clone(&usage_store);
        async move { track_request(store.as_ref(), arguments).await }
    });

    let evaluation_store = Arc::clone(&store);
    let track_feature_evaluation_handler: Arc<dyn TaskHandler> =
        Arc::new(move |arguments: TaskArguments| {
            let store = Arc::clone(&evaluation_store);
            async move { track_feature_evaluation(store.as_ref(), arguments).await }
        });

    Ok(AnalyticsTasks {
        track_request: dispatcher.register_task_with_arity(
            builder,
            TASK_MODULE,
            "track_request",
            track_request_handler,
            Arity::Exact(3),
        )?,
        track_feature_evaluation: dispatcher.register_task_with_arity(
            builder,
            TASK_MODULE,
            "track_feature_evaluation",
            track_feature_evaluation_handler,
            Arity::Exact(2),
        )?,
    })
}

/// 注册分桶统计周期任务，只有处理器角色的进程才会真正写入周期任务表
pub async fn register_recurring_tasks(
    dispatcher: &TaskDispatcher,
    builder: &mut TaskRegistryBuilder,
    store: Arc<dyn UsageStore>,
) -> ProcessorResult<()> {
    let arguments = PopulateBucketArguments {
        bucket_size: DEFAULT_BUCKET_SIZE_MINUTES,
        run_every: DEFAULT_RUN_EVERY_MINUTES,
        source_bucket_size: None,
    };
    let run_every = Duration::minutes(DEFAULT_RUN_EVERY_MINUTES);

    let usage_store = Arc::clone(&store);
    let api_usage_handler: Arc<dyn TaskHandler> = Arc::new(move |arguments: TaskArguments| {
        let store = Arc::clone(&usage_store);
        async move {
            let arguments: PopulateBucketArguments = arguments.kwargs_as()?;
            populate_api_usage_bucket(store.as_ref(), Utc::now(), arguments).await?;
            anyhow::Ok(())
        }
    });

    let evaluation_store = Arc::clone(&store);
    let feature_evaluation_handler: Arc<dyn TaskHandler> =
        Arc::new(move |arguments: TaskArguments| {
            let store = Arc::clone(&evaluation_store);
            async move {
                let arguments: PopulateBucketArguments = arguments.kwargs_as()?;
                populate_feature_evaluation_bucket(store.as_ref(), Utc::now(), arguments).await?;
                anyhow::Ok(())
            }
        });

    let registered = [
        dispatcher
            .register_recurring_task(
                builder,
                TASK_MODULE,
                "populate_api_usage_bucket",
                run_every,
                arguments.to_task_arguments(),
                api_usage_handler,
            )
            .await?,
        dispatcher
            .register_recurring_task(
                builder,
                TASK_MODULE,
                "populate_feature_evaluation_bucket",
                run_every,
                arguments.to_task_arguments(),
                feature_evaluation_handler,
            )
            .await?,
    ];

    let count = registered.iter().flatten().count();
    if count > 0 {
        info!("已注册 {} 个分桶统计周期任务", count);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::store::InMemoryUsageStore;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, minute, second).unwrap()
    }

    fn hourly_fifteen_minute_buckets() -> PopulateBucketArguments {
        PopulateBucketArguments {
            bucket_size: 15,
            run_every: 60,
            source_bucket_size: None,
        }
    }

    async fn record_request(store: &InMemoryUsageStore, environment_id: i64, created_at: DateTime<Utc>) {
        store
            .insert_api_usage(&ApiUsageRaw {
                environment_id,
                resource: 1,
                host: "api.example.com".to_string(),
                created_at,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_populate_api_usage_bucket_groups_by_window() {
        let store = InMemoryUsageStore::new();
        record_request(&store, 1, at(10, 20, 0)).await;
        record_request(&store, 1, at(10, 29, 59)).await;
        record_request(&store, 2, at(10, 16, 0)).await;
        record_request(&store, 1, at(9, 40, 0)).await;
        // 属于当前尚未结束的桶，不统计
        record_request(&store, 1, at(10, 31, 0)).await;

        let written = populate_api_usage_bucket(&store, at(10, 37, 0), hourly_fifteen_minute_buckets())
            .await
            .unwrap();
        assert_eq!(written, 3);

        let buckets = store.list_api_usage_buckets(15).await.unwrap();
        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets[0].created_at, at(9, 30, 0));
        assert_eq!(buckets[0].total_count, 1);
        assert_eq!(buckets[1].created_at, at(10, 15, 0));
        assert_eq!(buckets[1].environment_id, 1);
        assert_eq!(buckets[1].total_count, 2);
        assert_eq!(buckets[2].environment_id, 2);
        assert_eq!(buckets[2].total_count, 1);
    }

    #[tokio::test]
    async fn test_populate_is_idempotent() {
        let store = InMemoryUsageStore::new();
        record_request(&store, 1, at(10, 20, 0)).await;

        for _ in 0..2 {
            populate_api_usage_bucket(&store, at(10, 37, 0), hourly_fifteen_minute_buckets())
                .await
                .unwrap();
        }

        let buckets = store.list_api_usage_buckets(15).await.unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].total_count, 1);
    }

    #[tokio::test]
    async fn test_populate_from_smaller_buckets() {
        let store = InMemoryUsageStore::new();
        // 10:00 的小桶属于下一个小时
        for (hour, minute, count) in [(9, 0, 1), (9, 15, 4), (9, 30, 6), (9, 45, 5), (10, 0, 100)] {
            store
                .upsert_feature_evaluation_bucket(&FeatureEvaluationBucket {
                    environment_id: 1,
                    feature_name: "dark_mode".to_string(),
                    total_count: count,
                    bucket_size: 15,
                    created_at: at(hour, minute, 0),
                })
                .await
                .unwrap();
        }

        let written = populate_feature_evaluation_bucket(
            &store,
            at(10, 20, 0),
            PopulateBucketArguments {
                bucket_size: 60,
                run_every: 60,
                source_bucket_size: Some(15),
            },
        )
        .await
        .unwrap();
        assert_eq!(written, 1);

        let buckets = store.list_feature_evaluation_buckets(60).await.unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].created_at, at(9, 0, 0));
        assert_eq!(buckets[0].total_count, 16);
    }

    #[tokio::test]
    async fn test_track_feature_evaluation_inserts_one_row_per_feature() {
        let store = InMemoryUsageStore::new();
        let arguments = TaskArguments::new()
            .with_arg(7)
            .with_arg(serde_json::json!({"dark_mode": 3, "beta_banner": 2}));

        track_feature_evaluation(&store, arguments).await.unwrap();

        let now = Utc::now();
        let window = crate::analytics::buckets::BucketWindow {
            start: now - Duration::minutes(1),
            end: now + Duration::minutes(1),
        };
        let counts = store.feature_evaluation_counts(window, None).await.unwrap();
        assert_eq!(counts.len(), 2);
        assert_eq!(counts[0].feature_name, "beta_banner");
        assert_eq!(counts[0].count, 2);
        assert_eq!(counts[1].count, 3);
    }

    #[tokio::test]
    async fn test_track_request_rejects_bad_arguments() {
        let store = InMemoryUsageStore::new();
        let result = track_request(&store, TaskArguments::new().with_arg("flags")).await;

        let error = result.unwrap_err();
        assert!(matches!(
            error.downcast_ref::<ProcessorError>(),
            Some(ProcessorError::InvalidTaskArguments(_))
        ));
    }
}
