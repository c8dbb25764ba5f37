//! 使用量数据的存储
//!
//! 原始记录与分桶统计各两张表。分桶行按 (维度, `bucket_size`, `created_at`) 唯一，
//! 重复统计同一个窗口只会覆盖计数。

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use processor_errors::{ProcessorError, ProcessorResult};
use processor_infrastructure::error_handling::{RepositoryErrorHelpers, RepositoryOperation};
use processor_infrastructure::store_context;
use sqlx::{PgPool, Row};
use tracing::{debug, info, instrument};

use super::buckets::BucketWindow;
use super::models::{
    ApiUsageBucket, ApiUsageCount, ApiUsageRaw, FeatureEvaluationBucket, FeatureEvaluationCount,
    FeatureEvaluationRaw,
};

#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn insert_api_usage(&self, usage: &ApiUsageRaw) -> ProcessorResult<()>;

    async fn insert_feature_evaluations(
        &self,
        evaluations: &[FeatureEvaluationRaw],
    ) -> ProcessorResult<()>;

    /// 统计窗口内的请求数
    ///
    /// `source_bucket_size` 为空时统计原始记录，否则汇总起点落在 `[start, end)` 内的该大小分桶。
    async fn api_usage_counts(
        &self,
        window: BucketWindow,
        source_bucket_size: Option<i32>,
    ) -> ProcessorResult<Vec<ApiUsageCount>>;

    async fn feature_evaluation_counts(
        &self,
        window: BucketWindow,
        source_bucket_size: Option<i32>,
    ) -> ProcessorResult<Vec<FeatureEvaluationCount>>;

    async fn upsert_api_usage_bucket(&self, bucket: &ApiUsageBucket) -> ProcessorResult<()>;

    async fn upsert_feature_evaluation_bucket(
        &self,
        bucket: &FeatureEvaluationBucket,
    ) -> ProcessorResult<()>;

    /// 按起始时间升序返回指定大小的分桶
    async fn list_api_usage_buckets(&self, bucket_size: i32) -> ProcessorResult<Vec<ApiUsageBucket>>;

    async fn list_feature_evaluation_buckets(
        &self,
        bucket_size: i32,
    ) -> ProcessorResult<Vec<FeatureEvaluationBucket>>;
}

pub struct PostgresUsageStore {
    pool: PgPool,
}

impl PostgresUsageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 创建使用量相关的表，可重复执行
    pub async fn run_migrations(&self) -> ProcessorResult<()> {
        let statements = [
            (
                "api_usage_raw",
                r#"
                CREATE TABLE IF NOT EXISTS api_usage_raw (
                    id BIGSERIAL PRIMARY KEY,
                    environment_id BIGINT NOT NULL,
                    resource INTEGER NOT NULL,
                    host VARCHAR(255) NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )
                "#,
            ),
            (
                "api_usage_raw",
                "CREATE INDEX IF NOT EXISTS idx_api_usage_raw_created_at ON api_usage_raw (created_at)",
            ),
            (
                "api_usage_buckets",
                r#"
                CREATE TABLE IF NOT EXISTS api_usage_buckets (
                    id BIGSERIAL PRIMARY KEY,
                    environment_id BIGINT NOT NULL,
                    resource INTEGER NOT NULL,
                    total_count BIGINT NOT NULL,
                    bucket_size INTEGER NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL,
                    CONSTRAINT unique_api_usage_bucket
                        UNIQUE (environment_id, resource, bucket_size, created_at)
                )
                "#,
            ),
            (
                "feature_evaluation_raw",
                r#"
                CREATE TABLE IF NOT EXISTS feature_evaluation_raw (
                    id BIGSERIAL PRIMARY KEY,
                    environment_id BIGINT NOT NULL,
                    feature_name VARCHAR(2000) NOT NULL,
                    evaluation_count BIGINT NOT NULL DEFAULT 0,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )
                "#,
            ),
            (
                "feature_evaluation_raw",
                "CREATE INDEX IF NOT EXISTS idx_feature_evaluation_raw_created_at ON feature_evaluation_raw (created_at)",
            ),
            (
                "feature_evaluation_buckets",
                r#"
                CREATE TABLE IF NOT EXISTS feature_evaluation_buckets (
                    id BIGSERIAL PRIMARY KEY,
                    environment_id BIGINT NOT NULL,
                    feature_name VARCHAR(2000) NOT NULL,
                    total_count BIGINT NOT NULL,
                    bucket_size INTEGER NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL,
                    CONSTRAINT unique_feature_evaluation_bucket
                        UNIQUE (environment_id, feature_name, bucket_size, created_at)
                )
                "#,
            ),
        ];

        for (table, statement) in statements {
            let context = store_context!(RepositoryOperation::Migrate, table);
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;
        }

        info!("使用量统计表迁移完成");
        Ok(())
    }
}

#[async_trait]
impl UsageStore for PostgresUsageStore {
    #[instrument(skip(self, usage), fields(environment_id = usage.environment_id))]
    async fn insert_api_usage(&self, usage: &ApiUsageRaw) -> ProcessorResult<()> {
        let context = store_context!(RepositoryOperation::Create, "api_usage_raw");
        sqlx::query(
            "INSERT INTO api_usage_raw (environment_id, resource, host, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(usage.environment_id)
        .bind(usage.resource)
        .bind(&usage.host)
        .bind(usage.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;
        Ok(())
    }

    #[instrument(skip(self, evaluations), fields(count = evaluations.len()))]
    async fn insert_feature_evaluations(
        &self,
        evaluations: &[FeatureEvaluationRaw],
    ) -> ProcessorResult<()> {
        let context = store_context!(RepositoryOperation::Create, "feature_evaluation_raw");
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

        for evaluation in evaluations {
            sqlx::query(
                "INSERT INTO feature_evaluation_raw (environment_id, feature_name, evaluation_count, created_at) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(evaluation.environment_id)
            .bind(&evaluation.feature_name)
            .bind(evaluation.evaluation_count)
            .bind(evaluation.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;
        }

        tx.commit()
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn api_usage_counts(
        &self,
        window: BucketWindow,
        source_bucket_size: Option<i32>,
    ) -> ProcessorResult<Vec<ApiUsageCount>> {
        let rows = match source_bucket_size {
            Some(bucket_size) => {
                let context = store_context!(RepositoryOperation::Read, "api_usage_buckets");
                sqlx::query(
                    "SELECT environment_id, resource, SUM(total_count)::BIGINT AS count \
                     FROM api_usage_buckets \
                     WHERE created_at >= $1 AND created_at < $2 AND bucket_size = $3 \
                     GROUP BY environment_id, resource ORDER BY environment_id, resource",
                )
                .bind(window.start)
                .bind(window.end)
                .bind(bucket_size)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?
            }
            None => {
                let context = store_context!(RepositoryOperation::Read, "api_usage_raw");
                sqlx::query(
                    "SELECT environment_id, resource, COUNT(id)::BIGINT AS count \
                     FROM api_usage_raw \
                     WHERE created_at > $1 AND created_at <= $2 \
                     GROUP BY environment_id, resource ORDER BY environment_id, resource",
                )
                .bind(window.start)
                .bind(window.end)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?
            }
        };

        rows.iter()
            .map(|row| -> ProcessorResult<ApiUsageCount> {
                Ok(ApiUsageCount {
                    environment_id: row.try_get("environment_id")?,
                    resource: row.try_get("resource")?,
                    count: row.try_get("count")?,
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn feature_evaluation_counts(
        &self,
        window: BucketWindow,
        source_bucket_size: Option<i32>,
    ) -> ProcessorResult<Vec<FeatureEvaluationCount>> {
        let rows = match source_bucket_size {
            Some(bucket_size) => {
                let context =
                    store_context!(RepositoryOperation::Read, "feature_evaluation_buckets");
                sqlx::query(
                    "SELECT environment_id, feature_name, SUM(total_count)::BIGINT AS count \
                     FROM feature_evaluation_buckets \
                     WHERE created_at >= $1 AND created_at < $2 AND bucket_size = $3 \
                     GROUP BY environment_id, feature_name ORDER BY environment_id, feature_name",
                )
                .bind(window.start)
                .bind(window.end)
                .bind(bucket_size)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?
            }
            None => {
                let context = store_context!(RepositoryOperation::Read, "feature_evaluation_raw");
                sqlx::query(
                    "SELECT environment_id, feature_name, SUM(evaluation_count)::BIGINT AS count \
                     FROM feature_evaluation_raw \
                     WHERE created_at > $1 AND created_at <= $2 \
                     GROUP BY environment_id, feature_name ORDER BY environment_id, feature_name",
                )
                .bind(window.start)
                .bind(window.end)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?
            }
        };

        rows.iter()
            .map(|row| -> ProcessorResult<FeatureEvaluationCount> {
                Ok(FeatureEvaluationCount {
                    environment_id: row.try_get("environment_id")?,
                    feature_name: row.try_get("feature_name")?,
                    count: row.try_get("count")?,
                })
            })
            .collect()
    }

    async fn upsert_api_usage_bucket(&self, bucket: &ApiUsageBucket) -> ProcessorResult<()> {
        let context = store_context!(RepositoryOperation::Upsert, "api_usage_buckets");
        sqlx::query(
            "INSERT INTO api_usage_buckets (environment_id, resource, total_count, bucket_size, created_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT ON CONSTRAINT unique_api_usage_bucket \
             DO UPDATE SET total_count = EXCLUDED.total_count",
        )
        .bind(bucket.environment_id)
        .bind(bucket.resource)
        .bind(bucket.total_count)
        .bind(bucket.bucket_size)
        .bind(bucket.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;
        Ok(())
    }

    async fn upsert_feature_evaluation_bucket(
        &self,
        bucket: &FeatureEvaluationBucket,
    ) -> ProcessorResult<()> {
        let context = store_context!(RepositoryOperation::Upsert, "feature_evaluation_buckets");
        sqlx::query(
            "INSERT INTO feature_evaluation_buckets (environment_id, feature_name, total_count, bucket_size, created_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT ON CONSTRAINT unique_feature_evaluation_bucket \
             DO UPDATE SET total_count = EXCLUDED.total_count",
        )
        .bind(bucket.environment_id)
        .bind(&bucket.feature_name)
        .bind(bucket.total_count)
        .bind(bucket.bucket_size)
        .bind(bucket.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;
        Ok(())
    }

    async fn list_api_usage_buckets(&self, bucket_size: i32) -> ProcessorResult<Vec<ApiUsageBucket>> {
        let context = store_context!(RepositoryOperation::Read, "api_usage_buckets");
        let rows = sqlx::query(
            "SELECT environment_id, resource, total_count, bucket_size, created_at \
             FROM api_usage_buckets WHERE bucket_size = $1 \
             ORDER BY created_at, environment_id, resource",
        )
        .bind(bucket_size)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

        rows.iter()
            .map(|row| -> ProcessorResult<ApiUsageBucket> {
                Ok(ApiUsageBucket {
                    environment_id: row.try_get("environment_id")?,
                    resource: row.try_get("resource")?,
                    total_count: row.try_get("total_count")?,
                    bucket_size: row.try_get("bucket_size")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn list_feature_evaluation_buckets(
        &self,
        bucket_size: i32,
    ) -> ProcessorResult<Vec<FeatureEvaluationBucket>> {
        let context = store_context!(RepositoryOperation::Read, "feature_evaluation_buckets");
        let rows = sqlx::query(
            "SELECT environment_id, feature_name, total_count, bucket_size, created_at \
             FROM feature_evaluation_buckets WHERE bucket_size = $1 \
             ORDER BY created_at, environment_id, feature_name",
        )
        .bind(bucket_size)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

        rows.iter()
            .map(|row| -> ProcessorResult<FeatureEvaluationBucket> {
                Ok(FeatureEvaluationBucket {
                    environment_id: row.try_get("environment_id")?,
                    feature_name: row.try_get("feature_name")?,
                    total_count: row.try_get("total_count")?,
                    bucket_size: row.try_get("bucket_size")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}

type ApiBucketKey = (i64, i32, i32, DateTime<Utc>);
type FeatureBucketKey = (i64, String, i32, DateTime<Utc>);

#[derive(Debug, Default)]
struct UsageState {
    api_usage: Vec<ApiUsageRaw>,
    feature_evaluations: Vec<FeatureEvaluationRaw>,
    api_usage_buckets: BTreeMap<ApiBucketKey, i64>,
    feature_evaluation_buckets: BTreeMap<FeatureBucketKey, i64>,
}

/// 内存中的使用量存储，用于测试和 `memory://` 模式
#[derive(Debug, Clone, Default)]
pub struct InMemoryUsageStore {
    state: Arc<Mutex<UsageState>>,
}

impl InMemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> ProcessorResult<MutexGuard<'_, UsageState>> {
        self.state
            .lock()
            .map_err(|e| ProcessorError::Internal(format!("使用量存储锁已损坏: {e}")))
    }
}

#[async_trait]
impl UsageStore for InMemoryUsageStore {
    async fn insert_api_usage(&self, usage: &ApiUsageRaw) -> ProcessorResult<()> {
        self.lock_state()?.api_usage.push(usage.clone());
        Ok(())
    }

    async fn insert_feature_evaluations(
        &self,
        evaluations: &[FeatureEvaluationRaw],
    ) -> ProcessorResult<()> {
        self.lock_state()?
            .feature_evaluations
            .extend_from_slice(evaluations);
        Ok(())
    }

    async fn api_usage_counts(
        &self,
        window: BucketWindow,
        source_bucket_size: Option<i32>,
    ) -> ProcessorResult<Vec<ApiUsageCount>> {
        let state = self.lock_state()?;
        let mut counts: BTreeMap<(i64, i32), i64> = BTreeMap::new();

        match source_bucket_size {
            Some(size) => {
                for ((environment_id, resource, bucket_size, created_at), total) in
                    &state.api_usage_buckets
                {
                    if *bucket_size == size && window.contains_bucket_start(*created_at) {
                        *counts.entry((*environment_id, *resource)).or_default() += total;
                    }
                }
            }
            None => {
                for usage in state.api_usage.iter().filter(|u| window.contains(u.created_at)) {
                    *counts.entry((usage.environment_id, usage.resource)).or_default() += 1;
                }
            }
        }

        Ok(counts
            .into_iter()
            .map(|((environment_id, resource), count)| ApiUsageCount {
                environment_id,
                resource,
                count,
            })
            .collect())
    }

    async fn feature_evaluation_counts(
        &self,
        window: BucketWindow,
        source_bucket_size: Option<i32>,
    ) -> ProcessorResult<Vec<FeatureEvaluationCount>> {
        let state = self.lock_state()?;
        let mut counts: BTreeMap<(i64, String), i64> = BTreeMap::new();

        match source_bucket_size {
            Some(size) => {
                for ((environment_id, feature_name, bucket_size, created_at), total) in
                    &state.feature_evaluation_buckets
                {
                    if *bucket_size == size && window.contains_bucket_start(*created_at) {
                        *counts
                            .entry((*environment_id, feature_name.clone()))
                            .or_default() += total;
                    }
                }
            }
            None => {
                for evaluation in state
                    .feature_evaluations
                    .iter()
                    .filter(|e| window.contains(e.created_at))
                {
                    *counts
                        .entry((evaluation.environment_id, evaluation.feature_name.clone()))
                        .or_default() += evaluation.evaluation_count;
                }
            }
        }

        Ok(counts
            .into_iter()
            .map(|((environment_id, feature_name), count)| FeatureEvaluationCount {
                environment_id,
                feature_name,
                count,
            })
            .collect())
    }

    async fn upsert_api_usage_bucket(&self, bucket: &ApiUsageBucket) -> ProcessorResult<()> {
        self.lock_state()?.api_usage_buckets.insert(
            (
                bucket.environment_id,
                bucket.resource,
                bucket.bucket_size,
                bucket.created_at,
            ),
            bucket.total_count,
        );
        Ok(())
    }

    async fn upsert_feature_evaluation_bucket(
        &self,
        bucket: &FeatureEvaluationBucket,
    ) -> ProcessorResult<()> {
        self.lock_state()?.feature_evaluation_buckets.insert(
            (
                bucket.environment_id,
                bucket.feature_name.clone(),
                bucket.bucket_size,
                bucket.created_at,
            ),
            bucket.total_count,
        );
        Ok(())
    }

    async fn list_api_usage_buckets(&self, bucket_size: i32) -> ProcessorResult<Vec<ApiUsageBucket>> {
        let state = self.lock_state()?;
        let mut buckets: Vec<ApiUsageBucket> = state
            .api_usage_buckets
            .iter()
            .filter(|((_, _, size, _), _)| *size == bucket_size)
            .map(
                |((environment_id, resource, size, created_at), total_count)| ApiUsageBucket {
                    environment_id: *environment_id,
                    resource: *resource,
                    total_count: *total_count,
                    bucket_size: *size,
                    created_at: *created_at,
                },
            )
            .collect();
        buckets.sort_by_key(|b| (b.created_at, b.environment_id, b.resource));
        debug!("内存中共有 {} 个 {} 分钟的请求分桶", buckets.len(), bucket_size);
        Ok(buckets)
    }

    async fn list_feature_evaluation_buckets(
        &self,
        bucket_size: i32,
    ) -> ProcessorResult<Vec<FeatureEvaluationBucket>> {
        let state = self.lock_state()?;
        let mut buckets: Vec<FeatureEvaluationBucket> = state
            .feature_evaluation_buckets
            .iter()
            .filter(|((_, _, size, _), _)| *size == bucket_size)
            .map(
                |((environment_id, feature_name, size, created_at), total_count)| {
                    FeatureEvaluationBucket {
                        environment_id: *environment_id,
                        feature_name: feature_name.clone(),
                        total_count: *total_count,
                        bucket_size: *size,
                        created_at: *created_at,
                    }
                },
            )
            .collect();
        buckets.sort_by(|a, b| {
            (a.created_at, a.environment_id, &a.feature_name).cmp(&(
                b.created_at,
                b.environment_id,
                &b.feature_name,
            ))
        });
        Ok(buckets)
    }
}
