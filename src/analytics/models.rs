use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 一次 API 请求的原始记录
///
/// `resource` 为请求的资源类型编号（flags、identities、traits、environment document 等）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiUsageRaw {
    pub environment_id: i64,
    pub resource: i32,
    pub host: String,
    pub created_at: DateTime<Utc>,
}

/// 一批功能开关求值次数的原始记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureEvaluationRaw {
    pub environment_id: i64,
    pub feature_name: String,
    pub evaluation_count: i64,
    pub created_at: DateTime<Utc>,
}

/// API 请求的分桶统计，`created_at` 为桶的起始时间
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiUsageBucket {
    pub environment_id: i64,
    pub resource: i32,
    pub total_count: i64,
    /// 桶大小（分钟）
    pub bucket_size: i32,
    pub created_at: DateTime<Utc>,
}

/// 功能开关求值次数的分桶统计，`created_at` 为桶的起始时间
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureEvaluationBucket {
    pub environment_id: i64,
    pub feature_name: String,
    pub total_count: i64,
    pub bucket_size: i32,
    pub created_at: DateTime<Utc>,
}

/// 按 (环境, 资源) 聚合的请求数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiUsageCount {
    pub environment_id: i64,
    pub resource: i32,
    pub count: i64,
}

/// 按 (环境, 功能名) 聚合的求值次数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureEvaluationCount {
    pub environment_id: i64,
    pub feature_name: String,
    pub count: i64,
}
