//! 分桶时间窗口
//!
//! 每次运行回看 `run_every / bucket_size` 个桶。锚点为当前时间截断到分钟后，
//! 再减去 `分钟数 % bucket_size`，第 `i` 个窗口为
//! `(anchor - i * bucket_size, anchor - (i - 1) * bucket_size]`。
//! 桶大小需能整除 60。
//!
//! 分桶记录以窗口起点作为 `created_at`，因此从小桶汇总时改用
//! [`BucketWindow::contains_bucket_start`] 的左闭右开区间。

use chrono::{DateTime, Duration, DurationRound, Timelike, Utc};
use processor_errors::{ProcessorError, ProcessorResult};

/// 左开右闭的时间窗口
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BucketWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at > self.start && at <= self.end
    }

    /// 起点落在 `[start, end)` 内的分桶属于本窗口
    pub fn contains_bucket_start(&self, bucket_start: DateTime<Utc>) -> bool {
        bucket_start >= self.start && bucket_start < self.end
    }
}

pub fn start_of_current_bucket(
    now: DateTime<Utc>,
    bucket_size_minutes: i64,
) -> ProcessorResult<DateTime<Utc>> {
    if bucket_size_minutes <= 0 {
        return Err(ProcessorError::invalid_arguments(format!(
            "bucket_size 必须大于0，实际: {bucket_size_minutes}"
        )));
    }

    let current_minute = now
        .duration_trunc(Duration::minutes(1))
        .map_err(|e| ProcessorError::invalid_arguments(format!("无法截断时间 {now}: {e}")))?;
    let offset = i64::from(current_minute.minute()) % bucket_size_minutes;
    Ok(current_minute - Duration::minutes(offset))
}

/// 按时间倒序返回本次需要重新统计的窗口，最近的在前
pub fn bucket_windows(
    now: DateTime<Utc>,
    bucket_size_minutes: i64,
    run_every_minutes: i64,
) -> ProcessorResult<Vec<BucketWindow>> {
    let anchor = start_of_current_bucket(now, bucket_size_minutes)?;
    let count = run_every_minutes / bucket_size_minutes;

    // 最早窗口的起点可表示，逐个窗口的偏移就不会溢出
    bucket_size_minutes
        .checked_mul(count)
        .and_then(Duration::try_minutes)
        .and_then(|span| anchor.checked_sub_signed(span))
        .ok_or_else(|| {
            ProcessorError::invalid_arguments(format!(
                "run_every 超出范围: {run_every_minutes} (bucket_size: {bucket_size_minutes})"
            ))
        })?;

    let bucket_size = Duration::minutes(bucket_size_minutes);
    Ok((1..=count)
        .map(|i| {
            let start = anchor - Duration::minutes(bucket_size_minutes * i);
            BucketWindow {
                start,
                end: start + bucket_size,
            }
        })
        .collect())
}
