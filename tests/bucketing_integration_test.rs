use std::sync::Arc;

use chrono::{Duration, Utc};
use processor_core::config::TaskRunMethod;
use processor_core::models::TaskResult;
use processor_core::registry::TaskRegistryBuilder;
use processor_dispatcher::TaskDispatcher;
use processor_infrastructure::InMemoryTaskStore;
use processor_worker::TaskProcessor;
use task_processor::analytics::{
    register_recurring_tasks, register_tasks, ApiUsageRaw, FeatureEvaluationRaw,
    InMemoryUsageStore, UsageStore,
};

fn dispatcher(store: &InMemoryTaskStore) -> TaskDispatcher {
    TaskDispatcher::new(Arc::new(store.clone()), TaskRunMethod::TaskProcessor, true)
}

#[tokio::test]
async fn test_recurring_bucketing_runs_once_per_interval() {
    let task_store = InMemoryTaskStore::new();
    let usage_store = InMemoryUsageStore::new();
    let dispatcher = dispatcher(&task_store);

    let twenty_minutes_ago = Utc::now() - Duration::minutes(20);
    for environment_id in [1, 1, 2] {
        usage_store
            .insert_api_usage(&ApiUsageRaw {
                environment_id,
                resource: 1,
                host: "api.example.com".to_string(),
                created_at: twenty_minutes_ago,
            })
            .await
            .unwrap();
    }
    usage_store
        .insert_feature_evaluations(&[FeatureEvaluationRaw {
            environment_id: 1,
            feature_name: "dark_mode".to_string(),
            evaluation_count: 12,
            created_at: twenty_minutes_ago,
        }])
        .await
        .unwrap();

    let mut builder = TaskRegistryBuilder::new();
    register_recurring_tasks(&dispatcher, &mut builder, Arc::new(usage_store.clone()))
        .await
        .unwrap();
    let processor = TaskProcessor::new(Arc::new(task_store.clone()), Arc::new(builder.build()));

    let runs = processor.run_recurring_tasks(5).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs
        .iter()
        .all(|run| run.attempt.result == Some(TaskResult::Success)));

    // 一小时内不会再次执行
    assert!(processor.run_recurring_tasks(5).await.unwrap().is_empty());

    let api_buckets = usage_store.list_api_usage_buckets(15).await.unwrap();
    assert_eq!(api_buckets.len(), 2);
    assert_eq!(api_buckets.iter().map(|b| b.total_count).sum::<i64>(), 3);

    let evaluation_buckets = usage_store.list_feature_evaluation_buckets(15).await.unwrap();
    assert_eq!(evaluation_buckets.len(), 1);
    assert_eq!(evaluation_buckets[0].total_count, 12);
}

#[tokio::test]
async fn test_tracked_requests_flow_through_the_queue() {
    let task_store = InMemoryTaskStore::new();
    let usage_store = InMemoryUsageStore::new();
    let dispatcher = dispatcher(&task_store);

    let mut builder = TaskRegistryBuilder::new();
    let analytics = register_tasks(&dispatcher, &mut builder, Arc::new(usage_store.clone())).unwrap();
    let processor = TaskProcessor::new(Arc::new(task_store.clone()), Arc::new(builder.build()));

    analytics
        .track_feature_evaluation
        .delay(
            processor_core::models::TaskArguments::new()
                .with_arg(3)
                .with_arg(serde_json::json!({"dark_mode": 5})),
            None,
        )
        .await
        .unwrap();
    // 参数个数不对，执行时记为失败
    analytics
        .track_request
        .delay(processor_core::models::TaskArguments::new().with_arg(1), None)
        .await
        .unwrap();

    let runs = processor.run_tasks(2).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].attempt.result, Some(TaskResult::Success));
    assert_eq!(runs[1].attempt.result, Some(TaskResult::Failure));

    let now = Utc::now();
    let counts = usage_store
        .feature_evaluation_counts(
            task_processor::analytics::BucketWindow {
                start: now - Duration::minutes(1),
                end: now + Duration::minutes(1),
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(counts.len(), 1);
    assert_eq!(counts[0].count, 5);
}
