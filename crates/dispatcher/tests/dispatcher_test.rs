use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Duration;
use processor_core::config::{AppConfig, TaskRunMethod};
use processor_core::models::{TaskArguments, TaskResult};
use processor_core::registry::{Arity, TaskHandler, TaskRegistryBuilder};
use processor_core::traits::TaskStore;
use processor_dispatcher::TaskDispatcher;
use processor_errors::ProcessorError;
use processor_infrastructure::InMemoryTaskStore;
use processor_worker::TaskProcessor;
use serde_json::json;

fn counting_handler(calls: &Arc<AtomicUsize>) -> Arc<dyn TaskHandler> {
    let calls = Arc::clone(calls);
    Arc::new(move |_arguments: TaskArguments| {
        let calls = Arc::clone(&calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            anyhow::Ok(())
        }
    })
}

#[tokio::test]
async fn test_recurring_registration_skipped_outside_processor() {
    let store = InMemoryTaskStore::new();
    let dispatcher = TaskDispatcher::new(
        Arc::new(store.clone()),
        TaskRunMethod::TaskProcessor,
        false,
    );
    let mut builder = TaskRegistryBuilder::new();

    let registered = dispatcher
        .register_recurring_task(
            &mut builder,
            "app_analytics",
            "populate_api_usage_bucket",
            Duration::minutes(60),
            TaskArguments::new(),
            counting_handler(&Arc::new(AtomicUsize::new(0))),
        )
        .await
        .unwrap();

    assert!(registered.is_none());
    assert!(!builder.contains("app_analytics.populate_api_usage_bucket"));
    assert!(store.get_recurring_task(1).await.unwrap().is_none());
}

#[tokio::test]
async fn test_recurring_registration_is_idempotent_across_restarts() {
    let store = InMemoryTaskStore::new();
    let dispatcher = TaskDispatcher::new(
        Arc::new(store.clone()),
        TaskRunMethod::TaskProcessor,
        true,
    );
    let calls = Arc::new(AtomicUsize::new(0));

    let mut first_boot = TaskRegistryBuilder::new();
    let first = dispatcher
        .register_recurring_task(
            &mut first_boot,
            "app_analytics",
            "populate_api_usage_bucket",
            Duration::minutes(60),
            TaskArguments::new().with_kwarg("bucket_size", 15),
            counting_handler(&calls),
        )
        .await
        .unwrap()
        .unwrap();

    let mut second_boot = TaskRegistryBuilder::new();
    let second = dispatcher
        .register_recurring_task(
            &mut second_boot,
            "app_analytics",
            "populate_api_usage_bucket",
            Duration::minutes(60),
            TaskArguments::new().with_kwarg("bucket_size", 30),
            counting_handler(&calls),
        )
        .await
        .unwrap()
        .unwrap();

    assert_eq!(first.base.id, second.base.id);
    assert!(second_boot.contains("app_analytics.populate_api_usage_bucket"));

    let stored = store.get_recurring_task(first.base.id).await.unwrap().unwrap();
    let arguments = stored.base.arguments().unwrap();
    assert_eq!(arguments.kwargs.get("bucket_size"), Some(&json!(30)));

    // 不同的执行间隔视为不同的周期任务
    let mut third_boot = TaskRegistryBuilder::new();
    let daily = dispatcher
        .register_recurring_task(
            &mut third_boot,
            "app_analytics",
            "populate_api_usage_bucket",
            Duration::days(1),
            TaskArguments::new(),
            counting_handler(&calls),
        )
        .await
        .unwrap()
        .unwrap();
    assert_ne!(daily.base.id, first.base.id);
}

#[tokio::test]
async fn test_conflicting_registration_is_rejected() {
    let dispatcher = TaskDispatcher::new(
        Arc::new(InMemoryTaskStore::new()),
        TaskRunMethod::Synchronously,
        false,
    );
    let calls = Arc::new(AtomicUsize::new(0));
    let mut builder = TaskRegistryBuilder::new();

    dispatcher
        .register_task(&mut builder, "organisations::tasks", "send", counting_handler(&calls))
        .unwrap();
    let result = dispatcher.register_task(
        &mut builder,
        "audit::tasks",
        "send",
        counting_handler(&calls),
    );

    assert!(matches!(
        result,
        Err(ProcessorError::TaskAlreadyRegistered { identifier }) if identifier == "tasks.send"
    ));
}

#[tokio::test]
async fn test_enqueued_task_is_executed_by_processor() {
    let store = InMemoryTaskStore::new();
    let config = AppConfig::from_toml(
        r#"
[database]
url = "memory://"
max_connections = 1
min_connections = 1
connection_timeout_seconds = 5
idle_timeout_seconds = 60

[processor]
num_workers = 1
sleep_interval_ms = 100
queue_pop_size = 1
grace_period_ms = 1000
run_by_processor = true

[dispatch]
task_run_method = "TASK_PROCESSOR"

[observability]
log_level = "info"
log_format = "pretty"
metrics_enabled = false
metrics_bind_address = "127.0.0.1:9100"
"#,
    )
    .unwrap();
    let dispatcher = TaskDispatcher::from_config(Arc::new(store.clone()), &config);
    assert!(dispatcher.is_run_by_processor());

    let calls = Arc::new(AtomicUsize::new(0));
    let mut builder = TaskRegistryBuilder::new();
    let handle = dispatcher
        .register_task_with_arity(
            &mut builder,
            "organisations::tasks",
            "create_organisation",
            counting_handler(&calls),
            Arity::Exact(1),
        )
        .unwrap();

    let task = handle
        .delay(TaskArguments::new().with_arg("test-org"), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let processor = TaskProcessor::new(Arc::new(store.clone()), Arc::new(builder.build()));
    let runs = processor.run_tasks(1).await.unwrap();

    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].task_id, task.base.id);
    assert_eq!(runs[0].attempt.result, Some(TaskResult::Success));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
