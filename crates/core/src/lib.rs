pub mod config;
pub mod models;
pub mod registry;
pub mod traits;

pub use config::{
    AppConfig, DatabaseConfig, DispatchConfig, ObservabilityConfig, ProcessorConfig,
    TaskRunMethod,
};
pub use models::{
    QueuedTask, RecurringTask, RecurringTaskRun, RunAttempt, RunHistory, Task, TaskArguments,
    TaskBase, TaskResult, TaskRun, MAX_RECURRING_RUNS_PER_WINDOW, MAX_TASK_FAILURES,
};
pub use processor_errors::{ProcessorError, ProcessorResult};
pub use registry::{
    derive_task_identifier, Arity, RegisteredTask, TaskHandler, TaskRegistry, TaskRegistryBuilder,
};
pub use traits::{RecurringTaskClaim, TaskClaim, TaskStore};
