pub mod claim;
pub mod mapping;
pub mod migrations;
pub mod task_store;

pub use claim::{PostgresRecurringTaskClaim, PostgresTaskClaim};
pub use migrations::run_migrations;
pub use task_store::PostgresTaskStore;

pub(crate) const TASK_COLUMNS: &str = "id, uuid, task_identifier, serialized_args, serialized_kwargs, created_at, scheduled_for, num_failures, completed";

pub(crate) const RECURRING_TASK_COLUMNS: &str =
    "id, uuid, task_identifier, serialized_args, serialized_kwargs, created_at, run_every_seconds";

pub(crate) const RUN_COLUMNS: &str = "id, task_id, started_at, finished_at, result, error_details";
