pub mod store;

pub use store::{RecurringTaskClaim, TaskClaim, TaskStore};
