pub mod manager;
pub mod memory;
pub mod postgres;

pub use manager::{DatabaseManager, DatabasePool, DatabaseType};
pub use memory::InMemoryTaskStore;
pub use postgres::{run_migrations, PostgresTaskStore};
