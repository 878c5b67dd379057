pub mod error;
pub mod memory;
pub mod sqlite;
pub mod store;

pub use error::SubscriptionError;
pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;
pub use store::*;
