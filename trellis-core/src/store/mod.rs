mod schema;
pub mod sqlite;
mod traits;

pub use sqlite::SqliteStore;
pub use traits::GraphStore;
