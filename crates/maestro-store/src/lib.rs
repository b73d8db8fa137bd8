pub mod database;
pub mod error;
pub mod messages;
pub mod row_helpers;
pub mod schedules;
pub mod schema;
pub mod sessions;

pub use database::Database;
pub use error::StoreError;
