//! SQLite-backed stores over sqlx.

pub mod attempt;
pub mod pool;
pub mod request;
pub mod token;

pub use pool::DatabasePool;
