pub mod config;
pub mod models;
pub mod schema;
pub mod sql_store;

pub use config::DbConfig;
pub use sql_store::{DbPool, PgPool, SqlStore};
