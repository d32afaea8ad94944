//! Database layer: connection pooling, migrations, and typed query
//! functions over the task/session/event tables.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
