//! SQL execution and validation for the supported backends.
//!
//! One [`sql::SqlConnector`] implementation per engine, all enforcing the
//! read-only single-SELECT contract and the row cap before anything
//! reaches the database.

pub mod databricks;
pub mod engine;
pub mod postgres;
pub mod snowflake;
pub mod sql;
pub mod sqlite;
pub mod tsql;
pub mod validator;

pub use engine::default_engine_rules;
pub use sql::{create_connector, EntityRef, SqlConnector};
pub use validator::{validate_select, ValidationOutcome};
