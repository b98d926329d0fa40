//! dbworker - a uniform contract over relational database backends.
//!
//! This crate defines the operation set every backend worker implements and
//! the generic layers built on top of it:
//!
//! # Core Concepts
//!
//! - **Worker**: one backend's adapter over its native client library,
//!   implementing [`DbWorker`] (connection lifecycle, direct and prepared
//!   queries, streaming, transactions, typed result access, formatting).
//! - **Type tag**: a [`DbType`] attached to each mapped column, driving
//!   value formatting on write and coercion on read.
//! - **Dimension grouping**: nesting flat query rows into a multi-level
//!   mapping keyed by successive key-field values.
//!
//! # Layers
//!
//! - [`DbWorker`]: the backend contract
//! - [`RecordsetManager`]: schema-driven single-record and record-set CRUD
//! - [`ShardManager`]: named shard registry with one cached worker per shard

#![cfg_attr(
    test,
    allow(clippy::unwrap_used, clippy::expect_used, clippy::unwrap_in_result)
)]

mod error;
#[cfg(test)]
pub(crate) mod mock;
mod params;
mod recordset;
mod result;
mod shard;
mod sqltext;
mod types;
mod worker;

pub use error::DbError;
pub use params::ConnectionParameters;
pub use recordset::{RecordsetManager, WhereSpec};
pub use result::{FieldInfo, ResultBuffer};
pub use shard::{ShardManager, WorkerFactory};
pub use sqltext::{count_placeholders, translate_placeholders};
pub use types::{DbType, DbValue, coerce_read_value};
pub use worker::{DbWorker, STREAM_CHUNK_SIZE};
