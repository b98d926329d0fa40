//! PostgreSQL backend for the dbworker contract, built on sqlx.
//!
//! Connection lifecycle, prepared statements with `$n` placeholders, and
//! large-object streaming through the server-side `lo_*` functions. The
//! active database is fixed at connect time and `use_database` is rejected.
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::unwrap_in_result
    )
)]

mod decode;
mod lob;
mod worker;

pub use worker::PostgresWorker;
