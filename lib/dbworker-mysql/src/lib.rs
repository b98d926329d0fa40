//! MySQL backend for the dbworker contract, built on sqlx.
//!
//! Connections come up in strict SQL mode with a bounded handshake timeout.
//! The native `?` placeholder syntax is used unchanged for prepared
//! statements, and geometry literals render through `ST_GeomFromText`.
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
mod worker;

pub use worker::MysqlWorker;
