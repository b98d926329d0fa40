//! Microsoft SQL Server backend for the dbworker contract, built on tiberius.
//!
//! Portable `?` placeholders translate to `@Pn`, prepared inserts capture
//! their identity through a same-batch `scope_identity()` select, and
//! SELECT limits render as `TOP`.
//!
//! Bound text parameters travel as nvarchar and are Unicode-safe. Quoted
//! literals assembled through `escape`/`quotes_or_null` are plain `'...'`
//! strings, so non-ASCII text in literals depends on the target database's
//! collation; route such values through prepared statements instead.
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

pub use worker::MssqlWorker;
