//! The backend contract: one trait every relational worker implements.

use async_trait::async_trait;
use chrono::DateTime;
use serde_json::Value as JsonValue;
use tokio::io::AsyncRead;

use crate::result::{FieldInfo, ResultBuffer};
use crate::types::coerce_read_value;
use crate::{ConnectionParameters, DbError, DbType, DbValue};

/// Chunk size for streaming large-object reads and writes.
pub const STREAM_CHUNK_SIZE: usize = 8192;

/// Uniform operation set over one logical database connection.
///
/// A worker is constructed, configured with [`DbWorker::init`], connected,
/// used for query/transaction cycles, and closed. A single worker must not be
/// used concurrently; one result buffer and one prepared statement are live
/// at a time. The sanctioned sharing mechanism is [`DbWorker::create_clone`]:
/// a second worker wrapping the same native connection, whose
/// `close_connection` never tears down the shared handle.
///
/// Input SQL for the prepared-statement lifecycle uses a single `?` per bound
/// parameter; each backend translates that to its native placeholder syntax.
#[async_trait]
pub trait DbWorker: Send {
    /// Store the connection parameters. No I/O happens here.
    fn init(&mut self, parameters: ConnectionParameters) -> Result<(), DbError>;

    /// Human-readable backend name ("MySQL", "MS SQL Server", "PostgreSQL").
    fn rdbms_name(&self) -> &'static str;

    /// Name of the native client crate adapted by this worker.
    fn driver_name(&self) -> &'static str;

    /// Whether the native client is usable. Rust drivers are statically
    /// linked, so the default is unconditionally true.
    fn is_driver_available(&self) -> bool {
        true
    }

    fn is_connected(&self) -> bool;

    /// Whether this worker shares another worker's connection handle.
    fn is_clone(&self) -> bool;

    /// Toggle SQL logging for this worker.
    fn set_logging(&mut self, enabled: bool);

    /// Text of the most recently executed or prepared query.
    fn last_query(&self) -> Option<&str>;

    /// Establish the connection. A no-op when already connected.
    async fn connect(&mut self) -> Result<(), DbError>;

    /// Close the connection. For a clone this never closes the shared
    /// handle; only the owning worker tears it down.
    async fn close_connection(&mut self) -> Result<(), DbError>;

    /// Produce a second worker bound to the same native connection, for
    /// auxiliary queries while a result set is being iterated on the
    /// original. The two must not contend for the same statement.
    fn create_clone(&self) -> Box<dyn DbWorker>;

    /// Switch the active database. PostgreSQL rejects this; its database is
    /// fixed at connect time.
    async fn use_database(&mut self, db_name: &str) -> Result<(), DbError>;

    /// Default schema prefix ("public" / "dbo" / empty).
    fn schema(&self) -> &'static str;

    fn qualify_name_with_schema(&self, name: &str) -> String {
        let schema = self.schema();
        if schema.is_empty() {
            name.to_string()
        } else {
            format!("{schema}.{name}")
        }
    }

    /// Run a non-parameterized statement, replacing the current result.
    async fn execute_query(&mut self, sql: &str) -> Result<(), DbError>;

    /// Compile a statement with portable `?` placeholders. Exactly one
    /// prepared statement may be active per worker at a time.
    async fn prepare_query(&mut self, sql: &str) -> Result<(), DbError>;

    /// Execute the active prepared statement with positional values.
    async fn execute_prepared_query(&mut self, values: &[DbValue]) -> Result<(), DbError>;

    /// Release the active prepared statement.
    async fn free_prepared_query(&mut self) -> Result<(), DbError>;

    /// Build and run a stored-procedure call, formatting each argument by
    /// its runtime type.
    async fn execute_procedure(&mut self, name: &str, args: &[DbValue]) -> Result<(), DbError> {
        let rendered: Vec<String> = args.iter().map(|a| self.format_runtime_value(a)).collect();
        let sql = self.build_procedure_call(name, &rendered.join(", "));
        self.execute_query(&sql).await
    }

    /// Backend-specific procedure call syntax.
    fn build_procedure_call(&self, name: &str, args_sql: &str) -> String;

    /// Bind `data` as the sole parameter of `sql` and execute, reading the
    /// stream in bounded chunks rather than loading it wholly into memory.
    async fn stream_long_data(
        &mut self,
        sql: &str,
        data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), DbError>;

    async fn start_transaction(&mut self) -> Result<(), DbError>;
    async fn commit_transaction(&mut self) -> Result<(), DbError>;
    async fn rollback_transaction(&mut self) -> Result<(), DbError>;

    /// The buffered result of the most recent execution.
    fn result(&self) -> &ResultBuffer;
    fn result_mut(&mut self) -> &mut ResultBuffer;

    /// Release the current result set.
    fn free_result(&mut self) {
        self.result_mut().reset();
    }

    /// Advance to the next fetched row. False once exhausted.
    fn fetch_row(&mut self) -> bool {
        self.result_mut().advance()
    }

    /// Drain the remaining rows into `target`, nesting by the values of the
    /// designated dimension columns (one level per column) or accumulating a
    /// flat list when no dimensions are given. Returns the row count.
    fn fetch_array(&mut self, target: &mut JsonValue, dimension_keys: &[String]) -> u64 {
        self.result_mut().fetch_all_grouped(target, dimension_keys)
    }

    fn fetched_count(&self) -> u64 {
        self.result().fetched_count()
    }

    fn affected_count(&self) -> u64 {
        self.result().affected_count()
    }

    fn field_count(&self) -> usize {
        self.result().field_count()
    }

    fn field_name(&self, index: usize) -> Option<String> {
        self.result().field_name(index).map(str::to_string)
    }

    fn field_info_by_num(&self, index: usize) -> Option<FieldInfo> {
        self.result().field_info(index).cloned()
    }

    /// Typed field access by column name, with date/datetime coercion to
    /// Unix time. Backends with a large-object read path override this for
    /// `DbType::LargeObjectStream`.
    async fn field_by_name(&mut self, name: &str, value_type: DbType) -> Result<DbValue, DbError> {
        match self.result().value_by_name(name) {
            Some(value) => coerce_read_value(value.clone(), value_type),
            None => Ok(DbValue::Null),
        }
    }

    /// Typed field access by column index.
    async fn field_by_num(&mut self, index: usize, value_type: DbType) -> Result<DbValue, DbError> {
        match self.result().value_by_num(index) {
            Some(value) => coerce_read_value(value.clone(), value_type),
            None => Ok(DbValue::Null),
        }
    }

    /// Identity value generated by the most recent insert.
    async fn insert_id(&mut self) -> Result<i64, DbError>;

    /// Escape a string for inclusion in a single-quoted SQL literal.
    fn escape(&self, value: &str) -> String;

    /// Quoted escaped literal, or the exact literal `null` for an empty
    /// string. "0" is not empty and stays quoted.
    fn quotes_or_null(&self, value: &str) -> String {
        if value.is_empty() {
            "null".to_string()
        } else {
            format!("'{}'", self.escape(value))
        }
    }

    /// The value unchanged when it is a finite numeric, `null` when empty,
    /// and a `DataFormat` error otherwise. "inf" and "NaN" parse as floats
    /// but are not SQL numerics, so they are rejected too.
    fn number_or_null(&self, value: &str) -> Result<String, DbError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Ok("null".to_string());
        }
        match trimmed.parse::<f64>() {
            Ok(f) if f.is_finite() => Ok(value.to_string()),
            _ => Err(DbError::DataFormat(format!("'{value}' is not numeric"))),
        }
    }

    /// Quoted date literal for a Unix timestamp.
    fn format_date(&self, timestamp: i64) -> String {
        match DateTime::from_timestamp(timestamp, 0) {
            Some(dt) => format!("'{}'", dt.format("%Y-%m-%d")),
            None => "null".to_string(),
        }
    }

    /// Quoted datetime literal for a Unix timestamp.
    fn format_datetime(&self, timestamp: i64) -> String {
        match DateTime::from_timestamp(timestamp, 0) {
            Some(dt) => format!("'{}'", dt.format("%Y-%m-%d %H:%M:%S")),
            None => "null".to_string(),
        }
    }

    /// Geometry literal formatting; MySQL-only in practice.
    fn format_geometry(&self, _value: &DbValue, _srid: Option<u32>) -> Result<String, DbError> {
        Err(DbError::Unsupported {
            backend: self.rdbms_name(),
            operation: "geometry values".to_string(),
        })
    }

    /// Render a value as a SQL literal by its runtime type: null, numbers
    /// raw, everything else quoted and escaped.
    fn format_runtime_value(&self, value: &DbValue) -> String {
        match value {
            DbValue::Null => "null".to_string(),
            DbValue::Int(n) => n.to_string(),
            DbValue::Float(f) => f.to_string(),
            DbValue::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            DbValue::Text(s) => format!("'{}'", self.escape(s)),
            DbValue::Bytes(b) => format!("'{}'", self.escape(&String::from_utf8_lossy(b))),
        }
    }

    /// The single choke point all write paths use: render a value as a SQL
    /// literal according to its declared type tag.
    fn prepare_for_query(&self, value: &DbValue, value_type: DbType) -> Result<String, DbError> {
        if value.is_null() {
            return Ok("null".to_string());
        }
        match value_type {
            DbType::AsIs => Ok(value.as_text()),
            DbType::Number => self.number_or_null(&value.as_text()),
            DbType::String => Ok(self.quotes_or_null(&value.as_text())),
            DbType::Date => match value.as_int() {
                Some(ts) => Ok(self.format_date(ts)),
                None => Ok("null".to_string()),
            },
            DbType::DateTime => match value.as_int() {
                Some(ts) => Ok(self.format_datetime(ts)),
                None => Ok("null".to_string()),
            },
            DbType::Geometry => self.format_geometry(value, None),
            DbType::Geometry4326 => self.format_geometry(value, Some(4326)),
            DbType::LargeObjectStream => Err(DbError::Unsupported {
                backend: self.rdbms_name(),
                operation: "inline large-object literals; use stream_long_data".to_string(),
            }),
        }
    }

    /// Backend-specific SELECT assembly. The default renders a trailing
    /// LIMIT; SQL Server overrides with TOP.
    fn build_select_query(
        &self,
        table: &str,
        fields: &[String],
        where_clause: &str,
        order_clause: &str,
        limit: Option<u64>,
    ) -> String {
        let mut sql = format!("select {} from {}", fields.join(", "), table);
        if !where_clause.is_empty() {
            sql.push_str(" where ");
            sql.push_str(where_clause);
        }
        if !order_clause.is_empty() {
            sql.push_str(" order by ");
            sql.push_str(order_clause);
        }
        if let Some(n) = limit {
            sql.push_str(&format!(" limit {n}"));
        }
        sql
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockWorker;

    #[test]
    fn quotes_or_null_null_sentinel() {
        let worker = MockWorker::default();
        assert_eq!(worker.quotes_or_null(""), "null");
        assert_eq!(worker.quotes_or_null("0"), "'0'");
        assert_eq!(worker.quotes_or_null("O'Brien"), "'O''Brien'");
    }

    #[test]
    fn number_or_null_validates() {
        let worker = MockWorker::default();
        assert_eq!(worker.number_or_null("").unwrap(), "null");
        assert_eq!(worker.number_or_null("42").unwrap(), "42");
        assert_eq!(worker.number_or_null("-3.5").unwrap(), "-3.5");
        assert!(matches!(
            worker.number_or_null("abc"),
            Err(DbError::DataFormat(_))
        ));
        // Parseable as f64, but not valid SQL numerics.
        for input in ["inf", "-inf", "infinity", "NaN", "1e999"] {
            assert!(matches!(
                worker.number_or_null(input),
                Err(DbError::DataFormat(_))
            ));
        }
    }

    #[test]
    fn date_formatting_uses_unix_time() {
        let worker = MockWorker::default();
        assert_eq!(worker.format_date(86400), "'1970-01-02'");
        assert_eq!(worker.format_datetime(86401), "'1970-01-02 00:00:01'");
    }

    #[test]
    fn prepare_for_query_dispatches_by_tag() {
        let worker = MockWorker::default();
        assert_eq!(
            worker
                .prepare_for_query(&DbValue::Text("a'b".into()), DbType::String)
                .unwrap(),
            "'a''b'"
        );
        assert_eq!(
            worker
                .prepare_for_query(&DbValue::Int(42), DbType::Number)
                .unwrap(),
            "42"
        );
        assert_eq!(
            worker
                .prepare_for_query(&DbValue::Null, DbType::String)
                .unwrap(),
            "null"
        );
        assert_eq!(
            worker
                .prepare_for_query(&DbValue::Int(86400), DbType::Date)
                .unwrap(),
            "'1970-01-02'"
        );
        assert_eq!(
            worker
                .prepare_for_query(&DbValue::Text("raw()".into()), DbType::AsIs)
                .unwrap(),
            "raw()"
        );
        assert!(matches!(
            worker.prepare_for_query(&DbValue::Text("POINT(0 0)".into()), DbType::Geometry),
            Err(DbError::Unsupported { .. })
        ));
    }

    #[test]
    fn default_select_uses_trailing_limit() {
        let worker = MockWorker::default();
        let sql = worker.build_select_query(
            "USERS",
            &["ID".to_string(), "NAME".to_string()],
            "ID > 5",
            "NAME",
            Some(10),
        );
        assert_eq!(
            sql,
            "select ID, NAME from USERS where ID > 5 order by NAME limit 10"
        );
    }

    #[tokio::test]
    async fn execute_procedure_formats_by_runtime_type() {
        let mut worker = MockWorker::default();
        worker
            .execute_procedure(
                "sync_users",
                &[
                    DbValue::Null,
                    DbValue::Int(7),
                    DbValue::Float(1.5),
                    DbValue::Text("a'b".into()),
                ],
            )
            .await
            .unwrap();
        assert_eq!(
            worker.last_query(),
            Some("call sync_users(null, 7, 1.5, 'a''b')")
        );
    }

    #[tokio::test]
    async fn stream_reads_in_bounded_chunks() {
        let mut worker = MockWorker::default();
        let payload = vec![7u8; STREAM_CHUNK_SIZE * 2 + 17];
        let mut reader = std::io::Cursor::new(payload.clone());
        worker
            .stream_long_data("update DOCS set BODY = ? where ID = 1", &mut reader)
            .await
            .unwrap();
        assert_eq!(worker.streamed.len(), 1);
        assert_eq!(worker.streamed[0].1, payload);
    }

    #[test]
    fn schema_qualification_default() {
        let worker = MockWorker::default();
        assert_eq!(worker.qualify_name_with_schema("USERS"), "USERS");
    }

    #[tokio::test]
    async fn closing_a_clone_leaves_the_owner_connected() {
        let mut worker = MockWorker::default();
        worker.connect().await.unwrap();
        let mut cloned = worker.create_clone();
        assert!(cloned.is_clone());
        assert!(cloned.is_connected());

        cloned.close_connection().await.unwrap();
        assert!(worker.is_connected());
        assert!(cloned.is_connected());
    }

    #[tokio::test]
    async fn closing_the_owner_disconnects_its_clones() {
        let mut worker = MockWorker::default();
        worker.connect().await.unwrap();
        let cloned = worker.create_clone();

        worker.close_connection().await.unwrap();
        assert!(!worker.is_connected());
        assert!(!cloned.is_connected());
    }
}
