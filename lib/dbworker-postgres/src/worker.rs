//! PostgreSQL implementation of the DbWorker contract.

use std::sync::Arc;

use async_trait::async_trait;
use dbworker::{
    ConnectionParameters, DbError, DbType, DbValue, DbWorker, ResultBuffer, coerce_read_value,
    translate_placeholders,
};
use futures_util::TryStreamExt;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection};
use sqlx::{Arguments, Connection, Either, Executor};
use tokio::io::AsyncRead;
use tokio::sync::Mutex;

use crate::{decode, lob};

type SharedConnection = Arc<Mutex<Option<PgConnection>>>;

struct PreparedQuery {
    sql: String,
    param_count: usize,
}

/// One logical PostgreSQL connection.
///
/// The database is fixed at connect time; `use_database` is rejected.
/// `insert_id` relies on `SELECT lastval()`, which breaks when triggers
/// perform nested inserts - use explicit sequence-based ids in that case.
pub struct PostgresWorker {
    parameters: ConnectionParameters,
    connection: SharedConnection,
    owner: bool,
    logging: bool,
    last_query: Option<String>,
    prepared: Option<PreparedQuery>,
    result: ResultBuffer,
}

impl Default for PostgresWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl PostgresWorker {
    pub fn new() -> Self {
        Self {
            parameters: ConnectionParameters::default(),
            connection: Arc::new(Mutex::new(None)),
            owner: true,
            logging: false,
            last_query: None,
            prepared: None,
            result: ResultBuffer::default(),
        }
    }

    fn log_query(&self, sql: &str) {
        if self.logging {
            tracing::debug!(target: "dbworker::postgres", sql, "executing");
        }
    }

    fn bind_values(values: &[DbValue]) -> Result<PgArguments, DbError> {
        let mut args = PgArguments::default();
        for value in values {
            let bound = match value {
                DbValue::Null => args.add(None::<String>),
                DbValue::Int(n) => args.add(*n),
                DbValue::Float(f) => args.add(*f),
                DbValue::Bool(b) => args.add(*b),
                DbValue::Text(s) => args.add(s.clone()),
                DbValue::Bytes(b) => args.add(b.clone()),
            };
            bound.map_err(|e| DbError::DataFormat(e.to_string()))?;
        }
        Ok(args)
    }

    async fn read_large_object_field(&mut self, raw: Option<DbValue>) -> Result<DbValue, DbError> {
        let Some(oid) = raw.and_then(|v| v.as_int()) else {
            return Ok(DbValue::Null);
        };
        let mut guard = self.connection.lock().await;
        let connection = guard.as_mut().ok_or(DbError::NotConnected)?;
        lob::read_large_object(connection, oid as u32)
            .await
            .map(DbValue::Bytes)
    }
}

fn classify_connect_error(error: sqlx::Error) -> DbError {
    match &error {
        sqlx::Error::Io(e) => DbError::HostUnreachable(e.to_string()),
        sqlx::Error::Tls(e) => DbError::ConnectionFailed(e.to_string()),
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // invalid_password / invalid_authorization_specification
            Some("28P01") | Some("28000") => DbError::WrongCredentials(db.message().to_string()),
            // invalid_catalog_name
            Some("3D000") => DbError::DatabaseNotFound(db.message().to_string()),
            _ => DbError::ConnectionFailed(db.message().to_string()),
        },
        _ => DbError::ConnectionFailed(error.to_string()),
    }
}

/// Drain a mixed row/affected-count stream into the result buffer.
async fn drain_stream(
    result: &mut ResultBuffer,
    mut stream: futures_util::stream::BoxStream<
        '_,
        Result<Either<sqlx::postgres::PgQueryResult, sqlx::postgres::PgRow>, sqlx::Error>,
    >,
    sql: &str,
) -> Result<(), DbError> {
    result.reset();
    let mut first_row = true;
    while let Some(item) = stream.try_next().await.map_err(|e| {
        tracing::error!(target: "dbworker::postgres", sql, error = %e, "query failed");
        DbError::query(e.to_string(), sql)
    })? {
        match item {
            Either::Left(done) => result.add_affected(done.rows_affected()),
            Either::Right(row) => {
                if first_row {
                    result.set_fields(decode::fields_from_row(&row));
                    first_row = false;
                }
                result.push_row(decode::decode_row(&row));
            }
        }
    }
    Ok(())
}

#[async_trait]
impl DbWorker for PostgresWorker {
    fn init(&mut self, parameters: ConnectionParameters) -> Result<(), DbError> {
        self.parameters = parameters;
        Ok(())
    }

    fn rdbms_name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn driver_name(&self) -> &'static str {
        "sqlx-postgres"
    }

    fn is_connected(&self) -> bool {
        // A held lock means a query is in flight on a live connection.
        self.connection
            .try_lock()
            .map(|guard| guard.is_some())
            .unwrap_or(true)
    }

    fn is_clone(&self) -> bool {
        !self.owner
    }

    fn set_logging(&mut self, enabled: bool) {
        self.logging = enabled;
    }

    fn last_query(&self) -> Option<&str> {
        self.last_query.as_deref()
    }

    async fn connect(&mut self) -> Result<(), DbError> {
        let mut guard = self.connection.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        self.parameters.validate()?;

        let mut options = PgConnectOptions::new()
            .host(&self.parameters.server)
            .username(&self.parameters.user)
            .password(&self.parameters.password)
            .database(&self.parameters.db_name);
        if let Some(port) = self.parameters.port {
            options = options.port(port);
        }

        let mut connection = PgConnection::connect_with(&options)
            .await
            .map_err(classify_connect_error)?;
        if self.parameters.read_only {
            connection
                .execute("set default_transaction_read_only to on")
                .await
                .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;
        }
        *guard = Some(connection);
        Ok(())
    }

    async fn close_connection(&mut self) -> Result<(), DbError> {
        self.result.reset();
        self.prepared = None;
        if !self.owner {
            // Clones never tear down the shared connection.
            return Ok(());
        }
        let mut guard = self.connection.lock().await;
        if let Some(connection) = guard.take() {
            connection
                .close()
                .await
                .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;
        }
        Ok(())
    }

    fn create_clone(&self) -> Box<dyn DbWorker> {
        Box::new(PostgresWorker {
            parameters: self.parameters.clone(),
            connection: Arc::clone(&self.connection),
            owner: false,
            logging: self.logging,
            last_query: None,
            prepared: None,
            result: ResultBuffer::default(),
        })
    }

    async fn use_database(&mut self, _db_name: &str) -> Result<(), DbError> {
        Err(DbError::Unsupported {
            backend: "PostgreSQL",
            operation: "switching databases after connect; the database must be specified at connect time"
                .to_string(),
        })
    }

    fn schema(&self) -> &'static str {
        "public"
    }

    async fn execute_query(&mut self, sql: &str) -> Result<(), DbError> {
        self.last_query = Some(sql.to_string());
        self.log_query(sql);
        let mut guard = self.connection.lock().await;
        let connection = guard.as_mut().ok_or(DbError::NotConnected)?;
        let stream = connection.fetch_many(sql);
        drain_stream(&mut self.result, stream, sql).await
    }

    async fn prepare_query(&mut self, sql: &str) -> Result<(), DbError> {
        if self.prepared.is_some() {
            return Err(DbError::Configuration(
                "a prepared statement is already active; call free_prepared_query first".into(),
            ));
        }
        let (translated, param_count) = translate_placeholders(sql, |i| format!("${i}"));
        self.last_query = Some(translated.clone());
        self.prepared = Some(PreparedQuery {
            sql: translated,
            param_count,
        });
        Ok(())
    }

    async fn execute_prepared_query(&mut self, values: &[DbValue]) -> Result<(), DbError> {
        let (sql, param_count) = match self.prepared.as_ref() {
            Some(prepared) => (prepared.sql.clone(), prepared.param_count),
            None => {
                return Err(DbError::Configuration(
                    "no prepared statement; call prepare_query first".into(),
                ));
            }
        };
        if values.len() != param_count {
            return Err(DbError::Configuration(format!(
                "prepared statement expects {param_count} values, got {}",
                values.len()
            )));
        }
        self.log_query(&sql);
        let args = Self::bind_values(values)?;
        let mut guard = self.connection.lock().await;
        let connection = guard.as_mut().ok_or(DbError::NotConnected)?;
        let stream = connection.fetch_many(sqlx::query_with(&sql, args));
        drain_stream(&mut self.result, stream, &sql).await
    }

    async fn free_prepared_query(&mut self) -> Result<(), DbError> {
        self.prepared = None;
        Ok(())
    }

    fn build_procedure_call(&self, name: &str, args_sql: &str) -> String {
        format!("select {name}({args_sql})")
    }

    async fn stream_long_data(
        &mut self,
        sql: &str,
        data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), DbError> {
        let (translated, param_count) = translate_placeholders(sql, |i| format!("${i}"));
        if param_count != 1 {
            return Err(DbError::Stream(
                "stream_long_data expects exactly one placeholder".into(),
            ));
        }
        self.last_query = Some(translated.clone());
        self.log_query(&translated);

        let mut guard = self.connection.lock().await;
        let connection = guard.as_mut().ok_or(DbError::NotConnected)?;

        let oid = lob::write_large_object(connection, data).await?;

        let mut args = PgArguments::default();
        args.add(sqlx::postgres::types::Oid(oid))
            .map_err(|e| DbError::DataFormat(e.to_string()))?;
        let done = sqlx::query_with(&translated, args)
            .execute(&mut *connection)
            .await
            .map_err(|e| DbError::query(e.to_string(), &translated))?;
        self.result.reset();
        self.result.add_affected(done.rows_affected());
        Ok(())
    }

    async fn start_transaction(&mut self) -> Result<(), DbError> {
        self.execute_query("begin").await
    }

    async fn commit_transaction(&mut self) -> Result<(), DbError> {
        self.execute_query("commit").await
    }

    async fn rollback_transaction(&mut self) -> Result<(), DbError> {
        self.execute_query("rollback").await
    }

    fn result(&self) -> &ResultBuffer {
        &self.result
    }

    fn result_mut(&mut self) -> &mut ResultBuffer {
        &mut self.result
    }

    async fn field_by_name(&mut self, name: &str, value_type: DbType) -> Result<DbValue, DbError> {
        let raw = self.result.value_by_name(name).cloned();
        if value_type == DbType::LargeObjectStream {
            return self.read_large_object_field(raw).await;
        }
        match raw {
            Some(value) => coerce_read_value(value, value_type),
            None => Ok(DbValue::Null),
        }
    }

    async fn field_by_num(&mut self, index: usize, value_type: DbType) -> Result<DbValue, DbError> {
        let raw = self.result.value_by_num(index).cloned();
        if value_type == DbType::LargeObjectStream {
            return self.read_large_object_field(raw).await;
        }
        match raw {
            Some(value) => coerce_read_value(value, value_type),
            None => Ok(DbValue::Null),
        }
    }

    /// `SELECT lastval()`. Documented limitation: when a trigger performs a
    /// nested insert, `lastval()` reports the trigger's sequence, not the
    /// outer insert's. Use explicit sequence-based ids where that matters.
    async fn insert_id(&mut self) -> Result<i64, DbError> {
        let mut guard = self.connection.lock().await;
        let connection = guard.as_mut().ok_or(DbError::NotConnected)?;
        sqlx::query_scalar::<_, i64>("select lastval()")
            .fetch_one(&mut *connection)
            .await
            .map_err(|e| DbError::query(e.to_string(), "select lastval()"))
    }

    /// With standard_conforming_strings (the modern server default), only
    /// the single quote needs doubling.
    fn escape(&self, value: &str) -> String {
        value.replace('\'', "''")
    }
}
