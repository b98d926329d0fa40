//! MySQL implementation of the DbWorker contract.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dbworker::{
    ConnectionParameters, DbError, DbValue, DbWorker, ResultBuffer, STREAM_CHUNK_SIZE,
    count_placeholders,
};
use futures_util::TryStreamExt;
use sqlx::mysql::{MySqlArguments, MySqlConnectOptions, MySqlConnection, MySqlDatabaseError};
use sqlx::{Arguments, Connection, Either, Executor};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;

use crate::decode;

/// Server handshakes that stall beyond this are reported as unreachable.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

type SharedConnection = Arc<Mutex<Option<MySqlConnection>>>;

struct PreparedQuery {
    sql: String,
    param_count: usize,
}

/// One logical MySQL connection.
///
/// Sessions run with `STRICT_ALL_TABLES` so that out-of-range and truncating
/// writes fail loudly instead of being silently adjusted.
pub struct MysqlWorker {
    parameters: ConnectionParameters,
    connection: SharedConnection,
    owner: bool,
    logging: bool,
    last_query: Option<String>,
    prepared: Option<PreparedQuery>,
    result: ResultBuffer,
    last_insert_id: Option<i64>,
}

impl Default for MysqlWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl MysqlWorker {
    pub fn new() -> Self {
        Self {
            parameters: ConnectionParameters::default(),
            connection: Arc::new(Mutex::new(None)),
            owner: true,
            logging: false,
            last_query: None,
            prepared: None,
            result: ResultBuffer::default(),
            last_insert_id: None,
        }
    }

    fn log_query(&self, sql: &str) {
        if self.logging {
            tracing::debug!(target: "dbworker::mysql", sql, "executing");
        }
    }

    fn bind_values(values: &[DbValue]) -> Result<MySqlArguments, DbError> {
        let mut args = MySqlArguments::default();
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
}

fn classify_connect_error(error: sqlx::Error) -> DbError {
    match &error {
        sqlx::Error::Io(e) => DbError::HostUnreachable(e.to_string()),
        sqlx::Error::Tls(e) => DbError::ConnectionFailed(e.to_string()),
        sqlx::Error::Database(db) => {
            match db
                .try_downcast_ref::<MySqlDatabaseError>()
                .map(MySqlDatabaseError::number)
            {
                // ER_DBACCESS_DENIED_ERROR / ER_ACCESS_DENIED_ERROR
                Some(1044) | Some(1045) => DbError::WrongCredentials(db.message().to_string()),
                // ER_BAD_DB_ERROR
                Some(1049) => DbError::DatabaseNotFound(db.message().to_string()),
                _ => DbError::ConnectionFailed(db.message().to_string()),
            }
        }
        _ => DbError::ConnectionFailed(error.to_string()),
    }
}

/// Drain a mixed row/affected-count stream into the result buffer, capturing
/// the identity value DML executions report.
async fn drain_stream(
    result: &mut ResultBuffer,
    last_insert_id: &mut Option<i64>,
    mut stream: futures_util::stream::BoxStream<
        '_,
        Result<Either<sqlx::mysql::MySqlQueryResult, sqlx::mysql::MySqlRow>, sqlx::Error>,
    >,
    sql: &str,
) -> Result<(), DbError> {
    result.reset();
    let mut first_row = true;
    while let Some(item) = stream.try_next().await.map_err(|e| {
        tracing::error!(target: "dbworker::mysql", sql, error = %e, "query failed");
        DbError::query(e.to_string(), sql)
    })? {
        match item {
            Either::Left(done) => {
                result.add_affected(done.rows_affected());
                if done.last_insert_id() != 0 {
                    *last_insert_id = Some(done.last_insert_id() as i64);
                }
            }
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
impl DbWorker for MysqlWorker {
    fn init(&mut self, parameters: ConnectionParameters) -> Result<(), DbError> {
        self.parameters = parameters;
        Ok(())
    }

    fn rdbms_name(&self) -> &'static str {
        "MySQL"
    }

    fn driver_name(&self) -> &'static str {
        "sqlx-mysql"
    }

    fn is_connected(&self) -> bool {
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

        let mut options = MySqlConnectOptions::new()
            .host(&self.parameters.server)
            .username(&self.parameters.user)
            .password(&self.parameters.password)
            .database(&self.parameters.db_name);
        if let Some(port) = self.parameters.port {
            options = options.port(port);
        }

        let mut connection =
            tokio::time::timeout(CONNECT_TIMEOUT, MySqlConnection::connect_with(&options))
                .await
                .map_err(|_| {
                    DbError::HostUnreachable(format!(
                        "connection to {} timed out",
                        self.parameters.server
                    ))
                })?
                .map_err(classify_connect_error)?;

        connection
            .execute("set session sql_mode = 'STRICT_ALL_TABLES'")
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;
        if self.parameters.read_only {
            connection
                .execute("set session transaction read only")
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
        Box::new(MysqlWorker {
            parameters: self.parameters.clone(),
            connection: Arc::clone(&self.connection),
            owner: false,
            logging: self.logging,
            last_query: None,
            prepared: None,
            result: ResultBuffer::default(),
            last_insert_id: None,
        })
    }

    async fn use_database(&mut self, db_name: &str) -> Result<(), DbError> {
        let sql = format!("use `{db_name}`");
        self.last_query = Some(sql.clone());
        self.log_query(&sql);
        let mut guard = self.connection.lock().await;
        let connection = guard.as_mut().ok_or(DbError::NotConnected)?;
        connection.execute(sql.as_str()).await.map_err(|e| {
            if let sqlx::Error::Database(db) = &e {
                if db
                    .try_downcast_ref::<MySqlDatabaseError>()
                    .map(MySqlDatabaseError::number)
                    == Some(1049)
                {
                    return DbError::DatabaseNotFound(db.message().to_string());
                }
            }
            DbError::query(e.to_string(), &sql)
        })?;
        self.parameters.db_name = db_name.to_string();
        Ok(())
    }

    /// MySQL has no schema prefix distinct from the database.
    fn schema(&self) -> &'static str {
        ""
    }

    async fn execute_query(&mut self, sql: &str) -> Result<(), DbError> {
        self.last_query = Some(sql.to_string());
        self.log_query(sql);
        let mut guard = self.connection.lock().await;
        let connection = guard.as_mut().ok_or(DbError::NotConnected)?;
        let stream = connection.fetch_many(sql);
        drain_stream(&mut self.result, &mut self.last_insert_id, stream, sql).await
    }

    /// MySQL's native placeholder is already `?`; preparation only records
    /// the statement and its arity.
    async fn prepare_query(&mut self, sql: &str) -> Result<(), DbError> {
        if self.prepared.is_some() {
            return Err(DbError::Configuration(
                "a prepared statement is already active; call free_prepared_query first".into(),
            ));
        }
        self.last_query = Some(sql.to_string());
        self.prepared = Some(PreparedQuery {
            sql: sql.to_string(),
            param_count: count_placeholders(sql),
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
        drain_stream(&mut self.result, &mut self.last_insert_id, stream, &sql).await
    }

    async fn free_prepared_query(&mut self) -> Result<(), DbError> {
        self.prepared = None;
        Ok(())
    }

    fn build_procedure_call(&self, name: &str, args_sql: &str) -> String {
        format!("call {name}({args_sql})")
    }

    /// The wire protocol has no incremental parameter streaming, so the
    /// reader is drained in bounded chunks into one buffer and bound as a
    /// single BLOB parameter.
    async fn stream_long_data(
        &mut self,
        sql: &str,
        data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), DbError> {
        if count_placeholders(sql) != 1 {
            return Err(DbError::Stream(
                "stream_long_data expects exactly one placeholder".into(),
            ));
        }
        self.last_query = Some(sql.to_string());
        self.log_query(sql);

        let mut payload = Vec::new();
        let mut chunk = vec![0u8; STREAM_CHUNK_SIZE];
        loop {
            let read = data
                .read(&mut chunk)
                .await
                .map_err(|e| DbError::Stream(e.to_string()))?;
            if read == 0 {
                break;
            }
            payload.extend_from_slice(&chunk[..read]);
        }

        let mut guard = self.connection.lock().await;
        let connection = guard.as_mut().ok_or(DbError::NotConnected)?;
        let done = sqlx::query(sql)
            .bind(payload)
            .execute(&mut *connection)
            .await
            .map_err(|e| DbError::query(e.to_string(), sql))?;
        self.result.reset();
        self.result.add_affected(done.rows_affected());
        Ok(())
    }

    async fn start_transaction(&mut self) -> Result<(), DbError> {
        self.execute_query("start transaction").await
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

    async fn insert_id(&mut self) -> Result<i64, DbError> {
        if let Some(id) = self.last_insert_id.filter(|id| *id != 0) {
            return Ok(id);
        }
        let mut guard = self.connection.lock().await;
        let connection = guard.as_mut().ok_or(DbError::NotConnected)?;
        sqlx::query_scalar::<_, u64>("select last_insert_id()")
            .fetch_one(&mut *connection)
            .await
            .map(|id| id as i64)
            .map_err(|e| DbError::query(e.to_string(), "select last_insert_id()"))
    }

    /// Backslash escaping per the server's default (non-NO_BACKSLASH_ESCAPES)
    /// mode, including NUL and ctrl-Z which terminate input on some clients.
    fn escape(&self, value: &str) -> String {
        let mut out = String::with_capacity(value.len());
        for c in value.chars() {
            match c {
                '\\' => out.push_str("\\\\"),
                '\'' => out.push_str("\\'"),
                '"' => out.push_str("\\\""),
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\0' => out.push_str("\\0"),
                '\u{1a}' => out.push_str("\\Z"),
                _ => out.push(c),
            }
        }
        out
    }

    /// WKT literals through `ST_GeomFromText`, with an explicit SRID for
    /// geographic values.
    fn format_geometry(&self, value: &DbValue, srid: Option<u32>) -> Result<String, DbError> {
        let wkt = value.as_text();
        if wkt.is_empty() {
            return Ok("null".to_string());
        }
        let escaped = self.escape(&wkt);
        Ok(match srid {
            Some(srid) => format!("ST_GeomFromText('{escaped}', {srid})"),
            None => format!("ST_GeomFromText('{escaped}')"),
        })
    }
}
