//! SQL Server implementation of the DbWorker contract.

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use dbworker::{
    ConnectionParameters, DbError, DbValue, DbWorker, ResultBuffer, STREAM_CHUNK_SIZE,
    translate_placeholders,
};
use tiberius::{AuthMethod, Client, ColumnData, Config, ToSql};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use crate::decode;

const DEFAULT_PORT: u16 = 1433;

type SharedClient = Arc<Mutex<Option<Client<Compat<TcpStream>>>>>;

/// Bridges the shared value model into TDS parameters. Text binds as
/// nvarchar, so bound parameters are Unicode-safe regardless of collation.
struct MssqlParam<'a>(&'a DbValue);

impl ToSql for MssqlParam<'_> {
    fn to_sql(&self) -> ColumnData<'_> {
        match self.0 {
            DbValue::Null => ColumnData::String(None),
            DbValue::Int(n) => ColumnData::I64(Some(*n)),
            DbValue::Float(f) => ColumnData::F64(Some(*f)),
            DbValue::Bool(b) => ColumnData::Bit(Some(*b)),
            DbValue::Text(s) => ColumnData::String(Some(Cow::from(s.as_str()))),
            DbValue::Bytes(b) => ColumnData::Binary(Some(Cow::from(b.as_slice()))),
        }
    }
}

struct PreparedQuery {
    sql: String,
    param_count: usize,
    returns_identity: bool,
}

/// One logical SQL Server connection over TDS.
///
/// Result sets are drained eagerly, so row counts are exact even though the
/// wire cursor is forward-only. Identity capture for prepared inserts runs
/// `scope_identity()` in the same batch as the insert, where its scope is
/// still valid.
pub struct MssqlWorker {
    parameters: ConnectionParameters,
    client: SharedClient,
    owner: bool,
    logging: bool,
    last_query: Option<String>,
    prepared: Option<PreparedQuery>,
    result: ResultBuffer,
    last_insert_id: Option<i64>,
}

impl Default for MssqlWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl MssqlWorker {
    pub fn new() -> Self {
        Self {
            parameters: ConnectionParameters::default(),
            client: Arc::new(Mutex::new(None)),
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
            tracing::debug!(target: "dbworker::mssql", sql, "executing");
        }
    }

    /// Whether a statement produces result sets (query path) as opposed to
    /// only affected counts (execute path).
    fn returns_rows(sql: &str) -> bool {
        let first_word = sql
            .trim_start()
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();
        matches!(first_word.as_str(), "select" | "with" | "exec" | "execute")
    }

    async fn run(
        &mut self,
        sql: &str,
        values: &[DbValue],
        capture_identity: bool,
    ) -> Result<(), DbError> {
        self.log_query(sql);
        let params: Vec<MssqlParam<'_>> = values.iter().map(MssqlParam).collect();
        let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();

        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or(DbError::NotConnected)?;
        self.result.reset();

        if Self::returns_rows(sql) || capture_identity {
            let stream = client
                .query(sql, &param_refs)
                .await
                .map_err(|e| DbError::query(e.to_string(), sql))?;
            let mut result_sets = stream
                .into_results()
                .await
                .map_err(|e| DbError::query(e.to_string(), sql))?;

            if capture_identity {
                // The appended batch statement yields the final result set:
                // scope_identity() first, then @@rowcount, which at that
                // point still reports the insert's row count.
                if let Some(row) = result_sets.pop().and_then(|rows| rows.into_iter().next()) {
                    let mut cells = row.into_iter();
                    if let Some(cell) = cells.next() {
                        self.last_insert_id = decode::identity_from_cell(&cell);
                    }
                    if let Some(count) = cells.next().and_then(|cell| {
                        decode::identity_from_cell(&cell).filter(|n| *n >= 0)
                    }) {
                        self.result.add_affected(count as u64);
                    }
                }
            } else if let Some(rows) = result_sets.into_iter().next() {
                let mut first_row = true;
                for row in rows {
                    if first_row {
                        self.result.set_fields(decode::fields_from_columns(row.columns()));
                        first_row = false;
                    }
                    self.result
                        .push_row(row.into_iter().map(|cell| decode::decode_cell(&cell)).collect());
                }
            }
        } else {
            let done = client
                .execute(sql, &param_refs)
                .await
                .map_err(|e| DbError::query(e.to_string(), sql))?;
            self.result.add_affected(done.total());
        }
        Ok(())
    }
}

fn classify_error(error: &tiberius::error::Error) -> Option<DbError> {
    match error {
        tiberius::error::Error::Io { message, .. } => {
            Some(DbError::HostUnreachable(message.clone()))
        }
        tiberius::error::Error::Server(token) => match token.code() {
            // login failed
            18456 => Some(DbError::WrongCredentials(token.message().to_string())),
            // database unavailable / does not exist
            911 | 4060 => Some(DbError::DatabaseNotFound(token.message().to_string())),
            _ => None,
        },
        _ => None,
    }
}

fn classify_connect_error(error: tiberius::error::Error) -> DbError {
    classify_error(&error).unwrap_or_else(|| DbError::ConnectionFailed(error.to_string()))
}

#[async_trait]
impl DbWorker for MssqlWorker {
    fn init(&mut self, parameters: ConnectionParameters) -> Result<(), DbError> {
        self.parameters = parameters;
        Ok(())
    }

    fn rdbms_name(&self) -> &'static str {
        "MS SQL Server"
    }

    fn driver_name(&self) -> &'static str {
        "tiberius"
    }

    fn is_connected(&self) -> bool {
        self.client
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
        let mut guard = self.client.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        self.parameters.validate()?;

        let port = self.parameters.port.unwrap_or(DEFAULT_PORT);
        let mut config = Config::new();
        config.host(&self.parameters.server);
        config.port(port);
        config.database(&self.parameters.db_name);
        config.authentication(AuthMethod::sql_server(
            &self.parameters.user,
            &self.parameters.password,
        ));
        config.trust_cert();
        if self.parameters.read_only {
            config.readonly(true);
        }

        let tcp = TcpStream::connect((self.parameters.server.as_str(), port))
            .await
            .map_err(|e| DbError::HostUnreachable(e.to_string()))?;
        tcp.set_nodelay(true)
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;

        let client = Client::connect(config, tcp.compat_write())
            .await
            .map_err(classify_connect_error)?;
        *guard = Some(client);
        Ok(())
    }

    async fn close_connection(&mut self) -> Result<(), DbError> {
        self.result.reset();
        self.prepared = None;
        if !self.owner {
            return Ok(());
        }
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.take() {
            client
                .close()
                .await
                .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;
        }
        Ok(())
    }

    fn create_clone(&self) -> Box<dyn DbWorker> {
        Box::new(MssqlWorker {
            parameters: self.parameters.clone(),
            client: Arc::clone(&self.client),
            owner: false,
            logging: self.logging,
            last_query: None,
            prepared: None,
            result: ResultBuffer::default(),
            last_insert_id: None,
        })
    }

    async fn use_database(&mut self, db_name: &str) -> Result<(), DbError> {
        let sql = format!("use [{db_name}]");
        self.last_query = Some(sql.clone());
        self.log_query(&sql);
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or(DbError::NotConnected)?;
        client.execute(sql.as_str(), &[]).await.map_err(|e| {
            classify_error(&e).unwrap_or_else(|| DbError::query(e.to_string(), &sql))
        })?;
        self.parameters.db_name = db_name.to_string();
        Ok(())
    }

    fn schema(&self) -> &'static str {
        "dbo"
    }

    async fn execute_query(&mut self, sql: &str) -> Result<(), DbError> {
        self.last_query = Some(sql.to_string());
        self.run(sql, &[], false).await
    }

    async fn prepare_query(&mut self, sql: &str) -> Result<(), DbError> {
        if self.prepared.is_some() {
            return Err(DbError::Configuration(
                "a prepared statement is already active; call free_prepared_query first".into(),
            ));
        }
        let (mut translated, param_count) = translate_placeholders(sql, |i| format!("@P{i}"));
        let returns_identity = translated
            .trim_start()
            .get(..6)
            .is_some_and(|head| head.eq_ignore_ascii_case("insert"));
        if returns_identity {
            translated.push_str("; select scope_identity() as insert_id, @@rowcount as affected");
        }
        self.last_query = Some(translated.clone());
        self.prepared = Some(PreparedQuery {
            sql: translated,
            param_count,
            returns_identity,
        });
        Ok(())
    }

    async fn execute_prepared_query(&mut self, values: &[DbValue]) -> Result<(), DbError> {
        let (sql, param_count, returns_identity) = match self.prepared.as_ref() {
            Some(prepared) => (
                prepared.sql.clone(),
                prepared.param_count,
                prepared.returns_identity,
            ),
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
        self.last_query = Some(sql.clone());
        self.run(&sql, values, returns_identity).await
    }

    async fn free_prepared_query(&mut self) -> Result<(), DbError> {
        self.prepared = None;
        Ok(())
    }

    fn build_procedure_call(&self, name: &str, args_sql: &str) -> String {
        if args_sql.is_empty() {
            format!("exec {name}")
        } else {
            format!("exec {name} {args_sql}")
        }
    }

    /// TDS parameters are sent whole, so the reader is drained in bounded
    /// chunks into one buffer and bound as a single varbinary parameter.
    async fn stream_long_data(
        &mut self,
        sql: &str,
        data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), DbError> {
        let (translated, param_count) = translate_placeholders(sql, |i| format!("@P{i}"));
        if param_count != 1 {
            return Err(DbError::Stream(
                "stream_long_data expects exactly one placeholder".into(),
            ));
        }
        self.last_query = Some(translated.clone());

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

        self.run(&translated, &[DbValue::Bytes(payload)], false).await
    }

    async fn start_transaction(&mut self) -> Result<(), DbError> {
        self.execute_query("begin transaction").await
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

    /// The identity captured by the most recent prepared insert's batch.
    /// `@@identity` is the fallback for plain-text inserts; it is
    /// session-scoped, so triggers that insert elsewhere can skew it.
    async fn insert_id(&mut self) -> Result<i64, DbError> {
        if let Some(id) = self.last_insert_id {
            return Ok(id);
        }
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or(DbError::NotConnected)?;
        let stream = client
            .query("select @@identity", &[])
            .await
            .map_err(|e| DbError::query(e.to_string(), "select @@identity"))?;
        let result_sets = stream
            .into_results()
            .await
            .map_err(|e| DbError::query(e.to_string(), "select @@identity"))?;
        let identity = result_sets
            .into_iter()
            .next()
            .and_then(|rows| rows.into_iter().next())
            .and_then(|row| row.into_iter().next())
            .and_then(|cell| decode::identity_from_cell(&cell));
        identity.ok_or_else(|| DbError::query("no identity available", "select @@identity"))
    }

    fn escape(&self, value: &str) -> String {
        value.replace('\'', "''")
    }

    /// `TOP` instead of a trailing `LIMIT`.
    fn build_select_query(
        &self,
        table: &str,
        fields: &[String],
        where_clause: &str,
        order_clause: &str,
        limit: Option<u64>,
    ) -> String {
        let mut sql = String::from("select ");
        if let Some(n) = limit {
            sql.push_str(&format!("top {n} "));
        }
        sql.push_str(&fields.join(", "));
        sql.push_str(" from ");
        sql.push_str(table);
        if !where_clause.is_empty() {
            sql.push_str(" where ");
            sql.push_str(where_clause);
        }
        if !order_clause.is_empty() {
            sql.push_str(" order by ");
            sql.push_str(order_clause);
        }
        sql
    }
}
