//! Scripted in-memory worker used by the unit tests.
//!
//! Each executed statement is recorded and answered from a queue of canned
//! results, so the managers' SQL generation and decision logic can be tested
//! without a live database.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::result::{FieldInfo, ResultBuffer};
use crate::worker::STREAM_CHUNK_SIZE;
use crate::{ConnectionParameters, DbError, DbValue, DbWorker};

pub(crate) struct CannedResult {
    pub fields: Vec<String>,
    pub rows: Vec<Vec<DbValue>>,
    pub affected: u64,
}

impl CannedResult {
    pub fn empty() -> Self {
        Self {
            fields: Vec::new(),
            rows: Vec::new(),
            affected: 0,
        }
    }

    pub fn affected(count: u64) -> Self {
        Self {
            fields: Vec::new(),
            rows: Vec::new(),
            affected: count,
        }
    }

    pub fn rows(fields: &[&str], rows: Vec<Vec<DbValue>>) -> Self {
        Self {
            fields: fields.iter().map(|f| f.to_string()).collect(),
            rows,
            affected: 0,
        }
    }
}

#[derive(Default)]
pub(crate) struct MockWorker {
    pub parameters: ConnectionParameters,
    /// Shared with clones, like a backend's native connection handle.
    pub connection: Arc<AtomicBool>,
    pub clone_flag: bool,
    pub logging: bool,
    pub last: Option<String>,
    pub executed: Vec<String>,
    pub prepared: Option<String>,
    pub canned: VecDeque<Result<CannedResult, DbError>>,
    pub result: ResultBuffer,
    pub next_insert_id: i64,
    pub tx_log: Vec<&'static str>,
    pub connect_count: usize,
    pub streamed: Vec<(String, Vec<u8>)>,
}

impl MockWorker {
    pub fn expect(&mut self, result: CannedResult) {
        self.canned.push_back(Ok(result));
    }

    pub fn expect_failure(&mut self, error: DbError) {
        self.canned.push_back(Err(error));
    }

    fn consume(&mut self, sql: &str) -> Result<(), DbError> {
        self.last = Some(sql.to_string());
        self.executed.push(sql.to_string());
        let canned = self.canned.pop_front().unwrap_or(Ok(CannedResult::empty()));
        let canned = canned?;
        self.result.reset();
        self.result.set_fields(
            canned
                .fields
                .iter()
                .map(|name| FieldInfo {
                    name: name.clone(),
                    type_name: "VARCHAR".into(),
                    string: true,
                    ..Default::default()
                })
                .collect(),
        );
        for row in canned.rows {
            self.result.push_row(row);
        }
        self.result.add_affected(canned.affected);
        Ok(())
    }
}

#[async_trait]
impl DbWorker for MockWorker {
    fn init(&mut self, parameters: ConnectionParameters) -> Result<(), DbError> {
        self.parameters = parameters;
        Ok(())
    }

    fn rdbms_name(&self) -> &'static str {
        "Mock"
    }

    fn driver_name(&self) -> &'static str {
        "mock"
    }

    fn is_connected(&self) -> bool {
        self.connection.load(Ordering::SeqCst)
    }

    fn is_clone(&self) -> bool {
        self.clone_flag
    }

    fn set_logging(&mut self, enabled: bool) {
        self.logging = enabled;
    }

    fn last_query(&self) -> Option<&str> {
        self.last.as_deref()
    }

    async fn connect(&mut self) -> Result<(), DbError> {
        if !self.connection.swap(true, Ordering::SeqCst) {
            self.connect_count += 1;
        }
        Ok(())
    }

    async fn close_connection(&mut self) -> Result<(), DbError> {
        if !self.clone_flag {
            self.connection.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    fn create_clone(&self) -> Box<dyn DbWorker> {
        Box::new(MockWorker {
            parameters: self.parameters.clone(),
            connection: Arc::clone(&self.connection),
            clone_flag: true,
            ..Default::default()
        })
    }

    async fn use_database(&mut self, db_name: &str) -> Result<(), DbError> {
        self.parameters.db_name = db_name.to_string();
        Ok(())
    }

    fn schema(&self) -> &'static str {
        ""
    }

    async fn execute_query(&mut self, sql: &str) -> Result<(), DbError> {
        self.consume(sql)
    }

    async fn prepare_query(&mut self, sql: &str) -> Result<(), DbError> {
        self.prepared = Some(sql.to_string());
        Ok(())
    }

    async fn execute_prepared_query(&mut self, values: &[DbValue]) -> Result<(), DbError> {
        let Some(sql) = self.prepared.clone() else {
            return Err(DbError::Configuration("no prepared statement".into()));
        };
        let rendered = values
            .iter()
            .map(|v| self.format_runtime_value(v))
            .collect::<Vec<_>>()
            .join(",");
        self.consume(&format!("{sql} -- [{rendered}]"))
    }

    async fn free_prepared_query(&mut self) -> Result<(), DbError> {
        self.prepared = None;
        Ok(())
    }

    fn build_procedure_call(&self, name: &str, args_sql: &str) -> String {
        format!("call {name}({args_sql})")
    }

    async fn stream_long_data(
        &mut self,
        sql: &str,
        data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), DbError> {
        let mut buffer = Vec::new();
        let mut chunk = [0u8; STREAM_CHUNK_SIZE];
        loop {
            let n = data
                .read(&mut chunk)
                .await
                .map_err(|e| DbError::Stream(e.to_string()))?;
            if n == 0 {
                break;
            }
            buffer.extend_from_slice(&chunk[..n]);
        }
        self.streamed.push((sql.to_string(), buffer));
        Ok(())
    }

    async fn start_transaction(&mut self) -> Result<(), DbError> {
        self.tx_log.push("start");
        Ok(())
    }

    async fn commit_transaction(&mut self) -> Result<(), DbError> {
        self.tx_log.push("commit");
        Ok(())
    }

    async fn rollback_transaction(&mut self) -> Result<(), DbError> {
        self.tx_log.push("rollback");
        Ok(())
    }

    fn result(&self) -> &ResultBuffer {
        &self.result
    }

    fn result_mut(&mut self) -> &mut ResultBuffer {
        &mut self.result
    }

    async fn insert_id(&mut self) -> Result<i64, DbError> {
        Ok(self.next_insert_id)
    }

    fn escape(&self, value: &str) -> String {
        value.replace('\'', "''")
    }
}
