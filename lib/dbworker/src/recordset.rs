//! Generic, schema-driven CRUD over a [`DbWorker`].
//!
//! A manager is described once with a field/type map and a list of key
//! fields, then loads and saves flat records or hierarchical record sets
//! keyed by the successive key-field values (dimension grouping). All SQL
//! goes through the worker's `prepare_for_query` choke point.

use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::result::insert_grouped;
use crate::{DbError, DbType, DbValue, DbWorker};

/// Where-clause input for the record operations.
///
/// `Literal` is used verbatim (without the `WHERE` keyword); `Keys` is a
/// field-to-value map synthesized into an AND-joined equality clause through
/// the worker's typed formatting. `None` lets `save_record` derive the clause
/// from the declared key fields and the record's own values.
#[derive(Debug, Clone, Default)]
pub enum WhereSpec {
    #[default]
    None,
    Literal(String),
    Keys(JsonMap<String, JsonValue>),
}

impl From<&str> for WhereSpec {
    fn from(clause: &str) -> Self {
        if clause.is_empty() {
            WhereSpec::None
        } else {
            WhereSpec::Literal(clause.to_string())
        }
    }
}

impl From<String> for WhereSpec {
    fn from(clause: String) -> Self {
        clause.as_str().into()
    }
}

impl From<JsonMap<String, JsonValue>> for WhereSpec {
    fn from(keys: JsonMap<String, JsonValue>) -> Self {
        WhereSpec::Keys(keys)
    }
}

/// Schema-driven record mapper over one worker.
pub struct RecordsetManager {
    dbworker: Option<Box<dyn DbWorker>>,
    table: Option<String>,
    fields: Vec<(String, DbType)>,
    key_fields: Vec<String>,
}

impl Default for RecordsetManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordsetManager {
    pub fn new() -> Self {
        Self {
            dbworker: None,
            table: None,
            fields: Vec::new(),
            key_fields: Vec::new(),
        }
    }

    pub fn with_dbworker(worker: Box<dyn DbWorker>) -> Self {
        let mut manager = Self::new();
        manager.set_dbworker(worker);
        manager
    }

    pub fn set_dbworker(&mut self, worker: Box<dyn DbWorker>) {
        self.dbworker = Some(worker);
    }

    /// Direct access to the underlying worker, e.g. for `affected_count`.
    pub fn dbworker_mut(&mut self) -> Result<&mut (dyn DbWorker + 'static), DbError> {
        self.dbworker
            .as_deref_mut()
            .ok_or_else(|| DbError::Configuration("no dbworker assigned".into()))
    }

    fn dbworker_ref(&self) -> Result<&dyn DbWorker, DbError> {
        self.dbworker
            .as_deref()
            .ok_or_else(|| DbError::Configuration("no dbworker assigned".into()))
    }

    /// Describe table-based access: field/type map plus the ordered key
    /// fields used for existence checks and dimension grouping.
    pub fn describe_table_fields(
        &mut self,
        table: &str,
        fields: Vec<(String, DbType)>,
        key_fields: Vec<String>,
    ) -> Result<(), DbError> {
        if table.is_empty() {
            return Err(DbError::Configuration("table name is empty".into()));
        }
        self.table = Some(table.to_string());
        self.describe_table_fields_query(fields, key_fields)
    }

    /// Describe query-based access (no table; only the `*_query` operations
    /// are valid).
    pub fn describe_table_fields_query(
        &mut self,
        fields: Vec<(String, DbType)>,
        key_fields: Vec<String>,
    ) -> Result<(), DbError> {
        if fields.is_empty() {
            return Err(DbError::Configuration("field descriptor is empty".into()));
        }
        for key in &key_fields {
            if !fields.iter().any(|(name, _)| name == key) {
                return Err(DbError::Configuration(format!(
                    "key field '{key}' is not in the field descriptor"
                )));
            }
        }
        self.fields = fields;
        self.key_fields = key_fields;
        Ok(())
    }

    fn validate(&self, need_table: bool) -> Result<(), DbError> {
        self.dbworker_ref()?;
        if self.fields.is_empty() {
            return Err(DbError::Configuration(
                "fields are not described; call describe_table_fields first".into(),
            ));
        }
        if need_table && self.table.is_none() {
            return Err(DbError::Configuration("no table assigned".into()));
        }
        Ok(())
    }

    fn table_name(&self) -> Result<String, DbError> {
        self.table
            .clone()
            .ok_or_else(|| DbError::Configuration("no table assigned".into()))
    }

    fn field_type(&self, name: &str) -> Result<DbType, DbError> {
        self.fields
            .iter()
            .find(|(f, _)| f == name)
            .map(|(_, t)| *t)
            .ok_or_else(|| DbError::Configuration(format!("field '{name}' is not declared")))
    }

    /// Normalize a where-spec into clause text (no `WHERE` keyword).
    fn where_clause(&self, spec: &WhereSpec) -> Result<String, DbError> {
        match spec {
            WhereSpec::None => Ok(String::new()),
            WhereSpec::Literal(clause) => Ok(clause.clone()),
            WhereSpec::Keys(keys) => {
                let worker = self.dbworker_ref()?;
                let mut parts = Vec::with_capacity(keys.len());
                for (name, value) in keys {
                    let literal = worker
                        .prepare_for_query(&DbValue::from_json(value), self.field_type(name)?)?;
                    if literal == "null" {
                        parts.push(format!("{name} is null"));
                    } else {
                        parts.push(format!("{name} = {literal}"));
                    }
                }
                Ok(parts.join(" and "))
            }
        }
    }

    fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|(name, _)| name.clone()).collect()
    }

    /// Load a single record: first row of the SELECT over the described
    /// fields, then the result is freed.
    pub async fn load_record(
        &mut self,
        record: &mut JsonMap<String, JsonValue>,
        where_spec: impl Into<WhereSpec>,
    ) -> Result<bool, DbError> {
        self.validate(true)?;
        let clause = self.where_clause(&where_spec.into())?;
        let table = self.table_name()?;
        let names = self.field_names();
        let sql = self
            .dbworker_ref()?
            .build_select_query(&table, &names, &clause, "", None);
        self.load_record_query(record, &sql).await
    }

    /// Load a single record from an arbitrary query.
    pub async fn load_record_query(
        &mut self,
        record: &mut JsonMap<String, JsonValue>,
        query: &str,
    ) -> Result<bool, DbError> {
        self.validate(false)?;
        let fields = self.fields.clone();
        let worker = self.dbworker_mut()?;
        worker.execute_query(query).await?;
        let found = worker.fetch_row();
        if found {
            read_current_record(worker, &fields, record).await?;
        }
        worker.free_result();
        Ok(found)
    }

    /// Load all matching rows. With key fields declared the rows are grouped
    /// into a nested mapping, one level per key field; otherwise `records`
    /// becomes a flat ordered list. Returns the row count.
    pub async fn load_record_set(
        &mut self,
        records: &mut JsonValue,
        where_spec: impl Into<WhereSpec>,
        order_clause: &str,
        limit: Option<u64>,
    ) -> Result<u64, DbError> {
        self.validate(true)?;
        let clause = self.where_clause(&where_spec.into())?;
        let table = self.table_name()?;
        let names = self.field_names();
        let sql = self
            .dbworker_ref()?
            .build_select_query(&table, &names, &clause, order_clause, limit);
        self.load_record_set_query(records, &sql).await
    }

    /// Load a record set from an arbitrary query.
    pub async fn load_record_set_query(
        &mut self,
        records: &mut JsonValue,
        query: &str,
    ) -> Result<u64, DbError> {
        self.validate(false)?;
        let fields = self.fields.clone();
        let key_fields = self.key_fields.clone();
        let worker = self.dbworker_mut()?;
        worker.execute_query(query).await?;
        let count = collect_records(worker, &fields, &key_fields, records).await;
        worker.free_result();
        count
    }

    /// Insert or update one record.
    ///
    /// Existence is decided by a `SELECT 1` probe over the where clause
    /// (derived from the key fields when no clause is given); an empty clause
    /// always inserts. The identity field is skipped on insert and written
    /// back into the record from the backend's `insert_id` afterwards.
    /// Fields absent from the record are skipped, so partial updates are
    /// allowed.
    pub async fn save_record(
        &mut self,
        record: &mut JsonMap<String, JsonValue>,
        where_spec: impl Into<WhereSpec>,
        identity_field: Option<&str>,
    ) -> Result<(), DbError> {
        self.validate(true)?;
        let spec = match where_spec.into() {
            WhereSpec::None => self.key_where_from_record(record),
            other => other,
        };
        let clause = self.where_clause(&spec)?;
        let table = self.table_name()?;

        let exists = if clause.is_empty() {
            false
        } else {
            let probe = format!("select 1 from {table} where {clause}");
            let worker = self.dbworker_mut()?;
            worker.execute_query(&probe).await?;
            let found = worker.fetch_row();
            worker.free_result();
            found
        };

        let sql = if exists {
            let mut assignments = Vec::new();
            for (name, value_type) in &self.fields {
                if identity_field == Some(name.as_str()) {
                    continue;
                }
                let Some(value) = record.get(name) else {
                    continue;
                };
                let literal = self
                    .dbworker_ref()?
                    .prepare_for_query(&DbValue::from_json(value), *value_type)?;
                assignments.push(format!("{name} = {literal}"));
            }
            if assignments.is_empty() {
                return Ok(());
            }
            format!(
                "update {table} set {} where {clause}",
                assignments.join(", ")
            )
        } else {
            let mut columns = Vec::new();
            let mut values = Vec::new();
            for (name, value_type) in &self.fields {
                if identity_field == Some(name.as_str()) {
                    continue;
                }
                let Some(value) = record.get(name) else {
                    continue;
                };
                columns.push(name.clone());
                values.push(
                    self.dbworker_ref()?
                        .prepare_for_query(&DbValue::from_json(value), *value_type)?,
                );
            }
            if columns.is_empty() {
                return Err(DbError::Configuration(
                    "record has no declared fields to insert".into(),
                ));
            }
            format!(
                "insert into {table} ({}) values ({})",
                columns.join(", "),
                values.join(", ")
            )
        };

        let worker = self.dbworker_mut()?;
        worker.execute_query(&sql).await?;
        worker.free_result();

        if !exists {
            if let Some(identity) = identity_field {
                let id = worker.insert_id().await?;
                record.insert(identity.to_string(), JsonValue::from(id));
            }
        }
        Ok(())
    }

    /// Save a hierarchical record set: the inverse of dimension grouping.
    ///
    /// Walks the nested mapping level by level, reconstructs one flat record
    /// per leaf, and delegates to `save_record`. `parent_values` supplies
    /// fixed foreign-key values for child record sets, overriding the
    /// dimension keys derived from the mapping's own keys.
    pub async fn save_record_set(
        &mut self,
        records: &JsonValue,
        parent_values: &JsonMap<String, JsonValue>,
        identity_field: Option<&str>,
    ) -> Result<(), DbError> {
        self.validate(true)?;
        let mut flat = Vec::new();
        let mut path = Vec::new();
        self.flatten_record_set(records, &mut path, 0, parent_values, &mut flat)?;
        for mut record in flat {
            self.save_record(&mut record, WhereSpec::None, identity_field)
                .await?;
        }
        Ok(())
    }

    /// Delete matching rows (all rows when the clause is empty).
    pub async fn delete_records(
        &mut self,
        where_spec: impl Into<WhereSpec>,
    ) -> Result<u64, DbError> {
        self.validate(true)?;
        let clause = self.where_clause(&where_spec.into())?;
        let table = self.table_name()?;
        let sql = if clause.is_empty() {
            format!("delete from {table}")
        } else {
            format!("delete from {table} where {clause}")
        };
        self.delete_records_query(&sql).await
    }

    /// Run an arbitrary delete/update statement through the worker.
    pub async fn delete_records_query(&mut self, query: &str) -> Result<u64, DbError> {
        let worker = self.dbworker_mut()?;
        worker.execute_query(query).await?;
        let affected = worker.affected_count();
        worker.free_result();
        Ok(affected)
    }

    /// `SELECT count(*)` over the described table.
    pub async fn count_records(
        &mut self,
        where_spec: impl Into<WhereSpec>,
    ) -> Result<i64, DbError> {
        self.validate(true)?;
        let clause = self.where_clause(&where_spec.into())?;
        let table = self.table_name()?;
        let sql = if clause.is_empty() {
            format!("select count(*) from {table}")
        } else {
            format!("select count(*) from {table} where {clause}")
        };
        self.count_records_query(&sql).await
    }

    /// Count through an arbitrary query whose first column is the count.
    pub async fn count_records_query(&mut self, query: &str) -> Result<i64, DbError> {
        let worker = self.dbworker_mut()?;
        worker.execute_query(query).await?;
        let mut count = 0;
        if worker.fetch_row() {
            count = worker
                .field_by_num(0, DbType::Number)
                .await?
                .as_int()
                .unwrap_or(0);
        }
        worker.free_result();
        Ok(count)
    }

    pub async fn start_transaction(&mut self) -> Result<(), DbError> {
        self.dbworker_mut()?.start_transaction().await
    }

    pub async fn commit_transaction(&mut self) -> Result<(), DbError> {
        self.dbworker_mut()?.commit_transaction().await
    }

    pub async fn rollback_transaction(&mut self) -> Result<(), DbError> {
        self.dbworker_mut()?.rollback_transaction().await
    }

    pub fn escape(&self, value: &str) -> Result<String, DbError> {
        Ok(self.dbworker_ref()?.escape(value))
    }

    pub fn quotes_or_null(&self, value: &str) -> Result<String, DbError> {
        Ok(self.dbworker_ref()?.quotes_or_null(value))
    }

    pub fn number_or_null(&self, value: &str) -> Result<String, DbError> {
        self.dbworker_ref()?.number_or_null(value)
    }

    pub fn format_date(&self, timestamp: i64) -> Result<String, DbError> {
        Ok(self.dbworker_ref()?.format_date(timestamp))
    }

    pub fn format_datetime(&self, timestamp: i64) -> Result<String, DbError> {
        Ok(self.dbworker_ref()?.format_datetime(timestamp))
    }

    /// Key-field equality spec from the record's own values; `None` when a
    /// key value is missing (forcing the insert path).
    fn key_where_from_record(&self, record: &JsonMap<String, JsonValue>) -> WhereSpec {
        if self.key_fields.is_empty() {
            return WhereSpec::None;
        }
        let mut keys = JsonMap::new();
        for name in &self.key_fields {
            match record.get(name) {
                Some(value) if !value.is_null() => {
                    keys.insert(name.clone(), value.clone());
                }
                _ => return WhereSpec::None,
            }
        }
        WhereSpec::Keys(keys)
    }

    fn flatten_record_set(
        &self,
        node: &JsonValue,
        path: &mut Vec<String>,
        depth: usize,
        parent_values: &JsonMap<String, JsonValue>,
        out: &mut Vec<JsonMap<String, JsonValue>>,
    ) -> Result<(), DbError> {
        if self.key_fields.is_empty() {
            let list = node.as_array().ok_or_else(|| {
                DbError::Configuration("record set without key fields must be a list".into())
            })?;
            for item in list {
                let mut record = item
                    .as_object()
                    .cloned()
                    .ok_or_else(|| DbError::Configuration("record must be an object".into()))?;
                for (name, value) in parent_values {
                    record.insert(name.clone(), value.clone());
                }
                out.push(record);
            }
            return Ok(());
        }

        if depth == self.key_fields.len() {
            let mut record = node
                .as_object()
                .cloned()
                .ok_or_else(|| DbError::Configuration("record set leaf must be an object".into()))?;
            for (index, name) in self.key_fields.iter().enumerate() {
                let value = match parent_values.get(name) {
                    Some(fixed) => fixed.clone(),
                    None => self.key_string_to_json(name, &path[index])?,
                };
                record.insert(name.clone(), value);
            }
            for (name, value) in parent_values {
                if !self.key_fields.contains(name) {
                    record.insert(name.clone(), value.clone());
                }
            }
            out.push(record);
            return Ok(());
        }

        let map = node.as_object().ok_or_else(|| {
            DbError::Configuration(format!(
                "record set must nest one level per key field (depth {depth})"
            ))
        })?;
        for (key, child) in map {
            path.push(key.clone());
            self.flatten_record_set(child, path, depth + 1, parent_values, out)?;
            path.pop();
        }
        Ok(())
    }

    /// Dimension keys arrive as JSON object keys (strings); restore the
    /// declared type for number-typed key fields.
    fn key_string_to_json(&self, name: &str, key: &str) -> Result<JsonValue, DbError> {
        match self.field_type(name)? {
            DbType::Number => {
                if let Ok(i) = key.parse::<i64>() {
                    Ok(JsonValue::from(i))
                } else if let Ok(f) = key.parse::<f64>() {
                    Ok(JsonValue::from(f))
                } else {
                    Err(DbError::DataFormat(format!(
                        "dimension key '{key}' is not numeric for field '{name}'"
                    )))
                }
            }
            _ => Ok(JsonValue::String(key.to_string())),
        }
    }
}

/// Populate `record` from the worker's current row using the declared types.
async fn read_current_record(
    worker: &mut dyn DbWorker,
    fields: &[(String, DbType)],
    record: &mut JsonMap<String, JsonValue>,
) -> Result<(), DbError> {
    for (name, value_type) in fields {
        if worker.result().field_index(name).is_none() {
            continue;
        }
        let value = worker.field_by_name(name, *value_type).await?;
        record.insert(name.clone(), value.to_json());
    }
    Ok(())
}

/// Drain all rows into `records`, grouped by the key fields in declared
/// order, or as a flat list when no key fields are set.
async fn collect_records(
    worker: &mut dyn DbWorker,
    fields: &[(String, DbType)],
    key_fields: &[String],
    records: &mut JsonValue,
) -> Result<u64, DbError> {
    if key_fields.is_empty() {
        if !records.is_array() {
            *records = JsonValue::Array(Vec::new());
        }
    } else if !records.is_object() {
        *records = JsonValue::Object(JsonMap::new());
    }

    let mut count = 0;
    while worker.fetch_row() {
        count += 1;
        let mut row = JsonMap::new();
        for (name, value_type) in fields {
            if worker.result().field_index(name).is_none() {
                continue;
            }
            let value = worker.field_by_name(name, *value_type).await?;
            row.insert(name.clone(), value.to_json());
        }

        if key_fields.is_empty() {
            if let Some(list) = records.as_array_mut() {
                list.push(JsonValue::Object(row));
            }
            continue;
        }

        let mut path = Vec::with_capacity(key_fields.len());
        for key in key_fields {
            let value = row.remove(key).unwrap_or(JsonValue::Null);
            path.push(json_key_text(&value));
        }
        insert_grouped(records, &path, row);
    }
    Ok(count)
}

fn json_key_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{CannedResult, MockWorker};
    use serde_json::json;

    fn users_manager(worker: MockWorker) -> RecordsetManager {
        let mut manager = RecordsetManager::with_dbworker(Box::new(worker));
        manager
            .describe_table_fields(
                "USERS",
                vec![
                    ("ID".to_string(), DbType::Number),
                    ("NAME".to_string(), DbType::String),
                ],
                vec!["ID".to_string()],
            )
            .unwrap();
        manager
    }

    fn keys(pairs: &[(&str, JsonValue)]) -> JsonMap<String, JsonValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn save_record_inserts_when_probe_finds_nothing() {
        let mut worker = MockWorker {
            next_insert_id: 1,
            ..Default::default()
        };
        worker.expect(CannedResult::empty()); // probe: no row
        worker.expect(CannedResult::affected(1)); // insert
        let mut manager = users_manager(worker);

        let mut record = keys(&[("ID", json!(1)), ("NAME", json!("Alex"))]);
        manager
            .save_record(&mut record, WhereSpec::None, Some("ID"))
            .await
            .unwrap();

        // Identity propagated back into the record.
        assert_eq!(record.get("ID"), Some(&json!(1)));
        let worker = manager.dbworker_mut().unwrap();
        assert_eq!(
            worker.last_query(),
            Some("insert into USERS (NAME) values ('Alex')")
        );
    }

    #[tokio::test]
    async fn save_record_updates_when_probe_finds_a_row() {
        let mut worker = MockWorker::default();
        worker.expect(CannedResult::rows(&["1"], vec![vec![DbValue::Int(1)]])); // probe hit
        worker.expect(CannedResult::affected(1)); // update
        let mut manager = users_manager(worker);

        let mut record = keys(&[("ID", json!(1)), ("NAME", json!("Alexa"))]);
        manager
            .save_record(&mut record, WhereSpec::None, Some("ID"))
            .await
            .unwrap();

        let worker = manager.dbworker_mut().unwrap();
        assert_eq!(
            worker.last_query(),
            Some("update USERS set NAME = 'Alexa' where ID = 1")
        );
    }

    #[tokio::test]
    async fn save_record_without_keys_always_inserts() {
        let mut worker = MockWorker::default();
        worker.expect(CannedResult::affected(1));
        let mut manager = RecordsetManager::with_dbworker(Box::new(worker));
        manager
            .describe_table_fields(
                "LOG",
                vec![("MESSAGE".to_string(), DbType::String)],
                Vec::new(),
            )
            .unwrap();

        let mut record = keys(&[("MESSAGE", json!("hello"))]);
        manager
            .save_record(&mut record, WhereSpec::None, None)
            .await
            .unwrap();

        let worker = manager.dbworker_mut().unwrap();
        assert_eq!(
            worker.last_query(),
            Some("insert into LOG (MESSAGE) values ('hello')")
        );
    }

    #[tokio::test]
    async fn load_record_populates_from_first_row_only() {
        let mut worker = MockWorker::default();
        worker.expect(CannedResult::rows(
            &["ID", "NAME"],
            vec![
                vec![DbValue::Int(1), DbValue::Text("Alex".into())],
                vec![DbValue::Int(2), DbValue::Text("Kim".into())],
            ],
        ));
        let mut manager = users_manager(worker);

        let mut record = JsonMap::new();
        let found = manager
            .load_record(&mut record, keys(&[("ID", json!(1))]))
            .await
            .unwrap();

        assert!(found);
        assert_eq!(JsonValue::Object(record), json!({"ID": 1, "NAME": "Alex"}));
        let worker = manager.dbworker_mut().unwrap();
        assert_eq!(
            worker.last_query(),
            Some("select ID, NAME from USERS where ID = 1")
        );
        assert!(!worker.result().has_current_row());
    }

    #[tokio::test]
    async fn load_record_set_groups_by_key_fields() {
        let mut worker = MockWorker::default();
        worker.expect(CannedResult::rows(
            &["REGION", "COUNTRY", "POP"],
            vec![
                vec!["EU".into(), "DE".into(), DbValue::Int(80)],
                vec!["EU".into(), "FR".into(), DbValue::Int(65)],
                vec!["NA".into(), "US".into(), DbValue::Int(330)],
            ],
        ));
        let mut manager = RecordsetManager::with_dbworker(Box::new(worker));
        manager
            .describe_table_fields(
                "POPULATION",
                vec![
                    ("REGION".to_string(), DbType::String),
                    ("COUNTRY".to_string(), DbType::String),
                    ("POP".to_string(), DbType::Number),
                ],
                vec!["REGION".to_string(), "COUNTRY".to_string()],
            )
            .unwrap();

        let mut records = JsonValue::Null;
        let count = manager
            .load_record_set(&mut records, WhereSpec::None, "", None)
            .await
            .unwrap();

        assert_eq!(count, 3);
        assert_eq!(
            records,
            json!({
                "EU": {"DE": {"POP": 80}, "FR": {"POP": 65}},
                "NA": {"US": {"POP": 330}}
            })
        );
    }

    #[tokio::test]
    async fn save_record_set_inverts_dimension_grouping() {
        let mut worker = MockWorker::default();
        // Two leaves: probe + insert for each.
        for _ in 0..2 {
            worker.expect(CannedResult::empty());
            worker.expect(CannedResult::affected(1));
        }
        let mut manager = RecordsetManager::with_dbworker(Box::new(worker));
        manager
            .describe_table_fields(
                "POPULATION",
                vec![
                    ("REGION".to_string(), DbType::String),
                    ("COUNTRY".to_string(), DbType::String),
                    ("POP".to_string(), DbType::Number),
                ],
                vec!["REGION".to_string(), "COUNTRY".to_string()],
            )
            .unwrap();

        let records = json!({
            "EU": {"DE": {"POP": 80}, "FR": {"POP": 65}}
        });
        manager
            .save_record_set(&records, &JsonMap::new(), None)
            .await
            .unwrap();

        let worker = manager.dbworker_mut().unwrap();
        assert_eq!(
            worker.last_query(),
            Some("insert into POPULATION (REGION, COUNTRY, POP) values ('EU', 'FR', 65)")
        );
    }

    #[tokio::test]
    async fn save_record_set_applies_parent_values() {
        let mut worker = MockWorker::default();
        worker.expect(CannedResult::empty());
        worker.expect(CannedResult::affected(1));
        let mut manager = RecordsetManager::with_dbworker(Box::new(worker));
        manager
            .describe_table_fields(
                "ORDER_ITEMS",
                vec![
                    ("ORDER_ID".to_string(), DbType::Number),
                    ("LINE".to_string(), DbType::Number),
                    ("SKU".to_string(), DbType::String),
                ],
                vec!["ORDER_ID".to_string(), "LINE".to_string()],
            )
            .unwrap();

        // The mapping's own ORDER_ID key is overridden by the parent value.
        let records = json!({"0": {"1": {"SKU": "A-1"}}});
        let parents = keys(&[("ORDER_ID", json!(42))]);
        manager
            .save_record_set(&records, &parents, None)
            .await
            .unwrap();

        let worker = manager.dbworker_mut().unwrap();
        assert_eq!(
            worker.last_query(),
            Some("insert into ORDER_ITEMS (ORDER_ID, LINE, SKU) values (42, 1, 'A-1')")
        );
    }

    #[tokio::test]
    async fn delete_records_synthesizes_key_clause() {
        let mut worker = MockWorker::default();
        worker.expect(CannedResult::affected(2));
        let mut manager = users_manager(worker);

        let affected = manager
            .delete_records(keys(&[("ID", json!(7))]))
            .await
            .unwrap();

        assert_eq!(affected, 2);
        let worker = manager.dbworker_mut().unwrap();
        assert_eq!(worker.last_query(), Some("delete from USERS where ID = 7"));
    }

    #[tokio::test]
    async fn count_records_reads_first_column() {
        let mut worker = MockWorker::default();
        worker.expect(CannedResult::rows(&["count"], vec![vec![DbValue::Int(5)]]));
        let mut manager = users_manager(worker);

        let count = manager.count_records(WhereSpec::None).await.unwrap();
        assert_eq!(count, 5);
        let worker = manager.dbworker_mut().unwrap();
        assert_eq!(worker.last_query(), Some("select count(*) from USERS"));
    }

    #[tokio::test]
    async fn undeclared_where_key_is_a_configuration_error() {
        let worker = MockWorker::default();
        let mut manager = users_manager(worker);
        let mut record = JsonMap::new();
        let result = manager
            .load_record(&mut record, keys(&[("MISSING", json!(1))]))
            .await;
        assert!(matches!(result, Err(DbError::Configuration(_))));
    }

    #[tokio::test]
    async fn missing_dbworker_is_a_configuration_error() {
        let mut manager = RecordsetManager::new();
        manager
            .describe_table_fields(
                "T",
                vec![("A".to_string(), DbType::String)],
                Vec::new(),
            )
            .unwrap();
        let mut record = JsonMap::new();
        let result = manager.load_record(&mut record, WhereSpec::None).await;
        assert!(matches!(result, Err(DbError::Configuration(_))));
    }

    #[test]
    fn key_field_must_be_declared() {
        let mut manager = RecordsetManager::new();
        let result = manager.describe_table_fields(
            "T",
            vec![("A".to_string(), DbType::String)],
            vec!["B".to_string()],
        );
        assert!(matches!(result, Err(DbError::Configuration(_))));
    }

    #[tokio::test]
    async fn multi_step_save_rolls_back_on_failure() {
        let mut worker = MockWorker::default();
        worker.expect(CannedResult::empty()); // probe for first record
        worker.expect(CannedResult::affected(1)); // first insert
        worker.expect_failure(DbError::query("duplicate key", "probe")); // second probe fails
        let mut manager = users_manager(worker);

        manager.start_transaction().await.unwrap();
        let mut first = keys(&[("ID", json!(1)), ("NAME", json!("Alex"))]);
        let mut second = keys(&[("ID", json!(2)), ("NAME", json!("Kim"))]);
        let outcome = async {
            manager.save_record(&mut first, WhereSpec::None, None).await?;
            manager.save_record(&mut second, WhereSpec::None, None).await?;
            Ok::<(), DbError>(())
        }
        .await;

        match outcome {
            Ok(()) => manager.commit_transaction().await.unwrap(),
            Err(_) => manager.rollback_transaction().await.unwrap(),
        }

        let worker = manager.dbworker_mut().unwrap();
        assert!(worker.last_query().is_some());
        // The failure propagated and the wrapper rolled back.
        assert!(matches!(outcome, Err(DbError::QueryFailed { .. })));
    }
}
