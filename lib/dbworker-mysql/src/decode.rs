//! Column metadata and row decoding for the MySQL worker.

use dbworker::{DbValue, FieldInfo};
use sqlx::mysql::MySqlRow;
use sqlx::{Column, Row, TypeInfo};

/// Classification flags for one native type name.
pub(crate) fn classify(type_name: &str) -> FieldInfo {
    let base = type_name.strip_suffix(" UNSIGNED").unwrap_or(type_name);
    let numeric = matches!(
        base,
        "TINYINT"
            | "SMALLINT"
            | "MEDIUMINT"
            | "INT"
            | "BIGINT"
            | "FLOAT"
            | "DOUBLE"
            | "DECIMAL"
            | "YEAR"
            | "BIT"
            | "BOOLEAN"
    );
    let datetime = matches!(base, "DATE" | "DATETIME" | "TIMESTAMP" | "TIME");
    let binary = matches!(
        base,
        "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BINARY" | "VARBINARY"
    );
    FieldInfo {
        name: String::new(),
        type_name: type_name.to_string(),
        binary,
        numeric,
        datetime,
        string: !numeric && !datetime && !binary,
    }
}

pub(crate) fn fields_from_row(row: &MySqlRow) -> Vec<FieldInfo> {
    row.columns()
        .iter()
        .map(|column| {
            let mut info = classify(column.type_info().name());
            info.name = column.name().to_string();
            info
        })
        .collect()
}

/// Decode one column into the shared value model. Unknown types fall back to
/// text; a decode failure degrades to null with a warning.
pub(crate) fn decode_column(row: &MySqlRow, index: usize) -> DbValue {
    let type_name = row
        .columns()
        .get(index)
        .map(|c| c.type_info().name().to_string())
        .unwrap_or_default();

    let decoded: Result<DbValue, sqlx::Error> = match type_name.as_str() {
        "BOOLEAN" => row
            .try_get::<Option<bool>, _>(index)
            .map(|v| v.map_or(DbValue::Null, DbValue::Bool)),
        "TINYINT" => row
            .try_get::<Option<i8>, _>(index)
            .map(|v| v.map_or(DbValue::Null, |n| DbValue::Int(n.into()))),
        "SMALLINT" => row
            .try_get::<Option<i16>, _>(index)
            .map(|v| v.map_or(DbValue::Null, |n| DbValue::Int(n.into()))),
        "MEDIUMINT" | "INT" => row
            .try_get::<Option<i32>, _>(index)
            .map(|v| v.map_or(DbValue::Null, |n| DbValue::Int(n.into()))),
        "BIGINT" => row
            .try_get::<Option<i64>, _>(index)
            .map(|v| v.map_or(DbValue::Null, DbValue::Int)),
        "TINYINT UNSIGNED" => row
            .try_get::<Option<u8>, _>(index)
            .map(|v| v.map_or(DbValue::Null, |n| DbValue::Int(n.into()))),
        "SMALLINT UNSIGNED" => row
            .try_get::<Option<u16>, _>(index)
            .map(|v| v.map_or(DbValue::Null, |n| DbValue::Int(n.into()))),
        "MEDIUMINT UNSIGNED" | "INT UNSIGNED" => row
            .try_get::<Option<u32>, _>(index)
            .map(|v| v.map_or(DbValue::Null, |n| DbValue::Int(n.into()))),
        "BIGINT UNSIGNED" => row
            .try_get::<Option<u64>, _>(index)
            .map(|v| v.map_or(DbValue::Null, |n| DbValue::Int(n as i64))),
        "YEAR" => row
            .try_get::<Option<u16>, _>(index)
            .map(|v| v.map_or(DbValue::Null, |n| DbValue::Int(n.into()))),
        "FLOAT" => row
            .try_get::<Option<f32>, _>(index)
            .map(|v| v.map_or(DbValue::Null, |f| DbValue::Float(f.into()))),
        "DOUBLE" => row
            .try_get::<Option<f64>, _>(index)
            .map(|v| v.map_or(DbValue::Null, DbValue::Float)),
        "DECIMAL" => row
            .try_get::<Option<sqlx::types::BigDecimal>, _>(index)
            .map(|v| v.map_or(DbValue::Null, |d| DbValue::Text(d.to_string()))),
        "DATETIME" => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(index)
            .map(|v| {
                v.map_or(DbValue::Null, |dt| {
                    DbValue::Text(dt.format("%Y-%m-%d %H:%M:%S").to_string())
                })
            }),
        "TIMESTAMP" => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(index)
            .map(|v| {
                v.map_or(DbValue::Null, |dt| {
                    DbValue::Text(dt.format("%Y-%m-%d %H:%M:%S").to_string())
                })
            }),
        "DATE" => row.try_get::<Option<chrono::NaiveDate>, _>(index).map(|v| {
            v.map_or(DbValue::Null, |d| {
                DbValue::Text(d.format("%Y-%m-%d").to_string())
            })
        }),
        "TIME" => row.try_get::<Option<chrono::NaiveTime>, _>(index).map(|v| {
            v.map_or(DbValue::Null, |t| {
                DbValue::Text(t.format("%H:%M:%S").to_string())
            })
        }),
        "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BINARY" | "VARBINARY" => row
            .try_get::<Option<Vec<u8>>, _>(index)
            .map(|v| v.map_or(DbValue::Null, DbValue::Bytes)),
        "JSON" => row
            .try_get::<Option<serde_json::Value>, _>(index)
            .map(|v| v.map_or(DbValue::Null, |j| DbValue::Text(j.to_string()))),
        _ => row
            .try_get::<Option<String>, _>(index)
            .map(|v| v.map_or(DbValue::Null, DbValue::Text)),
    };

    match decoded {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(%type_name, index, %error, "failed to decode column, yielding null");
            DbValue::Null
        }
    }
}

pub(crate) fn decode_row(row: &MySqlRow) -> Vec<DbValue> {
    (0..row.columns().len())
        .map(|index| decode_column(row, index))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_flags_per_type_name() {
        assert!(classify("BIGINT").numeric);
        assert!(classify("INT UNSIGNED").numeric);
        assert!(classify("DECIMAL").numeric);
        assert!(classify("DATETIME").datetime);
        assert!(classify("LONGBLOB").binary);
        let text = classify("VARCHAR");
        assert!(text.string && !text.numeric && !text.datetime && !text.binary);
    }
}
