//! Column metadata and row decoding for the PostgreSQL worker.
//!
//! PostgreSQL reports named type strings rather than numeric driver codes,
//! so classification keys on the names sqlx exposes through `PgTypeInfo`.

use dbworker::{DbValue, FieldInfo};
use sqlx::postgres::PgRow;
use sqlx::{Column, Row, TypeInfo};

/// Classification flags for one native type name.
pub(crate) fn classify(type_name: &str) -> FieldInfo {
    let numeric = matches!(
        type_name,
        "INT2" | "INT4" | "INT8" | "FLOAT4" | "FLOAT8" | "NUMERIC" | "OID" | "MONEY"
    );
    let datetime = matches!(
        type_name,
        "TIMESTAMP" | "TIMESTAMPTZ" | "DATE" | "TIME" | "TIMETZ"
    );
    let binary = type_name == "BYTEA";
    FieldInfo {
        name: String::new(),
        type_name: type_name.to_string(),
        binary,
        numeric,
        datetime,
        string: !numeric && !datetime && !binary,
    }
}

pub(crate) fn fields_from_row(row: &PgRow) -> Vec<FieldInfo> {
    row.columns()
        .iter()
        .map(|column| {
            let mut info = classify(column.type_info().name());
            info.name = column.name().to_string();
            info
        })
        .collect()
}

/// Decode one column of a row into the shared value model. Unknown types
/// fall back to text; a decode failure degrades to null with a warning, in
/// line with the contract's lenient field accessors.
pub(crate) fn decode_column(row: &PgRow, index: usize) -> DbValue {
    let type_name = row
        .columns()
        .get(index)
        .map(|c| c.type_info().name().to_string())
        .unwrap_or_default();

    let decoded: Result<DbValue, sqlx::Error> = match type_name.as_str() {
        "BOOL" => row
            .try_get::<Option<bool>, _>(index)
            .map(|v| v.map_or(DbValue::Null, DbValue::Bool)),
        "INT2" => row
            .try_get::<Option<i16>, _>(index)
            .map(|v| v.map_or(DbValue::Null, |n| DbValue::Int(n.into()))),
        "INT4" => row
            .try_get::<Option<i32>, _>(index)
            .map(|v| v.map_or(DbValue::Null, |n| DbValue::Int(n.into()))),
        "INT8" => row
            .try_get::<Option<i64>, _>(index)
            .map(|v| v.map_or(DbValue::Null, DbValue::Int)),
        "OID" => row
            .try_get::<Option<sqlx::postgres::types::Oid>, _>(index)
            .map(|v| v.map_or(DbValue::Null, |oid| DbValue::Int(oid.0.into()))),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(index)
            .map(|v| v.map_or(DbValue::Null, |f| DbValue::Float(f.into()))),
        "FLOAT8" => row
            .try_get::<Option<f64>, _>(index)
            .map(|v| v.map_or(DbValue::Null, DbValue::Float)),
        "NUMERIC" => row
            .try_get::<Option<sqlx::types::BigDecimal>, _>(index)
            .map(|v| v.map_or(DbValue::Null, |d| DbValue::Text(d.to_string()))),
        "TIMESTAMP" => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(index)
            .map(|v| {
                v.map_or(DbValue::Null, |dt| {
                    DbValue::Text(dt.format("%Y-%m-%d %H:%M:%S").to_string())
                })
            }),
        "TIMESTAMPTZ" => row
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
        "BYTEA" => row
            .try_get::<Option<Vec<u8>>, _>(index)
            .map(|v| v.map_or(DbValue::Null, DbValue::Bytes)),
        "JSON" | "JSONB" => row
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

pub(crate) fn decode_row(row: &PgRow) -> Vec<DbValue> {
    (0..row.columns().len())
        .map(|index| decode_column(row, index))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_flags_per_type_name() {
        assert!(classify("INT8").numeric);
        assert!(classify("NUMERIC").numeric);
        assert!(classify("TIMESTAMPTZ").datetime);
        assert!(classify("BYTEA").binary);
        let text = classify("VARCHAR");
        assert!(text.string && !text.numeric && !text.datetime && !text.binary);
    }
}
