//! Column metadata and row decoding for the SQL Server worker.
//!
//! Tiberius reports typed `ColumnData` per cell, so conversion is a direct
//! match over the wire variants; temporal variants go through the driver's
//! chrono conversions.

use dbworker::{DbValue, FieldInfo};
use tiberius::{Column, ColumnData, ColumnType, FromSql};

/// Classification flags for one wire type.
pub(crate) fn classify(column_type: ColumnType) -> FieldInfo {
    let numeric = matches!(
        column_type,
        ColumnType::Bit
            | ColumnType::Bitn
            | ColumnType::Int1
            | ColumnType::Int2
            | ColumnType::Int4
            | ColumnType::Int8
            | ColumnType::Intn
            | ColumnType::Float4
            | ColumnType::Float8
            | ColumnType::Floatn
            | ColumnType::Decimaln
            | ColumnType::Numericn
            | ColumnType::Money
            | ColumnType::Money4
    );
    let datetime = matches!(
        column_type,
        ColumnType::Datetime
            | ColumnType::Datetime4
            | ColumnType::Datetimen
            | ColumnType::Datetime2
            | ColumnType::DatetimeOffsetn
            | ColumnType::Daten
            | ColumnType::Timen
    );
    let binary = matches!(
        column_type,
        ColumnType::BigBinary | ColumnType::BigVarBin | ColumnType::Image
    );
    FieldInfo {
        name: String::new(),
        type_name: format!("{column_type:?}"),
        binary,
        numeric,
        datetime,
        string: !numeric && !datetime && !binary,
    }
}

pub(crate) fn fields_from_columns(columns: &[Column]) -> Vec<FieldInfo> {
    columns
        .iter()
        .map(|column| {
            let mut info = classify(column.column_type());
            info.name = column.name().to_string();
            info
        })
        .collect()
}

fn temporal<'a, T: FromSql<'a>>(
    data: &'a ColumnData<'static>,
    format: impl Fn(T) -> String,
) -> DbValue {
    match T::from_sql(data) {
        Ok(Some(value)) => DbValue::Text(format(value)),
        Ok(None) => DbValue::Null,
        Err(error) => {
            tracing::warn!(%error, "failed to decode temporal column, yielding null");
            DbValue::Null
        }
    }
}

/// Convert one cell into the shared value model.
pub(crate) fn decode_cell(data: &ColumnData<'static>) -> DbValue {
    match data {
        ColumnData::U8(v) => v.map_or(DbValue::Null, |n| DbValue::Int(n.into())),
        ColumnData::I16(v) => v.map_or(DbValue::Null, |n| DbValue::Int(n.into())),
        ColumnData::I32(v) => v.map_or(DbValue::Null, |n| DbValue::Int(n.into())),
        ColumnData::I64(v) => v.map_or(DbValue::Null, DbValue::Int),
        ColumnData::F32(v) => v.map_or(DbValue::Null, |f| DbValue::Float(f.into())),
        ColumnData::F64(v) => v.map_or(DbValue::Null, DbValue::Float),
        ColumnData::Bit(v) => v.map_or(DbValue::Null, DbValue::Bool),
        ColumnData::String(v) => v
            .as_ref()
            .map_or(DbValue::Null, |s| DbValue::Text(s.to_string())),
        ColumnData::Guid(v) => v.map_or(DbValue::Null, |g| DbValue::Text(g.to_string())),
        ColumnData::Binary(v) => v
            .as_ref()
            .map_or(DbValue::Null, |b| DbValue::Bytes(b.to_vec())),
        ColumnData::Numeric(v) => v.map_or(DbValue::Null, |n| DbValue::Text(n.to_string())),
        ColumnData::Xml(v) => v
            .as_ref()
            .map_or(DbValue::Null, |x| DbValue::Text(x.to_string())),
        ColumnData::Date(_) => temporal::<chrono::NaiveDate>(data, |d| {
            d.format("%Y-%m-%d").to_string()
        }),
        ColumnData::Time(_) => temporal::<chrono::NaiveTime>(data, |t| {
            t.format("%H:%M:%S").to_string()
        }),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            temporal::<chrono::NaiveDateTime>(data, |dt| {
                dt.format("%Y-%m-%d %H:%M:%S").to_string()
            })
        }
        ColumnData::DateTimeOffset(_) => temporal::<chrono::DateTime<chrono::Utc>>(data, |dt| {
            dt.format("%Y-%m-%d %H:%M:%S").to_string()
        }),
    }
}

/// Extract an identity value from a `select scope_identity()` cell, which
/// the server reports as a nullable numeric.
pub(crate) fn identity_from_cell(data: &ColumnData<'static>) -> Option<i64> {
    match decode_cell(data) {
        DbValue::Int(n) => Some(n),
        DbValue::Float(f) => Some(f as i64),
        DbValue::Text(s) => s.parse::<f64>().ok().map(|f| f as i64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_flags_per_wire_type() {
        assert!(classify(ColumnType::Int8).numeric);
        assert!(classify(ColumnType::Numericn).numeric);
        assert!(classify(ColumnType::Datetime2).datetime);
        assert!(classify(ColumnType::BigVarBin).binary);
        let text = classify(ColumnType::NVarchar);
        assert!(text.string && !text.numeric && !text.datetime && !text.binary);
    }

    #[test]
    fn cells_map_to_shared_values() {
        assert_eq!(decode_cell(&ColumnData::I32(Some(7))), DbValue::Int(7));
        assert_eq!(decode_cell(&ColumnData::I32(None)), DbValue::Null);
        assert_eq!(
            decode_cell(&ColumnData::String(Some("abc".into()))),
            DbValue::Text("abc".into())
        );
        assert_eq!(decode_cell(&ColumnData::Bit(Some(true))), DbValue::Bool(true));
    }

    #[test]
    fn identity_extraction_accepts_numeric_shapes() {
        assert_eq!(identity_from_cell(&ColumnData::I64(Some(42))), Some(42));
        assert_eq!(identity_from_cell(&ColumnData::F64(Some(42.0))), Some(42));
        assert_eq!(
            identity_from_cell(&ColumnData::String(Some("42".into()))),
            Some(42)
        );
        assert_eq!(identity_from_cell(&ColumnData::String(None)), None);
    }
}
