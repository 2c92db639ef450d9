//! Conversion between engine values and SQL values

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use pgpolicy_core::PluginError;
use pgpolicy_types::SqlValue;
use serde_json::{Map, Number, Value};

use crate::connectors::RowSet;

/// One result row, keyed by column name
pub type Row = Map<String, Value>;

/// Convert the argument at position `index` into a bind parameter
pub fn to_native(index: usize, value: &Value) -> Result<SqlValue, PluginError> {
    match value {
        Value::Null => Ok(SqlValue::Null),
        Value::Bool(b) => Ok(SqlValue::Bool(*b)),
        Value::String(s) => Ok(SqlValue::Text(s.clone())),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(SqlValue::Int(i))
            } else if n.is_u64() {
                Err(PluginError::argument(
                    index,
                    format!("integer {} does not fit in a 64-bit signed integer", n),
                ))
            } else {
                n.as_f64()
                    .map(SqlValue::Float)
                    .ok_or_else(|| PluginError::argument(index, format!("unsupported number {}", n)))
            }
        }
        Value::Array(_) => Err(PluginError::argument(
            index,
            "arrays cannot be bound as a query parameter",
        )),
        Value::Object(_) => Err(PluginError::argument(
            index,
            "objects cannot be bound as a query parameter",
        )),
    }
}

/// Convert every argument, failing on the first one that cannot be bound
pub fn to_native_args(args: &[Value]) -> Result<Vec<SqlValue>, PluginError> {
    args.iter()
        .enumerate()
        .map(|(index, value)| to_native(index, value))
        .collect()
}

/// Convert a result column back into an engine value.
///
/// Binary columns become standard base64 text.
pub fn to_value(value: SqlValue) -> Result<Value, PluginError> {
    Ok(match value {
        SqlValue::Null => Value::Null,
        SqlValue::Bool(b) => Value::Bool(b),
        SqlValue::Int(i) => Value::Number(i.into()),
        SqlValue::Float(f) => Number::from_f64(f).map(Value::Number).ok_or_else(|| {
            PluginError::ResultConversion(format!("{} has no JSON representation", f))
        })?,
        SqlValue::Text(s) => Value::String(s),
        SqlValue::Bytes(bytes) => Value::String(STANDARD.encode(bytes)),
        SqlValue::Json(json) => json,
    })
}

/// Assemble one row. A repeated column name keeps the last value.
pub fn from_row(columns: &[String], values: Vec<SqlValue>) -> Result<Row, PluginError> {
    if columns.len() != values.len() {
        return Err(PluginError::RowConversion(format!(
            "row has {} values for {} columns",
            values.len(),
            columns.len()
        )));
    }

    let mut row = Map::with_capacity(columns.len());
    for (column, value) in columns.iter().zip(values) {
        let value = to_value(value).map_err(|e| match e {
            PluginError::ResultConversion(message) => {
                PluginError::ResultConversion(format!("column '{}': {}", column, message))
            }
            other => other,
        })?;
        row.insert(column.clone(), value);
    }
    Ok(row)
}

/// Assemble every row of a result set, in order
pub fn from_rows(rows: RowSet) -> Result<Vec<Row>, PluginError> {
    let RowSet { columns, rows } = rows;
    rows.into_iter()
        .map(|values| from_row(&columns, values))
        .collect()
}
