//! SQLite data source.
//!
//! Statements are ad-hoc SQL. Parameters come from the JSON request params:
//! an object binds named parameters (`:id`, `@id` or `$id` all read `id`),
//! an array binds positional ones, and a scalar binds a single `?`. Rows come
//! back as JSON objects keyed by column name; blobs are hex-encoded.

mod database;
mod pool;

pub use database::{Database, SqlFetcher};
pub use pool::{SqliteConnection, SqlitePool};

use serde_json::{Map, Value};
use tokio_rusqlite::rusqlite::types::{Value as SqlValue, ValueRef};
use tokio_rusqlite::rusqlite::{Connection, Statement};

use crate::Error;

/// Run a query and collect every row.
pub(crate) fn query_rows(conn: &Connection, sql: &str, params: &Value) -> Result<Vec<Value>, Error> {
    let mut stmt = conn.prepare_cached(sql)?;
    bind(&mut stmt, params)?;

    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.raw_query();
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut object = Map::with_capacity(columns.len());
        for (index, name) in columns.iter().enumerate() {
            object.insert(name.clone(), to_json(row.get_ref(index)?));
        }
        out.push(Value::Object(object));
    }
    Ok(out)
}

/// Run a statement that returns no rows. Returns the changed row count.
pub(crate) fn execute(conn: &Connection, sql: &str, params: &Value) -> Result<usize, Error> {
    let mut stmt = conn.prepare_cached(sql)?;
    bind(&mut stmt, params)?;
    Ok(stmt.raw_execute()?)
}

fn bind(stmt: &mut Statement<'_>, params: &Value) -> Result<(), Error> {
    let count = stmt.parameter_count();
    match params {
        Value::Object(map) => {
            for index in 1..=count {
                let name = stmt
                    .parameter_name(index)
                    .map(str::to_owned)
                    .ok_or_else(|| Error::Validation(format!("parameter {index} is positional but params are named")))?;
                let field = name.trim_start_matches([':', '@', '$']);
                let value = map.get(field).ok_or_else(|| Error::Validation(format!("missing parameter {name}")))?;
                stmt.raw_bind_parameter(index, to_sql(value))?;
            }
        }
        Value::Array(items) => {
            if items.len() != count {
                return Err(Error::Validation(format!("statement takes {count} parameters, got {}", items.len())));
            }
            for (offset, value) in items.iter().enumerate() {
                stmt.raw_bind_parameter(offset + 1, to_sql(value))?;
            }
        }
        Value::Null if count == 0 => {}
        scalar => {
            if count != 1 {
                return Err(Error::Validation(format!("statement takes {count} parameters, got 1")));
            }
            stmt.raw_bind_parameter(1, to_sql(scalar))?;
        }
    }
    Ok(())
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map_or(SqlValue::Null, SqlValue::Real),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        // nested structures are stored as JSON text
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(hex::encode(bytes)),
    }
}
