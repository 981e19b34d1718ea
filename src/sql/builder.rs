//! Builds parameterized SELECT, COUNT, INSERT, UPDATE, DELETE from a table descriptor.
//! Identifiers come from the catalog only; every value is a bound parameter.

use super::filter::{FilterExpression, OrderBy, Page, Predicate};
use super::params::{coerce, BindValue};
use crate::error::AppError;
use crate::schema::{quote_ident, ColumnDescriptor, TableDescriptor};
use serde_json::{Map, Value};

/// Native types the executor decodes directly; everything else is selected as text.
const DECODED_NATIVE: &[&str] = &[
    "int2", "int4", "int8", "float4", "float8", "bool", "text", "varchar", "bpchar", "name",
    "json", "jsonb", "timestamptz", "timestamp", "date", "uuid",
];

#[derive(Clone, Debug, Default)]
pub struct QueryBuf {
    /// Table the statement targets; names it in translated errors.
    pub table: String,
    pub sql: String,
    pub params: Vec<BindValue>,
}

impl QueryBuf {
    fn new(table: &TableDescriptor) -> Self {
        QueryBuf {
            table: table.name.clone(),
            ..QueryBuf::default()
        }
    }

    /// Bind `value` and return its placeholder cast to the column's native type.
    fn push_param(&mut self, column: &ColumnDescriptor, value: BindValue) -> String {
        self.params.push(value);
        format!("${}::{}", self.params.len(), column.cast_target())
    }
}

/// SELECT list: columns as-is, except types the executor cannot decode (numeric, enums, ...) as col::text.
fn select_column_list(table: &TableDescriptor) -> String {
    table
        .columns
        .iter()
        .map(|c| {
            let q = quote_ident(&c.name);
            if c.native_schema.is_none() && DECODED_NATIVE.contains(&c.native_type.as_str()) {
                q
            } else {
                format!("{}::text AS {}", q, q)
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Columns of type `json` have no equality or ordering operators.
fn require_comparable(table: &TableDescriptor, column: &ColumnDescriptor) -> Result<(), AppError> {
    if column.native_type == "json" {
        return Err(AppError::InvalidQuery(format!(
            "column '{}' of '{}' cannot be compared or ordered",
            column.name, table.name
        )));
    }
    Ok(())
}

fn bind_literal(
    q: &mut QueryBuf,
    table: &TableDescriptor,
    column: &ColumnDescriptor,
    value: &Value,
) -> Result<String, AppError> {
    if value.is_null() {
        return Err(AppError::InvalidQuery(format!(
            "null is not a valid filter value for '{}'",
            column.name
        )));
    }
    let bound = coerce(table, column, value)?;
    Ok(q.push_param(column, bound))
}

/// Render the AND-joined predicate for `filters`, binding values into `q`.
fn where_clause(
    q: &mut QueryBuf,
    table: &TableDescriptor,
    filters: &[FilterExpression],
) -> Result<String, AppError> {
    let mut parts = Vec::with_capacity(filters.len());
    for f in filters {
        let column = table.require_column(&f.column)?;
        require_comparable(table, column)?;
        let col = quote_ident(&column.name);
        let part = match &f.predicate {
            Predicate::Eq(v) => format!("{} = {}", col, bind_literal(q, table, column, v)?),
            Predicate::Gte(v) => format!("{} >= {}", col, bind_literal(q, table, column, v)?),
            Predicate::Lte(v) => format!("{} <= {}", col, bind_literal(q, table, column, v)?),
            Predicate::Range(low, high) => {
                let low = bind_literal(q, table, column, low)?;
                let high = bind_literal(q, table, column, high)?;
                format!("{} >= {} AND {} <= {}", col, low, col, high)
            }
            Predicate::In(values) => {
                if values.is_empty() {
                    return Err(AppError::InvalidQuery(format!(
                        "empty value list for '{}'",
                        column.name
                    )));
                }
                let placeholders = values
                    .iter()
                    .map(|v| bind_literal(q, table, column, v))
                    .collect::<Result<Vec<_>, _>>()?;
                format!("{} IN ({})", col, placeholders.join(", "))
            }
        };
        parts.push(part);
    }
    Ok(if parts.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", parts.join(" AND "))
    })
}

/// Requested ordering, then the primary key ascending as a tiebreaker so pages never
/// overlap. Without a primary key every comparable column breaks ties.
fn order_clause(table: &TableDescriptor, ordering: &[OrderBy]) -> Result<String, AppError> {
    let mut named: Vec<&str> = Vec::with_capacity(ordering.len());
    let mut parts = Vec::with_capacity(ordering.len() + table.primary_key.len());
    for o in ordering {
        let column = table.column(&o.column).ok_or_else(|| {
            AppError::InvalidQuery(format!(
                "cannot order '{}' by unknown column '{}'",
                table.name, o.column
            ))
        })?;
        require_comparable(table, column)?;
        if named.contains(&column.name.as_str()) {
            continue;
        }
        named.push(&column.name);
        parts.push(format!("{} {}", quote_ident(&column.name), o.direction.keyword()));
    }

    let tiebreak: Vec<&str> = if table.primary_key.is_empty() {
        table
            .columns
            .iter()
            .filter(|c| c.native_type != "json")
            .map(|c| c.name.as_str())
            .collect()
    } else {
        table.primary_key.iter().map(String::as_str).collect()
    };
    for column in tiebreak {
        if !named.contains(&column) {
            named.push(column);
            parts.push(format!("{} ASC", quote_ident(column)));
        }
    }

    Ok(if parts.is_empty() {
        String::new()
    } else {
        format!(" ORDER BY {}", parts.join(", "))
    })
}

/// Filtered, ordered, paged SELECT. Ordering defaults to the primary key ascending.
pub fn build_select(
    table: &TableDescriptor,
    filters: &[FilterExpression],
    ordering: &[OrderBy],
    page: Page,
) -> Result<QueryBuf, AppError> {
    let mut q = QueryBuf::new(table);
    let where_sql = where_clause(&mut q, table, filters)?;
    let order_sql = order_clause(table, ordering)?;
    q.sql = format!(
        "SELECT {} FROM {}{}{} LIMIT {} OFFSET {}",
        select_column_list(table),
        table.qualified_name(),
        where_sql,
        order_sql,
        page.limit(),
        page.offset()
    );
    Ok(q)
}

/// COUNT(*) over exactly the predicate `build_select` renders for the same filters.
pub fn build_count(table: &TableDescriptor, filters: &[FilterExpression]) -> Result<QueryBuf, AppError> {
    let mut q = QueryBuf::new(table);
    let where_sql = where_clause(&mut q, table, filters)?;
    q.sql = format!("SELECT COUNT(*) FROM {}{}", table.qualified_name(), where_sql);
    Ok(q)
}

/// SELECT by primary key (single column only).
pub fn build_get_by_id(table: &TableDescriptor, id: &Value) -> Result<QueryBuf, AppError> {
    let mut q = QueryBuf::new(table);
    let pk = table.single_primary_key()?;
    let ph = bind_id(&mut q, table, pk, id)?;
    q.sql = format!(
        "SELECT {} FROM {} WHERE {} = {}",
        select_column_list(table),
        table.qualified_name(),
        quote_ident(&pk.name),
        ph
    );
    Ok(q)
}

fn bind_id(
    q: &mut QueryBuf,
    table: &TableDescriptor,
    pk: &ColumnDescriptor,
    id: &Value,
) -> Result<String, AppError> {
    if id.is_null() {
        return Err(AppError::TypeMismatch {
            table: table.name.clone(),
            column: pk.name.clone(),
            expected: pk.logical_type.to_string(),
        });
    }
    let bound = coerce(table, pk, id)?;
    Ok(q.push_param(pk, bound))
}

fn require_known_fields(table: &TableDescriptor, payload: &Map<String, Value>) -> Result<(), AppError> {
    match payload.keys().find(|k| table.column(k).is_none()) {
        Some(field) => Err(AppError::InvalidField {
            table: table.name.clone(),
            field: field.clone(),
        }),
        None => Ok(()),
    }
}

/// INSERT … RETURNING. Columns absent from the payload are omitted so the database applies
/// its defaults; an explicit null is bound as NULL.
pub fn build_insert(table: &TableDescriptor, payload: &Map<String, Value>) -> Result<QueryBuf, AppError> {
    require_known_fields(table, payload)?;
    let mut q = QueryBuf::new(table);
    let mut cols = Vec::new();
    let mut placeholders = Vec::new();
    for c in &table.columns {
        let Some(v) = payload.get(&c.name) else { continue };
        let bound = coerce(table, c, v)?;
        placeholders.push(q.push_param(c, bound));
        cols.push(quote_ident(&c.name));
    }
    let returning = select_column_list(table);
    q.sql = if cols.is_empty() {
        format!(
            "INSERT INTO {} DEFAULT VALUES RETURNING {}",
            table.qualified_name(),
            returning
        )
    } else {
        format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
            table.qualified_name(),
            cols.join(", "),
            placeholders.join(", "),
            returning
        )
    };
    Ok(q)
}

/// UPDATE by id: SET only payload columns, plus `updated_at = NOW()` when the table has one.
/// With nothing to set it degrades to a select by id so a missing row is still detected.
pub fn build_update(
    table: &TableDescriptor,
    id: &Value,
    payload: &Map<String, Value>,
) -> Result<QueryBuf, AppError> {
    require_known_fields(table, payload)?;
    let pk = table.single_primary_key()?;
    if let Some(key) = payload.keys().find(|k| table.is_primary_key(k)) {
        return Err(AppError::InvalidQuery(format!(
            "primary key column '{}' of '{}' cannot be updated",
            key, table.name
        )));
    }
    let touch = table.touch_column().map(|c| c.name.as_str());

    let mut q = QueryBuf::new(table);
    let mut sets = Vec::new();
    for c in &table.columns {
        if Some(c.name.as_str()) == touch {
            continue;
        }
        let Some(v) = payload.get(&c.name) else { continue };
        let bound = coerce(table, c, v)?;
        sets.push(format!("{} = {}", quote_ident(&c.name), q.push_param(c, bound)));
    }
    if let Some(touch) = touch {
        sets.push(format!("{} = NOW()", quote_ident(touch)));
    }
    if sets.is_empty() {
        return build_get_by_id(table, id);
    }

    let id_ph = bind_id(&mut q, table, pk, id)?;
    q.sql = format!(
        "UPDATE {} SET {} WHERE {} = {} RETURNING {}",
        table.qualified_name(),
        sets.join(", "),
        quote_ident(&pk.name),
        id_ph,
        select_column_list(table)
    );
    Ok(q)
}

/// DELETE by id, returning the removed row.
pub fn build_delete(table: &TableDescriptor, id: &Value) -> Result<QueryBuf, AppError> {
    let mut q = QueryBuf::new(table);
    let pk = table.single_primary_key()?;
    let ph = bind_id(&mut q, table, pk, id)?;
    q.sql = format!(
        "DELETE FROM {} WHERE {} = {} RETURNING {}",
        table.qualified_name(),
        quote_ident(&pk.name),
        ph,
        select_column_list(table)
    );
    Ok(q)
}
