//! Table CRUD handlers: list, create, read, update, delete.
//! Strings from the path and query are turned into wire values by column type;
//! the core does the actual validation.

use crate::error::AppError;
use crate::response::{success_created, success_one, success_page};
use crate::schema::{LogicalType, TableDescriptor};
use crate::sql::{FilterExpression, OrderBy, Page, Predicate, DEFAULT_PAGE_SIZE};
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::{Map, Value};

/// Parsed list query string.
#[derive(Debug, Default, PartialEq)]
pub struct ListParams {
    pub filters: Vec<FilterExpression>,
    pub ordering: Vec<OrderBy>,
    pub page: u32,
    pub size: u32,
}

/// Best-effort conversion of a query/path string to the JSON value a column expects.
/// Anything unparsable stays a string and is rejected by the builder with a type mismatch.
fn wire_value(table: &TableDescriptor, column: &str, s: &str) -> Result<Value, AppError> {
    let col = table.require_column(column)?;
    let fallback = || Value::String(s.to_string());
    Ok(match col.logical_type {
        LogicalType::Integer | LogicalType::Serial => {
            s.parse::<i64>().map(Value::from).unwrap_or_else(|_| fallback())
        }
        LogicalType::Float => serde_json::from_str::<serde_json::Number>(s)
            .map(Value::Number)
            .unwrap_or_else(|_| fallback()),
        LogicalType::Boolean if s.eq_ignore_ascii_case("true") => Value::Bool(true),
        LogicalType::Boolean if s.eq_ignore_ascii_case("false") => Value::Bool(false),
        LogicalType::Document => serde_json::from_str(s).unwrap_or_else(|_| fallback()),
        _ => fallback(),
    })
}

fn parse_number(key: &str, v: &str) -> Result<u32, AppError> {
    v.parse()
        .map_err(|_| AppError::InvalidQuery(format!("'{}' must be a positive integer", key)))
}

/// `col=v`, `col__gte=v`, `col__lte=v` (both together form a range), `col__in=a,b`,
/// plus `page`, `size` and `order_by=col,-col`.
pub fn parse_list_params(table: &TableDescriptor, params: &[(String, String)]) -> Result<ListParams, AppError> {
    let mut out = ListParams {
        page: 1,
        size: DEFAULT_PAGE_SIZE,
        ..ListParams::default()
    };
    let mut bounds: Vec<(String, Option<Value>, Option<Value>)> = Vec::new();

    for (k, v) in params {
        match k.as_str() {
            "page" => out.page = parse_number(k, v)?,
            "size" => out.size = parse_number(k, v)?,
            "order_by" => {
                for token in v.split(',').filter(|t| !t.trim().is_empty()) {
                    out.ordering.push(OrderBy::parse(token)?);
                }
            }
            _ => {
                if let Some(col) = k.strip_suffix("__in") {
                    let values = v
                        .split(',')
                        .map(|item| wire_value(table, col, item.trim()))
                        .collect::<Result<Vec<_>, _>>()?;
                    out.filters.push(FilterExpression::new(col, Predicate::In(values)));
                } else if let Some(col) = k.strip_suffix("__gte") {
                    let value = wire_value(table, col, v)?;
                    bound_entry(&mut bounds, col).1 = Some(value);
                } else if let Some(col) = k.strip_suffix("__lte") {
                    let value = wire_value(table, col, v)?;
                    bound_entry(&mut bounds, col).2 = Some(value);
                } else {
                    out.filters.push(FilterExpression::eq(k.as_str(), wire_value(table, k, v)?));
                }
            }
        }
    }

    for (col, low, high) in bounds {
        let predicate = match (low, high) {
            (Some(low), Some(high)) => Predicate::Range(low, high),
            (Some(low), None) => Predicate::Gte(low),
            (None, Some(high)) => Predicate::Lte(high),
            (None, None) => continue,
        };
        out.filters.push(FilterExpression::new(col, predicate));
    }
    Ok(out)
}

fn bound_entry<'a>(
    bounds: &'a mut Vec<(String, Option<Value>, Option<Value>)>,
    col: &str,
) -> &'a mut (String, Option<Value>, Option<Value>) {
    let at = match bounds.iter().position(|(c, _, _)| c == col) {
        Some(at) => at,
        None => {
            bounds.push((col.to_string(), None, None));
            bounds.len() - 1
        }
    };
    &mut bounds[at]
}

fn parse_id(table: &TableDescriptor, id: &str) -> Result<Value, AppError> {
    let pk = table.single_primary_key()?;
    wire_value(table, &pk.name, id)
}

fn body_to_map(value: Value) -> Result<Map<String, Value>, AppError> {
    match value {
        Value::Object(m) => Ok(m),
        _ => Err(AppError::InvalidQuery("body must be a JSON object".into())),
    }
}

pub async fn list(
    State(state): State<AppState>,
    Path(table): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<impl IntoResponse, AppError> {
    let endpoint = state.endpoints.endpoint(&table).await?;
    let params = parse_list_params(endpoint.table(), &params)?;
    let page = Page::new(params.page, params.size)?;
    let listing = endpoint.list(&params.filters, &params.ordering, page).await?;
    Ok(success_page(listing))
}

/// An object creates one row; an array creates all of them in one transaction.
pub async fn create(
    State(state): State<AppState>,
    Path(table): Path<String>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, AppError> {
    let endpoint = state.endpoints.endpoint(&table).await?;
    let data = match body {
        Value::Array(items) => {
            let payloads = items
                .into_iter()
                .map(body_to_map)
                .collect::<Result<Vec<_>, _>>()?;
            let rows = endpoint.create_many(&payloads).await?;
            Value::Array(rows.into_iter().map(Value::Object).collect())
        }
        other => Value::Object(endpoint.create(&body_to_map(other)?).await?),
    };
    Ok(success_created(data))
}

pub async fn read(
    State(state): State<AppState>,
    Path((table, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let endpoint = state.endpoints.endpoint(&table).await?;
    let id = parse_id(endpoint.table(), &id)?;
    Ok(success_one(endpoint.get(&id).await?))
}

/// PATCH and PUT both set only the columns present in the body.
pub async fn update(
    State(state): State<AppState>,
    Path((table, id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, AppError> {
    let endpoint = state.endpoints.endpoint(&table).await?;
    let id = parse_id(endpoint.table(), &id)?;
    let body = body_to_map(body)?;
    Ok(success_one(endpoint.update(&id, &body).await?))
}

pub async fn delete(
    State(state): State<AppState>,
    Path((table, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let endpoint = state.endpoints.endpoint(&table).await?;
    let id = parse_id(endpoint.table(), &id)?;
    endpoint.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
