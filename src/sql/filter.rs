//! Filter, ordering and paging inputs for list queries.

use crate::error::AppError;
use serde_json::Value;

pub const MAX_PAGE_SIZE: u32 = 100;
pub const DEFAULT_PAGE_SIZE: u32 = 10;

/// One comparison against a column. Values are wire values, coerced by the builder.
#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    Eq(Value),
    Gte(Value),
    Lte(Value),
    /// Inclusive on both ends.
    Range(Value, Value),
    In(Vec<Value>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct FilterExpression {
    pub column: String,
    pub predicate: Predicate,
}

impl FilterExpression {
    pub fn new(column: impl Into<String>, predicate: Predicate) -> Self {
        FilterExpression {
            column: column.into(),
            predicate,
        }
    }

    pub fn eq(column: impl Into<String>, value: Value) -> Self {
        Self::new(column, Predicate::Eq(value))
    }

    pub fn range(column: impl Into<String>, low: Value, high: Value) -> Self {
        Self::new(column, Predicate::Range(low, high))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn keyword(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrderBy {
    pub column: String,
    pub direction: SortDirection,
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> Self {
        OrderBy {
            column: column.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        OrderBy {
            column: column.into(),
            direction: SortDirection::Desc,
        }
    }

    /// `col` is ascending, `-col` descending.
    pub fn parse(token: &str) -> Result<Self, AppError> {
        let token = token.trim();
        let (column, direction) = match token.strip_prefix('-') {
            Some(rest) => (rest, SortDirection::Desc),
            None => (token.strip_prefix('+').unwrap_or(token), SortDirection::Asc),
        };
        if column.is_empty() {
            return Err(AppError::InvalidQuery("empty order_by column".into()));
        }
        Ok(OrderBy {
            column: column.to_string(),
            direction,
        })
    }
}

/// A validated page request: `page >= 1`, `size` in `1..=100`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Page {
    page: u32,
    size: u32,
}

impl Page {
    pub fn new(page: u32, size: u32) -> Result<Self, AppError> {
        if page < 1 {
            return Err(AppError::InvalidQuery(format!("page must be >= 1, got {}", page)));
        }
        if !(1..=MAX_PAGE_SIZE).contains(&size) {
            return Err(AppError::InvalidQuery(format!(
                "size must be between 1 and {}, got {}",
                MAX_PAGE_SIZE, size
            )));
        }
        Ok(Page { page, size })
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn limit(&self) -> u64 {
        u64::from(self.size)
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.size)
    }
}

impl Default for Page {
    fn default() -> Self {
        Page {
            page: 1,
            size: DEFAULT_PAGE_SIZE,
        }
    }
}
