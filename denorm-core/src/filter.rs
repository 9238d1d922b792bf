//! Filter expressions over stored documents
//!
//! Used by the executor to locate dependent documents through a dotted path
//! into their embedded mirrors (e.g. `tenant.house.id`).

use crate::Document;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Filter operator for field comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOperator {
    /// Equal to
    Eq,
    /// Path resolves to a non-null value
    Exists,
}

/// Single comparison against a dotted field path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterExpr {
    /// Dotted path into the document
    pub field: String,
    /// Operator to apply
    pub operator: FilterOperator,
    /// Value to compare against
    pub value: Value,
}

impl FilterExpr {
    /// Create a new filter expression.
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    /// Create an equality filter.
    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOperator::Eq, value)
    }

    /// Create an existence filter.
    pub fn exists(field: impl Into<String>) -> Self {
        Self::new(field, FilterOperator::Exists, Value::Null)
    }

    /// Evaluate against a document.
    pub fn matches(&self, doc: &Document) -> bool {
        let found = lookup_path(doc, &self.field);
        match self.operator {
            FilterOperator::Eq => found == Some(&self.value),
            FilterOperator::Exists => matches!(found, Some(v) if !v.is_null()),
        }
    }
}

/// Composite filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Filter {
    Expr(FilterExpr),
    /// Matches when any branch matches; an empty list matches nothing
    Or(Vec<Filter>),
}

impl Filter {
    /// Match documents where any of `paths` equals `value`.
    pub fn any_path_eq<I, S>(paths: I, value: Value) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Filter::Or(
            paths
                .into_iter()
                .map(|p| Filter::Expr(FilterExpr::eq(p, value.clone())))
                .collect(),
        )
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::Expr(expr) => expr.matches(doc),
            Filter::Or(parts) => parts.iter().any(|f| f.matches(doc)),
        }
    }
}

/// Resolve a dotted path (`a.b.c`) inside a document.
pub fn lookup_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}
