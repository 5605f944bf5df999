//! Query descriptors and in-memory evaluation.
//!
//! A [`Query`] is a list of `(field, operator, value)` filter triples plus
//! optional ordering and an optional limit with cursor. The same evaluation
//! is used for cache-scan replay and by the in-memory test backend, so the
//! two paths cannot drift.
//!
//! # Fingerprints
//!
//! [`Query::fingerprint`] derives a stable string from the filter predicates
//! only - ordering and limit are excluded. A fingerprint marks "this filter
//! combination has been fully loaded into cache" so repeats can be served by
//! scanning cached documents instead of re-fetching.

use std::cmp::Ordering;
use std::fmt;

use serde_json::Value;

use crate::entity::{document_id, Document};

// =============================================================================
// Filter
// =============================================================================

/// Comparison operator for a filter triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// Document value is contained in the filter's array value.
    In,
    /// Document value is not contained in the filter's array value.
    NotIn,
}

impl FilterOp {
    /// The operator's wire symbol, also used in fingerprints.
    pub fn symbol(&self) -> &'static str {
        match self {
            FilterOp::Eq => "==",
            FilterOp::Ne => "!=",
            FilterOp::Lt => "<",
            FilterOp::Le => "<=",
            FilterOp::Gt => ">",
            FilterOp::Ge => ">=",
            FilterOp::In => "in",
            FilterOp::NotIn => "not-in",
        }
    }
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// One `(field, operator, value)` predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    /// Document field the predicate reads.
    pub field: String,
    /// Comparison operator.
    pub op: FilterOp,
    /// Comparison value. For `In`/`NotIn` this must be an array.
    pub value: Value,
}

impl Filter {
    /// Create a predicate.
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// Evaluate this predicate against a document. Missing fields compare
    /// as JSON null.
    pub fn matches(&self, doc: &Document) -> bool {
        let actual = doc.get(&self.field).unwrap_or(&Value::Null);
        match self.op {
            FilterOp::Eq => actual == &self.value,
            FilterOp::Ne => actual != &self.value,
            FilterOp::Lt => matches!(compare_values(actual, &self.value), Some(Ordering::Less)),
            FilterOp::Le => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOp::Gt => matches!(compare_values(actual, &self.value), Some(Ordering::Greater)),
            FilterOp::Ge => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOp::In => self
                .value
                .as_array()
                .is_some_and(|candidates| candidates.contains(actual)),
            FilterOp::NotIn => self
                .value
                .as_array()
                .is_some_and(|candidates| !candidates.contains(actual)),
        }
    }
}

/// Order two JSON values. Numbers, strings, and booleans are comparable;
/// anything else (or a type mismatch) is not.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

// =============================================================================
// Ordering and Limit
// =============================================================================

/// Sort direction for an ordered query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    /// Ascending.
    Asc,
    /// Descending.
    Desc,
}

/// Ordering clause: `(field, direction)`.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    /// Field to sort on.
    pub field: String,
    /// Sort direction.
    pub direction: SortDirection,
}

// =============================================================================
// Query
// =============================================================================

/// A query descriptor: filters, optional ordering, optional limit + cursor.
#[derive(Debug, Clone, Default)]
pub struct Query {
    /// Filter predicates, all of which must match.
    pub filters: Vec<Filter>,
    /// Optional ordering clause.
    pub order_by: Option<OrderBy>,
    /// Optional page size.
    pub limit: Option<usize>,
    /// Optional cursor: results resume after this document (matched by id).
    pub after: Option<Document>,
}

impl Query {
    /// An empty query matching everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter predicate.
    pub fn filter(mut self, field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::new(field, op, value));
        self
    }

    /// Set the ordering clause.
    pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    /// Set the page size.
    pub fn limit(mut self, size: usize) -> Self {
        self.limit = Some(size);
        self
    }

    /// Resume after this document (typically the previous page's last entity).
    pub fn after(mut self, cursor: Document) -> Self {
        self.after = Some(cursor);
        self
    }

    /// True when every filter matches the document.
    pub fn matches(&self, doc: &Document) -> bool {
        self.filters.iter().all(|f| f.matches(doc))
    }

    /// Stable fingerprint of the filter predicates only.
    ///
    /// Predicates are serialized in sorted order, so two queries with the
    /// same filters in a different order share a fingerprint. Ordering and
    /// limit are deliberately excluded.
    pub fn fingerprint(&self) -> String {
        let mut parts: Vec<String> = self
            .filters
            .iter()
            .map(|f| format!("{}{}{}", f.field, f.op.symbol(), f.value))
            .collect();
        parts.sort();
        parts.join("&")
    }

    /// Evaluate the full query in memory: filter, sort, cursor, limit.
    pub fn apply(&self, mut docs: Vec<Document>) -> Vec<Document> {
        docs.retain(|doc| self.matches(doc));

        if let Some(order) = &self.order_by {
            docs.sort_by(|a, b| {
                let left = a.get(&order.field).unwrap_or(&Value::Null);
                let right = b.get(&order.field).unwrap_or(&Value::Null);
                let ordering = compare_values(left, right).unwrap_or(Ordering::Equal);
                match order.direction {
                    SortDirection::Asc => ordering,
                    SortDirection::Desc => ordering.reverse(),
                }
            });
        }

        if let Some(cursor) = self.after.as_ref().and_then(document_id) {
            if let Some(position) = docs.iter().position(|d| document_id(d) == Some(cursor)) {
                docs.drain(..=position);
            }
        }

        if let Some(size) = self.limit {
            docs.truncate(size);
        }

        docs
    }
}
