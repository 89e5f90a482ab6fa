// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Filter AST for index document lookups.
//!
//! Filters are built as a tree and rendered by [`super::MeiliTranslator`],
//! so field values never get spliced into filter strings by hand.
//!
//! # Example
//!
//! ```rust
//! use search_sync::search::{Filter, MeiliTranslator};
//!
//! let filter = Filter::is_null("deleted_at")
//!     .and(Filter::eq("id", "3f2c"))
//!     .and(Filter::gte("created_at", 1_700_000_000));
//!
//! assert_eq!(
//!     MeiliTranslator::translate(&filter),
//!     r#"(deleted_at IS NULL AND id = "3f2c" AND created_at >= 1700000000)"#
//! );
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Filter AST
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub root: FilterNode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterNode {
    Field(FieldFilter),
    And(Vec<FilterNode>),
    Or(Vec<FilterNode>),
    Not(Box<FilterNode>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    pub field: String,
    pub operator: FilterOperator,
    pub value: FilterValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOperator {
    Equals,
    NotEquals,
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
    IsNull,
    IsNotNull,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterValue {
    Text(String),
    Integer(i64),
    Boolean(bool),
    /// Operators without an operand (`IS NULL`, `IS NOT NULL`)
    None,
}

impl From<&str> for FilterValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<i64> for FilterValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for FilterValue {
    fn from(v: i32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<bool> for FilterValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl Filter {
    pub fn new(root: FilterNode) -> Self {
        Self { root }
    }

    fn field(field: impl Into<String>, operator: FilterOperator, value: FilterValue) -> Self {
        Self::new(FilterNode::Field(FieldFilter {
            field: field.into(),
            operator,
            value,
        }))
    }

    pub fn eq(field: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        Self::field(field, FilterOperator::Equals, value.into())
    }

    pub fn ne(field: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        Self::field(field, FilterOperator::NotEquals, value.into())
    }

    pub fn gt(field: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        Self::field(field, FilterOperator::Greater, value.into())
    }

    pub fn gte(field: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        Self::field(field, FilterOperator::GreaterOrEqual, value.into())
    }

    pub fn lt(field: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        Self::field(field, FilterOperator::Less, value.into())
    }

    pub fn lte(field: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        Self::field(field, FilterOperator::LessOrEqual, value.into())
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Self::field(field, FilterOperator::IsNull, FilterValue::None)
    }

    pub fn is_not_null(field: impl Into<String>) -> Self {
        Self::field(field, FilterOperator::IsNotNull, FilterValue::None)
    }

    /// Combine with AND, flattening nested ANDs.
    pub fn and(self, other: Filter) -> Self {
        let mut nodes = match self.root {
            FilterNode::And(nodes) => nodes,
            node => vec![node],
        };
        match other.root {
            FilterNode::And(more) => nodes.extend(more),
            node => nodes.push(node),
        }
        Self::new(FilterNode::And(nodes))
    }

    /// Combine with OR, flattening nested ORs.
    pub fn or(self, other: Filter) -> Self {
        let mut nodes = match self.root {
            FilterNode::Or(nodes) => nodes,
            node => vec![node],
        };
        match other.root {
            FilterNode::Or(more) => nodes.extend(more),
            node => nodes.push(node),
        }
        Self::new(FilterNode::Or(nodes))
    }

    pub fn negate(self) -> Self {
        Self::new(FilterNode::Not(Box::new(self.root)))
    }

    /// Evaluate against a JSON document.
    ///
    /// Mirrors the engine's semantics closely enough for in-process use:
    /// `IS NULL` requires the field to be present and null, comparisons
    /// against a missing field are false.
    pub fn matches(&self, document: &Value) -> bool {
        Self::matches_node(&self.root, document)
    }

    fn matches_node(node: &FilterNode, document: &Value) -> bool {
        match node {
            FilterNode::Field(f) => Self::matches_field(f, document),
            FilterNode::And(nodes) => nodes.iter().all(|n| Self::matches_node(n, document)),
            FilterNode::Or(nodes) => nodes.iter().any(|n| Self::matches_node(n, document)),
            FilterNode::Not(inner) => !Self::matches_node(inner, document),
        }
    }

    fn matches_field(filter: &FieldFilter, document: &Value) -> bool {
        let actual = document.get(&filter.field);
        match filter.operator {
            FilterOperator::IsNull => matches!(actual, Some(Value::Null)),
            FilterOperator::IsNotNull => !matches!(actual, Some(Value::Null)),
            op => {
                let Some(ordering) = actual.and_then(|a| compare(a, &filter.value)) else {
                    return op == FilterOperator::NotEquals;
                };
                match op {
                    FilterOperator::Equals => ordering == Ordering::Equal,
                    FilterOperator::NotEquals => ordering != Ordering::Equal,
                    FilterOperator::Greater => ordering == Ordering::Greater,
                    FilterOperator::GreaterOrEqual => ordering != Ordering::Less,
                    FilterOperator::Less => ordering == Ordering::Less,
                    FilterOperator::LessOrEqual => ordering != Ordering::Greater,
                    FilterOperator::IsNull | FilterOperator::IsNotNull => false,
                }
            }
        }
    }
}

fn compare(actual: &Value, expected: &FilterValue) -> Option<Ordering> {
    match (actual, expected) {
        (Value::String(a), FilterValue::Text(b)) => Some(a.as_str().cmp(b.as_str())),
        (Value::Number(a), FilterValue::Integer(b)) => a.as_f64()?.partial_cmp(&(*b as f64)),
        (Value::Number(a), FilterValue::Text(b)) => a.as_f64()?.partial_cmp(&b.parse::<f64>().ok()?),
        (Value::Bool(a), FilterValue::Boolean(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_and_flattens() {
        let f = Filter::eq("a", "1").and(Filter::eq("b", "2")).and(Filter::eq("c", "3"));
        match f.root {
            FilterNode::And(nodes) => assert_eq!(nodes.len(), 3),
            other => panic!("expected And, got {:?}", other),
        }
    }

    #[test]
    fn test_or_inside_and_is_kept_grouped() {
        let f = Filter::eq("a", "1").and(Filter::eq("b", "2").or(Filter::eq("c", "3")));
        match f.root {
            FilterNode::And(nodes) => {
                assert_eq!(nodes.len(), 2);
                assert!(matches!(nodes[1], FilterNode::Or(_)));
            }
            other => panic!("expected And, got {:?}", other),
        }
    }

    #[test]
    fn test_is_null_requires_present_field() {
        let doc = json!({"id": "u1", "updated_at": null});
        assert!(Filter::is_null("updated_at").matches(&doc));
        assert!(!Filter::is_null("deleted_at").matches(&doc));
        assert!(Filter::is_not_null("deleted_at").matches(&doc));
        assert!(!Filter::is_not_null("updated_at").matches(&doc));
    }

    #[test]
    fn test_numeric_comparisons() {
        let doc = json!({"created_at": 100});
        assert!(Filter::gte("created_at", 100).matches(&doc));
        assert!(!Filter::gt("created_at", 100).matches(&doc));
        assert!(Filter::lt("created_at", 101).matches(&doc));
        assert!(Filter::lte("created_at", 100).matches(&doc));
        assert!(!Filter::gte("missing", 0).matches(&doc));
    }

    #[test]
    fn test_string_equality_and_negation() {
        let doc = json!({"id": "u1"});
        assert!(Filter::eq("id", "u1").matches(&doc));
        assert!(!Filter::eq("id", "u2").matches(&doc));
        assert!(Filter::ne("id", "u2").matches(&doc));
        assert!(Filter::eq("id", "u2").negate().matches(&doc));
        assert!(Filter::ne("missing", "x").matches(&doc));
    }
}
