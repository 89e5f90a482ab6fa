//! Meilisearch Translator
//!
//! Renders the [`Filter`] AST as a Meilisearch filter expression.
//!
//! # Filter Syntax Generated
//!
//! ```text
//! id = "abc"                 - Equality (strings always double-quoted)
//! created_at >= 1700000000   - Numeric comparison
//! updated_at IS NULL         - Null check
//! (a AND b)                  - Grouping
//! NOT (a)                    - Negation
//! ```

use super::filter::{FieldFilter, Filter, FilterNode, FilterOperator, FilterValue};

/// Meilisearch filter translator
pub struct MeiliTranslator;

impl MeiliTranslator {
    pub fn translate(filter: &Filter) -> String {
        Self::translate_node(&filter.root)
    }

    fn translate_node(node: &FilterNode) -> String {
        match node {
            FilterNode::Field(field) => Self::translate_field(field),
            FilterNode::And(nodes) => Self::join(nodes, " AND "),
            FilterNode::Or(nodes) => Self::join(nodes, " OR "),
            FilterNode::Not(inner) => format!("NOT ({})", Self::translate_node(inner)),
        }
    }

    fn join(nodes: &[FilterNode], separator: &str) -> String {
        let parts: Vec<String> = nodes.iter().map(Self::translate_node).collect();
        if parts.len() == 1 {
            parts[0].clone()
        } else {
            format!("({})", parts.join(separator))
        }
    }

    fn translate_field(field: &FieldFilter) -> String {
        let name = Self::escape_field_name(&field.field);
        let op = match field.operator {
            FilterOperator::IsNull => return format!("{} IS NULL", name),
            FilterOperator::IsNotNull => return format!("{} IS NOT NULL", name),
            FilterOperator::Equals => "=",
            FilterOperator::NotEquals => "!=",
            FilterOperator::Greater => ">",
            FilterOperator::GreaterOrEqual => ">=",
            FilterOperator::Less => "<",
            FilterOperator::LessOrEqual => "<=",
        };
        format!("{} {} {}", name, op, Self::render_value(&field.value))
    }

    fn render_value(value: &FilterValue) -> String {
        match value {
            FilterValue::Text(s) => Self::quote(s),
            FilterValue::Integer(n) => n.to_string(),
            FilterValue::Boolean(b) => b.to_string(),
            FilterValue::None => "null".to_string(),
        }
    }

    /// Double-quote a string literal, escaping backslashes and quotes.
    fn quote(s: &str) -> String {
        let mut out = String::with_capacity(s.len() + 2);
        out.push('"');
        for c in s.chars() {
            if c == '"' || c == '\\' {
                out.push('\\');
            }
            out.push(c);
        }
        out.push('"');
        out
    }

    /// Attribute names are restricted to a safe charset; anything else is quoted.
    fn escape_field_name(name: &str) -> String {
        let plain = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-');
        if plain {
            name.to_string()
        } else {
            Self::quote(name)
        }
    }
}
