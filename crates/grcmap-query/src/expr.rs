//! Filter-expression AST
//!
//! Expressions are produced by [`crate::parser`] from user-typed filter text and
//! by the Advanced Search compiler, and are consumed by the remote query
//! service. The serialized form is the JSON shape the backend query API
//! understands:
//!
//! ```text
//! {"left": "title", "op": {"name": "~"}, "right": "A"}
//! {"left": {...}, "op": {"name": "AND"}, "right": {...}}
//! {"op": {"name": "NOT"}, "right": {...}}
//! {"op": {"name": "text_search"}, "text": "foo"}
//! {"object_name": "__previous__", "op": {"name": "relevant"}, "ids": ["0"]}
//! {}
//! ```

use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Operators
// ============================================================================

/// Attribute comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComparisonOp {
    Eq,
    NotEq,
    Contains,
    NotContains,
    Lt,
    Gt,
    Le,
    Ge,
}

impl ComparisonOp {
    pub const ALL: [Self; 8] = [
        Self::Eq,
        Self::NotEq,
        Self::Contains,
        Self::NotContains,
        Self::Lt,
        Self::Gt,
        Self::Le,
        Self::Ge,
    ];

    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::NotEq => "!=",
            Self::Contains => "~",
            Self::NotContains => "!~",
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Le => "<=",
            Self::Ge => ">=",
        }
    }

    pub fn from_symbol(symbol: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.symbol() == symbol)
    }
}

impl fmt::Display for ComparisonOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Boolean join keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BoolOp {
    And,
    Or,
}

impl BoolOp {
    pub const fn keyword(self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::Or => "OR",
        }
    }

    /// Keywords are case-insensitive (`and`, `And`, `AND`).
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        if keyword.eq_ignore_ascii_case("AND") {
            Some(Self::And)
        } else if keyword.eq_ignore_ascii_case("OR") {
            Some(Self::Or)
        } else {
            None
        }
    }
}

impl fmt::Display for BoolOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

// ============================================================================
// Expression
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Expression {
    /// Matches everything; serialized as `{}`.
    #[default]
    Empty,
    Comparison {
        left: String,
        op: ComparisonOp,
        right: String,
    },
    Binary {
        left: Box<Expression>,
        op: BoolOp,
        right: Box<Expression>,
    },
    Not(Box<Expression>),
    TextSearch(String),
    /// Objects related to `ids` of `object_name`. `object_name` may be the
    /// `__previous__` pseudo-model, in which case each id is an index into the
    /// request list of the same batched query.
    Relevant {
        object_name: String,
        ids: Vec<String>,
    },
}

/// Pseudo-model name used to reference an earlier request of the same batch.
pub const PREVIOUS_REQUEST: &str = "__previous__";

impl Expression {
    pub fn comparison(left: impl Into<String>, op: ComparisonOp, right: impl Into<String>) -> Self {
        Self::Comparison {
            left: left.into(),
            op,
            right: right.into(),
        }
    }

    pub fn binary(left: Self, op: BoolOp, right: Self) -> Self {
        Self::Binary {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    pub fn relevant(object_name: impl Into<String>, ids: impl IntoIterator<Item = impl ToString>) -> Self {
        Self::Relevant {
            object_name: object_name.into(),
            ids: ids.into_iter().map(|id| id.to_string()).collect(),
        }
    }

    /// Back-reference to the request at `index` in the same batch.
    pub fn previous(index: usize) -> Self {
        Self::relevant(PREVIOUS_REQUEST, [index])
    }

    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Attribute names used on the left of comparisons, in first-seen order.
    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        self.collect_keys(&mut keys);
        keys
    }

    fn collect_keys(&self, keys: &mut Vec<String>) {
        match self {
            Self::Comparison { left, .. } => {
                if !keys.iter().any(|k| k == left) {
                    keys.push(left.clone());
                }
            }
            Self::Binary { left, right, .. } => {
                left.collect_keys(keys);
                right.collect_keys(keys);
            }
            Self::Not(inner) => inner.collect_keys(keys),
            Self::Empty | Self::TextSearch(_) | Self::Relevant { .. } => {}
        }
    }

    /// Evaluate against a flat attribute map, client-side.
    ///
    /// `Relevant` needs the backend and always evaluates to `true` here.
    pub fn evaluate(&self, attrs: &BTreeMap<String, String>) -> bool {
        match self {
            Self::Empty | Self::Relevant { .. } => true,
            Self::Comparison { left, op, right } => {
                let value = lookup(attrs, left).unwrap_or("");
                compare(value, *op, right)
            }
            Self::Binary { left, op, right } => match op {
                BoolOp::And => left.evaluate(attrs) && right.evaluate(attrs),
                BoolOp::Or => left.evaluate(attrs) || right.evaluate(attrs),
            },
            Self::Not(inner) => !inner.evaluate(attrs),
            Self::TextSearch(text) => {
                let needle = text.to_lowercase();
                attrs.values().any(|v| v.to_lowercase().contains(&needle))
            }
        }
    }

    fn fmt_operand(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if matches!(self, Self::Binary { .. }) {
            write!(f, "({self})")
        } else {
            write!(f, "{self}")
        }
    }
}

fn lookup<'a>(attrs: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    attrs
        .get(key)
        .or_else(|| {
            attrs
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v)
        })
        .map(String::as_str)
}

fn compare(value: &str, op: ComparisonOp, expected: &str) -> bool {
    let value_lc = value.to_lowercase();
    let expected_lc = expected.to_lowercase();
    match op {
        ComparisonOp::Eq => value_lc == expected_lc,
        ComparisonOp::NotEq => value_lc != expected_lc,
        ComparisonOp::Contains => value_lc.contains(&expected_lc),
        ComparisonOp::NotContains => !value_lc.contains(&expected_lc),
        ComparisonOp::Lt | ComparisonOp::Gt | ComparisonOp::Le | ComparisonOp::Ge => {
            let ordering = match (value.trim().parse::<f64>(), expected.trim().parse::<f64>()) {
                (Ok(a), Ok(b)) => a.partial_cmp(&b),
                _ => Some(value_lc.cmp(&expected_lc)),
            };
            let Some(ordering) = ordering else {
                return false;
            };
            match op {
                ComparisonOp::Lt => ordering.is_lt(),
                ComparisonOp::Gt => ordering.is_gt(),
                ComparisonOp::Le => ordering.is_le(),
                _ => ordering.is_ge(),
            }
        }
    }
}

/// Quote an operand for filter text, escaping `"` and `\`.
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        if ch == '"' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

/// Renders back to filter text that [`crate::parser::parse`] accepts.
impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => Ok(()),
            Self::Comparison { left, op, right } => {
                write!(f, "{} {} {}", quote(left), op, quote(right))
            }
            Self::Binary { left, op, right } => {
                left.fmt_operand(f)?;
                write!(f, " {op} ")?;
                right.fmt_operand(f)
            }
            Self::Not(inner) => {
                f.write_str("NOT ")?;
                inner.fmt_operand(f)
            }
            Self::TextSearch(text) => f.write_str(&quote(text)),
            Self::Relevant { object_name, ids } => {
                write!(f, "#{object_name},{}#", ids.join(","))
            }
        }
    }
}

struct OpName<'a>(&'a str);

impl Serialize for OpName<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry("name", self.0)?;
        map.end()
    }
}

impl Serialize for Expression {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Empty => serializer.serialize_map(Some(0))?.end(),
            Self::Comparison { left, op, right } => {
                let mut map = serializer.serialize_map(Some(3))?;
                map.serialize_entry("left", left)?;
                map.serialize_entry("op", &OpName(op.symbol()))?;
                map.serialize_entry("right", right)?;
                map.end()
            }
            Self::Binary { left, op, right } => {
                let mut map = serializer.serialize_map(Some(3))?;
                map.serialize_entry("left", left)?;
                map.serialize_entry("op", &OpName(op.keyword()))?;
                map.serialize_entry("right", right)?;
                map.end()
            }
            Self::Not(inner) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("op", &OpName("NOT"))?;
                map.serialize_entry("right", inner)?;
                map.end()
            }
            Self::TextSearch(text) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("op", &OpName("text_search"))?;
                map.serialize_entry("text", text)?;
                map.end()
            }
            Self::Relevant { object_name, ids } => {
                let mut map = serializer.serialize_map(Some(3))?;
                map.serialize_entry("object_name", object_name)?;
                map.serialize_entry("op", &OpName("relevant"))?;
                map.serialize_entry("ids", ids)?;
                map.end()
            }
        }
    }
}

// ============================================================================
// Filter query
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderKey {
    pub name: String,
    #[serde(default)]
    pub desc: bool,
}

impl OrderKey {
    pub fn asc(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            desc: false,
        }
    }

    pub fn desc(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            desc: true,
        }
    }
}

/// A parsed filter: the expression plus the metadata the backend wants next
/// to it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct FilterQuery {
    pub expression: Expression,
    pub keys: Vec<String>,
    pub order_by: Vec<OrderKey>,
}

impl FilterQuery {
    pub fn new(expression: Expression) -> Self {
        let keys = expression.keys();
        Self {
            expression,
            keys,
            order_by: Vec::new(),
        }
    }

    pub fn with_order_by(mut self, order_by: Vec<OrderKey>) -> Self {
        self.order_by = order_by;
        self
    }

    pub const fn is_empty(&self) -> bool {
        self.expression.is_empty()
    }
}

impl From<Expression> for FilterQuery {
    fn from(expression: Expression) -> Self {
        Self::new(expression)
    }
}

/// Combine two filters with `op`.
///
/// An empty side yields the other side unchanged. Keys are unioned; the left
/// side's ordering wins unless it has none.
pub fn join_queries(left: FilterQuery, right: FilterQuery, op: BoolOp) -> FilterQuery {
    if left.is_empty() {
        return right;
    }
    if right.is_empty() {
        return left;
    }

    let mut keys = left.keys;
    for key in right.keys {
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    let order_by = if left.order_by.is_empty() {
        right.order_by
    } else {
        left.order_by
    };

    FilterQuery {
        expression: Expression::binary(left.expression, op, right.expression),
        keys,
        order_by,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn serializes_backend_shapes() {
        let expr = Expression::binary(
            Expression::comparison("title", ComparisonOp::Contains, "A"),
            BoolOp::And,
            Expression::previous(0),
        );
        assert_eq!(
            serde_json::to_value(&expr).unwrap(),
            json!({
                "left": {"left": "title", "op": {"name": "~"}, "right": "A"},
                "op": {"name": "AND"},
                "right": {"object_name": "__previous__", "op": {"name": "relevant"}, "ids": ["0"]}
            })
        );
        assert_eq!(serde_json::to_value(Expression::Empty).unwrap(), json!({}));
        assert_eq!(
            serde_json::to_value(Expression::Not(Box::new(Expression::TextSearch("x".into()))))
                .unwrap(),
            json!({"op": {"name": "NOT"}, "right": {"op": {"name": "text_search"}, "text": "x"}})
        );
    }

    #[test]
    fn join_with_empty_side_returns_other() {
        let q = FilterQuery::new(Expression::comparison("status", ComparisonOp::Eq, "Draft"));
        assert_eq!(join_queries(FilterQuery::default(), q.clone(), BoolOp::And), q);
        assert_eq!(join_queries(q.clone(), FilterQuery::default(), BoolOp::Or), q);
    }

    #[test]
    fn join_unions_keys() {
        let a = FilterQuery::new(Expression::comparison("title", ComparisonOp::Eq, "a"));
        let b = FilterQuery::new(Expression::comparison("status", ComparisonOp::Eq, "b"));
        let joined = join_queries(a, b, BoolOp::Or);
        assert_eq!(joined.keys, vec!["title".to_string(), "status".to_string()]);
    }

    #[test]
    fn evaluates_comparisons_case_insensitively() {
        let a = attrs(&[("Title", "Access Control"), ("score", "10")]);
        assert!(Expression::comparison("title", ComparisonOp::Contains, "access").evaluate(&a));
        assert!(Expression::comparison("title", ComparisonOp::Eq, "ACCESS CONTROL").evaluate(&a));
        assert!(Expression::comparison("score", ComparisonOp::Gt, "9").evaluate(&a));
        assert!(!Expression::comparison("score", ComparisonOp::Lt, "9").evaluate(&a));
        assert!(Expression::TextSearch("contr".into()).evaluate(&a));
    }

    #[test]
    fn display_parenthesizes_nested_binaries() {
        let expr = Expression::binary(
            Expression::binary(
                Expression::comparison("a", ComparisonOp::Eq, "1"),
                BoolOp::Or,
                Expression::comparison("b", ComparisonOp::Eq, "2"),
            ),
            BoolOp::And,
            Expression::previous(3),
        );
        assert_eq!(
            expr.to_string(),
            r#"("a" = "1" OR "b" = "2") AND #__previous__,3#"#
        );
    }
}
