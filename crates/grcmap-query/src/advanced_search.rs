//! Advanced Search compiler
//!
//! Turns the flat, alternating node sequence built by the search UI into
//! filter text. Mapping criteria ("mapped to X where X matches ...") cannot be
//! answered locally: each one becomes its own `ids` sub-request pushed onto a
//! shared request list, and the enclosing filter refers to it with a
//! `#__previous__,<index>#` token.

use crate::expr::{join_queries, quote, BoolOp, Expression, FilterQuery, PREVIOUS_REQUEST};
use crate::parser::{self, QueryParseError};
use crate::request::{QueryRequest, ResultKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdvancedSearchError {
    #[error("malformed filter sequence at node {index}: {reason}")]
    Malformed { index: usize, reason: String },

    #[error("invalid mapping criteria for `{object_name}`: {reason}")]
    InvalidCriteria { object_name: String, reason: String },

    #[error(transparent)]
    Parse(#[from] QueryParseError),
}

// ============================================================================
// Nodes
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeFilter {
    pub field: String,
    pub operator: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StateOperator {
    /// Status is one of the items.
    Any,
    /// Status is none of the items.
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateFilter {
    pub items: Vec<String>,
    pub operator: StateOperator,
    pub model_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingCriteria {
    pub object_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Box<SearchNode>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapped_to: Option<Box<SearchNode>>,
}

/// One UI filter node, serialized as `{"type": ..., "value": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum SearchNode {
    Attribute(AttributeFilter),
    Operator(String),
    State(StateFilter),
    Group(Vec<SearchNode>),
    MappingCriteria(MappingCriteria),
}

impl SearchNode {
    pub fn attribute(
        field: impl Into<String>,
        operator: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self::Attribute(AttributeFilter {
            field: field.into(),
            operator: operator.into(),
            value: value.into(),
        })
    }

    pub fn operator(keyword: impl Into<String>) -> Self {
        Self::Operator(keyword.into())
    }

    pub fn state(
        items: impl IntoIterator<Item = impl Into<String>>,
        operator: StateOperator,
        model_name: impl Into<String>,
    ) -> Self {
        Self::State(StateFilter {
            items: items.into_iter().map(Into::into).collect(),
            operator,
            model_name: model_name.into(),
        })
    }

    pub fn group(nodes: Vec<SearchNode>) -> Self {
        Self::Group(nodes)
    }

    pub fn mapping_criteria(
        object_name: impl Into<String>,
        filter: Option<SearchNode>,
        mapped_to: Option<SearchNode>,
    ) -> Self {
        Self::MappingCriteria(MappingCriteria {
            object_name: object_name.into(),
            filter: filter.map(Box::new),
            mapped_to: mapped_to.map(Box::new),
        })
    }

    const fn is_operator(&self) -> bool {
        matches!(self, Self::Operator(_))
    }
}

/// Name of the status attribute for `model`.
pub fn status_field_name(model: &str) -> &'static str {
    if model == "CycleTaskGroupObjectTask" {
        "Task State"
    } else {
        "Status"
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Check that `nodes` alternates value and operator nodes, starting and ending
/// with a value node. Groups and nested criteria are checked recursively.
pub fn validate(nodes: &[SearchNode]) -> Result<(), AdvancedSearchError> {
    if nodes.is_empty() {
        return Ok(());
    }
    if nodes.len() % 2 == 0 {
        return Err(AdvancedSearchError::Malformed {
            index: nodes.len() - 1,
            reason: "sequence must end with a value node".to_string(),
        });
    }

    for (index, node) in nodes.iter().enumerate() {
        let expects_operator = index % 2 == 1;
        if node.is_operator() != expects_operator {
            return Err(AdvancedSearchError::Malformed {
                index,
                reason: if expects_operator {
                    "expected an operator".to_string()
                } else {
                    "expected a value node".to_string()
                },
            });
        }

        match node {
            SearchNode::Operator(keyword) if BoolOp::from_keyword(keyword).is_none() => {
                return Err(AdvancedSearchError::Malformed {
                    index,
                    reason: format!("unknown operator `{keyword}`"),
                });
            }
            SearchNode::Group(inner) => {
                if inner.is_empty() {
                    return Err(AdvancedSearchError::Malformed {
                        index,
                        reason: "empty group".to_string(),
                    });
                }
                validate(inner)?;
            }
            SearchNode::State(state) if state.items.is_empty() => {
                return Err(AdvancedSearchError::Malformed {
                    index,
                    reason: "state filter without items".to_string(),
                });
            }
            SearchNode::MappingCriteria(criteria) => validate_criteria(criteria)?,
            _ => {}
        }
    }
    Ok(())
}

fn validate_criteria(criteria: &MappingCriteria) -> Result<(), AdvancedSearchError> {
    if criteria.object_name.trim().is_empty() {
        return Err(AdvancedSearchError::InvalidCriteria {
            object_name: criteria.object_name.clone(),
            reason: "missing object name".to_string(),
        });
    }
    for nested in [&criteria.filter, &criteria.mapped_to].into_iter().flatten() {
        if nested.is_operator() {
            return Err(AdvancedSearchError::InvalidCriteria {
                object_name: criteria.object_name.clone(),
                reason: "an operator cannot stand alone".to_string(),
            });
        }
        validate(std::slice::from_ref(nested.as_ref()))?;
    }
    Ok(())
}

// ============================================================================
// Compilation
// ============================================================================

/// Compile `nodes` into filter text.
///
/// Every mapping criterion encountered (including criteria nested through
/// `mapped_to`) is appended to `requests` as an `ids` sub-request, dependencies
/// first, and is represented in the returned text by a back-reference to its
/// position.
pub fn build_filter(
    nodes: &[SearchNode],
    requests: &mut Vec<QueryRequest>,
) -> Result<String, AdvancedSearchError> {
    validate(nodes)?;
    compile_sequence(nodes, requests)
}

fn compile_sequence(
    nodes: &[SearchNode],
    requests: &mut Vec<QueryRequest>,
) -> Result<String, AdvancedSearchError> {
    let mut out = String::new();
    for node in nodes {
        out.push_str(&compile_node(node, requests)?);
    }
    Ok(out)
}

fn compile_node(
    node: &SearchNode,
    requests: &mut Vec<QueryRequest>,
) -> Result<String, AdvancedSearchError> {
    Ok(match node {
        SearchNode::Attribute(attr) => attribute_text(attr),
        SearchNode::Operator(keyword) => format!(" {keyword} "),
        SearchNode::State(state) => state_text(state),
        SearchNode::Group(inner) => format!("({})", compile_sequence(inner, requests)?),
        SearchNode::MappingCriteria(criteria) => criteria_text(criteria, requests)?,
    })
}

fn attribute_text(attr: &AttributeFilter) -> String {
    format!("{} {} {}", quote(&attr.field), attr.operator, quote(&attr.value))
}

fn state_text(state: &StateFilter) -> String {
    let field = quote(status_field_name(&state.model_name));
    let (op, join) = match state.operator {
        StateOperator::Any => ("=", BoolOp::Or),
        StateOperator::None => ("!=", BoolOp::And),
    };
    let clauses: Vec<String> = state
        .items
        .iter()
        .map(|item| format!("{field}{op}{}", quote(item)))
        .collect();
    format!("({})", clauses.join(&format!(" {join} ")))
}

fn criteria_text(
    criteria: &MappingCriteria,
    requests: &mut Vec<QueryRequest>,
) -> Result<String, AdvancedSearchError> {
    let own = match &criteria.filter {
        Some(filter) => parser::parse(&compile_node(filter, requests)?)?,
        None => FilterQuery::default(),
    };
    let filters = match &criteria.mapped_to {
        Some(mapped_to) => {
            let mapped_text = compile_node(mapped_to, requests)?;
            join_queries(own, parser::parse(&mapped_text)?, BoolOp::And)
        }
        None => own,
    };

    requests.push(QueryRequest::new(
        criteria.object_name.clone(),
        ResultKind::Ids,
        filters,
    ));
    Ok(Expression::relevant(PREVIOUS_REQUEST, [requests.len() - 1]).to_string())
}

/// A compiled search: the filter for the main request plus every sub-request
/// it references, in execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledSearch {
    pub object_name: String,
    pub filter: String,
    pub requests: Vec<QueryRequest>,
}

impl CompiledSearch {
    pub fn filter_query(&self) -> Result<FilterQuery, QueryParseError> {
        parser::parse(&self.filter)
    }
}

pub fn build_request(
    object_name: impl Into<String>,
    nodes: &[SearchNode],
) -> Result<CompiledSearch, AdvancedSearchError> {
    let mut requests = Vec::new();
    let filter = build_filter(nodes, &mut requests)?;
    Ok(CompiledSearch {
        object_name: object_name.into(),
        filter,
        requests,
    })
}
