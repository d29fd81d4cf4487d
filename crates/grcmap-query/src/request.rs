//! Remote query data-transfer shapes
//!
//! A batch of [`QueryRequest`]s is executed by the remote query service in a
//! single backend call; the response list is positionally aligned with the
//! request list, which is what makes `#__previous__,<index>#` back-references
//! possible.

use crate::expr::{join_queries, BoolOp, Expression, FilterQuery, OrderKey};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    /// Full records.
    #[default]
    Values,
    /// Identifiers only.
    Ids,
    /// Only the total count.
    Count,
}

/// Page selection and sort for a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paging {
    /// 1-based page number.
    pub current: u64,
    pub page_size: u64,
    pub sort_by: Option<String>,
    pub sort_desc: bool,
}

impl Default for Paging {
    fn default() -> Self {
        Self {
            current: 1,
            page_size: 10,
            sort_by: None,
            sort_desc: false,
        }
    }
}

impl Paging {
    pub fn new(current: u64, page_size: u64) -> Self {
        Self {
            current,
            page_size,
            ..Self::default()
        }
    }

    /// `[first, last)` row window.
    pub fn limit(&self) -> [u64; 2] {
        let current = self.current.max(1);
        [(current - 1) * self.page_size, current * self.page_size]
    }
}

/// "Related to these objects" constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relevance {
    #[serde(rename = "type")]
    pub object_name: String,
    pub ids: Vec<u64>,
}

impl Relevance {
    pub fn new(object_name: impl Into<String>, ids: impl IntoIterator<Item = u64>) -> Self {
        Self {
            object_name: object_name.into(),
            ids: ids.into_iter().collect(),
        }
    }

    fn to_query(&self) -> FilterQuery {
        FilterQuery::new(Expression::relevant(self.object_name.clone(), self.ids.iter()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryRequest {
    pub object_name: String,
    #[serde(rename = "type")]
    pub kind: ResultKind,
    pub filters: FilterQuery,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<[u64; 2]>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub order_by: Vec<OrderKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
}

impl QueryRequest {
    pub fn new(object_name: impl Into<String>, kind: ResultKind, filters: FilterQuery) -> Self {
        Self {
            object_name: object_name.into(),
            kind,
            filters,
            limit: None,
            order_by: Vec::new(),
            fields: None,
        }
    }

    /// Listing request: `filter` AND-joined with one relevance clause per
    /// entry in `relevant`, paged and sorted per `paging`.
    pub fn build(
        object_name: impl Into<String>,
        paging: Option<&Paging>,
        relevant: &[Relevance],
        filter: FilterQuery,
    ) -> Self {
        let filters = relevant
            .iter()
            .fold(filter, |acc, rel| join_queries(acc, rel.to_query(), BoolOp::And));

        let mut request = Self::new(object_name, ResultKind::Values, filters);
        if let Some(paging) = paging {
            request.limit = Some(paging.limit());
            if let Some(sort_by) = &paging.sort_by {
                request.order_by = vec![OrderKey {
                    name: sort_by.clone(),
                    desc: paging.sort_desc,
                }];
            }
        }
        request
    }

    pub fn with_kind(mut self, kind: ResultKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.fields = Some(fields);
        self
    }
}

/// One response entry, aligned with the request at the same index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    #[serde(default)]
    pub values: Vec<serde_json::Value>,
    #[serde(default)]
    pub ids: Vec<u64>,
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub total: usize,
}
