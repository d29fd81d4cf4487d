//! GRC mapping query language
//!
//! This crate holds the pieces of the mapping engine that talk to the remote
//! query service: the filter-expression AST and its parser, the batched
//! request/response shapes, and the Advanced Search compiler that turns UI
//! filter trees into filter text plus back-referenced sub-requests.
//!
//! Everything here is synchronous and runtime-free.

pub mod advanced_search;
pub mod expr;
pub mod parser;
pub mod request;

pub use advanced_search::{
    build_filter, build_request, status_field_name, AdvancedSearchError, CompiledSearch,
    SearchNode, StateOperator,
};
pub use expr::{join_queries, BoolOp, ComparisonOp, Expression, FilterQuery, OrderKey};
pub use parser::{parse, QueryParseError};
pub use request::{Paging, QueryRequest, QueryResponse, Relevance, ResultKind};
