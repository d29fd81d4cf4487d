//! Object mapper search
//!
//! Backs the "map objects" dialog: given a source object and a search (type,
//! filter text, advanced search nodes, page), it builds the backend query,
//! resolves the returned records to shared instances and tells, per result,
//! whether it is already mapped and whether it may be mapped.
//!
//! Rapid successive searches are coalesced: each call waits out the debounce
//! window and gives up if a newer call arrived meanwhile.

use crate::context::MappingContext;
use crate::error::{LoadError, MapperError};
use crate::instance::{Instance, InstanceKey};
use crate::mappings::MapSubject;
use crate::snapshot;
use grcmap_query::{
    build_request, join_queries, parse, BoolOp, Paging, QueryRequest, Relevance, SearchNode,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct MapperQuery {
    pub object_name: String,
    /// Filter text, in the filter-expression syntax.
    pub filter: String,
    pub advanced: Vec<SearchNode>,
    pub paging: Paging,
    /// Restrict results to objects related to this one (e.g. an audit).
    pub scope: Option<Arc<Instance>>,
}

impl MapperQuery {
    pub fn new(object_name: impl Into<String>, paging: Paging) -> Self {
        Self {
            object_name: object_name.into(),
            filter: String::new(),
            advanced: Vec::new(),
            paging,
            scope: None,
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    pub fn with_advanced(mut self, nodes: Vec<SearchNode>) -> Self {
        self.advanced = nodes;
        self
    }

    pub fn with_scope(mut self, scope: Arc<Instance>) -> Self {
        self.scope = Some(scope);
        self
    }
}

#[derive(Debug, Clone)]
pub struct MapperItem {
    pub instance: Arc<Instance>,
    pub is_mapped: bool,
    pub allowed_to_map: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MapperPage {
    pub items: Vec<MapperItem>,
    pub total: usize,
}

pub struct ObjectMapper {
    ctx: Arc<MappingContext>,
    source: Arc<Instance>,
    latest: AtomicU64,
}

impl ObjectMapper {
    pub fn new(ctx: Arc<MappingContext>, source: Arc<Instance>) -> Self {
        Self {
            ctx,
            source,
            latest: AtomicU64::new(0),
        }
    }

    pub fn source(&self) -> &Arc<Instance> {
        &self.source
    }

    /// Default paging for a new search.
    pub fn first_page(&self) -> Paging {
        Paging::new(1, self.ctx.config().mapper_page_size)
    }

    /// The advanced-search sub-queries followed by the listing itself, so
    /// back-references in the listing point at earlier entries.
    pub fn build_requests(&self, query: &MapperQuery) -> Result<Vec<QueryRequest>, MapperError> {
        let compiled = build_request(query.object_name.as_str(), &query.advanced)?;
        let filter = join_queries(parse(&query.filter)?, compiled.filter_query()?, BoolOp::And);

        let relevance: Vec<Relevance> = query
            .scope
            .iter()
            .map(|scope| Relevance::new(scope.model(), [scope.id()]))
            .collect();
        let mut listing =
            QueryRequest::build(query.object_name.as_str(), Some(&query.paging), &relevance, filter);
        if query
            .scope
            .as_ref()
            .is_some_and(|scope| snapshot::is_snapshot_related(scope.model(), &query.object_name))
        {
            listing = snapshot::transform_query(listing);
        }

        let mut requests = compiled.requests;
        requests.push(listing);
        Ok(requests)
    }

    /// Run a search. Resolves to `None` when a newer search superseded this
    /// one.
    pub async fn search(&self, query: MapperQuery) -> Result<Option<MapperPage>, MapperError> {
        let generation = self.latest.fetch_add(1, Ordering::SeqCst) + 1;
        let window = self.ctx.config().mapper_debounce();
        if window.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(window).await;
        }
        if self.superseded(generation) {
            tracing::debug!(object_name = %query.object_name, "mapper search superseded");
            return Ok(None);
        }

        let requests = self.build_requests(&query)?;
        let expected = requests.len();
        let responses = self
            .ctx
            .query_service()
            .execute(requests)
            .await
            .map_err(LoadError::from)?;
        if responses.len() != expected {
            return Err(MapperError::ResponseMismatch {
                expected,
                got: responses.len(),
            });
        }
        let Some(listing) = responses.into_iter().last() else {
            return Ok(Some(MapperPage::default()));
        };

        let mapped = self.mapped_keys(&query.object_name).await?;
        if self.superseded(generation) {
            tracing::debug!(object_name = %query.object_name, "mapper search superseded");
            return Ok(None);
        }

        let source = MapSubject::from(&self.source);
        let items = listing
            .values
            .iter()
            .filter_map(|record| self.ctx.resolve_record(&query.object_name, record))
            .map(|instance| MapperItem {
                is_mapped: mapped.contains(instance.key()),
                allowed_to_map: self
                    .ctx
                    .allowed_to_map(&source, &MapSubject::from(&instance)),
                instance,
            })
            .collect();
        Ok(Some(MapperPage {
            items,
            total: listing.total,
        }))
    }

    fn superseded(&self, generation: u64) -> bool {
        self.latest.load(Ordering::SeqCst) != generation
    }

    /// Keys already in the source's canonical mapping for `object_name`.
    async fn mapped_keys(&self, object_name: &str) -> Result<BTreeSet<InstanceKey>, LoadError> {
        let Some(name) = self
            .ctx
            .mappings()
            .get_canonical_mapping_name(self.source.model(), object_name)
        else {
            return Ok(BTreeSet::new());
        };
        if self.source.is_new() {
            return Ok(BTreeSet::new());
        }
        let binding = self.ctx.get_binding(&self.source, name)?;
        let results = binding.refresh_stubs().await?;
        Ok(results.iter().filter_map(|r| r.key().cloned()).collect())
    }
}
