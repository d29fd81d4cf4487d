//! List loaders
//!
//! A [`ListLoader`] describes how one mapping is computed. Attaching it to an
//! instance yields a [`ListBinding`] whose list the loader keeps current: it
//! subscribes to whatever backs the mapping (model lifecycle events, source
//! bindings, attribute changes) and funnels everything through
//! [`insert_results`] and [`remove_instance`].
//!
//! Loaders are immutable values shared through `Arc`; all per-binding state
//! lives on the binding.

use crate::binding::{ListBinding, RemoteBinding, ResultBatch, TrackedResult};
use crate::context::MappingContext;
use crate::error::LoadError;
use crate::events::ModelEvent;
use crate::instance::{Instance, InstanceKey};
use crate::merge::{insert_results, remove_instance};
use crate::result::MappingResult;
use crate::snapshot;
use async_trait::async_trait;
use futures::future::{join_all, try_join_all, BoxFuture};
use futures::FutureExt;
use grcmap_query::{parse, FilterQuery, QueryParseError, QueryRequest, Relevance};
use std::fmt;
use std::future::Future;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// ============================================================================
// Sources
// ============================================================================

/// Where a composite loader takes its input from.
#[derive(Clone)]
pub enum SourceRef {
    /// Another mapping of the same instance, looked up in the registry.
    Named(String),
    /// An anonymous loader attached to the same instance.
    Loader(Arc<ListLoader>),
    /// An existing binding.
    Binding(Arc<ListBinding>),
}

impl fmt::Debug for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => write!(f, "Named({name})"),
            Self::Loader(loader) => write!(f, "Loader({})", loader.kind()),
            Self::Binding(binding) => write!(f, "Binding({:?})", binding),
        }
    }
}

impl From<&str> for SourceRef {
    fn from(name: &str) -> Self {
        Self::Named(name.to_string())
    }
}

impl From<String> for SourceRef {
    fn from(name: String) -> Self {
        Self::Named(name)
    }
}

impl From<Arc<ListLoader>> for SourceRef {
    fn from(loader: Arc<ListLoader>) -> Self {
        Self::Loader(loader)
    }
}

impl From<Arc<ListBinding>> for SourceRef {
    fn from(binding: Arc<ListBinding>) -> Self {
        Self::Binding(binding)
    }
}

impl SourceRef {
    /// The binding this source stands for on `instance`.
    pub fn resolve(
        &self,
        ctx: &Arc<MappingContext>,
        instance: &Arc<Instance>,
    ) -> Result<Arc<ListBinding>, LoadError> {
        match self {
            Self::Named(name) => ctx.get_binding(instance, name),
            Self::Loader(loader) => loader.attach(ctx, instance),
            Self::Binding(binding) => Ok(Arc::clone(binding)),
        }
    }

    fn collect_names(&self, out: &mut Vec<String>) {
        match self {
            Self::Named(name) => out.push(name.clone()),
            Self::Loader(loader) => out.extend(loader.local_names()),
            Self::Binding(_) => {}
        }
    }
}

// ============================================================================
// Pluggable predicates and searches
// ============================================================================

/// Predicate of a custom filter. May be asynchronous; an error counts as a
/// rejection and excludes the result.
#[async_trait]
pub trait ResultFilter: Send + Sync {
    async fn evaluate(&self, result: &MappingResult) -> anyhow::Result<bool>;

    /// Attributes whose change should re-run the predicate. Empty means any.
    fn watched_attrs(&self) -> Vec<String> {
        Vec::new()
    }
}

struct FnFilter<F>(F);

#[async_trait]
impl<F> ResultFilter for FnFilter<F>
where
    F: Fn(&MappingResult) -> bool + Send + Sync + 'static,
{
    async fn evaluate(&self, result: &MappingResult) -> anyhow::Result<bool> {
        Ok((self.0)(result))
    }
}

/// Wrap a synchronous predicate.
pub fn filter_fn(
    predicate: impl Fn(&MappingResult) -> bool + Send + Sync + 'static,
) -> Arc<dyn ResultFilter> {
    Arc::new(FnFilter(predicate))
}

/// Filter expression evaluated against the result instance's attributes.
#[derive(Debug, Clone)]
pub struct QueryFilter {
    query: FilterQuery,
}

impl QueryFilter {
    pub fn new(query: FilterQuery) -> Self {
        Self { query }
    }

    pub fn parse(text: &str) -> Result<Self, QueryParseError> {
        Ok(Self::new(parse(text)?))
    }
}

#[async_trait]
impl ResultFilter for QueryFilter {
    async fn evaluate(&self, result: &MappingResult) -> anyhow::Result<bool> {
        Ok(result
            .instance()
            .is_some_and(|instance| self.query.expression.evaluate(&instance.string_attrs())))
    }

    fn watched_attrs(&self) -> Vec<String> {
        self.query.keys.clone()
    }
}

/// Backend search producing the members of a search mapping.
#[async_trait]
pub trait SearchQuery: Send + Sync {
    async fn search(
        &self,
        ctx: &MappingContext,
        instance: &Arc<Instance>,
    ) -> anyhow::Result<Vec<Arc<Instance>>>;
}

/// Objects of one type relevant to the binding's instance, optionally
/// narrowed by a filter.
#[derive(Debug, Clone)]
pub struct RelevantSearch {
    pub object_name: String,
    pub filter: FilterQuery,
}

impl RelevantSearch {
    pub fn new(object_name: impl Into<String>) -> Self {
        Self {
            object_name: object_name.into(),
            filter: FilterQuery::default(),
        }
    }

    pub fn with_filter(mut self, filter: FilterQuery) -> Self {
        self.filter = filter;
        self
    }
}

#[async_trait]
impl SearchQuery for RelevantSearch {
    async fn search(
        &self,
        ctx: &MappingContext,
        instance: &Arc<Instance>,
    ) -> anyhow::Result<Vec<Arc<Instance>>> {
        let relevance = Relevance::new(instance.model(), [instance.id()]);
        let request = QueryRequest::build(
            self.object_name.as_str(),
            None,
            slice::from_ref(&relevance),
            self.filter.clone(),
        );
        let responses = ctx.query_service().execute(vec![request]).await?;
        let Some(response) = responses.into_iter().next() else {
            return Ok(Vec::new());
        };
        Ok(response
            .values
            .iter()
            .filter_map(|record| ctx.resolve_record(&self.object_name, record))
            .collect())
    }
}

// ============================================================================
// Loader variants
// ============================================================================

/// Members point back at the owner through a foreign key; the owner lists
/// them in a collection attribute.
#[derive(Debug, Clone)]
pub struct DirectLoader {
    pub model: String,
    pub remote_attr: String,
    pub instance_attr: String,
}

/// Members are reached through join records holding one reference to the
/// owner and one to the member.
#[derive(Debug, Clone)]
pub struct ProxyLoader {
    pub option_model: Option<String>,
    pub option_attr: String,
    pub join_model: String,
    pub object_attr: String,
    pub instance_attr: String,
}

#[derive(Debug, Clone)]
pub struct MultiLoader {
    pub sources: Vec<SourceRef>,
}

#[derive(Debug, Clone)]
pub struct TypeFilterLoader {
    pub source: SourceRef,
    pub types: Vec<String>,
}

pub type StubPredicate = Arc<dyn Fn(&MappingResult) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct StubFilterLoader {
    pub source: SourceRef,
    pub predicate: StubPredicate,
}

#[derive(Clone)]
pub struct CustomFilterLoader {
    pub source: SourceRef,
    pub filter: Arc<dyn ResultFilter>,
}

/// For every result of `local`, the `remote` mapping of that result's
/// instance.
#[derive(Debug, Clone)]
pub struct CrossLoader {
    pub local: SourceRef,
    pub remote: String,
}

#[derive(Debug, Clone)]
pub struct ReifyingLoader {
    pub source: SourceRef,
}

#[derive(Clone)]
pub struct SearchLoader {
    pub query: Arc<dyn SearchQuery>,
    /// Models whose creation re-runs the search.
    pub observe_types: Vec<String>,
}

pub enum ListLoader {
    Direct(DirectLoader),
    Proxy(ProxyLoader),
    Multi(MultiLoader),
    TypeFilter(TypeFilterLoader),
    StubFilter(StubFilterLoader),
    CustomFilter(CustomFilterLoader),
    Cross(CrossLoader),
    Reifying(ReifyingLoader),
    Search(SearchLoader),
}

impl fmt::Debug for ListLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(l) => l.fmt(f),
            Self::Proxy(l) => l.fmt(f),
            Self::Multi(l) => l.fmt(f),
            Self::TypeFilter(l) => l.fmt(f),
            Self::Cross(l) => l.fmt(f),
            Self::Reifying(l) => l.fmt(f),
            Self::StubFilter(l) => write!(f, "StubFilterLoader({:?})", l.source),
            Self::CustomFilter(l) => write!(f, "CustomFilterLoader({:?})", l.source),
            Self::Search(l) => write!(f, "SearchLoader({:?})", l.observe_types),
        }
    }
}

impl ListLoader {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Direct(_) => "direct",
            Self::Proxy(_) => "proxy",
            Self::Multi(_) => "multi",
            Self::TypeFilter(_) => "type_filter",
            Self::StubFilter(_) => "stub_filter",
            Self::CustomFilter(_) => "custom_filter",
            Self::Cross(_) => "cross",
            Self::Reifying(_) => "reify",
            Self::Search(_) => "search",
        }
    }

    /// Whether live updates of this loader's bindings run as background
    /// tasks.
    pub fn needs_runtime(&self) -> bool {
        matches!(
            self,
            Self::Proxy(_) | Self::CustomFilter(_) | Self::Reifying(_) | Self::Search(_)
        )
    }

    /// Fresh binding of this loader on `instance`, already listening.
    ///
    /// Loaders whose listeners spawn work ([`Self::needs_runtime`]) must be
    /// attached from within a tokio runtime; elsewhere this fails with
    /// [`LoadError::NoRuntime`].
    pub fn attach(
        self: &Arc<Self>,
        ctx: &Arc<MappingContext>,
        instance: &Arc<Instance>,
    ) -> Result<Arc<ListBinding>, LoadError> {
        self.attach_named(ctx, instance, None)
    }

    pub(crate) fn attach_named(
        self: &Arc<Self>,
        ctx: &Arc<MappingContext>,
        instance: &Arc<Instance>,
        name: Option<&str>,
    ) -> Result<Arc<ListBinding>, LoadError> {
        if self.needs_runtime() && tokio::runtime::Handle::try_current().is_err() {
            return Err(LoadError::NoRuntime { loader: self.kind() });
        }
        let binding = ListBinding::new(
            Arc::clone(instance),
            name.map(str::to_string),
            Arc::clone(self),
            ctx,
        );
        tracing::debug!(
            instance = %instance.key(),
            mapping = name.unwrap_or("<anonymous>"),
            loader = self.kind(),
            "attached binding"
        );
        self.init_listeners(ctx, &binding)?;
        Ok(binding)
    }

    fn init_listeners(
        &self,
        ctx: &Arc<MappingContext>,
        binding: &Arc<ListBinding>,
    ) -> Result<(), LoadError> {
        match self {
            Self::Direct(l) => l.init_listeners(ctx, binding),
            Self::Proxy(l) => l.init_listeners(ctx, binding),
            Self::Multi(l) => l.init_listeners(ctx, binding),
            Self::TypeFilter(l) => l.init_listeners(ctx, binding),
            Self::StubFilter(l) => l.init_listeners(ctx, binding),
            Self::CustomFilter(l) => l.init_listeners(ctx, binding),
            Self::Cross(l) => l.init_listeners(ctx, binding),
            Self::Reifying(l) => l.init_listeners(ctx, binding),
            Self::Search(l) => l.init_listeners(ctx, binding),
        }
    }

    /// Un-memoized stub load of `binding` by its own loader.
    pub(crate) fn refresh_stubs_impl(
        binding: Arc<ListBinding>,
    ) -> BoxFuture<'static, Result<(), LoadError>> {
        async move {
            let loader = Arc::clone(binding.loader());
            match &*loader {
                Self::Direct(l) => l.refresh_stubs(&binding).await,
                Self::Proxy(l) => l.refresh_stubs(&binding).await,
                Self::Multi(_) => refresh_all_sources(&binding).await,
                Self::TypeFilter(_) | Self::Cross(_) => refresh_source(&binding).await,
                Self::StubFilter(l) => l.refresh_stubs(&binding).await,
                Self::CustomFilter(l) => l.refresh_stubs(&binding).await,
                Self::Reifying(_) => ReifyingLoader::refresh_stubs(&binding).await,
                Self::Search(l) => run_search(Arc::clone(&l.query), Arc::clone(&binding)).await,
            }
        }
        .boxed()
    }

    /// Names of the same-type mappings this loader reads from.
    pub(crate) fn local_names(&self) -> Vec<String> {
        let mut out = Vec::new();
        match self {
            Self::Direct(_) | Self::Proxy(_) | Self::Search(_) => {}
            Self::Multi(l) => {
                for source in &l.sources {
                    source.collect_names(&mut out);
                }
            }
            Self::TypeFilter(l) => l.source.collect_names(&mut out),
            Self::StubFilter(l) => l.source.collect_names(&mut out),
            Self::CustomFilter(l) => l.source.collect_names(&mut out),
            Self::Cross(l) => l.local.collect_names(&mut out),
            Self::Reifying(l) => l.source.collect_names(&mut out),
        }
        out
    }
}

// ============================================================================
// Shared plumbing
// ============================================================================

/// Run `future` on the current tokio runtime.
///
/// Attaching checks for a runtime up front, so this only drops work when a
/// listener fires after the runtime has gone or from a foreign thread.
pub(crate) fn spawn_detached(what: &'static str, future: impl Future<Output = ()> + Send + 'static) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => tracing::warn!(task = what, "no async runtime; background work dropped"),
    }
}

/// `(r.instance, [r])` for a source result `r`.
fn wrap(source: &Arc<MappingResult>) -> Option<Arc<MappingResult>> {
    source
        .instance()
        .map(|instance| MappingResult::new(Arc::clone(instance), vec![Arc::clone(source)]))
}

fn insert_wrapped(binding: &Arc<ListBinding>, sources: &[Arc<MappingResult>]) {
    insert_results(binding, sources.iter().filter_map(wrap));
}

fn remove_wrapped(binding: &ListBinding, sources: &[Arc<MappingResult>]) {
    for source in sources {
        if let Some(key) = source.key() {
            remove_instance(binding, key, slice::from_ref(source));
        }
    }
}

/// Retract `mapping` from every entry that carries it.
fn retract_everywhere(binding: &ListBinding, mapping: &Arc<MappingResult>) {
    let keys: Vec<InstanceKey> = binding
        .list()
        .iter()
        .filter(|r| r.has_mapping(mapping))
        .filter_map(|r| r.key().cloned())
        .collect();
    for key in keys {
        remove_instance(binding, &key, slice::from_ref(mapping));
    }
}

/// Forward a source binding's add and remove batches into `binding` for as
/// long as `binding` lives.
fn follow_source<A, R>(binding: &Arc<ListBinding>, source: &ListBinding, on_add: A, on_remove: R)
where
    A: Fn(&Arc<ListBinding>, &ResultBatch) + Send + Sync + 'static,
    R: Fn(&Arc<ListBinding>, &ResultBatch) + Send + Sync + 'static,
{
    let weak = Arc::downgrade(binding);
    let added = source.on_add(move |batch| {
        if let Some(binding) = weak.upgrade() {
            on_add(&binding, batch);
        }
    });
    let weak = Arc::downgrade(binding);
    let removed = source.on_remove(move |batch| {
        if let Some(binding) = weak.upgrade() {
            on_remove(&binding, batch);
        }
    });
    binding.retain(added);
    binding.retain(removed);
}

fn source_binding(binding: &ListBinding) -> Option<Arc<ListBinding>> {
    binding.state().source_binding.clone()
}

async fn refresh_source(binding: &Arc<ListBinding>) -> Result<(), LoadError> {
    let Some(source) = source_binding(binding) else {
        return Ok(());
    };
    source.refresh_stubs_future().await?;

    let remotes: Vec<Arc<ListBinding>> = binding
        .state()
        .remote_bindings
        .values()
        .map(|remote| Arc::clone(&remote.binding))
        .collect();
    try_join_all(remotes.iter().map(|remote| remote.refresh_stubs_future())).await?;
    Ok(())
}

async fn refresh_all_sources(binding: &Arc<ListBinding>) -> Result<(), LoadError> {
    let sources = binding.state().source_bindings.clone();
    try_join_all(sources.iter().map(|source| source.refresh_stubs_future())).await?;
    Ok(())
}

// ============================================================================
// Direct
// ============================================================================

impl DirectLoader {
    fn init_listeners(
        &self,
        ctx: &Arc<MappingContext>,
        binding: &Arc<ListBinding>,
    ) -> Result<(), LoadError> {
        let owner = binding.instance().key().clone();
        let remote_attr = self.remote_attr.clone();
        let weak = Arc::downgrade(binding);
        let lifecycle = ctx.events().subscribe(&self.model, move |event| {
            let Some(binding) = weak.upgrade() else {
                return;
            };
            let peer = event.instance();
            let points_here = peer.reference(&remote_attr).as_ref() == Some(&owner);
            match event {
                ModelEvent::Created(_) | ModelEvent::Updated(_) if points_here => {
                    insert_results(&binding, [MappingResult::direct(Arc::clone(peer))]);
                }
                ModelEvent::Created(_) => {}
                // A stub that never loaded the key says nothing about where it points.
                ModelEvent::Updated(_) if peer.attr(&remote_attr).is_none() => {}
                _ => {
                    remove_instance(&binding, peer.key(), &[MappingResult::edge()]);
                }
            }
        });
        binding.retain(lifecycle);

        let instance_attr = self.instance_attr.clone();
        let weak = Arc::downgrade(binding);
        let collection = binding.instance().on_change(move |change| {
            if change.attr != instance_attr {
                return;
            }
            if let Some(binding) = weak.upgrade() {
                insert_referenced(&binding, &instance_attr);
            }
        });
        binding.retain(collection);
        Ok(())
    }

    async fn refresh_stubs(&self, binding: &Arc<ListBinding>) -> Result<(), LoadError> {
        let queue = binding.context()?.refresh_queue();
        queue.enqueue(binding.instance(), false);
        queue.trigger().await?;
        insert_referenced(binding, &self.instance_attr);
        Ok(())
    }
}

/// One direct result per member of the owner's collection attribute.
fn insert_referenced(binding: &Arc<ListBinding>, attr: &str) {
    let Ok(ctx) = binding.context() else {
        return;
    };
    let results: Vec<_> = binding
        .instance()
        .references(attr)
        .iter()
        .map(|key| MappingResult::direct(ctx.instances().get_instance(key, None)))
        .collect();
    insert_results(binding, results);
}

// ============================================================================
// Proxy
// ============================================================================

impl ProxyLoader {
    /// The member a join record points at, if it is of the mapped type.
    fn option_for(&self, join: &Instance) -> Option<InstanceKey> {
        let key = join.reference(&self.option_attr)?;
        match &self.option_model {
            Some(model) if *model != key.model => None,
            _ => Some(key),
        }
    }

    fn result_for(
        &self,
        ctx: &MappingContext,
        join: &Arc<Instance>,
    ) -> Option<Arc<MappingResult>> {
        let option = self.option_for(join)?;
        Some(MappingResult::new(
            ctx.instances().get_instance(&option, None),
            vec![MappingResult::direct(Arc::clone(join))],
        ))
    }

    fn init_listeners(
        &self,
        ctx: &Arc<MappingContext>,
        binding: &Arc<ListBinding>,
    ) -> Result<(), LoadError> {
        let owner = binding.instance().key().clone();
        let loader = self.clone();
        let weak = Arc::downgrade(binding);
        let lifecycle = ctx.events().subscribe(&self.join_model, move |event| {
            let Some(binding) = weak.upgrade() else {
                return;
            };
            let join = event.instance();
            let owned = join.reference(&loader.object_attr).as_ref() == Some(&owner);
            match event {
                ModelEvent::Created(_) | ModelEvent::Updated(_) if owned => {
                    let Ok(ctx) = binding.context() else {
                        return;
                    };
                    insert_results(&binding, loader.result_for(&ctx, join));
                }
                ModelEvent::Created(_) => {}
                ModelEvent::Updated(_) if join.attr(&loader.object_attr).is_none() => {}
                _ => retract_everywhere(&binding, &MappingResult::direct(Arc::clone(join))),
            }
        });
        binding.retain(lifecycle);

        let instance_attr = self.instance_attr.clone();
        let weak = Arc::downgrade(binding);
        let collection = binding.instance().on_change(move |change| {
            if change.attr != instance_attr {
                return;
            }
            let Some(binding) = weak.upgrade() else {
                return;
            };
            spawn_detached("proxy collection refresh", async move {
                if let Err(err) = ListLoader::refresh_stubs_impl(Arc::clone(&binding)).await {
                    tracing::warn!(binding = ?binding, error = %err, "proxy refresh after collection change failed");
                }
            });
        });
        binding.retain(collection);
        Ok(())
    }

    async fn refresh_stubs(&self, binding: &Arc<ListBinding>) -> Result<(), LoadError> {
        let ctx = binding.context()?;
        let queue = ctx.refresh_queue();
        queue.enqueue(binding.instance(), false);
        queue.trigger().await?;

        let joins: Vec<Arc<Instance>> = binding
            .instance()
            .references(&self.instance_attr)
            .iter()
            .map(|key| ctx.instances().get_instance(key, None))
            .collect();
        for join in &joins {
            queue.enqueue(join, false);
        }
        queue.trigger().await?;

        let results: Vec<_> = joins
            .iter()
            .filter_map(|join| self.result_for(&ctx, join))
            .collect();
        insert_results(binding, results);
        Ok(())
    }
}

// ============================================================================
// Multi
// ============================================================================

impl MultiLoader {
    fn init_listeners(
        &self,
        ctx: &Arc<MappingContext>,
        binding: &Arc<ListBinding>,
    ) -> Result<(), LoadError> {
        let sources = self
            .sources
            .iter()
            .map(|source| source.resolve(ctx, binding.instance()))
            .collect::<Result<Vec<_>, _>>()?;

        for source in &sources {
            follow_source(
                binding,
                source,
                |b, batch| insert_wrapped(b, batch),
                |b, batch| remove_wrapped(b, batch),
            );
            insert_wrapped(binding, &source.list());
        }
        binding.state().source_bindings = sources;
        Ok(())
    }
}

// ============================================================================
// Filters
// ============================================================================

fn has_type(types: &[String], result: &MappingResult) -> bool {
    result
        .instance()
        .is_some_and(|instance| types.iter().any(|t| t == instance.model()))
}

impl TypeFilterLoader {
    fn init_listeners(
        &self,
        ctx: &Arc<MappingContext>,
        binding: &Arc<ListBinding>,
    ) -> Result<(), LoadError> {
        let source = self.source.resolve(ctx, binding.instance())?;
        let types = self.types.clone();
        follow_source(
            binding,
            &source,
            move |b, batch| {
                let accepted: Vec<_> = batch.iter().filter(|r| has_type(&types, r)).cloned().collect();
                insert_wrapped(b, &accepted);
            },
            |b, batch| remove_wrapped(b, batch),
        );

        let accepted: Vec<_> = source
            .list()
            .into_iter()
            .filter(|r| has_type(&self.types, r))
            .collect();
        binding.state().source_binding = Some(source);
        insert_wrapped(binding, &accepted);
        Ok(())
    }
}

impl StubFilterLoader {
    fn init_listeners(
        &self,
        ctx: &Arc<MappingContext>,
        binding: &Arc<ListBinding>,
    ) -> Result<(), LoadError> {
        let source = self.source.resolve(ctx, binding.instance())?;
        let predicate = Arc::clone(&self.predicate);
        follow_source(
            binding,
            &source,
            move |b, batch| {
                if !b.state().stubs_loaded {
                    return;
                }
                let accepted: Vec<_> = batch.iter().filter(|r| predicate(r)).cloned().collect();
                insert_wrapped(b, &accepted);
            },
            |b, batch| remove_wrapped(b, batch),
        );
        binding.state().source_binding = Some(source);
        Ok(())
    }

    async fn refresh_stubs(&self, binding: &Arc<ListBinding>) -> Result<(), LoadError> {
        let Some(source) = source_binding(binding) else {
            return Ok(());
        };
        source.refresh_stubs_future().await?;
        let accepted: Vec<_> = source
            .list()
            .into_iter()
            .filter(|r| (self.predicate)(r))
            .collect();
        insert_wrapped(binding, &accepted);
        binding.state().stubs_loaded = true;
        Ok(())
    }
}

impl CustomFilterLoader {
    fn init_listeners(
        &self,
        ctx: &Arc<MappingContext>,
        binding: &Arc<ListBinding>,
    ) -> Result<(), LoadError> {
        let source = self.source.resolve(ctx, binding.instance())?;
        let filter = Arc::clone(&self.filter);
        follow_source(
            binding,
            &source,
            move |b, batch| {
                for result in batch {
                    track(b, &filter, result, true);
                }
            },
            |b, batch| {
                for result in batch {
                    untrack(b, result);
                }
            },
        );

        let existing = source.list();
        binding.state().source_binding = Some(source);
        for result in &existing {
            track(binding, &self.filter, result, true);
        }
        Ok(())
    }

    async fn refresh_stubs(&self, binding: &Arc<ListBinding>) -> Result<(), LoadError> {
        let Some(source) = source_binding(binding) else {
            return Ok(());
        };
        source.refresh_stubs_future().await?;

        let results = source.list();
        let evaluations: Vec<Option<u64>> = results
            .iter()
            .map(|result| {
                track(binding, &self.filter, result, false);
                start_evaluation(binding, result)
            })
            .collect();
        let verdicts = join_all(results.iter().map(|r| evaluate(&self.filter, r))).await;
        for ((result, keep), evaluation) in results.iter().zip(verdicts).zip(evaluations) {
            if let Some(evaluation) = evaluation {
                apply_verdict(binding, result, keep, evaluation);
            }
        }
        Ok(())
    }
}

async fn evaluate(filter: &Arc<dyn ResultFilter>, result: &MappingResult) -> bool {
    match filter.evaluate(result).await {
        Ok(keep) => keep,
        Err(err) => {
            tracing::warn!(result = ?result.key(), error = %err, "filter evaluation failed; excluding result");
            false
        }
    }
}

/// Watch `source` so attribute changes re-run the predicate.
fn track(
    binding: &Arc<ListBinding>,
    filter: &Arc<dyn ResultFilter>,
    source: &Arc<MappingResult>,
    evaluate_now: bool,
) {
    let Some(instance) = source.instance() else {
        return;
    };
    if binding.state().tracked.iter().any(|t| Arc::ptr_eq(&t.source, source)) {
        return;
    }

    let evaluations = Arc::new(AtomicU64::new(0));
    let watched = filter.watched_attrs();
    let weak = Arc::downgrade(binding);
    let (watch_filter, watch_source) = (Arc::clone(filter), Arc::clone(source));
    let watch_evaluations = Arc::clone(&evaluations);
    let subscription = instance.on_change(move |change| {
        if !watched.is_empty() && !watched.contains(&change.attr) {
            return;
        }
        if let Some(binding) = weak.upgrade() {
            let evaluation = watch_evaluations.fetch_add(1, Ordering::SeqCst) + 1;
            spawn_evaluation(&binding, &watch_filter, &watch_source, evaluation);
        }
    });
    binding.state().tracked.push(TrackedResult {
        source: Arc::clone(source),
        evaluations: Arc::clone(&evaluations),
        _subscription: subscription,
    });

    if evaluate_now {
        let evaluation = evaluations.fetch_add(1, Ordering::SeqCst) + 1;
        spawn_evaluation(binding, filter, source, evaluation);
    }
}

/// Number of a new evaluation of a tracked `source`, superseding any running
/// one.
fn start_evaluation(binding: &ListBinding, source: &Arc<MappingResult>) -> Option<u64> {
    binding
        .state()
        .tracked
        .iter()
        .find(|t| Arc::ptr_eq(&t.source, source))
        .map(|t| t.evaluations.fetch_add(1, Ordering::SeqCst) + 1)
}

fn untrack(binding: &Arc<ListBinding>, source: &Arc<MappingResult>) {
    let dropped: Vec<TrackedResult> = {
        let mut state = binding.state();
        let (dropped, kept) = std::mem::take(&mut state.tracked)
            .into_iter()
            .partition(|t| Arc::ptr_eq(&t.source, source));
        state.tracked = kept;
        dropped
    };
    drop(dropped);
    remove_wrapped(binding, slice::from_ref(source));
}

fn spawn_evaluation(
    binding: &Arc<ListBinding>,
    filter: &Arc<dyn ResultFilter>,
    source: &Arc<MappingResult>,
    evaluation: u64,
) {
    let weak = Arc::downgrade(binding);
    let filter = Arc::clone(filter);
    let source = Arc::clone(source);
    spawn_detached("filter evaluation", async move {
        let keep = evaluate(&filter, &source).await;
        if let Some(binding) = weak.upgrade() {
            apply_verdict(&binding, &source, keep, evaluation);
        }
    });
}

/// Insert or retract a tracked source result after its predicate settled.
/// Verdicts of superseded evaluations are dropped.
fn apply_verdict(binding: &Arc<ListBinding>, source: &Arc<MappingResult>, keep: bool, evaluation: u64) {
    let latest = binding
        .state()
        .tracked
        .iter()
        .find(|t| Arc::ptr_eq(&t.source, source))
        .map(|t| t.evaluations.load(Ordering::SeqCst));
    match latest {
        Some(latest) if latest == evaluation => {}
        Some(_) => {
            tracing::trace!(result = ?source.key(), evaluation, "dropping stale filter verdict");
            return;
        }
        None => return,
    }
    if keep {
        insert_wrapped(binding, slice::from_ref(source));
    } else {
        remove_wrapped(binding, slice::from_ref(source));
    }
}

// ============================================================================
// Cross
// ============================================================================

impl CrossLoader {
    fn init_listeners(
        &self,
        ctx: &Arc<MappingContext>,
        binding: &Arc<ListBinding>,
    ) -> Result<(), LoadError> {
        let local = self.local.resolve(ctx, binding.instance())?;
        let remote = self.remote.clone();
        follow_source(
            binding,
            &local,
            move |b, batch| {
                for result in batch {
                    attach_remote(b, &remote, result);
                }
            },
            |b, batch| {
                for result in batch {
                    detach_remote(b, result);
                }
            },
        );

        let existing = local.list();
        binding.state().source_binding = Some(local);
        for result in &existing {
            attach_remote(binding, &self.remote, result);
        }
        Ok(())
    }
}

/// `(remote.instance, [local])`.
fn via_local(
    remote: &MappingResult,
    local: &Arc<MappingResult>,
) -> Option<Arc<MappingResult>> {
    remote
        .instance()
        .map(|instance| MappingResult::new(Arc::clone(instance), vec![Arc::clone(local)]))
}

fn attach_remote(binding: &Arc<ListBinding>, remote_name: &str, local: &Arc<MappingResult>) {
    let Some(instance) = local.instance() else {
        return;
    };
    let key = instance.key().clone();
    if binding.state().remote_bindings.contains_key(&key) {
        return;
    }
    let Ok(ctx) = binding.context() else {
        return;
    };
    let remote = match ctx.get_binding(instance, remote_name) {
        Ok(remote) => remote,
        Err(err) => {
            tracing::warn!(local = %key, mapping = remote_name, error = %err, "cannot resolve remote mapping");
            return;
        }
    };

    let weak = Arc::downgrade(binding);
    let hop = Arc::clone(local);
    let added = remote.on_add(move |batch| {
        if let Some(binding) = weak.upgrade() {
            insert_results(&binding, batch.iter().filter_map(|r| via_local(r, &hop)));
        }
    });
    let weak = Arc::downgrade(binding);
    let hop = Arc::clone(local);
    let removed = remote.on_remove(move |batch| {
        if let Some(binding) = weak.upgrade() {
            for result in batch {
                if let Some(key) = result.key() {
                    remove_instance(&binding, key, slice::from_ref(&hop));
                }
            }
        }
    });

    let existing = remote.list();
    {
        let mut state = binding.state();
        if state.remote_bindings.contains_key(&key) {
            return;
        }
        state.remote_bindings.insert(
            key,
            RemoteBinding {
                binding: remote,
                local: Arc::clone(local),
                subscriptions: vec![added, removed],
            },
        );
    }
    insert_results(binding, existing.iter().filter_map(|r| via_local(r, local)));
}

fn detach_remote(binding: &Arc<ListBinding>, local: &Arc<MappingResult>) {
    let Some(key) = local.key() else {
        return;
    };
    let entry = binding.state().remote_bindings.remove(key);
    let Some(RemoteBinding {
        binding: remote,
        local,
        subscriptions,
    }) = entry
    else {
        return;
    };

    // Unsubscribe before retracting so no late remote batch re-adds anything.
    drop(subscriptions);
    for result in remote.list() {
        if let Some(key) = result.key() {
            remove_instance(binding, key, slice::from_ref(&local));
        }
    }
}

// ============================================================================
// Reifying
// ============================================================================

impl ReifyingLoader {
    fn init_listeners(
        &self,
        ctx: &Arc<MappingContext>,
        binding: &Arc<ListBinding>,
    ) -> Result<(), LoadError> {
        let source = self.source.resolve(ctx, binding.instance())?;
        follow_source(
            binding,
            &source,
            |b, batch| reify_then_insert(b, batch.clone()),
            |b, batch| remove_wrapped(b, batch),
        );

        // Stubs wait for a refresh; only loaded results show up right away.
        let ready: Vec<_> = source
            .list()
            .into_iter()
            .filter(|r| r.instance().is_some_and(|i| i.is_reified()))
            .collect();
        binding.state().source_binding = Some(source);
        insert_wrapped(binding, &ready);
        Ok(())
    }

    async fn refresh_stubs(binding: &Arc<ListBinding>) -> Result<(), LoadError> {
        let Some(source) = source_binding(binding) else {
            return Ok(());
        };
        source.refresh_stubs_future().await?;

        let results = source.list();
        let queue = binding.context()?.refresh_queue();
        for result in &results {
            if let Some(instance) = result.instance() {
                queue.enqueue(instance, false);
            }
        }
        queue.trigger().await?;
        insert_wrapped(binding, &results);
        Ok(())
    }
}

fn reify_then_insert(binding: &Arc<ListBinding>, batch: ResultBatch) {
    let Ok(ctx) = binding.context() else {
        return;
    };
    let queue = ctx.refresh_queue();
    for result in &batch {
        if let Some(instance) = result.instance() {
            queue.enqueue(instance, false);
        }
    }
    let pending = queue.trigger();
    let weak = Arc::downgrade(binding);
    spawn_detached("reify added results", async move {
        if let Err(err) = pending.await {
            tracing::warn!(error = %err, "loading added results failed");
            return;
        }
        let Some(binding) = weak.upgrade() else {
            return;
        };
        // Skip results the source dropped while they were loading.
        let source = source_binding(&binding);
        let live: Vec<_> = batch
            .into_iter()
            .filter(|r| source.as_ref().map_or(true, |s| s.contains_result(r)))
            .collect();
        insert_wrapped(&binding, &live);
    });
}

// ============================================================================
// Search
// ============================================================================

impl SearchLoader {
    fn init_listeners(
        &self,
        ctx: &Arc<MappingContext>,
        binding: &Arc<ListBinding>,
    ) -> Result<(), LoadError> {
        for model in &self.observe_types {
            let weak = Arc::downgrade(binding);
            let query = Arc::clone(&self.query);
            let lifecycle = ctx.events().subscribe(model, move |event| {
                let Some(binding) = weak.upgrade() else {
                    return;
                };
                match event {
                    ModelEvent::Created(_) => {
                        let query = Arc::clone(&query);
                        spawn_detached("search rerun", async move {
                            if let Err(err) = run_search(query, Arc::clone(&binding)).await {
                                tracing::warn!(binding = ?binding, error = %err, "search rerun failed");
                            }
                        });
                    }
                    ModelEvent::Updated(_) => {}
                    ModelEvent::Destroyed(peer) | ModelEvent::Orphaned(peer) => {
                        // Snapshot hits are listed as the object they pin.
                        let key = if peer.is_snapshot() {
                            snapshot::child_key(peer)
                        } else {
                            Some(peer.key().clone())
                        };
                        if let Some(key) = key {
                            remove_instance(&binding, &key, &[MappingResult::edge()]);
                        }
                    }
                }
            });
            binding.retain(lifecycle);
        }
        Ok(())
    }
}

async fn run_search(
    query: Arc<dyn SearchQuery>,
    binding: Arc<ListBinding>,
) -> Result<(), LoadError> {
    let ctx = binding.context()?;
    let found = query.search(&ctx, binding.instance()).await?;
    insert_results(&binding, found.into_iter().map(MappingResult::direct));
    Ok(())
}
