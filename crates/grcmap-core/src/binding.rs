//! List bindings
//!
//! A [`ListBinding`] owns the live, ordered list of [`MappingResult`]s for one
//! `(instance, loader)` pair. The list is only ever mutated in place (append a
//! batch, splice out entries) and each mutation is announced as one batch
//! event, so observers can follow it incrementally.
//!
//! Refreshes are memoized on the binding: concurrent callers share one
//! in-flight load. A successful load stays memoized (live listeners keep the
//! list current from then on); a failed one is forgotten after a short grace
//! window so a later call can retry.

use crate::context::MappingContext;
use crate::error::LoadError;
use crate::events::{EventHub, Subscription};
use crate::instance::{Instance, InstanceKey};
use crate::loader::{ListLoader, SourceRef};
use crate::result::MappingResult;
use ahash::AHashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockWriteGuard};
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Payload of add/remove events: the entries appended or spliced out by one
/// mutation.
pub type ResultBatch = Vec<Arc<MappingResult>>;

pub(crate) type LoadFuture = Shared<BoxFuture<'static, Result<(), LoadError>>>;

// ============================================================================
// Loader-private state
// ============================================================================

/// Remote side of a cross mapping, keyed by the local result's instance.
pub(crate) struct RemoteBinding {
    pub binding: Arc<ListBinding>,
    pub local: Arc<MappingResult>,
    pub subscriptions: Vec<Subscription>,
}

/// A source result watched by a custom filter.
pub(crate) struct TrackedResult {
    pub source: Arc<MappingResult>,
    /// Bumped whenever an evaluation starts; only the latest verdict lands.
    pub evaluations: Arc<AtomicU64>,
    pub _subscription: Subscription,
}

#[derive(Default)]
pub(crate) struct BindingState {
    pub pending_stubs: Option<(u64, LoadFuture)>,
    pub pending_instances: Option<(u64, LoadFuture)>,
    pub generation: u64,
    pub source_binding: Option<Arc<ListBinding>>,
    pub source_bindings: Vec<Arc<ListBinding>>,
    pub remote_bindings: AHashMap<InstanceKey, RemoteBinding>,
    pub tracked: Vec<TrackedResult>,
    pub stubs_loaded: bool,
    pub subscriptions: Vec<Subscription>,
}

#[derive(Debug, Clone, Copy)]
enum Memo {
    Stubs,
    Instances,
}

// ============================================================================
// ListBinding
// ============================================================================

pub struct ListBinding {
    instance: Arc<Instance>,
    name: Option<String>,
    loader: Arc<ListLoader>,
    context: Weak<MappingContext>,
    failure_grace: Duration,
    list: RwLock<Vec<Arc<MappingResult>>>,
    added: EventHub<ResultBatch>,
    removed: EventHub<ResultBatch>,
    state: Mutex<BindingState>,
}

impl fmt::Debug for ListBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListBinding")
            .field("instance", self.instance.key())
            .field("name", &self.name)
            .field("loader", &self.loader.kind())
            .field("len", &self.len())
            .finish()
    }
}

impl ListBinding {
    pub(crate) fn new(
        instance: Arc<Instance>,
        name: Option<String>,
        loader: Arc<ListLoader>,
        context: &Arc<MappingContext>,
    ) -> Arc<Self> {
        Arc::new(Self {
            instance,
            name,
            loader,
            context: Arc::downgrade(context),
            failure_grace: context.config().refresh_failure_grace(),
            list: RwLock::new(Vec::new()),
            added: EventHub::new(),
            removed: EventHub::new(),
            state: Mutex::new(BindingState::default()),
        })
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    /// Mapping name, for bindings obtained through the registry.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn loader(&self) -> &Arc<ListLoader> {
        &self.loader
    }

    pub fn context(&self) -> Result<Arc<MappingContext>, LoadError> {
        self.context.upgrade().ok_or(LoadError::ContextDropped)
    }

    /// Current entries, in insertion order.
    pub fn list(&self) -> Vec<Arc<MappingResult>> {
        self.list.read().clone()
    }

    pub fn len(&self) -> usize {
        self.list.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.read().is_empty()
    }

    pub fn find(&self, key: &InstanceKey) -> Option<Arc<MappingResult>> {
        self.list
            .read()
            .iter()
            .find(|r| r.key() == Some(key))
            .cloned()
    }

    pub fn contains(&self, key: &InstanceKey) -> bool {
        self.find(key).is_some()
    }

    /// Whether this exact result object is in the list.
    pub fn contains_result(&self, result: &Arc<MappingResult>) -> bool {
        self.list.read().iter().any(|r| Arc::ptr_eq(r, result))
    }

    pub fn instances(&self) -> Vec<Arc<Instance>> {
        self.list
            .read()
            .iter()
            .filter_map(|r| r.instance().cloned())
            .collect()
    }

    pub fn on_add(&self, listener: impl Fn(&ResultBatch) + Send + Sync + 'static) -> Subscription {
        self.added.subscribe(listener)
    }

    pub fn on_remove(
        &self,
        listener: impl Fn(&ResultBatch) + Send + Sync + 'static,
    ) -> Subscription {
        self.removed.subscribe(listener)
    }

    pub(crate) fn list_mut(&self) -> RwLockWriteGuard<'_, Vec<Arc<MappingResult>>> {
        self.list.write()
    }

    pub(crate) fn emit_added(&self, batch: &ResultBatch) {
        self.added.emit(batch);
    }

    pub(crate) fn emit_removed(&self, batch: &ResultBatch) {
        self.removed.emit(batch);
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, BindingState> {
        self.state.lock()
    }

    /// Keep `subscription` alive as long as this binding.
    pub(crate) fn retain(&self, subscription: Subscription) {
        self.state.lock().subscriptions.push(subscription);
    }

    // ========================================================================
    // Refresh protocol
    // ========================================================================

    /// Bulk-populate the list from the backend. Concurrent callers share one
    /// load.
    pub async fn refresh_stubs(self: &Arc<Self>) -> Result<Vec<Arc<MappingResult>>, LoadError> {
        self.refresh_stubs_future().await?;
        Ok(self.list())
    }

    /// Populate the list, then load every listed instance in full. With
    /// `force`, a new load starts even if one is memoized, and loaded
    /// instances are fetched again.
    pub async fn refresh_instances(
        self: &Arc<Self>,
        force: bool,
    ) -> Result<Vec<Arc<MappingResult>>, LoadError> {
        self.refresh_instances_future(force).await?;
        Ok(self.list())
    }

    pub async fn refresh_count(self: &Arc<Self>) -> Result<usize, LoadError> {
        self.refresh_stubs_future().await?;
        Ok(self.len())
    }

    /// The list with every entry fully loaded, through a throwaway reifying
    /// binding over this one.
    pub async fn refresh_list(self: &Arc<Self>) -> Result<Vec<Arc<MappingResult>>, LoadError> {
        let ctx = self.context()?;
        let loader = crate::mappings::reify(SourceRef::Binding(Arc::clone(self)));
        let reified = loader.attach(&ctx, &self.instance)?;
        reified.refresh_stubs().await
    }

    pub(crate) fn refresh_stubs_future(self: &Arc<Self>) -> LoadFuture {
        let mut state = self.state.lock();
        if let Some((_, pending)) = &state.pending_stubs {
            tracing::trace!(binding = ?self, "reusing in-flight stub refresh");
            return pending.clone();
        }

        state.generation += 1;
        let generation = state.generation;
        let binding = Arc::clone(self);
        let future = async move {
            let result = ListLoader::refresh_stubs_impl(Arc::clone(&binding)).await;
            if let Err(err) = &result {
                tracing::warn!(binding = ?binding, error = %err, "stub refresh failed");
                binding.forget_failed(Memo::Stubs, generation);
            }
            result
        }
        .boxed()
        .shared();
        state.pending_stubs = Some((generation, future.clone()));
        future
    }

    pub(crate) fn refresh_instances_future(self: &Arc<Self>, force: bool) -> LoadFuture {
        let mut state = self.state.lock();
        if !force {
            if let Some((_, pending)) = &state.pending_instances {
                tracing::trace!(binding = ?self, "reusing in-flight instance refresh");
                return pending.clone();
            }
        }

        state.generation += 1;
        let generation = state.generation;
        let binding = Arc::clone(self);
        let future = async move {
            let result = binding.load_instances(force).await;
            if let Err(err) = &result {
                tracing::warn!(binding = ?binding, error = %err, "instance refresh failed");
                binding.forget_failed(Memo::Instances, generation);
            }
            result
        }
        .boxed()
        .shared();
        state.pending_instances = Some((generation, future.clone()));
        future
    }

    async fn load_instances(self: &Arc<Self>, force: bool) -> Result<(), LoadError> {
        self.refresh_stubs_future().await?;
        let queue = self.context()?.refresh_queue();
        for result in self.list() {
            if let Some(instance) = result.instance() {
                queue.enqueue(instance, force);
            }
        }
        queue.trigger().await?;
        Ok(())
    }

    /// Drop a failed memo after the grace window, unless a newer load has
    /// replaced it in the meantime.
    fn forget_failed(self: &Arc<Self>, memo: Memo, generation: u64) {
        let weak = Arc::downgrade(self);
        let clear = move || {
            let Some(binding) = weak.upgrade() else {
                return;
            };
            let mut state = binding.state.lock();
            let slot = match memo {
                Memo::Stubs => &mut state.pending_stubs,
                Memo::Instances => &mut state.pending_instances,
            };
            if slot.as_ref().is_some_and(|(g, _)| *g == generation) {
                *slot = None;
                tracing::debug!(memo = ?memo, "cleared failed refresh");
            }
        };

        let grace = self.failure_grace;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(grace).await;
                    clear();
                });
            }
            Err(_) => clear(),
        }
    }
}
