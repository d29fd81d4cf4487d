//! Mapping context
//!
//! Everything a loader needs from the outside world, in one constructed
//! object: configuration, the shared instance cache, model lifecycle events,
//! backend collaborators, permissions, model metadata and the mappings
//! registry. Bindings obtained by name are cached here per
//! `(instance, mapping)` so every caller shares one live list; the cache only
//! holds them weakly, so a binding nobody uses any more is dropped along
//! with its listeners.

use crate::binding::ListBinding;
use crate::config::EngineConfig;
use crate::error::LoadError;
use crate::events::ModelEvents;
use crate::instance::{Instance, InstanceCache, InstanceKey, InstanceRegistry};
use crate::mappings::{AllowAll, MapSubject, Mappings, PermissionOracle};
use crate::models::ModelRegistry;
use crate::refresh_queue::{InFlightLoads, InstanceFetcher, RefreshQueue};
use crate::snapshot;
use ahash::AHashMap;
use async_trait::async_trait;
use grcmap_query::{QueryRequest, QueryResponse};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Weak};

/// Remote query endpoint. Executes a batch of requests in one call and
/// answers positionally.
#[async_trait]
pub trait QueryService: Send + Sync {
    async fn execute(&self, requests: Vec<QueryRequest>) -> anyhow::Result<Vec<QueryResponse>>;
}

struct NoQueryService;

#[async_trait]
impl QueryService for NoQueryService {
    async fn execute(&self, _requests: Vec<QueryRequest>) -> anyhow::Result<Vec<QueryResponse>> {
        anyhow::bail!("no query service configured")
    }
}

pub struct MappingContext {
    config: EngineConfig,
    instances: Arc<dyn InstanceRegistry>,
    events: ModelEvents,
    fetcher: Arc<dyn InstanceFetcher>,
    query_service: Arc<dyn QueryService>,
    permissions: Arc<dyn PermissionOracle>,
    models: ModelRegistry,
    mappings: Mappings,
    bindings: Mutex<AHashMap<(InstanceKey, String), Weak<ListBinding>>>,
    in_flight: Arc<InFlightLoads>,
}

impl fmt::Debug for MappingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappingContext")
            .field("config", &self.config)
            .field("models", &self.models.len())
            .field("bindings", &self.live_bindings())
            .finish_non_exhaustive()
    }
}

pub struct MappingContextBuilder {
    config: EngineConfig,
    mappings: Mappings,
    fetcher: Arc<dyn InstanceFetcher>,
    instances: Option<Arc<dyn InstanceRegistry>>,
    query_service: Option<Arc<dyn QueryService>>,
    permissions: Option<Arc<dyn PermissionOracle>>,
    models: ModelRegistry,
}

impl MappingContextBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn instances(mut self, instances: Arc<dyn InstanceRegistry>) -> Self {
        self.instances = Some(instances);
        self
    }

    pub fn query_service(mut self, service: Arc<dyn QueryService>) -> Self {
        self.query_service = Some(service);
        self
    }

    pub fn permissions(mut self, oracle: Arc<dyn PermissionOracle>) -> Self {
        self.permissions = Some(oracle);
        self
    }

    pub fn models(mut self, models: ModelRegistry) -> Self {
        self.models = models;
        self
    }

    pub fn build(self) -> Arc<MappingContext> {
        Arc::new(MappingContext {
            config: self.config,
            instances: self
                .instances
                .unwrap_or_else(|| Arc::new(InstanceCache::new())),
            events: ModelEvents::new(),
            fetcher: self.fetcher,
            query_service: self
                .query_service
                .unwrap_or_else(|| Arc::new(NoQueryService)),
            permissions: self.permissions.unwrap_or_else(|| Arc::new(AllowAll)),
            models: self.models,
            mappings: self.mappings,
            bindings: Mutex::new(AHashMap::new()),
            in_flight: Arc::default(),
        })
    }
}

impl MappingContext {
    pub fn builder(mappings: Mappings, fetcher: Arc<dyn InstanceFetcher>) -> MappingContextBuilder {
        MappingContextBuilder {
            config: EngineConfig::default(),
            mappings,
            fetcher,
            instances: None,
            query_service: None,
            permissions: None,
            models: ModelRegistry::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn instances(&self) -> &dyn InstanceRegistry {
        self.instances.as_ref()
    }

    pub fn events(&self) -> &ModelEvents {
        &self.events
    }

    pub fn query_service(&self) -> &dyn QueryService {
        self.query_service.as_ref()
    }

    pub fn permissions(&self) -> &dyn PermissionOracle {
        self.permissions.as_ref()
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    pub fn mappings(&self) -> &Mappings {
        &self.mappings
    }

    /// A fresh, empty reify queue over this context's fetcher. Queues of one
    /// context share their in-flight fetches, so concurrent refreshes load
    /// each instance once.
    pub fn refresh_queue(&self) -> RefreshQueue {
        RefreshQueue::with_in_flight(
            Arc::clone(&self.fetcher),
            self.config.refresh_batch_size,
            Arc::clone(&self.in_flight),
        )
    }

    /// The shared binding of mapping `name` on `instance`, created on first
    /// use and again after every holder has dropped it.
    pub fn get_binding(
        self: &Arc<Self>,
        instance: &Arc<Instance>,
        name: &str,
    ) -> Result<Arc<ListBinding>, LoadError> {
        let key = (instance.key().clone(), name.to_string());
        if let Some(binding) = self.bindings.lock().get(&key).and_then(Weak::upgrade) {
            return Ok(binding);
        }

        let loader = self
            .mappings
            .get_list_loader(instance.model(), name)
            .ok_or_else(|| LoadError::UnknownMapping {
                model: instance.model().to_string(),
                name: name.to_string(),
            })?;
        // Attaching may resolve further named bindings; the cache is unlocked
        // meanwhile.
        let binding = loader.attach_named(self, instance, Some(name))?;
        let mut bindings = self.bindings.lock();
        if let Some(raced) = bindings.get(&key).and_then(Weak::upgrade) {
            return Ok(raced);
        }
        bindings.retain(|_, cached| cached.strong_count() > 0);
        bindings.insert(key, Arc::downgrade(&binding));
        Ok(binding)
    }

    /// Number of named bindings still alive.
    pub fn live_bindings(&self) -> usize {
        self.bindings
            .lock()
            .values()
            .filter(|cached| cached.strong_count() > 0)
            .count()
    }

    /// Shared instance for a query result record; snapshot records become
    /// their pinned object.
    pub fn resolve_record(&self, default_model: &str, record: &Value) -> Option<Arc<Instance>> {
        let attrs = record.as_object()?.clone();
        let id = match attrs.get("id")? {
            Value::Number(n) => n.as_u64()?,
            Value::String(s) => s.parse().ok()?,
            _ => return None,
        };
        let model = attrs
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or(default_model)
            .to_string();
        let instance = self
            .instances
            .get_instance(&InstanceKey::new(model, id), Some(attrs));
        if instance.is_snapshot() {
            return snapshot::to_object(self.instances.as_ref(), &instance);
        }
        Some(instance)
    }

    pub fn allowed_to_map(&self, source: &MapSubject, target: &MapSubject) -> bool {
        self.mappings
            .allowed_to_map(source, target, self.permissions.as_ref())
    }

    pub fn allowed_to_create(&self, source: &MapSubject, target: &MapSubject) -> bool {
        self.mappings
            .allowed_to_create(source, target, self.permissions.as_ref())
    }

    pub fn allowed_to_unmap(&self, source: &MapSubject, target: &MapSubject) -> bool {
        self.mappings
            .allowed_to_unmap(source, target, self.permissions.as_ref())
    }
}
