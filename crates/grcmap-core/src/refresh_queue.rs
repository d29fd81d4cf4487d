//! Batched reify queue
//!
//! Collects "fully load this stub" requests and turns them into as few backend
//! fetches as possible: one per model type and `batch_size` ids.

use crate::error::LoadError;
use crate::instance::{Attributes, Instance, InstanceKey};
use ahash::AHashMap;
use async_trait::async_trait;
use futures::future::{try_join_all, BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Loads full records from the backend.
#[async_trait]
pub trait InstanceFetcher: Send + Sync {
    /// Full attribute records of `ids`. Each record carries its `id`; records
    /// may come back in any order and unknown ids may be missing.
    async fn fetch(&self, model: &str, ids: &[u64]) -> anyhow::Result<Vec<Attributes>>;
}

type BatchLoad = Shared<BoxFuture<'static, Result<(), LoadError>>>;

/// Fetches in progress, keyed by the instances they load.
///
/// Queues sharing one registry never fetch the same instance twice at once:
/// a queue that drains an instance another queue is already loading waits
/// for that fetch instead.
#[derive(Default)]
pub(crate) struct InFlightLoads {
    next_batch: AtomicU64,
    loads: Mutex<AHashMap<InstanceKey, (u64, BatchLoad)>>,
}

impl InFlightLoads {
    fn finish(&self, batch: u64) {
        self.loads.lock().retain(|_, (owner, _)| *owner != batch);
    }
}

pub struct RefreshQueue {
    fetcher: Arc<dyn InstanceFetcher>,
    batch_size: usize,
    pending: Mutex<Vec<Arc<Instance>>>,
    in_flight: Arc<InFlightLoads>,
}

impl RefreshQueue {
    pub fn new(fetcher: Arc<dyn InstanceFetcher>, batch_size: usize) -> Self {
        Self::with_in_flight(fetcher, batch_size, Arc::default())
    }

    pub(crate) fn with_in_flight(
        fetcher: Arc<dyn InstanceFetcher>,
        batch_size: usize,
        in_flight: Arc<InFlightLoads>,
    ) -> Self {
        Self {
            fetcher,
            batch_size: batch_size.max(1),
            pending: Mutex::new(Vec::new()),
            in_flight,
        }
    }

    /// Queue `instance` for loading. Already loaded instances are skipped
    /// unless `force`; unsaved ones are always skipped. Returns whether the
    /// instance was queued.
    pub fn enqueue(&self, instance: &Arc<Instance>, force: bool) -> bool {
        if instance.is_new() || (instance.is_reified() && !force) {
            return false;
        }
        let mut pending = self.pending.lock();
        if pending.iter().any(|queued| queued.key() == instance.key()) {
            return false;
        }
        pending.push(Arc::clone(instance));
        true
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Drain the queue and load everything in it.
    ///
    /// The queue is drained, and its fetches registered as in flight, when
    /// this is called rather than when the returned future is first polled.
    /// Instances already being fetched for another queue are not fetched
    /// again. Resolves to the drained instances once every batch has been
    /// applied.
    pub fn trigger(&self) -> BoxFuture<'static, Result<Vec<Arc<Instance>>, LoadError>> {
        let drained: Vec<Arc<Instance>> = std::mem::take(&mut *self.pending.lock());
        let mut waits: Vec<(u64, BatchLoad)> = Vec::new();
        {
            let mut loads = self.in_flight.loads.lock();
            let mut by_model: BTreeMap<&str, Vec<Arc<Instance>>> = BTreeMap::new();
            for instance in &drained {
                match loads.get(instance.key()) {
                    Some((batch, load)) => {
                        if !waits.iter().any(|(waiting, _)| waiting == batch) {
                            waits.push((*batch, load.clone()));
                        }
                    }
                    None => by_model
                        .entry(instance.model())
                        .or_default()
                        .push(Arc::clone(instance)),
                }
            }

            for (model, instances) in by_model {
                for chunk in instances.chunks(self.batch_size) {
                    let batch = self.in_flight.next_batch.fetch_add(1, Ordering::Relaxed);
                    let load = self.load_batch(batch, model, chunk.to_vec());
                    for instance in chunk {
                        loads.insert(instance.key().clone(), (batch, load.clone()));
                    }
                    waits.push((batch, load));
                }
            }
        }

        async move {
            try_join_all(waits.into_iter().map(|(_, load)| load)).await?;
            if !drained.is_empty() {
                tracing::debug!(count = drained.len(), "refresh queue drained");
            }
            Ok(drained)
        }
        .boxed()
    }

    fn load_batch(&self, batch: u64, model: &str, instances: Vec<Arc<Instance>>) -> BatchLoad {
        let fetcher = Arc::clone(&self.fetcher);
        let in_flight = Arc::clone(&self.in_flight);
        let model = model.to_string();
        async move {
            let ids: Vec<u64> = instances.iter().map(|instance| instance.id()).collect();
            let result = match fetcher.fetch(&model, &ids).await {
                Ok(records) => {
                    apply_records(&model, &instances, records);
                    Ok(())
                }
                Err(err) => Err(LoadError::from(err)),
            };
            in_flight.finish(batch);
            result
        }
        .boxed()
        .shared()
    }
}

fn apply_records(model: &str, instances: &[Arc<Instance>], records: Vec<Attributes>) {
    let index: HashMap<u64, &Arc<Instance>> = instances
        .iter()
        .map(|instance| (instance.id(), instance))
        .collect();
    for record in records {
        let Some(id) = record.get("id").and_then(serde_json::Value::as_u64) else {
            tracing::warn!(model = %model, "fetched record without an id");
            continue;
        };
        match index.get(&id) {
            Some(instance) => instance.apply(record, true),
            None => tracing::debug!(model = %model, id, "fetched record was not requested"),
        }
    }
}
