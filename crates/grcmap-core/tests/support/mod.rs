//! In-memory collaborators for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use grcmap_core::{
    Action, Attributes, Instance, InstanceFetcher, InstanceKey, MapSubject, MappingContext,
    Mappings, PermissionOracle, QueryService,
};
use grcmap_query::{QueryRequest, QueryResponse, ResultKind};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn key(model: &str, id: u64) -> InstanceKey {
    InstanceKey::new(model, id)
}

pub fn reference(model: &str, id: u64) -> Value {
    key(model, id).to_reference()
}

/// `json!` object as attributes.
pub fn attrs(value: Value) -> Attributes {
    value.as_object().cloned().unwrap_or_default()
}

/// Let detached tasks spawned by listeners run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

// ============================================================================
// Fetcher
// ============================================================================

/// Serves records from a table. Counts calls and can be told to fail.
#[derive(Default)]
pub struct FakeFetcher {
    records: Mutex<BTreeMap<InstanceKey, Attributes>>,
    calls: Mutex<Vec<(String, Vec<u64>)>>,
    failures: AtomicUsize,
    delay_ms: AtomicUsize,
}

impl FakeFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, model: &str, id: u64, record: Value) {
        let mut record = attrs(record);
        record.insert("id".into(), json!(id));
        self.records.lock().insert(key(model, id), record);
    }

    /// Fail the next `n` fetches.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<(String, Vec<u64>)> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, model: &str) -> usize {
        self.calls.lock().iter().filter(|(m, _)| m == model).count()
    }
}

#[async_trait]
impl InstanceFetcher for FakeFetcher {
    async fn fetch(&self, model: &str, ids: &[u64]) -> anyhow::Result<Vec<Attributes>> {
        self.calls.lock().push((model.to_string(), ids.to_vec()));
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("fetch of {model} {ids:?} rejected");
        }
        let records = self.records.lock();
        Ok(ids
            .iter()
            .filter_map(|id| records.get(&key(model, *id)).cloned())
            .collect())
    }
}

// ============================================================================
// Query service
// ============================================================================

/// Answers each request with the records stored for its object name.
#[derive(Default)]
pub struct FakeQueryService {
    records: Mutex<BTreeMap<String, Vec<Value>>>,
    batches: Mutex<Vec<Vec<QueryRequest>>>,
}

impl FakeQueryService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, object_name: &str, values: Vec<Value>) {
        self.records.lock().insert(object_name.to_string(), values);
    }

    pub fn batches(&self) -> Vec<Vec<QueryRequest>> {
        self.batches.lock().clone()
    }
}

#[async_trait]
impl QueryService for FakeQueryService {
    async fn execute(&self, requests: Vec<QueryRequest>) -> anyhow::Result<Vec<QueryResponse>> {
        let records = self.records.lock().clone();
        let responses = requests
            .iter()
            .map(|request| {
                let values = records.get(&request.object_name).cloned().unwrap_or_default();
                let total = values.len();
                match request.kind {
                    ResultKind::Ids => QueryResponse {
                        ids: values
                            .iter()
                            .filter_map(|v| v.get("id").and_then(Value::as_u64))
                            .collect(),
                        total,
                        ..QueryResponse::default()
                    },
                    ResultKind::Count => QueryResponse {
                        count: total,
                        total,
                        ..QueryResponse::default()
                    },
                    ResultKind::Values => QueryResponse {
                        count: total,
                        values,
                        total,
                        ..QueryResponse::default()
                    },
                }
            })
            .collect();
        self.batches.lock().push(requests);
        Ok(responses)
    }
}

// ============================================================================
// Permissions
// ============================================================================

pub struct CountingOracle {
    allow: AtomicBool,
    calls: AtomicUsize,
}

impl CountingOracle {
    pub fn new(allow: bool) -> Arc<Self> {
        Arc::new(Self {
            allow: AtomicBool::new(allow),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PermissionOracle for CountingOracle {
    fn is_allowed_for(&self, _action: Action, _subject: &MapSubject) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.allow.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Context
// ============================================================================

pub fn context(mappings: Mappings, fetcher: &Arc<FakeFetcher>) -> Arc<MappingContext> {
    MappingContext::builder(mappings, fetcher.clone()).build()
}

/// A cached stub for `(model, id)`.
pub fn stub(ctx: &MappingContext, model: &str, id: u64) -> Arc<Instance> {
    ctx.instances().get_instance(&key(model, id), None)
}

/// A cached, loaded instance for `(model, id)`.
pub fn loaded(ctx: &MappingContext, model: &str, id: u64, record: Value) -> Arc<Instance> {
    let mut record = attrs(record);
    record.insert("id".into(), json!(id));
    ctx.instances().get_instance(&key(model, id), Some(record))
}

/// Keys of a binding's entries, in list order.
pub fn keys(binding: &grcmap_core::ListBinding) -> Vec<InstanceKey> {
    binding
        .list()
        .iter()
        .filter_map(|r| r.key().cloned())
        .collect()
}
