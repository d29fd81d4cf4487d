//! Model instances and the shared instance cache
//!
//! An [`Instance`] is identified by its [`InstanceKey`] (`model`, `id`), never
//! by address: the same logical object can be seen as a stub first and as a
//! fully loaded record later. The [`InstanceCache`] makes sure every holder of
//! a key shares one `Arc<Instance>`, so attribute changes are visible to all
//! observers.

use crate::events::{EventHub, Subscription};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub type Attributes = serde_json::Map<String, Value>;

/// Pseudo-type wrapping a frozen revision of another object.
pub const SNAPSHOT_TYPE: &str = "Snapshot";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    pub model: String,
    pub id: u64,
}

impl InstanceKey {
    pub fn new(model: impl Into<String>, id: u64) -> Self {
        Self {
            model: model.into(),
            id,
        }
    }

    /// Read a `{"type": ..., "id": ...}` reference. Ids may be numbers or
    /// numeric strings.
    pub fn from_reference(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let model = obj.get("type")?.as_str()?;
        let id = match obj.get("id")? {
            Value::Number(n) => n.as_u64()?,
            Value::String(s) => s.parse().ok()?,
            _ => return None,
        };
        Some(Self::new(model, id))
    }

    pub fn to_reference(&self) -> Value {
        serde_json::json!({ "type": self.model, "id": self.id })
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.model, self.id)
    }
}

/// A single attribute write.
#[derive(Debug, Clone)]
pub struct AttributeChange {
    pub attr: String,
    pub value: Value,
}

struct InstanceState {
    attrs: Attributes,
    reified: bool,
}

pub struct Instance {
    key: InstanceKey,
    is_new: bool,
    state: RwLock<InstanceState>,
    changes: EventHub<AttributeChange>,
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("key", &self.key)
            .field("reified", &self.is_reified())
            .finish_non_exhaustive()
    }
}

impl Instance {
    /// Identity only, nothing loaded.
    pub fn stub(key: InstanceKey) -> Self {
        Self::with_attrs(key, Attributes::new(), false)
    }

    pub fn with_attrs(key: InstanceKey, attrs: Attributes, reified: bool) -> Self {
        Self {
            key,
            is_new: false,
            state: RwLock::new(InstanceState { attrs, reified }),
            changes: EventHub::new(),
        }
    }

    /// An object that has not been saved yet. Its id is `0`.
    pub fn unsaved(model: impl Into<String>, attrs: Attributes) -> Self {
        Self {
            is_new: true,
            ..Self::with_attrs(InstanceKey::new(model, 0), attrs, true)
        }
    }

    pub fn key(&self) -> &InstanceKey {
        &self.key
    }

    pub fn model(&self) -> &str {
        &self.key.model
    }

    pub fn id(&self) -> u64 {
        self.key.id
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn is_reified(&self) -> bool {
        self.state.read().reified
    }

    pub fn attr(&self, name: &str) -> Option<Value> {
        self.state.read().attrs.get(name).cloned()
    }

    pub fn attrs(&self) -> Attributes {
        self.state.read().attrs.clone()
    }

    /// Scalar attributes rendered as strings, for client-side filter
    /// evaluation. Nulls, arrays and objects are skipped.
    pub fn string_attrs(&self) -> BTreeMap<String, String> {
        self.state
            .read()
            .attrs
            .iter()
            .filter_map(|(k, v)| {
                let text = match v {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => return None,
                };
                Some((k.clone(), text))
            })
            .collect()
    }

    pub fn set_attr(&self, name: impl Into<String>, value: Value) {
        let name = name.into();
        {
            let mut state = self.state.write();
            if state.attrs.get(&name) == Some(&value) {
                return;
            }
            state.attrs.insert(name.clone(), value.clone());
        }
        self.changes.emit(&AttributeChange { attr: name, value });
    }

    /// Merge a loaded record. Listeners hear about every attribute whose value
    /// actually changed, after the whole record has been applied.
    pub fn apply(&self, attrs: Attributes, reified: bool) {
        let mut changed = Vec::new();
        {
            let mut state = self.state.write();
            for (name, value) in attrs {
                if state.attrs.get(&name) != Some(&value) {
                    state.attrs.insert(name.clone(), value.clone());
                    changed.push(AttributeChange { attr: name, value });
                }
            }
            state.reified |= reified;
        }
        for change in &changed {
            self.changes.emit(change);
        }
    }

    pub fn mark_reified(&self) {
        self.state.write().reified = true;
    }

    /// Single `{"type", "id"}` reference held in `attr`.
    pub fn reference(&self, attr: &str) -> Option<InstanceKey> {
        self.state
            .read()
            .attrs
            .get(attr)
            .and_then(InstanceKey::from_reference)
    }

    /// References held in a list attribute. Malformed entries are skipped.
    pub fn references(&self, attr: &str) -> Vec<InstanceKey> {
        match self.state.read().attrs.get(attr) {
            Some(Value::Array(items)) => items.iter().filter_map(InstanceKey::from_reference).collect(),
            Some(single @ Value::Object(_)) => InstanceKey::from_reference(single).into_iter().collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_snapshot(&self) -> bool {
        self.key.model == SNAPSHOT_TYPE
    }

    /// Type used for mapping rules: a snapshot counts as the type of the
    /// object it pins.
    pub fn effective_type(&self) -> String {
        if self.is_snapshot() {
            if let Some(Value::String(child)) = self.attr("child_type") {
                return child;
            }
        }
        self.key.model.clone()
    }

    pub fn on_change(
        &self,
        listener: impl Fn(&AttributeChange) + Send + Sync + 'static,
    ) -> Subscription {
        self.changes.subscribe(listener)
    }
}

// ============================================================================
// Instance registry
// ============================================================================

/// Shared identity map of instances.
pub trait InstanceRegistry: Send + Sync {
    /// The one instance for `key`, creating a stub if it is unknown. A `seed`
    /// is a full record: it is merged in and marks the instance loaded.
    fn get_instance(&self, key: &InstanceKey, seed: Option<Attributes>) -> Arc<Instance>;

    fn find_in_cache(&self, key: &InstanceKey) -> Option<Arc<Instance>>;

    fn remove_from_cache(&self, key: &InstanceKey) -> Option<Arc<Instance>>;
}

#[derive(Debug, Default)]
pub struct InstanceCache {
    instances: DashMap<InstanceKey, Arc<Instance>>,
}

impl InstanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

impl InstanceRegistry for InstanceCache {
    fn get_instance(&self, key: &InstanceKey, seed: Option<Attributes>) -> Arc<Instance> {
        if let Some(existing) = self.find_in_cache(key) {
            if let Some(seed) = seed {
                existing.apply(seed, true);
            }
            return existing;
        }

        let created = Arc::new(match seed {
            Some(attrs) => Instance::with_attrs(key.clone(), attrs, true),
            None => Instance::stub(key.clone()),
        });
        let entry = self.instances.entry(key.clone()).or_insert(created);
        Arc::clone(entry.value())
    }

    fn find_in_cache(&self, key: &InstanceKey) -> Option<Arc<Instance>> {
        self.instances.get(key).map(|entry| Arc::clone(entry.value()))
    }

    fn remove_from_cache(&self, key: &InstanceKey) -> Option<Arc<Instance>> {
        self.instances.remove(key).map(|(_, instance)| instance)
    }
}
