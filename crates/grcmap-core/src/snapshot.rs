//! Snapshots
//!
//! A snapshot pins the content of an object at one revision. Inside a
//! snapshot scope (an audit) snapshottable objects are listed and searched
//! as snapshots, and turned back into plain-looking objects for display.

use crate::instance::{Attributes, Instance, InstanceKey, InstanceRegistry, SNAPSHOT_TYPE};
use grcmap_query::{join_queries, BoolOp, ComparisonOp, Expression, FilterQuery, QueryRequest};
use serde_json::Value;
use std::sync::Arc;

/// Types whose relations inside a scope go through snapshots.
pub const SNAPSHOTTABLE_TYPES: &[&str] = &[
    "AccessGroup",
    "Clause",
    "Contract",
    "Control",
    "DataAsset",
    "Facility",
    "Market",
    "Objective",
    "OrgGroup",
    "Policy",
    "Process",
    "Product",
    "Regulation",
    "Risk",
    "Section",
    "Standard",
    "System",
    "Threat",
    "Vendor",
];

pub const SCOPE_TYPES: &[&str] = &["Audit"];

/// Attribute set on objects built from a snapshot.
pub const SNAPSHOT_MARKER: &str = "is_snapshot";

pub fn is_snapshottable(model: &str) -> bool {
    SNAPSHOTTABLE_TYPES.contains(&model)
}

pub fn is_snapshot_scope(model: &str) -> bool {
    SCOPE_TYPES.contains(&model)
}

/// Whether `child` objects under `parent` are seen as snapshots.
pub fn is_snapshot_related(parent: &str, child: &str) -> bool {
    is_snapshot_scope(parent) && is_snapshottable(child)
}

/// Whether `instance` was built from a snapshot.
pub fn is_snapshot_object(instance: &Instance) -> bool {
    instance.attr(SNAPSHOT_MARKER) == Some(Value::Bool(true))
}

/// Key of the object `snapshot` pins.
pub fn child_key(snapshot: &Instance) -> Option<InstanceKey> {
    let child_type = match snapshot.attr("child_type")? {
        Value::String(child_type) => child_type,
        _ => return None,
    };
    let child_id = match snapshot.attr("child_id")? {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.parse().ok()?,
        _ => return None,
    };
    Some(InstanceKey::new(child_type, child_id))
}

/// The pinned object behind `snapshot`, built from its revision content.
///
/// The object is standalone: it never enters the shared cache, and any
/// snapshot-built object cached under the same key is evicted. Returns
/// `None` when the snapshot lacks a child type or id.
pub fn to_object(registry: &dyn InstanceRegistry, snapshot: &Instance) -> Option<Arc<Instance>> {
    let key = child_key(snapshot)?;

    let mut attrs: Attributes = snapshot
        .attr("revision")
        .and_then(|revision| revision.get("content").cloned())
        .and_then(|content| content.as_object().cloned())
        .unwrap_or_default();
    attrs.insert("id".into(), Value::from(key.id));
    attrs.insert("type".into(), Value::String(key.model.clone()));
    attrs.insert(SNAPSHOT_MARKER.into(), Value::Bool(true));
    attrs.insert("snapshot".into(), snapshot.key().to_reference());
    if let Some(parent) = snapshot.attr("parent") {
        attrs.insert("parent".into(), parent);
    }

    if let Some(cached) = registry.find_in_cache(&key) {
        if is_snapshot_object(&cached) {
            tracing::debug!(key = %key, "evicting snapshot object from cache");
            registry.remove_from_cache(&key);
        }
    }
    Some(Arc::new(Instance::with_attrs(key, attrs, true)))
}

/// Rewrite a listing of `request.object_name` into the equivalent listing of
/// its snapshots.
pub fn transform_query(mut request: QueryRequest) -> QueryRequest {
    let child_type = std::mem::replace(&mut request.object_name, SNAPSHOT_TYPE.to_string());
    let by_type = FilterQuery::new(Expression::comparison(
        "child_type",
        ComparisonOp::Eq,
        child_type,
    ));
    request.filters = join_queries(request.filters, by_type, BoolOp::And);
    request
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::InstanceCache;
    use serde_json::json;

    fn snapshot(attrs: Value) -> Instance {
        Instance::with_attrs(
            InstanceKey::new(SNAPSHOT_TYPE, 70),
            attrs.as_object().cloned().unwrap_or_default(),
            true,
        )
    }

    #[test]
    fn builds_standalone_object_from_revision() {
        let cache = InstanceCache::new();
        let live = cache.get_instance(&InstanceKey::new("Control", 3), None);
        let snap = snapshot(json!({
            "child_type": "Control",
            "child_id": 3,
            "revision": {"content": {"title": "Old title", "id": 3}},
        }));

        let object = to_object(&cache, &snap).unwrap();
        assert_eq!(object.key(), &InstanceKey::new("Control", 3));
        assert_eq!(object.attr("title"), Some(json!("Old title")));
        assert!(is_snapshot_object(&object));
        assert!(!Arc::ptr_eq(&object, &live));
        // The live object stays cached.
        assert!(cache.find_in_cache(live.key()).is_some());
    }

    #[test]
    fn evicts_cached_snapshot_objects() {
        let cache = InstanceCache::new();
        let key = InstanceKey::new("Risk", 5);
        let mut attrs = Attributes::new();
        attrs.insert(SNAPSHOT_MARKER.into(), json!(true));
        cache.get_instance(&key, Some(attrs));

        let snap = snapshot(json!({"child_type": "Risk", "child_id": "5"}));
        assert!(to_object(&cache, &snap).is_some());
        assert!(cache.find_in_cache(&key).is_none());
    }

    #[test]
    fn missing_child_is_none() {
        let cache = InstanceCache::new();
        assert!(to_object(&cache, &snapshot(json!({"child_type": "Risk"}))).is_none());
    }

    #[test]
    fn query_targets_snapshots_of_child_type() {
        let request = QueryRequest::build("Control", None, &[], FilterQuery::default());
        let snap = transform_query(request);
        assert_eq!(snap.object_name, SNAPSHOT_TYPE);
        assert_eq!(
            snap.filters.expression.to_string(),
            r#""child_type" = "Control""#
        );
        assert!(is_snapshot_related("Audit", "Control"));
        assert!(!is_snapshot_related("Program", "Control"));
    }
}
