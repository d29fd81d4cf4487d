//! Registry queries and permission rules over the reference configuration.

mod support;

use grcmap_core::reference::{ggrc_mappings, ggrc_models};
use grcmap_core::{Instance, MapSubject, MappingContext};
use serde_json::json;
use std::sync::Arc;
use support::{attrs, loaded, CountingOracle, FakeFetcher};

fn context(oracle: &Arc<CountingOracle>) -> Arc<MappingContext> {
    MappingContext::builder(ggrc_mappings().unwrap(), FakeFetcher::new())
        .models(ggrc_models())
        .permissions(oracle.clone())
        .build()
}

#[test]
fn unrelated_types_never_reach_the_oracle() {
    let oracle = CountingOracle::new(true);
    let ctx = context(&oracle);

    let pairs = [("Widget", "Gadget"), ("Person", "Assessment"), ("Control", "Widget")];
    for (source, target) in pairs {
        let (source, target) = (MapSubject::from(source), MapSubject::from(target));
        assert!(!ctx.allowed_to_map(&source, &target));
        assert!(!ctx.allowed_to_create(&source, &target));
        assert!(!ctx.allowed_to_unmap(&source, &target));
    }

    let person = MapSubject::from(loaded(&ctx, "Person", 1, json!({})));
    let assessment = MapSubject::from(loaded(&ctx, "Assessment", 2, json!({})));
    assert!(!ctx.allowed_to_map(&person, &assessment));
    assert_eq!(oracle.calls(), 0);
}

#[test]
fn allowed_pairs_ask_the_oracle() {
    let oracle = CountingOracle::new(true);
    let ctx = context(&oracle);
    let program = MapSubject::from(loaded(&ctx, "Program", 1, json!({})));
    let control = MapSubject::from(loaded(&ctx, "Control", 2, json!({})));

    assert!(ctx.allowed_to_map(&program, &control));
    assert_eq!(oracle.calls(), 2);

    let denied = CountingOracle::new(false);
    let ctx = context(&denied);
    let program = MapSubject::from(loaded(&ctx, "Program", 1, json!({})));
    assert!(!ctx.allowed_to_map(&program, &MapSubject::from("Control")));
}

#[test]
fn unsaved_source_skips_update_check() {
    let oracle = CountingOracle::new(false);
    let ctx = context(&oracle);
    let draft = MapSubject::from(Arc::new(Instance::unsaved("Program", attrs(json!({})))));

    assert!(ctx.allowed_to_create(&draft, &MapSubject::from("Audit")));
    assert_eq!(oracle.calls(), 0);
}

#[test]
fn map_and_unmap_rules_are_independent() {
    let oracle = CountingOracle::new(true);
    let ctx = context(&oracle);
    let audit = MapSubject::from(loaded(&ctx, "Audit", 1, json!({})));
    let issue = MapSubject::from(loaded(&ctx, "Issue", 2, json!({})));

    assert!(ctx.allowed_to_map(&audit, &issue));
    assert!(!ctx.allowed_to_unmap(&audit, &issue));
    assert!(ctx.allowed_to_map(&issue, &audit));
    assert!(!ctx.allowed_to_unmap(&issue, &audit));
}

#[test]
fn snapshots_are_ruled_by_their_child_type() {
    let oracle = CountingOracle::new(true);
    let ctx = context(&oracle);
    let audit = MapSubject::from(loaded(&ctx, "Audit", 1, json!({})));
    let snapshot = MapSubject::from(loaded(
        &ctx,
        "Snapshot",
        9,
        json!({"child_type": "Control", "child_id": 4}),
    ));

    assert_eq!(ctx.mappings().get_type(&snapshot), "Control");
    assert!(ctx.allowed_to_map(&audit, &snapshot));
    assert!(ctx.allowed_to_unmap(&audit, &snapshot));
}

#[test]
fn available_mappings_are_grouped_for_display() {
    let oracle = CountingOracle::new(true);
    let ctx = context(&oracle);

    let available = ctx.mappings().get_available_mappings("Control", ctx.models());
    assert!(available.contains_key("Audit"));
    assert!(available.contains_key("Person"));
    assert!(!available.contains_key("Relationship"));

    let groups = ctx.models().group_types(available.keys());
    let names = |items: &[grcmap_core::models::TypeEntry]| {
        items.iter().map(|e| e.value.clone()).collect::<Vec<_>>()
    };
    assert!(names(&groups.entities.items).contains(&"Person".to_string()));
    assert!(names(&groups.scope.items).contains(&"System".to_string()));
    assert!(names(&groups.governance.items).contains(&"Risk".to_string()));
    assert!(groups
        .governance
        .items
        .windows(2)
        .all(|pair| pair[0].name <= pair[1].name));
}

#[test]
fn canonical_names_pick_the_direct_mapping() {
    let mappings = ggrc_mappings().unwrap();
    assert_eq!(mappings.get_canonical_mapping_name("Program", "Audit"), Some("audits"));
    assert_eq!(
        mappings.get_canonical_mapping_name("Audit", "Control"),
        Some("related_objects")
    );
    assert_eq!(mappings.get_canonical_mapping_name("Person", "Control"), None);

    let listed = mappings.get_mapping_list("Audit");
    assert!(listed.contains("Control") && listed.contains("Person"));
    assert_eq!(
        mappings.creatable_types("Audit").into_iter().collect::<Vec<_>>(),
        ["Assessment", "Issue"]
    );
    assert!(mappings.get_mappings_for("Audit").contains_key("snapshots"));
}
