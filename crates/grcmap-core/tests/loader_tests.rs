//! Behavior of each loader kind against in-memory collaborators.

mod support;

use async_trait::async_trait;
use grcmap_core::{
    cross, custom_filter, direct, multi, proxy, reify, search, stub_filter, type_filter,
    LoadError, MappingContext, MappingResult, Mappings, QueryFilter, RelevantSearch,
    ResultFilter, TypeMappings,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use support::{key, keys, loaded, reference, settle, stub, FakeFetcher, FakeQueryService};

fn relationships() -> TypeMappings {
    TypeMappings::new()
        .define(
            "related_sources",
            proxy(None, "source", "Relationship", "destination", "related_sources"),
        )
        .define(
            "related_destinations",
            proxy(None, "destination", "Relationship", "source", "related_destinations"),
        )
        .define(
            "related_objects",
            multi(["related_sources", "related_destinations"]),
        )
        .define("related_risks", type_filter("related_objects", ["Risk"]))
        .define("related_programs", type_filter("related_objects", ["Program"]))
}

fn mappings() -> Mappings {
    let active = QueryFilter::parse("status = Active").unwrap();
    Mappings::builder()
        .fragment("relationships", relationships())
        .entry(
            "Control",
            TypeMappings::new()
                .mixin("relationships")
                .define(
                    "non_objectives",
                    stub_filter("related_objects", |r| {
                        r.instance().is_some_and(|i| i.model() != "Objective")
                    }),
                )
                .define("active_objects", custom_filter("related_objects", Arc::new(active)))
                .define("program_audits", cross("related_programs", "audits")),
        )
        .entry(
            "Program",
            TypeMappings::new()
                .mixin("relationships")
                .define("audits", direct("Audit", "program", "audits"))
                .define("owned_audits", direct("Audit", "owner", "owned_audits"))
                .define("all_audits", multi(["audits", "owned_audits"]))
                .define("loaded_audits", reify("audits")),
        )
        .entry(
            "Audit",
            TypeMappings::new().define(
                "snapshots",
                search(Arc::new(RelevantSearch::new("Snapshot")), ["Snapshot"]),
            ),
        )
        .build()
        .unwrap()
}

fn relationship(fetcher: &FakeFetcher, id: u64, source: (&str, u64), destination: (&str, u64)) {
    fetcher.insert(
        "Relationship",
        id,
        json!({
            "source": reference(source.0, source.1),
            "destination": reference(destination.0, destination.1),
        }),
    );
}

/// Control#1 related to Risk#5 (both directions), Objective#6, Program#20
/// and System#8. Audit#30 belongs to Program#20, which also owns it.
fn fixture() -> Arc<FakeFetcher> {
    let fetcher = FakeFetcher::new();
    fetcher.insert(
        "Control",
        1,
        json!({
            "title": "Access reviews",
            "related_sources": [
                reference("Relationship", 100),
                reference("Relationship", 101),
                reference("Relationship", 105),
            ],
            "related_destinations": [
                reference("Relationship", 103),
                reference("Relationship", 104),
            ],
        }),
    );
    relationship(&fetcher, 100, ("Risk", 5), ("Control", 1));
    relationship(&fetcher, 101, ("Objective", 6), ("Control", 1));
    relationship(&fetcher, 105, ("Program", 20), ("Control", 1));
    relationship(&fetcher, 103, ("Control", 1), ("System", 8));
    relationship(&fetcher, 104, ("Control", 1), ("Risk", 5));
    fetcher.insert(
        "Program",
        20,
        json!({
            "audits": [reference("Audit", 30)],
            "owned_audits": [reference("Audit", 30)],
        }),
    );
    fetcher.insert(
        "Audit",
        30,
        json!({"program": reference("Program", 20), "owner": reference("Program", 20)}),
    );
    fetcher.insert("Audit", 33, json!({"title": "Late audit", "program": reference("Program", 20)}));
    fetcher
}

fn setup() -> (Arc<MappingContext>, Arc<FakeFetcher>) {
    support::init_tracing();
    let fetcher = fixture();
    let ctx = support::context(mappings(), &fetcher);
    (ctx, fetcher)
}

/// A new join record, announced as created.
fn create_relationship(ctx: &MappingContext, id: u64, source: (&str, u64), destination: (&str, u64)) {
    let join = loaded(
        ctx,
        "Relationship",
        id,
        json!({
            "source": reference(source.0, source.1),
            "destination": reference(destination.0, destination.1),
        }),
    );
    ctx.events().created(&join);
}

fn destroy(ctx: &MappingContext, model: &str, id: u64) {
    ctx.events().destroyed(&stub(ctx, model, id));
}

// ============================================================================
// Direct
// ============================================================================

#[tokio::test]
async fn direct_follows_foreign_keys() {
    let (ctx, _) = setup();
    let program = stub(&ctx, "Program", 20);
    let audits = ctx.get_binding(&program, "audits").unwrap();

    audits.refresh_stubs().await.unwrap();
    assert_eq!(keys(&audits), vec![key("Audit", 30)]);
    assert!(audits.list()[0].mappings()[0].is_edge());

    let new_audit = loaded(&ctx, "Audit", 31, json!({"program": reference("Program", 20)}));
    ctx.events().created(&new_audit);
    let elsewhere = loaded(&ctx, "Audit", 32, json!({"program": reference("Program", 21)}));
    ctx.events().created(&elsewhere);
    assert_eq!(keys(&audits), vec![key("Audit", 30), key("Audit", 31)]);

    // Moving an audit to another program drops it.
    new_audit.set_attr("program", reference("Program", 21));
    ctx.events().updated(&new_audit);
    assert_eq!(keys(&audits), vec![key("Audit", 30)]);

    destroy(&ctx, "Audit", 30);
    assert!(audits.is_empty());
}

#[tokio::test]
async fn direct_ignores_updates_without_the_foreign_key() {
    let (ctx, _) = setup();
    let program = stub(&ctx, "Program", 20);
    let audits = ctx.get_binding(&program, "audits").unwrap();
    audits.refresh_stubs().await.unwrap();

    // Audit#30 is listed from the program's collection and never loaded.
    let audit = stub(&ctx, "Audit", 30);
    assert_eq!(audit.attr("program"), None);
    audit.set_attr("owner", reference("Program", 20));
    ctx.events().updated(&audit);
    assert_eq!(keys(&audits), vec![key("Audit", 30)]);

    // Once the key is known to point elsewhere, the audit goes.
    audit.set_attr("program", json!(null));
    ctx.events().updated(&audit);
    assert!(audits.is_empty());
}

#[tokio::test]
async fn direct_picks_up_collection_changes() {
    let (ctx, _) = setup();
    let program = loaded(&ctx, "Program", 20, json!({"audits": []}));
    let audits = ctx.get_binding(&program, "audits").unwrap();
    audits.refresh_stubs().await.unwrap();
    assert!(audits.is_empty());

    program.set_attr("audits", json!([reference("Audit", 30), reference("Audit", 31)]));
    assert_eq!(keys(&audits), vec![key("Audit", 30), key("Audit", 31)]);
}

// ============================================================================
// Proxy and Multi
// ============================================================================

#[tokio::test]
async fn proxy_lists_join_targets() {
    let (ctx, _) = setup();
    let control = stub(&ctx, "Control", 1);
    let sources = ctx.get_binding(&control, "related_sources").unwrap();

    sources.refresh_stubs().await.unwrap();
    assert_eq!(
        keys(&sources),
        vec![key("Risk", 5), key("Objective", 6), key("Program", 20)]
    );
    let risk = sources.find(&key("Risk", 5)).unwrap();
    let join = MappingResult::direct(stub(&ctx, "Relationship", 100));
    assert!(risk.has_mapping(&join));
    settle().await;

    create_relationship(&ctx, 106, ("Policy", 7), ("Control", 1));
    create_relationship(&ctx, 107, ("Policy", 8), ("Control", 2));
    assert!(sources.contains(&key("Policy", 7)));
    assert!(!sources.contains(&key("Policy", 8)));

    destroy(&ctx, "Relationship", 100);
    assert!(!sources.contains(&key("Risk", 5)));
}

#[tokio::test]
async fn multi_unions_both_directions() {
    let (ctx, _) = setup();
    let control = stub(&ctx, "Control", 1);
    let related = ctx.get_binding(&control, "related_objects").unwrap();

    related.refresh_stubs().await.unwrap();
    assert_eq!(related.len(), 4);
    assert_eq!(related.find(&key("Risk", 5)).unwrap().mapping_count(), 2);
    assert!(related.contains(&key("System", 8)));
    settle().await;

    destroy(&ctx, "Relationship", 100);
    let risk = related.find(&key("Risk", 5)).unwrap();
    assert_eq!(risk.mapping_count(), 1);

    destroy(&ctx, "Relationship", 104);
    assert!(!related.contains(&key("Risk", 5)));
    assert_eq!(related.len(), 3);
}

#[tokio::test]
async fn multi_keeps_each_source_of_one_object() {
    let (ctx, _) = setup();
    let program = stub(&ctx, "Program", 20);
    let all = ctx.get_binding(&program, "all_audits").unwrap();

    all.refresh_stubs().await.unwrap();
    assert_eq!(keys(&all), vec![key("Audit", 30)]);
    assert_eq!(all.find(&key("Audit", 30)).unwrap().mapping_count(), 2);

    // Moved to another program but still owned here.
    let audit = stub(&ctx, "Audit", 30);
    audit.set_attr("owner", reference("Program", 20));
    audit.set_attr("program", reference("Program", 21));
    ctx.events().updated(&audit);

    let audits = ctx.get_binding(&program, "audits").unwrap();
    assert!(!audits.contains(&key("Audit", 30)));
    assert_eq!(keys(&all), vec![key("Audit", 30)]);
    assert_eq!(all.find(&key("Audit", 30)).unwrap().mapping_count(), 1);

    destroy(&ctx, "Audit", 30);
    assert!(all.is_empty());
}

// ============================================================================
// Filters
// ============================================================================

#[tokio::test]
async fn type_filter_keeps_matching_models() {
    let (ctx, _) = setup();
    let control = stub(&ctx, "Control", 1);
    let risks = ctx.get_binding(&control, "related_risks").unwrap();

    risks.refresh_stubs().await.unwrap();
    assert_eq!(keys(&risks), vec![key("Risk", 5)]);
    settle().await;

    create_relationship(&ctx, 108, ("Risk", 9), ("Control", 1));
    create_relationship(&ctx, 109, ("System", 10), ("Control", 1));
    assert_eq!(keys(&risks), vec![key("Risk", 5), key("Risk", 9)]);
}

#[tokio::test]
async fn stub_filter_waits_for_first_refresh() {
    let (ctx, _) = setup();
    let control = stub(&ctx, "Control", 1);
    let filtered = ctx.get_binding(&control, "non_objectives").unwrap();

    ctx.get_binding(&control, "related_objects")
        .unwrap()
        .refresh_stubs()
        .await
        .unwrap();
    assert!(filtered.is_empty());

    filtered.refresh_stubs().await.unwrap();
    assert_eq!(filtered.len(), 3);
    assert!(!filtered.contains(&key("Objective", 6)));
    settle().await;

    create_relationship(&ctx, 110, ("Objective", 11), ("Control", 1));
    create_relationship(&ctx, 111, ("Market", 12), ("Control", 1));
    assert!(!filtered.contains(&key("Objective", 11)));
    assert!(filtered.contains(&key("Market", 12)));
}

#[tokio::test]
async fn custom_filter_reevaluates_on_change() {
    let (ctx, _) = setup();
    let risk = loaded(&ctx, "Risk", 5, json!({"status": "Active"}));
    let objective = loaded(&ctx, "Objective", 6, json!({"status": "Draft"}));
    let control = stub(&ctx, "Control", 1);
    let active = ctx.get_binding(&control, "active_objects").unwrap();

    active.refresh_stubs().await.unwrap();
    settle().await;
    assert_eq!(keys(&active), vec![key("Risk", 5)]);

    objective.set_attr("status", json!("Active"));
    settle().await;
    assert!(active.contains(&key("Objective", 6)));

    risk.set_attr("status", json!("Retired"));
    settle().await;
    assert_eq!(keys(&active), vec![key("Objective", 6)]);
}

struct RejectObjectives;

#[async_trait]
impl ResultFilter for RejectObjectives {
    async fn evaluate(&self, result: &MappingResult) -> anyhow::Result<bool> {
        match result.instance() {
            Some(i) if i.model() == "Objective" => anyhow::bail!("permission lookup timed out"),
            _ => Ok(true),
        }
    }
}

#[tokio::test]
async fn failing_predicate_excludes_result() {
    let (ctx, _) = setup();
    let control = stub(&ctx, "Control", 1);
    let binding = custom_filter("related_objects", Arc::new(RejectObjectives))
        .attach(&ctx, &control)
        .unwrap();

    binding.refresh_stubs().await.unwrap();
    settle().await;
    assert_eq!(binding.len(), 3);
    assert!(!binding.contains(&key("Objective", 6)));
}

/// Takes its time approving active objects; rejects the rest at once.
struct SlowApproval;

#[async_trait]
impl ResultFilter for SlowApproval {
    async fn evaluate(&self, result: &MappingResult) -> anyhow::Result<bool> {
        let active = result.instance().and_then(|i| i.attr("status")) == Some(json!("Active"));
        if active {
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        Ok(active)
    }

    fn watched_attrs(&self) -> Vec<String> {
        vec!["status".to_string()]
    }
}

#[tokio::test]
async fn latest_filter_verdict_wins() {
    let (ctx, _) = setup();
    let program = stub(&ctx, "Program", 20);
    let binding = custom_filter("audits", Arc::new(SlowApproval))
        .attach(&ctx, &program)
        .unwrap();
    binding.refresh_stubs().await.unwrap();
    settle().await;
    assert!(binding.is_empty());

    // The slow approval of the first change finishes after the rejection of
    // the second.
    let audit = stub(&ctx, "Audit", 30);
    audit.set_attr("status", json!("Active"));
    tokio::time::sleep(Duration::from_millis(5)).await;
    audit.set_attr("status", json!("Closed"));
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(!binding.contains(&key("Audit", 30)));

    audit.set_attr("status", json!("Active"));
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(binding.contains(&key("Audit", 30)));
}

#[test]
fn runtime_driven_loaders_need_a_runtime() {
    let (ctx, _) = setup();
    let control = stub(&ctx, "Control", 1);
    let err = ctx.get_binding(&control, "related_sources").unwrap_err();
    assert!(matches!(err, LoadError::NoRuntime { loader: "proxy" }));
    let err = ctx.get_binding(&control, "related_objects").unwrap_err();
    assert!(matches!(err, LoadError::NoRuntime { .. }));

    // Direct bindings react synchronously.
    let program = stub(&ctx, "Program", 20);
    assert!(ctx.get_binding(&program, "audits").is_ok());
}

// ============================================================================
// Cross
// ============================================================================

#[tokio::test]
async fn cross_follows_remote_lists() {
    let (ctx, _) = setup();
    let control = stub(&ctx, "Control", 1);
    let audits = ctx.get_binding(&control, "program_audits").unwrap();

    audits.refresh_stubs().await.unwrap();
    assert_eq!(keys(&audits), vec![key("Audit", 30)]);
    let hop = audits.list()[0].mappings()[0].clone();
    assert_eq!(hop.key(), Some(&key("Program", 20)));

    let program = stub(&ctx, "Program", 20);
    let remote = ctx.get_binding(&program, "audits").unwrap();
    let new_audit = loaded(&ctx, "Audit", 31, json!({"program": reference("Program", 20)}));
    ctx.events().created(&new_audit);
    assert!(audits.contains(&key("Audit", 31)));
    settle().await;

    // Unrelating the program drops its audits and stops listening to them.
    destroy(&ctx, "Relationship", 105);
    assert!(audits.is_empty());

    let later = loaded(&ctx, "Audit", 34, json!({"program": reference("Program", 20)}));
    ctx.events().created(&later);
    assert!(remote.contains(&key("Audit", 34)));
    assert!(audits.is_empty());
}

// ============================================================================
// Reifying
// ============================================================================

#[tokio::test]
async fn reifying_lists_only_loaded_instances() {
    let (ctx, fetcher) = setup();
    let program = stub(&ctx, "Program", 20);
    ctx.get_binding(&program, "audits")
        .unwrap()
        .refresh_stubs()
        .await
        .unwrap();

    let loaded_audits = ctx.get_binding(&program, "loaded_audits").unwrap();
    assert!(loaded_audits.is_empty());

    loaded_audits.refresh_stubs().await.unwrap();
    assert_eq!(keys(&loaded_audits), vec![key("Audit", 30)]);
    assert!(loaded_audits.instances()[0].is_reified());

    let late = stub(&ctx, "Audit", 33);
    late.set_attr("program", reference("Program", 20));
    ctx.events().created(&late);
    assert!(!loaded_audits.contains(&key("Audit", 33)));
    settle().await;
    assert!(loaded_audits.contains(&key("Audit", 33)));
    assert_eq!(late.attr("title"), Some(json!("Late audit")));
    assert!(fetcher.calls().iter().any(|(m, ids)| m == "Audit" && ids == &[33]));
}

// ============================================================================
// Search
// ============================================================================

fn snapshot_record(id: u64, child_type: &str, child_id: u64, title: &str) -> serde_json::Value {
    json!({
        "id": id,
        "type": "Snapshot",
        "child_type": child_type,
        "child_id": child_id,
        "revision": {"content": {"title": title}},
    })
}

#[tokio::test]
async fn search_lists_pinned_objects() {
    support::init_tracing();
    let fetcher = fixture();
    let service = FakeQueryService::new();
    service.set("Snapshot", vec![snapshot_record(70, "Control", 3, "Pinned control")]);
    let ctx = MappingContext::builder(mappings(), fetcher)
        .query_service(service.clone())
        .build();

    let audit = stub(&ctx, "Audit", 40);
    let snapshots = ctx.get_binding(&audit, "snapshots").unwrap();
    snapshots.refresh_stubs().await.unwrap();

    assert_eq!(keys(&snapshots), vec![key("Control", 3)]);
    let pinned = snapshots.instances()[0].clone();
    assert_eq!(pinned.attr("title"), Some(json!("Pinned control")));
    assert!(grcmap_core::snapshot::is_snapshot_object(&pinned));
    assert_eq!(service.batches()[0][0].object_name, "Snapshot");

    service.set(
        "Snapshot",
        vec![
            snapshot_record(70, "Control", 3, "Pinned control"),
            snapshot_record(71, "Risk", 4, "Pinned risk"),
        ],
    );
    ctx.events().created(&stub(&ctx, "Snapshot", 71));
    settle().await;
    assert_eq!(keys(&snapshots), vec![key("Control", 3), key("Risk", 4)]);

    let gone = ctx.instances().find_in_cache(&key("Snapshot", 70)).unwrap();
    ctx.events().destroyed(&gone);
    assert_eq!(keys(&snapshots), vec![key("Risk", 4)]);
}
