//! Reference GRC configuration
//!
//! Programs own audits; audits collect assessments and issues and see
//! governance and scope objects as snapshots; governance and scope objects
//! relate to each other through generic `Relationship` join records. People
//! are mapped through roles, outside the relationship table.
//!
//! Unmapping is configured apart from mapping: an issue can be mapped to an
//! audit but never unmapped from it, and an audit never leaves its program.

use crate::error::ConfigError;
use crate::loader::{QueryFilter, RelevantSearch};
use crate::mappings::{
    cross, custom_filter, direct, multi, proxy, reify, search, stub_filter, type_filter, Mappings,
    MappingsBuilder, TypeMappings,
};
use crate::models::{ModelDescriptor, ModelRegistry, TreeColumn, TreeViewConfig};
use crate::snapshot::SNAPSHOTTABLE_TYPES;
use grcmap_query::{ComparisonOp, Expression, FilterQuery};
use serde_json::Value;
use std::sync::Arc;

pub const GOVERNANCE_TYPES: &[&str] = &[
    "Clause",
    "Contract",
    "Control",
    "Objective",
    "Policy",
    "Regulation",
    "Risk",
    "Section",
    "Standard",
    "Threat",
];

pub const SCOPE_TYPES: &[&str] = &[
    "AccessGroup",
    "DataAsset",
    "Facility",
    "Market",
    "OrgGroup",
    "Process",
    "Product",
    "Project",
    "System",
    "Vendor",
];

/// Types listed through their own `related_<plural>` filter.
const FILTERED_LISTS: &[(&str, &str)] = &[
    ("related_programs", "Program"),
    ("related_audits", "Audit"),
    ("related_assessments", "Assessment"),
    ("related_issues", "Issue"),
    ("related_controls", "Control"),
    ("related_risks", "Risk"),
    ("related_systems", "System"),
    ("related_people", "Person"),
];

fn governance_and_scope() -> impl Iterator<Item = &'static str> {
    GOVERNANCE_TYPES.iter().chain(SCOPE_TYPES).copied()
}

fn relationships() -> TypeMappings {
    let mut fragment = TypeMappings::new()
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
        );
    for (name, model) in FILTERED_LISTS {
        fragment = fragment.define(*name, type_filter("related_objects", [*model]));
    }
    fragment
}

fn governance_object() -> TypeMappings {
    let peers: Vec<&str> = governance_and_scope().chain(["Program", "Issue"]).collect();
    TypeMappings::new()
        .mixin("relationships")
        .canonical("related_objects", peers.iter().copied())
        .unmappable(peers)
        .related(["Audit", "Assessment"])
        .external(["Person"])
        .define("audits_via_programs", cross("related_programs", "audits"))
}

fn program() -> TypeMappings {
    let peers: Vec<&str> = governance_and_scope().chain(["Issue"]).collect();
    TypeMappings::new()
        .mixin("relationships")
        .canonical("related_objects", peers.iter().copied())
        .canonical("audits", ["Audit"])
        .creatable(peers.iter().copied().chain(["Audit"]))
        .unmappable(peers)
        .external(["Person"])
        .define("audits", direct("Audit", "program", "audits"))
        .define("loaded_audits", reify("audits"))
}

fn is_open(status: Option<Value>) -> bool {
    !matches!(status.as_ref().and_then(Value::as_str), Some("Deprecated"))
}

fn audit() -> TypeMappings {
    let open_assessments = QueryFilter::new(FilterQuery::new(Expression::comparison(
        "status",
        ComparisonOp::NotEq,
        "Completed",
    )));
    TypeMappings::new()
        .mixin("relationships")
        .canonical(
            "related_objects",
            SNAPSHOTTABLE_TYPES.iter().copied().chain(["Issue", "Assessment"]),
        )
        .creatable(["Assessment", "Issue"])
        .unmappable(SNAPSHOTTABLE_TYPES.iter().copied())
        .related(["Program"])
        .external(["Person"])
        .define(
            "snapshots",
            search(Arc::new(RelevantSearch::new("Snapshot")), ["Snapshot"]),
        )
        .define("program_controls", cross("related_programs", "related_controls"))
        .define(
            "open_assessments",
            custom_filter("related_assessments", Arc::new(open_assessments)),
        )
        .define(
            "active_issues",
            stub_filter("related_issues", |result| {
                result.instance().is_some_and(|i| is_open(i.attr("status")))
            }),
        )
        .define("loaded_assessments", reify("related_assessments"))
}

fn issue() -> TypeMappings {
    let peers: Vec<&str> = governance_and_scope().chain(["Program"]).collect();
    TypeMappings::new()
        .mixin("relationships")
        .canonical(
            "related_objects",
            peers.iter().copied().chain(["Audit", "Assessment"]),
        )
        .unmappable(peers)
        .external(["Person"])
}

fn assessment() -> TypeMappings {
    TypeMappings::new()
        .mixin("relationships")
        .canonical(
            "related_objects",
            SNAPSHOTTABLE_TYPES.iter().copied().chain(["Issue"]),
        )
        .unmappable(SNAPSHOTTABLE_TYPES.iter().copied().chain(["Issue"]))
        .related(["Audit"])
        .external(["Person"])
}

/// The reference registry.
pub fn ggrc_mappings() -> Result<Mappings, ConfigError> {
    let mut builder: MappingsBuilder = Mappings::builder()
        .fragment("relationships", relationships())
        .fragment("governance_object", governance_object())
        .entry("Program", program())
        .entry("Audit", audit())
        .entry("Issue", issue())
        .entry("Assessment", assessment())
        .entry(
            "Person",
            TypeMappings::new()
                .mixin("relationships")
                .related(["Program", "Audit"]),
        );
    for model in governance_and_scope() {
        builder = builder.entry(model, TypeMappings::new().mixin("governance_object"));
    }
    builder.build()
}

fn standard_tree_view() -> TreeViewConfig {
    TreeViewConfig {
        columns: vec![
            TreeColumn::new("title", "Title").mandatory(),
            TreeColumn::new("status", "State"),
            TreeColumn::new("owners", "Owners"),
            TreeColumn::new("updated_at", "Last Updated"),
        ],
        default_columns: vec!["status".into(), "owners".into()],
    }
}

fn plural(model: &str) -> String {
    match model {
        "Person" => "People".into(),
        "Policy" => "Policies".into(),
        "Process" => "Processes".into(),
        "Facility" => "Facilities".into(),
        _ => format!("{model}s"),
    }
}

fn title(model: &str) -> String {
    match model {
        "OrgGroup" => "Org Group".into(),
        "DataAsset" => "Data Asset".into(),
        "AccessGroup" => "Access Group".into(),
        _ => model.into(),
    }
}

fn descriptor(model: &str, category: Option<&str>) -> ModelDescriptor {
    let title_singular = title(model);
    let title_plural = plural(&title_singular);
    let descriptor = ModelDescriptor::new(model, title_singular, title_plural)
        .tree_view(standard_tree_view());
    match category {
        Some(category) => descriptor.category(category),
        None => descriptor,
    }
}

/// Metadata for every type of the reference registry.
pub fn ggrc_models() -> ModelRegistry {
    let mut models = ModelRegistry::new();
    for model in GOVERNANCE_TYPES {
        models.register(descriptor(model, Some("governance")));
    }
    for model in SCOPE_TYPES {
        let category = match *model {
            "OrgGroup" | "Vendor" | "AccessGroup" => "entities",
            _ => "scope",
        };
        models.register(descriptor(model, Some(category)));
    }
    models.register(descriptor("Person", Some("entities")));
    models.register(descriptor("Program", Some("programs")));
    for model in ["Audit", "Assessment", "Issue"] {
        models.register(descriptor(model, None));
    }
    models
}
