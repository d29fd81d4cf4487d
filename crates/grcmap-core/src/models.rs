//! Model metadata
//!
//! Static per-type descriptors, looked up by type name. Unknown names are
//! simply absent.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tree-view column offered for a type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeColumn {
    pub attr_name: String,
    pub attr_title: String,
    /// Always shown, whatever the user picked.
    #[serde(default)]
    pub mandatory: bool,
}

impl TreeColumn {
    pub fn new(attr_name: impl Into<String>, attr_title: impl Into<String>) -> Self {
        Self {
            attr_name: attr_name.into(),
            attr_title: attr_title.into(),
            mandatory: false,
        }
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeViewConfig {
    pub columns: Vec<TreeColumn>,
    /// Columns shown when the user has no stored selection.
    pub default_columns: Vec<String>,
}

impl TreeViewConfig {
    /// `selection` restricted to known columns, with mandatory columns
    /// first. An empty result falls back to the defaults.
    pub fn resolve_columns(&self, selection: &[String]) -> Vec<String> {
        let known = |name: &String| self.columns.iter().any(|c| &c.attr_name == name);
        let mut out: Vec<String> = self
            .columns
            .iter()
            .filter(|c| c.mandatory)
            .map(|c| c.attr_name.clone())
            .collect();
        let picked: Vec<&String> = selection.iter().filter(|name| known(*name)).collect();
        let chosen = if picked.is_empty() {
            self.default_columns.iter().filter(|name| known(*name)).collect()
        } else {
            picked
        };
        for name in chosen {
            if !out.contains(name) {
                out.push(name.clone());
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub model_singular: String,
    pub title_singular: String,
    pub title_plural: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tree_view: TreeViewConfig,
}

impl ModelDescriptor {
    pub fn new(
        model_singular: impl Into<String>,
        title_singular: impl Into<String>,
        title_plural: impl Into<String>,
    ) -> Self {
        Self {
            model_singular: model_singular.into(),
            title_singular: title_singular.into(),
            title_plural: title_plural.into(),
            category: None,
            tree_view: TreeViewConfig::default(),
        }
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn tree_view(mut self, tree_view: TreeViewConfig) -> Self {
        self.tree_view = tree_view;
        self
    }
}

// ============================================================================
// Grouping
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeEntry {
    /// Display name.
    pub name: String,
    /// Model name.
    pub value: String,
    pub plural: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeGroup {
    pub name: String,
    pub items: Vec<TypeEntry>,
}

impl TypeGroup {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            items: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeGroups {
    pub entities: TypeGroup,
    pub scope: TypeGroup,
    pub governance: TypeGroup,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelRegistry {
    models: BTreeMap<String, ModelDescriptor>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: ModelDescriptor) {
        self.models
            .insert(descriptor.model_singular.clone(), descriptor);
    }

    pub fn with(mut self, descriptor: ModelDescriptor) -> Self {
        self.register(descriptor);
        self
    }

    pub fn get_model_by_type(&self, name: &str) -> Option<&ModelDescriptor> {
        self.models.get(name)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Bucket `names` by category: `entities`, `scope`, and everything else
    /// under governance. Unknown names are skipped; each group is sorted by
    /// display name.
    pub fn group_types<S: AsRef<str>>(&self, names: impl IntoIterator<Item = S>) -> TypeGroups {
        let mut groups = TypeGroups {
            entities: TypeGroup::named("People/Groups"),
            scope: TypeGroup::named("Scope"),
            governance: TypeGroup::named("Governance"),
        };

        for name in names {
            let Some(model) = self.get_model_by_type(name.as_ref()) else {
                continue;
            };
            let group = match model.category.as_deref() {
                Some("entities") => &mut groups.entities,
                Some("scope") => &mut groups.scope,
                _ => &mut groups.governance,
            };
            if group.items.iter().any(|e| e.value == model.model_singular) {
                continue;
            }
            group.items.push(TypeEntry {
                name: model.title_singular.clone(),
                value: model.model_singular.clone(),
                plural: model.title_plural.clone(),
            });
        }

        for group in [&mut groups.entities, &mut groups.scope, &mut groups.governance] {
            group.items.sort_by(|a, b| a.name.cmp(&b.name));
        }
        groups
    }
}
