//! Mappings registry
//!
//! The registry is built in two phases. [`MappingsBuilder`] first collects
//! every type entry and every reusable fragment; [`MappingsBuilder::build`]
//! then resolves each type's mixins in order (the type's own entries win),
//! rejects unknown or cyclic mixins, and checks that every named source a
//! loader reads from exists on the same type. The resulting [`Mappings`] is
//! immutable.

use crate::error::ConfigError;
use crate::instance::Instance;
use crate::loader::{
    CrossLoader, CustomFilterLoader, DirectLoader, ListLoader, MultiLoader, ProxyLoader,
    ReifyingLoader, ResultFilter, SearchLoader, SearchQuery, SourceRef, StubFilterLoader,
    TypeFilterLoader,
};
use crate::models::{ModelDescriptor, ModelRegistry};
use crate::result::MappingResult;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Loader factories
// ============================================================================

pub fn direct(
    model: impl Into<String>,
    remote_attr: impl Into<String>,
    instance_attr: impl Into<String>,
) -> Arc<ListLoader> {
    Arc::new(ListLoader::Direct(DirectLoader {
        model: model.into(),
        remote_attr: remote_attr.into(),
        instance_attr: instance_attr.into(),
    }))
}

/// Many-to-many through `join_model`: join records reference the owner in
/// `object_attr` and the member in `option_attr`; the owner lists its join
/// records in `instance_attr`. With `option_model`, members of other types
/// are ignored.
pub fn proxy(
    option_model: Option<&str>,
    option_attr: impl Into<String>,
    join_model: impl Into<String>,
    object_attr: impl Into<String>,
    instance_attr: impl Into<String>,
) -> Arc<ListLoader> {
    Arc::new(ListLoader::Proxy(ProxyLoader {
        option_model: option_model.map(str::to_string),
        option_attr: option_attr.into(),
        join_model: join_model.into(),
        object_attr: object_attr.into(),
        instance_attr: instance_attr.into(),
    }))
}

pub fn multi<S: Into<SourceRef>>(sources: impl IntoIterator<Item = S>) -> Arc<ListLoader> {
    Arc::new(ListLoader::Multi(MultiLoader {
        sources: sources.into_iter().map(Into::into).collect(),
    }))
}

pub fn type_filter<T: Into<String>>(
    source: impl Into<SourceRef>,
    types: impl IntoIterator<Item = T>,
) -> Arc<ListLoader> {
    Arc::new(ListLoader::TypeFilter(TypeFilterLoader {
        source: source.into(),
        types: types.into_iter().map(Into::into).collect(),
    }))
}

pub fn stub_filter(
    source: impl Into<SourceRef>,
    predicate: impl Fn(&MappingResult) -> bool + Send + Sync + 'static,
) -> Arc<ListLoader> {
    Arc::new(ListLoader::StubFilter(StubFilterLoader {
        source: source.into(),
        predicate: Arc::new(predicate),
    }))
}

pub fn custom_filter(
    source: impl Into<SourceRef>,
    filter: Arc<dyn ResultFilter>,
) -> Arc<ListLoader> {
    Arc::new(ListLoader::CustomFilter(CustomFilterLoader {
        source: source.into(),
        filter,
    }))
}

pub fn cross(local: impl Into<SourceRef>, remote: impl Into<String>) -> Arc<ListLoader> {
    Arc::new(ListLoader::Cross(CrossLoader {
        local: local.into(),
        remote: remote.into(),
    }))
}

pub fn reify(source: impl Into<SourceRef>) -> Arc<ListLoader> {
    Arc::new(ListLoader::Reifying(ReifyingLoader {
        source: source.into(),
    }))
}

pub fn search<T: Into<String>>(
    query: Arc<dyn SearchQuery>,
    observe_types: impl IntoIterator<Item = T>,
) -> Arc<ListLoader> {
    Arc::new(ListLoader::Search(SearchLoader {
        query,
        observe_types: observe_types.into_iter().map(Into::into).collect(),
    }))
}

// ============================================================================
// Permissions
// ============================================================================

/// Either a concrete object or just a type name.
#[derive(Debug, Clone)]
pub enum MapSubject {
    Instance(Arc<Instance>),
    Type(String),
}

impl MapSubject {
    pub fn is_new(&self) -> bool {
        matches!(self, Self::Instance(instance) if instance.is_new())
    }
}

impl From<Arc<Instance>> for MapSubject {
    fn from(instance: Arc<Instance>) -> Self {
        Self::Instance(instance)
    }
}

impl From<&Arc<Instance>> for MapSubject {
    fn from(instance: &Arc<Instance>) -> Self {
        Self::Instance(Arc::clone(instance))
    }
}

impl From<&str> for MapSubject {
    fn from(model: &str) -> Self {
        Self::Type(model.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Read,
    Update,
}

pub trait PermissionOracle: Send + Sync {
    fn is_allowed_for(&self, action: Action, subject: &MapSubject) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PermissionOracle for AllowAll {
    fn is_allowed_for(&self, _action: Action, _subject: &MapSubject) -> bool {
        true
    }
}

// ============================================================================
// Type entries
// ============================================================================

/// Mapping rules for one type, or a reusable fragment of them.
#[derive(Clone, Default)]
pub struct TypeMappings {
    mixins: Vec<String>,
    canonical: BTreeMap<String, BTreeSet<String>>,
    related: BTreeSet<String>,
    external: BTreeSet<String>,
    creatable: Option<BTreeSet<String>>,
    unmappable: BTreeSet<String>,
    definitions: BTreeMap<String, Arc<ListLoader>>,
}

impl fmt::Debug for TypeMappings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeMappings")
            .field("mixins", &self.mixins)
            .field("canonical", &self.canonical)
            .field("definitions", &self.definitions.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn strings<T: Into<String>>(items: impl IntoIterator<Item = T>) -> impl Iterator<Item = String> {
    items.into_iter().map(Into::into)
}

impl TypeMappings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge the named entry in before this one. Mixins apply in call order.
    pub fn mixin(mut self, name: impl Into<String>) -> Self {
        self.mixins.push(name.into());
        self
    }

    /// `types` are mapped directly through the mapping called `mapping`.
    pub fn canonical<T: Into<String>>(
        mut self,
        mapping: impl Into<String>,
        types: impl IntoIterator<Item = T>,
    ) -> Self {
        self.canonical
            .entry(mapping.into())
            .or_default()
            .extend(strings(types));
        self
    }

    /// Types reachable indirectly; listed but not directly mappable.
    pub fn related<T: Into<String>>(mut self, types: impl IntoIterator<Item = T>) -> Self {
        self.related.extend(strings(types));
        self
    }

    /// Types mapped through an outside mechanism, still mappable.
    pub fn external<T: Into<String>>(mut self, types: impl IntoIterator<Item = T>) -> Self {
        self.external.extend(strings(types));
        self
    }

    /// Types that may be created in place. Without this, the canonical types.
    pub fn creatable<T: Into<String>>(mut self, types: impl IntoIterator<Item = T>) -> Self {
        self.creatable
            .get_or_insert_with(BTreeSet::new)
            .extend(strings(types));
        self
    }

    pub fn unmappable<T: Into<String>>(mut self, types: impl IntoIterator<Item = T>) -> Self {
        self.unmappable.extend(strings(types));
        self
    }

    pub fn define(mut self, name: impl Into<String>, loader: Arc<ListLoader>) -> Self {
        self.definitions.insert(name.into(), loader);
        self
    }

    /// Lay `over` on top of `self`: sets are unioned, keyed entries and an
    /// explicit creatable set from `over` replace ours.
    fn merge(&mut self, over: &TypeMappings) {
        for (mapping, types) in &over.canonical {
            self.canonical.insert(mapping.clone(), types.clone());
        }
        self.related.extend(over.related.iter().cloned());
        self.external.extend(over.external.iter().cloned());
        if let Some(creatable) = &over.creatable {
            self.creatable = Some(creatable.clone());
        }
        self.unmappable.extend(over.unmappable.iter().cloned());
        for (name, loader) in &over.definitions {
            self.definitions.insert(name.clone(), Arc::clone(loader));
        }
    }

    fn mappable(&self) -> impl Iterator<Item = &String> {
        self.canonical.values().flatten()
    }

    fn can_map(&self, target: &str) -> bool {
        self.mappable().any(|t| t == target) || self.external.contains(target)
    }

    fn can_create(&self, target: &str) -> bool {
        match &self.creatable {
            Some(creatable) => creatable.contains(target),
            None => self.mappable().any(|t| t == target),
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

#[derive(Debug, Default)]
pub struct MappingsBuilder {
    entries: BTreeMap<String, TypeMappings>,
    fragments: BTreeMap<String, TypeMappings>,
    duplicates: Vec<String>,
}

impl MappingsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rules of a concrete type.
    pub fn entry(mut self, model: impl Into<String>, mappings: TypeMappings) -> Self {
        let model = model.into();
        if self.fragments.contains_key(&model) || self.entries.contains_key(&model) {
            self.duplicates.push(model.clone());
        }
        self.entries.insert(model, mappings);
        self
    }

    /// A named fragment that only exists to be mixed in.
    pub fn fragment(mut self, name: impl Into<String>, mappings: TypeMappings) -> Self {
        let name = name.into();
        if self.fragments.contains_key(&name) || self.entries.contains_key(&name) {
            self.duplicates.push(name.clone());
        }
        self.fragments.insert(name, mappings);
        self
    }

    pub fn build(self) -> Result<Mappings, ConfigError> {
        if let Some(name) = self.duplicates.into_iter().next() {
            return Err(ConfigError::DuplicateType(name));
        }

        let mut resolved = BTreeMap::new();
        for model in self.entries.keys() {
            let mut stack = Vec::new();
            let effective = resolve(&self.entries, &self.fragments, model, &mut stack)?;
            check_sources(model, &effective)?;
            resolved.insert(model.clone(), effective);
        }
        tracing::debug!(types = resolved.len(), "mappings registry built");
        Ok(Mappings { types: resolved })
    }
}

fn resolve(
    entries: &BTreeMap<String, TypeMappings>,
    fragments: &BTreeMap<String, TypeMappings>,
    name: &str,
    stack: &mut Vec<String>,
) -> Result<TypeMappings, ConfigError> {
    if stack.iter().any(|s| s == name) {
        let mut chain = stack.clone();
        chain.push(name.to_string());
        return Err(ConfigError::CyclicMixin { chain });
    }
    let own = match entries.get(name).or_else(|| fragments.get(name)) {
        Some(own) => own,
        None => {
            return Err(ConfigError::UnknownMixin {
                model: stack.last().cloned().unwrap_or_default(),
                mixin: name.to_string(),
            })
        }
    };

    stack.push(name.to_string());
    let mut effective = TypeMappings::default();
    for mixin in &own.mixins {
        let inherited = resolve(entries, fragments, mixin, stack)?;
        effective.merge(&inherited);
    }
    stack.pop();

    effective.merge(own);
    effective.mixins = own.mixins.clone();
    Ok(effective)
}

/// Every named source exists on the type, and named sources never loop back.
fn check_sources(model: &str, mappings: &TypeMappings) -> Result<(), ConfigError> {
    for (mapping, loader) in &mappings.definitions {
        for source in loader.local_names() {
            if !mappings.definitions.contains_key(&source) {
                return Err(ConfigError::UnknownSource {
                    model: model.to_string(),
                    mapping: mapping.clone(),
                    source_name: source,
                });
            }
        }
    }

    fn visit(
        model: &str,
        mappings: &TypeMappings,
        name: &str,
        path: &mut Vec<String>,
        done: &mut BTreeSet<String>,
    ) -> Result<(), ConfigError> {
        if done.contains(name) {
            return Ok(());
        }
        if let Some(start) = path.iter().position(|p| p == name) {
            let mut chain = path[start..].to_vec();
            chain.push(name.to_string());
            return Err(ConfigError::CyclicSource {
                model: model.to_string(),
                chain,
            });
        }
        path.push(name.to_string());
        if let Some(loader) = mappings.definitions.get(name) {
            for source in loader.local_names() {
                visit(model, mappings, &source, path, done)?;
            }
        }
        path.pop();
        done.insert(name.to_string());
        Ok(())
    }

    let mut done = BTreeSet::new();
    for name in mappings.definitions.keys() {
        visit(model, mappings, name, &mut Vec::new(), &mut done)?;
    }
    Ok(())
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Debug, Default)]
pub struct Mappings {
    types: BTreeMap<String, TypeMappings>,
}

impl Mappings {
    pub fn builder() -> MappingsBuilder {
        MappingsBuilder::new()
    }

    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    /// Type used for rule lookups: snapshots count as the type they pin.
    pub fn get_type(&self, subject: &MapSubject) -> String {
        match subject {
            MapSubject::Instance(instance) => instance.effective_type(),
            MapSubject::Type(model) => model.clone(),
        }
    }

    /// Types the mapper offers for `model`: the canonical and external ones.
    pub fn get_mapping_list(&self, model: &str) -> BTreeSet<String> {
        self.types
            .get(model)
            .map(|entry| entry.mappable().chain(&entry.external).cloned().collect())
            .unwrap_or_default()
    }

    /// Descriptors of every type `model` can relate to: mappable, related,
    /// external and creatable. Types without metadata are left out.
    pub fn get_available_mappings<'m>(
        &self,
        model: &str,
        models: &'m ModelRegistry,
    ) -> BTreeMap<String, &'m ModelDescriptor> {
        let Some(entry) = self.types.get(model) else {
            return BTreeMap::new();
        };
        entry
            .mappable()
            .chain(&entry.related)
            .chain(&entry.external)
            .chain(entry.creatable.iter().flatten())
            .filter_map(|name| {
                models
                    .get_model_by_type(name)
                    .map(|descriptor| (name.clone(), descriptor))
            })
            .collect()
    }

    /// Every named mapping defined for `model`.
    pub fn get_mappings_for(&self, model: &str) -> BTreeMap<String, Arc<ListLoader>> {
        self.types
            .get(model)
            .map(|entry| entry.definitions.clone())
            .unwrap_or_default()
    }

    /// The mapping through which `model` maps `target` directly.
    pub fn get_canonical_mapping_name(&self, model: &str, target: &str) -> Option<&str> {
        self.types
            .get(model)?
            .canonical
            .iter()
            .find(|(_, types)| types.contains(target))
            .map(|(mapping, _)| mapping.as_str())
    }

    pub fn get_list_loader(&self, model: &str, mapping: &str) -> Option<Arc<ListLoader>> {
        self.types.get(model)?.definitions.get(mapping).cloned()
    }

    pub fn creatable_types(&self, model: &str) -> BTreeSet<String> {
        match self.types.get(model) {
            Some(TypeMappings {
                creatable: Some(creatable),
                ..
            }) => creatable.clone(),
            Some(entry) => entry.mappable().cloned().collect(),
            None => BTreeSet::new(),
        }
    }

    pub fn allowed_to_map(
        &self,
        source: &MapSubject,
        target: &MapSubject,
        oracle: &dyn PermissionOracle,
    ) -> bool {
        self.allowed(source, target, oracle, TypeMappings::can_map)
    }

    pub fn allowed_to_create(
        &self,
        source: &MapSubject,
        target: &MapSubject,
        oracle: &dyn PermissionOracle,
    ) -> bool {
        self.allowed(source, target, oracle, TypeMappings::can_create)
    }

    /// Checked against the unmap allow-list, which is configured separately
    /// from the map rules.
    pub fn allowed_to_unmap(
        &self,
        source: &MapSubject,
        target: &MapSubject,
        oracle: &dyn PermissionOracle,
    ) -> bool {
        self.allowed(source, target, oracle, |entry, target| {
            entry.unmappable.contains(target)
        })
    }

    fn allowed(
        &self,
        source: &MapSubject,
        target: &MapSubject,
        oracle: &dyn PermissionOracle,
        rule: impl Fn(&TypeMappings, &str) -> bool,
    ) -> bool {
        let source_type = self.get_type(source);
        let target_type = self.get_type(target);
        let Some(entry) = self.types.get(&source_type) else {
            return false;
        };
        // The rules decide before the oracle is ever asked.
        if !rule(entry, &target_type) {
            return false;
        }

        let source_ok = source.is_new() || oracle.is_allowed_for(Action::Update, source);
        let target_ok = match target {
            MapSubject::Instance(_) => oracle.is_allowed_for(Action::Update, target),
            MapSubject::Type(_) => true,
        };
        source_ok && target_ok
    }
}
