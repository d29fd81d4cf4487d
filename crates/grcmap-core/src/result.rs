//! Mapping results
//!
//! A [`MappingResult`] is one related instance plus the provenance that put it
//! in a list: the nested results (join records, local hops of a cross mapping)
//! that justify the relation. A directly mapped object carries a single
//! [`Subject::Edge`] provenance entry: the edge itself is the relation.

use crate::binding::ListBinding;
use crate::instance::{Instance, InstanceKey};
use parking_lot::RwLock;
use std::fmt;
use std::sync::{Arc, Weak};

#[derive(Clone)]
pub enum Subject {
    /// The relation itself, with no further instance behind it.
    Edge,
    Instance(Arc<Instance>),
}

impl Subject {
    pub fn instance(&self) -> Option<&Arc<Instance>> {
        match self {
            Self::Edge => None,
            Self::Instance(instance) => Some(instance),
        }
    }

    pub fn key(&self) -> Option<&InstanceKey> {
        self.instance().map(|i| i.key())
    }

    /// Identity comparison: edges match edges, instances match by key.
    pub fn same_as(&self, other: &Subject) -> bool {
        match (self, other) {
            (Self::Edge, Self::Edge) => true,
            (Self::Instance(a), Self::Instance(b)) => a.key() == b.key(),
            _ => false,
        }
    }
}

impl fmt::Debug for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Edge => f.write_str("Edge"),
            Self::Instance(instance) => write!(f, "{}", instance.key()),
        }
    }
}

pub struct MappingResult {
    subject: Subject,
    mappings: RwLock<Vec<Arc<MappingResult>>>,
    /// Set once the result is listed; listed results are matched by identity.
    binding: Option<Weak<ListBinding>>,
}

impl fmt::Debug for MappingResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappingResult")
            .field("subject", &self.subject)
            .field("mappings", &*self.mappings.read())
            .finish()
    }
}

impl MappingResult {
    /// The plain-edge provenance entry.
    pub fn edge() -> Arc<Self> {
        Arc::new(Self {
            subject: Subject::Edge,
            mappings: RwLock::new(Vec::new()),
            binding: None,
        })
    }

    /// An unbound candidate result.
    pub fn new(instance: Arc<Instance>, mappings: Vec<Arc<MappingResult>>) -> Arc<Self> {
        Self::with_binding(instance, mappings, None)
    }

    /// `(instance, [edge])`: a directly related object.
    pub fn direct(instance: Arc<Instance>) -> Arc<Self> {
        Self::new(instance, vec![Self::edge()])
    }

    pub(crate) fn bound(
        instance: Arc<Instance>,
        mappings: Vec<Arc<MappingResult>>,
        binding: Weak<ListBinding>,
    ) -> Arc<Self> {
        Self::with_binding(instance, mappings, Some(binding))
    }

    fn with_binding(
        instance: Arc<Instance>,
        mappings: Vec<Arc<MappingResult>>,
        binding: Option<Weak<ListBinding>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            subject: Subject::Instance(instance),
            mappings: RwLock::new(mappings),
            binding,
        })
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    pub fn instance(&self) -> Option<&Arc<Instance>> {
        self.subject.instance()
    }

    pub fn key(&self) -> Option<&InstanceKey> {
        self.subject.key()
    }

    pub fn is_edge(&self) -> bool {
        matches!(self.subject, Subject::Edge)
    }

    pub fn mappings(&self) -> Vec<Arc<MappingResult>> {
        self.mappings.read().clone()
    }

    pub fn mapping_count(&self) -> usize {
        self.mappings.read().len()
    }

    /// The binding whose list holds this result, while it is alive.
    pub fn binding(&self) -> Option<Arc<ListBinding>> {
        self.binding.as_ref().and_then(Weak::upgrade)
    }

    /// Whether this result was created as an entry of some binding's list.
    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    pub fn has_mapping(&self, mapping: &MappingResult) -> bool {
        self.mappings
            .read()
            .iter()
            .any(|m| m.same_provenance(mapping))
    }

    /// Append the entries of `incoming` not already present. Returns how many
    /// were added.
    pub(crate) fn merge_mappings(&self, incoming: &[Arc<MappingResult>]) -> usize {
        let mut mappings = self.mappings.write();
        let mut added = 0;
        for candidate in incoming {
            if !mappings.iter().any(|m| m.same_provenance(candidate)) {
                mappings.push(Arc::clone(candidate));
                added += 1;
            }
        }
        added
    }

    /// Drop every provenance entry matching `mapping`. Returns whether any was
    /// removed.
    pub(crate) fn remove_mapping(&self, mapping: &MappingResult) -> bool {
        let mut mappings = self.mappings.write();
        let before = mappings.len();
        mappings.retain(|m| !m.same_provenance(mapping));
        mappings.len() != before
    }

    /// Same provenance: the same object, or two unbound descriptors with the
    /// same subject and pairwise matching nested provenance.
    ///
    /// A bound result is an entry of another list and only ever matches
    /// itself, so one object reached through two sources keeps both.
    pub fn same_provenance(&self, other: &MappingResult) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        if self.is_bound() || other.is_bound() {
            return false;
        }
        if !self.subject.same_as(&other.subject) {
            return false;
        }
        let ours = self.mappings.read();
        let theirs = other.mappings.read();
        ours.len() == theirs.len()
            && ours
                .iter()
                .zip(theirs.iter())
                .all(|(a, b)| a.same_provenance(b))
    }

    /// Depth-first walk emitting `(subject, result, depth)` for every subject
    /// that differs from its parent's. Depth only grows when the subject
    /// changes, so chains repeating one instance flatten into one level.
    pub fn walk_instances<F>(self: &Arc<Self>, f: &mut F)
    where
        F: FnMut(&Subject, &Arc<MappingResult>, usize),
    {
        self.walk_from(f, None, 0);
    }

    fn walk_from<F>(self: &Arc<Self>, f: &mut F, last: Option<&Subject>, mut depth: usize)
    where
        F: FnMut(&Subject, &Arc<MappingResult>, usize),
    {
        if !last.is_some_and(|last| last.same_as(&self.subject)) {
            f(&self.subject, self, depth);
            depth += 1;
        }
        for mapping in self.mappings() {
            mapping.walk_from(f, Some(&self.subject), depth);
        }
    }

    /// The instances one hop behind this result. A plain edge stands for this
    /// result's own instance.
    pub fn get_mappings(self: &Arc<Self>) -> Vec<Arc<Instance>> {
        let own = self.instance().cloned();
        let mut out = Vec::new();
        self.walk_instances(&mut |subject, _, depth| {
            if depth != 1 {
                return;
            }
            let instance = match subject {
                Subject::Edge => own.clone(),
                Subject::Instance(instance) => Some(Arc::clone(instance)),
            };
            out.extend(instance);
        });
        out
    }
}
