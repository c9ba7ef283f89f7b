//! The revision graph.
//!
//! Revisions form a DAG through their `parents`. The graph owns every
//! revision, validates the parent relation and derives a deterministic
//! topological order, the root and the heads.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::dialect::MigrationDialect;
use crate::error::{GraphError, Result};
use crate::fingerprint::{CanonicalSchema, Fingerprint};
use crate::operations::SchemaTarget;
use crate::revision::{Revision, RevisionId};
use crate::state::SchemaState;

/// Which revision a run should end at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LoadTarget {
    /// The single head of the graph.
    #[default]
    Head,
    /// An explicitly named revision.
    Named(RevisionId),
}

impl LoadTarget {
    /// Builds a target from an optional CLI value.
    #[must_use]
    pub fn from_option(target: Option<&str>) -> Self {
        target.map_or(Self::Head, |id| Self::Named(RevisionId::from(id)))
    }
}

/// All revisions with their derived order.
#[derive(Debug, Clone, Default)]
pub struct RevisionGraph {
    revisions: BTreeMap<RevisionId, Revision>,
    order: Vec<RevisionId>,
    root: Option<RevisionId>,
    heads: Vec<RevisionId>,
}

impl RevisionGraph {
    /// Validates revisions and builds the graph.
    ///
    /// Each revision is sealed (its checksum computed) on the way in.
    pub fn build(revisions: Vec<Revision>) -> Result<Self> {
        let mut by_id: BTreeMap<RevisionId, Revision> = BTreeMap::new();
        for mut revision in revisions {
            if by_id.contains_key(&revision.id) {
                return Err(GraphError::DuplicateRevision(revision.id));
            }
            revision.seal().map_err(|source| GraphError::Encode {
                revision: revision.id.clone(),
                source,
            })?;
            by_id.insert(revision.id.clone(), revision);
        }

        let (order, heads) = Self::order(&by_id)?;
        let root = by_id
            .values()
            .find(|r| r.parents.is_empty())
            .map(|r| r.id.clone());

        debug!(revisions = order.len(), "Built revision graph");

        Ok(Self {
            revisions: by_id,
            order,
            root,
            heads,
        })
    }

    /// Validates parents and sorts revisions topologically.
    fn order(by_id: &BTreeMap<RevisionId, Revision>) -> Result<(Vec<RevisionId>, Vec<RevisionId>)> {
        let mut children: BTreeMap<&RevisionId, Vec<&RevisionId>> = BTreeMap::new();
        let mut in_degree: BTreeMap<&RevisionId, usize> = BTreeMap::new();
        for revision in by_id.values() {
            in_degree.entry(&revision.id).or_insert(0);
            let parents: BTreeSet<&RevisionId> = revision.parents.iter().collect();
            for parent in parents {
                if !by_id.contains_key(parent) {
                    return Err(GraphError::MissingParent {
                        revision: revision.id.clone(),
                        parent: parent.clone(),
                    });
                }
                children.entry(parent).or_default().push(&revision.id);
                *in_degree.entry(&revision.id).or_insert(0) += 1;
            }
        }

        let roots: Vec<RevisionId> = by_id
            .values()
            .filter(|r| r.parents.is_empty())
            .map(|r| r.id.clone())
            .collect();
        if roots.len() > 1 {
            return Err(GraphError::MultipleRoots(roots));
        }

        // Kahn's algorithm; the BTreeSet frontier breaks ties by id
        let mut ready: BTreeSet<&RevisionId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(by_id.len());
        while let Some(id) = ready.pop_first() {
            order.push(id.clone());
            for child in children.get(id).into_iter().flatten() {
                if let Some(d) = in_degree.get_mut(child) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(*child);
                    }
                }
            }
        }

        if order.len() != by_id.len() {
            let placed: BTreeSet<&RevisionId> = order.iter().collect();
            let stuck = by_id
                .keys()
                .filter(|id| !placed.contains(id))
                .cloned()
                .collect();
            return Err(GraphError::Cycle(stuck));
        }

        let heads = by_id
            .keys()
            .filter(|id| !children.contains_key(id))
            .cloned()
            .collect();
        Ok((order, heads))
    }

    /// Returns the number of revisions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.revisions.len()
    }

    /// Returns true if there are no revisions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    /// Gets a revision by id.
    #[must_use]
    pub fn get(&self, id: &RevisionId) -> Option<&Revision> {
        self.revisions.get(id)
    }

    /// Gets a revision by id, failing if it is unknown.
    pub fn require(&self, id: &RevisionId) -> Result<&Revision> {
        self.get(id)
            .ok_or_else(|| GraphError::UnknownRevision(id.to_string()))
    }

    /// Returns true if the revision is part of the graph.
    #[must_use]
    pub fn contains(&self, id: &RevisionId) -> bool {
        self.revisions.contains_key(id)
    }

    /// Returns revisions in topological order.
    pub fn ordered(&self) -> impl Iterator<Item = &Revision> {
        self.order.iter().filter_map(|id| self.revisions.get(id))
    }

    /// Returns the root revision.
    #[must_use]
    pub fn root(&self) -> Option<&RevisionId> {
        self.root.as_ref()
    }

    /// Returns every revision without children.
    #[must_use]
    pub fn heads(&self) -> &[RevisionId] {
        &self.heads
    }

    /// Resolves a target to a revision id.
    ///
    /// An empty graph resolves to `None`. Several heads are an error unless
    /// a revision is named.
    pub fn resolve(&self, target: &LoadTarget) -> Result<Option<RevisionId>> {
        match target {
            LoadTarget::Named(id) => self.require(id).map(|r| Some(r.id.clone())),
            LoadTarget::Head => match self.heads.as_slice() {
                [] => Ok(None),
                [head] => Ok(Some(head.clone())),
                heads => Err(GraphError::MultipleHeads(heads.to_vec())),
            },
        }
    }

    /// Returns the strict ancestors of a revision.
    #[must_use]
    pub fn ancestors(&self, id: &RevisionId) -> BTreeSet<RevisionId> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&RevisionId> = self
            .get(id)
            .map(|r| r.parents.iter().collect())
            .unwrap_or_default();
        while let Some(current) = stack.pop() {
            if seen.insert(current.clone()) {
                if let Some(revision) = self.get(current) {
                    stack.extend(revision.parents.iter());
                }
            }
        }
        seen
    }

    /// Returns true if `ancestor` is a strict ancestor of `id`.
    #[must_use]
    pub fn is_ancestor(&self, ancestor: &RevisionId, id: &RevisionId) -> bool {
        self.ancestors(id).contains(ancestor)
    }

    fn closure(&self, id: &RevisionId) -> BTreeSet<RevisionId> {
        let mut set = self.ancestors(id);
        set.insert(id.clone());
        set
    }

    /// Returns the revisions to apply to move from `from` to `to`, in
    /// topological order. `from = None` is the empty database.
    pub fn path(&self, from: Option<&RevisionId>, to: &RevisionId) -> Result<Vec<&Revision>> {
        self.require(to)?;
        let applied = match from {
            Some(from) => {
                self.require(from)?;
                if from != to && !self.is_ancestor(from, to) {
                    return Err(GraphError::Unreachable {
                        from: from.clone(),
                        to: to.clone(),
                    });
                }
                self.closure(from)
            }
            None => BTreeSet::new(),
        };
        let wanted = self.closure(to);
        Ok(self
            .ordered()
            .filter(|r| wanted.contains(&r.id) && !applied.contains(&r.id))
            .collect())
    }

    /// Returns the strict ancestors of `id` in topological order.
    pub fn ordered_ancestors(&self, id: &RevisionId) -> impl Iterator<Item = &Revision> {
        let ancestors = self.ancestors(id);
        self.ordered().filter(move |r| ancestors.contains(&r.id))
    }

    /// Replays every strict ancestor of `id`, skipping operations that do
    /// not fit. Used as the lint view before a revision.
    #[must_use]
    pub fn schema_before(&self, id: &RevisionId) -> SchemaState {
        let mut state = SchemaState::new();
        for revision in self.ordered_ancestors(id) {
            for err in state.apply_revision_lenient(revision) {
                debug!(revision = %revision.id, error = %err, "Skipped operation during replay");
            }
        }
        state
    }

    /// Replays the schema up to and including `id`, failing on the first
    /// operation that does not fit.
    pub fn schema_at(&self, id: Option<&RevisionId>) -> Result<SchemaState> {
        let mut state = SchemaState::new();
        let Some(id) = id else {
            return Ok(state);
        };
        for revision in self.path(None, id)? {
            state
                .apply_revision(revision)
                .map_err(|source| GraphError::Replay {
                    revision: revision.id.clone(),
                    source,
                })?;
        }
        Ok(state)
    }

    /// Collects the `deprecates` marks of every strict ancestor of `id`.
    #[must_use]
    pub fn deprecations_before(&self, id: &RevisionId) -> BTreeSet<SchemaTarget> {
        self.ordered_ancestors(id)
            .flat_map(|r| r.deprecates.iter().cloned())
            .collect()
    }

    /// Returns true if replay cannot derive the schema at `id` because a
    /// raw statement on the way changed it.
    #[must_use]
    pub fn is_opaque_at(&self, id: &RevisionId) -> bool {
        self.closure(id)
            .iter()
            .filter_map(|rid| self.get(rid))
            .any(Revision::is_opaque)
    }

    /// Derives the fingerprint a database at `id` should have.
    ///
    /// Returns `None` when the path is opaque.
    pub fn expected_fingerprint(
        &self,
        id: Option<&RevisionId>,
        dialect: &dyn MigrationDialect,
    ) -> Result<Option<Fingerprint>> {
        if id.is_some_and(|id| self.is_opaque_at(id)) {
            return Ok(None);
        }
        let state = self.schema_at(id)?;
        Ok(CanonicalSchema::from_schema(state.schema(), dialect).map(|c| c.fingerprint()))
    }

    /// Returns the canonical schema at `id`, or `None` when opaque.
    pub fn expected_schema(
        &self,
        id: Option<&RevisionId>,
        dialect: &dyn MigrationDialect,
    ) -> Result<Option<CanonicalSchema>> {
        if id.is_some_and(|id| self.is_opaque_at(id)) {
            return Ok(None);
        }
        let state = self.schema_at(id)?;
        Ok(CanonicalSchema::from_schema(state.schema(), dialect))
    }
}
