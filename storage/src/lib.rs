// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Storage contract consumed by the warden engine.
//!
//! The engine needs exactly three things from a datastore: snapshot reads
//! of relation tuples at a pinned revision, the compiled namespace
//! definitions at that revision, and the head revision for callers that
//! did not pin one. Anything satisfying [`RelationshipReader`] works; a
//! thin adapter over a relational or KV store suffices. This crate also
//! provides [`MemoryDatastore`], the copy-on-write snapshot store used by
//! the server in dev mode and by every test in the workspace.

mod memory;

pub use memory::MemoryDatastore;

use async_trait::async_trait;
use warden_types::NamespaceDefinition;
use warden_types::RelationTuple;
use warden_types::Result;
use warden_types::RevisionToken;
use warden_types::SubjectReference;
use warden_types::ELLIPSIS;

/// Matches the subject side of a tuple.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubjectFilter {
    pub namespace: String,
    /// `None` matches any object id.
    pub optional_object_id: Option<String>,
    /// `None` matches any subject relation, including the ellipsis; to
    /// match only terminal subjects, pass the ellipsis sentinel itself.
    pub optional_relation: Option<String>,
}

impl SubjectFilter {
    pub fn namespace(namespace: impl Into<String>) -> SubjectFilter {
        SubjectFilter {
            namespace: namespace.into(),
            optional_object_id: None,
            optional_relation: None,
        }
    }

    pub fn object_id(mut self, object_id: impl Into<String>) -> Self {
        self.optional_object_id = Some(object_id.into());
        self
    }

    pub fn relation(mut self, relation: impl Into<String>) -> Self {
        self.optional_relation = Some(relation.into());
        self
    }

    pub fn matches(&self, subject: &SubjectReference) -> bool {
        if subject.object.namespace != self.namespace {
            return false;
        }
        if let Some(object_id) = &self.optional_object_id {
            if &subject.object.object_id != object_id {
                return false;
            }
        }
        if let Some(relation) = &self.optional_relation {
            let subject_relation = subject.relation_or_ellipsis();
            if relation == ELLIPSIS {
                if subject.is_userset() {
                    return false;
                }
            } else if subject_relation != relation {
                return false;
            }
        }
        true
    }
}

/// Selects tuples by resource column and optionally by subject.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelationshipFilter {
    pub namespace: String,
    /// `None` matches every object id in the namespace.
    pub optional_object_ids: Option<Vec<String>>,
    pub optional_relation: Option<String>,
    pub optional_subject_filter: Option<SubjectFilter>,
}

impl RelationshipFilter {
    pub fn namespace(namespace: impl Into<String>) -> RelationshipFilter {
        RelationshipFilter {
            namespace: namespace.into(),
            optional_object_ids: None,
            optional_relation: None,
            optional_subject_filter: None,
        }
    }

    pub fn object_ids<I, S>(mut self, object_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.optional_object_ids =
            Some(object_ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn relation(mut self, relation: impl Into<String>) -> Self {
        self.optional_relation = Some(relation.into());
        self
    }

    pub fn subject(mut self, subject_filter: SubjectFilter) -> Self {
        self.optional_subject_filter = Some(subject_filter);
        self
    }

    pub fn matches(&self, tuple: &RelationTuple) -> bool {
        if tuple.resource.namespace != self.namespace {
            return false;
        }
        if let Some(object_ids) = &self.optional_object_ids {
            if !object_ids.contains(&tuple.resource.object_id) {
                return false;
            }
        }
        if let Some(relation) = &self.optional_relation {
            if &tuple.relation != relation {
                return false;
            }
        }
        if let Some(subject_filter) = &self.optional_subject_filter {
            if !subject_filter.matches(&tuple.subject) {
                return false;
            }
        }
        true
    }
}

/// A revision-pinned, snapshot-consistent reader of the relationship
/// graph.
///
/// Reads at a given revision must always observe the same data, in the
/// same deterministic order (sorted by structural key), for as long as
/// the revision is retained. Implementations report a no-longer-retained
/// revision with `Error::RevisionStale`.
#[async_trait]
pub trait RelationshipReader: Send + Sync {
    /// Returns every tuple matching `filter` in the snapshot at
    /// `revision`, sorted by structural key.
    async fn query_relationships(
        &self,
        revision: &RevisionToken,
        filter: &RelationshipFilter,
    ) -> Result<Vec<RelationTuple>>;

    /// The most recent revision; used when the caller did not pin one.
    async fn head_revision(&self) -> Result<RevisionToken>;

    /// The compiled namespace definition at `revision`.
    async fn namespace(
        &self,
        revision: &RevisionToken,
        namespace: &str,
    ) -> Result<NamespaceDefinition>;
}

#[cfg(test)]
mod test {
    use super::*;

    fn tuple(s: &str) -> RelationTuple {
        s.parse().unwrap()
    }

    #[test]
    fn test_filter_by_resource_column() {
        let filter = RelationshipFilter::namespace("document")
            .object_ids(["doc1"])
            .relation("viewer");
        assert!(filter.matches(&tuple("document:doc1#viewer@user:alice")));
        assert!(!filter.matches(&tuple("document:doc2#viewer@user:alice")));
        assert!(!filter.matches(&tuple("document:doc1#editor@user:alice")));
        assert!(!filter.matches(&tuple("folder:doc1#viewer@user:alice")));
    }

    #[test]
    fn test_subject_filter_terminal_only() {
        let filter = RelationshipFilter::namespace("document").subject(
            SubjectFilter::namespace("user").relation(ELLIPSIS),
        );
        assert!(filter.matches(&tuple("document:doc1#viewer@user:alice")));
        assert!(
            !filter.matches(&tuple("document:doc1#viewer@user:team#member"))
        );
    }

    #[test]
    fn test_subject_filter_userset() {
        let filter = RelationshipFilter::namespace("document").subject(
            SubjectFilter::namespace("group").relation("member"),
        );
        assert!(
            filter.matches(&tuple("document:doc1#viewer@group:eng#member"))
        );
        assert!(!filter.matches(&tuple("document:doc1#viewer@group:eng")));
        assert!(!filter.matches(&tuple("document:doc1#viewer@user:alice")));
    }
}
