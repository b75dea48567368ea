// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Relation tuples and the references that name positions in the graph.

use crate::caveat::ContextualizedCaveat;
use crate::error::Error;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Sentinel subject relation meaning "the object itself".
///
/// A tuple whose subject relation is the ellipsis points at a concrete
/// object rather than at another userset.
pub const ELLIPSIS: &str = "...";

/// Object id matching every object of the subject's namespace.
pub const WILDCARD_ID: &str = "*";

/// A reference to one object in the graph: `namespace:object_id`.
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
    JsonSchema,
)]
pub struct ObjectReference {
    pub namespace: String,
    pub object_id: String,
}

impl ObjectReference {
    pub fn new<N, O>(namespace: N, object_id: O) -> ObjectReference
    where
        N: Into<String>,
        O: Into<String>,
    {
        ObjectReference {
            namespace: namespace.into(),
            object_id: object_id.into(),
        }
    }
}

impl fmt::Display for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.object_id)
    }
}

/// A `(namespace, relation)` pair denoting one column of the graph.
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
    JsonSchema,
)]
pub struct RelationReference {
    pub namespace: String,
    pub relation: String,
}

impl RelationReference {
    pub fn new<N, R>(namespace: N, relation: R) -> RelationReference
    where
        N: Into<String>,
        R: Into<String>,
    {
        RelationReference {
            namespace: namespace.into(),
            relation: relation.into(),
        }
    }
}

impl fmt::Display for RelationReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.namespace, self.relation)
    }
}

/// A subject: either a concrete object (`optional_relation` is `None`,
/// rendered with the ellipsis sentinel on the wire) or a userset
/// `object#relation`.
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
    JsonSchema,
)]
pub struct SubjectReference {
    pub object: ObjectReference,
    pub optional_relation: Option<String>,
}

impl SubjectReference {
    /// A subject naming the object itself.
    pub fn object<N, O>(namespace: N, object_id: O) -> SubjectReference
    where
        N: Into<String>,
        O: Into<String>,
    {
        SubjectReference {
            object: ObjectReference::new(namespace, object_id),
            optional_relation: None,
        }
    }

    /// A subject naming a userset `namespace:object_id#relation`.
    pub fn userset<N, O, R>(
        namespace: N,
        object_id: O,
        relation: R,
    ) -> SubjectReference
    where
        N: Into<String>,
        O: Into<String>,
        R: Into<String>,
    {
        SubjectReference {
            object: ObjectReference::new(namespace, object_id),
            optional_relation: Some(relation.into()),
        }
    }

    pub fn is_userset(&self) -> bool {
        self.optional_relation.is_some()
    }

    pub fn is_wildcard(&self) -> bool {
        self.object.object_id == WILDCARD_ID
    }

    /// The relation as stored: the ellipsis sentinel for a concrete object.
    pub fn relation_or_ellipsis(&self) -> &str {
        self.optional_relation.as_deref().unwrap_or(ELLIPSIS)
    }
}

impl fmt::Display for SubjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.optional_relation {
            Some(relation) => write!(f, "{}#{}", self.object, relation),
            None => write!(f, "{}", self.object),
        }
    }
}

/// One immutable edge in the authorization graph:
/// `resource#relation@subject`, optionally gated by a caveat.
///
/// Equality is structural over every field, caveat context included.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct RelationTuple {
    pub resource: ObjectReference,
    pub relation: String,
    pub subject: SubjectReference,
    pub caveat: Option<ContextualizedCaveat>,
}

impl RelationTuple {
    pub fn new(
        resource: ObjectReference,
        relation: impl Into<String>,
        subject: SubjectReference,
    ) -> RelationTuple {
        RelationTuple {
            resource,
            relation: relation.into(),
            subject,
            caveat: None,
        }
    }

    pub fn with_caveat(mut self, caveat: ContextualizedCaveat) -> Self {
        self.caveat = Some(caveat);
        self
    }

    /// A key that orders tuples deterministically, so that snapshot reads
    /// and cursor seeks agree on one total order.
    pub fn structural_key(&self) -> (String, String, String, String, String, String) {
        (
            self.resource.namespace.clone(),
            self.resource.object_id.clone(),
            self.relation.clone(),
            self.subject.object.namespace.clone(),
            self.subject.object.object_id.clone(),
            self.subject.relation_or_ellipsis().to_string(),
        )
    }
}

impl fmt::Display for RelationTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}@{}:{}#{}",
            self.resource,
            self.relation,
            self.subject.object.namespace,
            self.subject.object.object_id,
            self.subject.relation_or_ellipsis(),
        )?;
        if let Some(caveat) = &self.caveat {
            write!(f, "[{}]", caveat.caveat_name)?;
        }
        Ok(())
    }
}

impl FromStr for RelationTuple {
    type Err = Error;

    /// Parses the canonical text form
    /// `ns:oid#relation@subject_ns:subject_oid#subject_relation`, with the
    /// subject relation optional (ellipsis assumed). Used by fixtures and
    /// debugging tools; caveats are not representable in this form.
    fn from_str(s: &str) -> Result<RelationTuple, Error> {
        let bad = || Error::InvalidArgument {
            message: format!("malformed relation tuple {:?}", s),
        };

        let (resource_part, subject_part) = s.split_once('@').ok_or_else(bad)?;
        let (resource_ref, relation) =
            resource_part.split_once('#').ok_or_else(bad)?;
        let (namespace, object_id) =
            resource_ref.split_once(':').ok_or_else(bad)?;

        let (subject_ref, subject_relation) = match subject_part.split_once('#')
        {
            Some((obj, rel)) if rel == ELLIPSIS => (obj, None),
            Some((obj, rel)) => (obj, Some(rel.to_string())),
            None => (subject_part, None),
        };
        let (subject_namespace, subject_object_id) =
            subject_ref.split_once(':').ok_or_else(bad)?;

        for piece in [namespace, object_id, relation, subject_namespace, subject_object_id] {
            if piece.is_empty() {
                return Err(bad());
            }
        }

        Ok(RelationTuple {
            resource: ObjectReference::new(namespace, object_id),
            relation: relation.to_string(),
            subject: SubjectReference {
                object: ObjectReference::new(
                    subject_namespace,
                    subject_object_id,
                ),
                optional_relation: subject_relation,
            },
        caveat: None,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_concrete_subject() {
        let tuple: RelationTuple =
            "document:doc1#viewer@user:alice".parse().unwrap();
        assert_eq!(tuple.resource, ObjectReference::new("document", "doc1"));
        assert_eq!(tuple.relation, "viewer");
        assert_eq!(tuple.subject, SubjectReference::object("user", "alice"));
        assert_eq!(
            tuple.to_string(),
            "document:doc1#viewer@user:alice#...",
        );
    }

    #[test]
    fn test_parse_userset_subject() {
        let tuple: RelationTuple =
            "document:doc1#viewer@group:eng#member".parse().unwrap();
        assert_eq!(
            tuple.subject,
            SubjectReference::userset("group", "eng", "member")
        );
        assert!(tuple.subject.is_userset());
    }

    #[test]
    fn test_parse_explicit_ellipsis() {
        let tuple: RelationTuple =
            "document:doc1#viewer@user:alice#...".parse().unwrap();
        assert_eq!(tuple.subject.optional_relation, None);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in [
            "",
            "document:doc1#viewer",
            "document:doc1@user:alice",
            "document#viewer@user:alice",
            "document:#viewer@user:alice",
            "document:doc1#viewer@alice",
        ] {
            assert_matches!(
                bad.parse::<RelationTuple>(),
                Err(Error::InvalidArgument { .. }),
                "expected parse failure for {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_wildcard_subject() {
        let tuple: RelationTuple =
            "document:doc1#viewer@user:*".parse().unwrap();
        assert!(tuple.subject.is_wildcard());
        assert!(!tuple.subject.is_userset());
    }

    #[test]
    fn test_structural_key_orders_tuples() {
        let a: RelationTuple =
            "document:doc1#viewer@user:alice".parse().unwrap();
        let b: RelationTuple =
            "document:doc2#viewer@user:alice".parse().unwrap();
        assert!(a.structural_key() < b.structural_key());
    }
}
