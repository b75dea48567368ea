// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Compiled permission rewrites.
//!
//! The schema compiler (out of scope here) reduces each relation or
//! permission of a namespace to a [`CompiledRewrite`] tree. The engine
//! interprets these trees; it never sees schema source text.

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;

/// One node of a compiled permission expression.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompiledRewrite {
    /// Direct tuples stored in this relation's column.
    This,
    /// Rewrite to another relation on the same resource.
    ComputedUserset { relation: String },
    /// Walk the tupleset relation on the resource, then evaluate the
    /// computed relation on each subject found there ("arrow" traversal).
    TupleToUserset {
        tupleset_relation: String,
        computed_userset_relation: String,
    },
    Union { children: Vec<CompiledRewrite> },
    Intersection { children: Vec<CompiledRewrite> },
    Exclusion { base: Box<CompiledRewrite>, subtracted: Box<CompiledRewrite> },
}

impl CompiledRewrite {
    pub fn union(children: Vec<CompiledRewrite>) -> CompiledRewrite {
        CompiledRewrite::Union { children }
    }

    pub fn intersection(children: Vec<CompiledRewrite>) -> CompiledRewrite {
        CompiledRewrite::Intersection { children }
    }

    pub fn exclusion(
        base: CompiledRewrite,
        subtracted: CompiledRewrite,
    ) -> CompiledRewrite {
        CompiledRewrite::Exclusion {
            base: Box::new(base),
            subtracted: Box::new(subtracted),
        }
    }

    pub fn computed_userset(relation: impl Into<String>) -> CompiledRewrite {
        CompiledRewrite::ComputedUserset { relation: relation.into() }
    }

    pub fn tuple_to_userset(
        tupleset_relation: impl Into<String>,
        computed_userset_relation: impl Into<String>,
    ) -> CompiledRewrite {
        CompiledRewrite::TupleToUserset {
            tupleset_relation: tupleset_relation.into(),
            computed_userset_relation: computed_userset_relation.into(),
        }
    }

    /// Whether evaluating this node can ever subtract or gate results, as
    /// opposed to purely accumulating them. Reachability analysis uses this
    /// to decide between `HAS_PERMISSION` and `REQUIRES_CHECK`.
    pub fn is_purely_additive(&self) -> bool {
        match self {
            CompiledRewrite::This
            | CompiledRewrite::ComputedUserset { .. }
            | CompiledRewrite::TupleToUserset { .. } => true,
            CompiledRewrite::Union { children } => {
                children.iter().all(|c| c.is_purely_additive())
            }
            CompiledRewrite::Intersection { .. }
            | CompiledRewrite::Exclusion { .. } => false,
        }
    }
}

/// A declared subject type for a relation: which namespace (and optionally
/// which relation on it) may appear on the right-hand side of tuples.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct SubjectTypeRestriction {
    pub namespace: String,
    pub optional_relation: Option<String>,
}

impl SubjectTypeRestriction {
    pub fn object(namespace: impl Into<String>) -> SubjectTypeRestriction {
        SubjectTypeRestriction {
            namespace: namespace.into(),
            optional_relation: None,
        }
    }

    pub fn userset(
        namespace: impl Into<String>,
        relation: impl Into<String>,
    ) -> SubjectTypeRestriction {
        SubjectTypeRestriction {
            namespace: namespace.into(),
            optional_relation: Some(relation.into()),
        }
    }
}

/// One relation or permission of a namespace, compiled.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct RelationDefinition {
    pub rewrite: CompiledRewrite,
    /// Empty for pure permissions (relations that hold no direct tuples).
    pub subject_types: Vec<SubjectTypeRestriction>,
}

/// A compiled namespace: the unit the engine consumes from storage.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct NamespaceDefinition {
    pub name: String,
    pub relations: BTreeMap<String, RelationDefinition>,
}

impl NamespaceDefinition {
    pub fn new(name: impl Into<String>) -> NamespaceDefinition {
        NamespaceDefinition { name: name.into(), relations: BTreeMap::new() }
    }

    /// Adds a relation holding direct tuples of the given subject types.
    pub fn with_relation(
        mut self,
        name: impl Into<String>,
        subject_types: Vec<SubjectTypeRestriction>,
    ) -> Self {
        self.relations.insert(
            name.into(),
            RelationDefinition { rewrite: CompiledRewrite::This, subject_types },
        );
        self
    }

    /// Adds a permission computed by `rewrite`, holding no direct tuples.
    pub fn with_permission(
        mut self,
        name: impl Into<String>,
        rewrite: CompiledRewrite,
    ) -> Self {
        self.relations.insert(
            name.into(),
            RelationDefinition { rewrite, subject_types: Vec::new() },
        );
        self
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDefinition> {
        self.relations.get(name)
    }
}
