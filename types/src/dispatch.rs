// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire types for the peer dispatch surface.
//!
//! Every request embeds a [`ResolverMeta`] (revision pin plus remaining
//! depth budget) and every response embeds a [`ResponseMeta`] (dispatch
//! accounting rolled up across the sub-tree). These cross the peer RPC
//! boundary verbatim, so everything here derives the serde and schema
//! traits.

use crate::caveat::CaveatExpression;
use crate::cursor::Cursor;
use crate::tuple::ObjectReference;
use crate::tuple::RelationReference;
use crate::tuple::SubjectReference;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// An opaque, monotonically-ordered token identifying a snapshot of the
/// store. Only the storage layer interprets the contents.
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
#[serde(transparent)]
pub struct RevisionToken(pub String);

impl RevisionToken {
    pub fn new(token: impl Into<String>) -> RevisionToken {
        RevisionToken(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RevisionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request-scoped resolution metadata, propagated down the dispatch tree.
///
/// `depth_remaining` is strictly positive on a valid request and is
/// decremented once per hop; a sub-request arriving at zero fails with
/// `DepthExceeded`. `at_revision` is propagated unchanged.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct ResolverMeta {
    pub at_revision: RevisionToken,
    pub depth_remaining: u32,
}

impl ResolverMeta {
    /// The metadata for one hop further down: identical revision, one less
    /// depth.
    pub fn descend(&self) -> ResolverMeta {
        ResolverMeta {
            at_revision: self.at_revision.clone(),
            depth_remaining: self.depth_remaining.saturating_sub(1),
        }
    }
}

/// Dispatch accounting accumulated back up the call tree.
#[derive(
    Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema,
)]
pub struct ResponseMeta {
    /// Total dispatches performed on behalf of this request, cached or not.
    pub dispatch_count: u32,
    /// How many of `dispatch_count` were answered from the dispatch cache.
    pub cached_dispatch_count: u32,
    /// High-water mark of depth consumed anywhere in the sub-tree.
    pub depth_required: u32,
    /// Present only when the caller requested debug tracing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_info: Option<DebugInfo>,
}

impl ResponseMeta {
    /// Accounting for a single dispatch that issued no sub-dispatches.
    pub fn single_dispatch() -> ResponseMeta {
        ResponseMeta {
            dispatch_count: 1,
            cached_dispatch_count: 0,
            depth_required: 1,
            debug_info: None,
        }
    }

    /// Accounting for a dispatch answered from the cache: it still counts
    /// as one dispatch, and as one cached dispatch. `depth_required` is
    /// taken from the original computation so that depth accounting stays
    /// sound for the caller.
    pub fn cache_hit(depth_required: u32) -> ResponseMeta {
        ResponseMeta {
            dispatch_count: 1,
            cached_dispatch_count: 1,
            depth_required,
            debug_info: None,
        }
    }

    /// Folds a sub-result's accounting into this one: counters are
    /// additive, depth is a maximum. Debug info is merged by the check
    /// resolver explicitly, not here.
    pub fn absorb(&mut self, child: &ResponseMeta) {
        self.dispatch_count =
            self.dispatch_count.saturating_add(child.dispatch_count);
        self.cached_dispatch_count = self
            .cached_dispatch_count
            .saturating_add(child.cached_dispatch_count);
        self.depth_required = self.depth_required.max(child.depth_required);
    }

    /// A sub-result seen from one hop up: its depth requirement grows by
    /// the hop itself.
    pub fn absorb_hop(&mut self, child: &ResponseMeta) {
        self.dispatch_count =
            self.dispatch_count.saturating_add(child.dispatch_count);
        self.cached_dispatch_count = self
            .cached_dispatch_count
            .saturating_add(child.cached_dispatch_count);
        self.depth_required =
            self.depth_required.max(child.depth_required.saturating_add(1));
    }
}

/// Debug tracing collected when a check request asks for it.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct DebugInfo {
    pub check: CheckTrace,
}

/// One node of the debug trace tree: which sub-problem was dispatched and
/// what it concluded.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct CheckTrace {
    pub resource_relation: RelationReference,
    pub resource_ids: Vec<String>,
    pub subject: SubjectReference,
    pub results: BTreeMap<String, ResourceCheckResult>,
    pub children: Vec<CheckTrace>,
}

/// Membership of one resource with respect to the checked subject.
///
/// The variants form a lattice ordered `NotMember < CaveatedMember <
/// Member`; unions take the least upper bound.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Deserialize,
    Serialize,
    JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Membership {
    NotMember,
    CaveatedMember,
    Member,
}

/// The per-resource outcome of a check.
///
/// Constructed only through [`ResourceCheckResult::not_member`],
/// [`ResourceCheckResult::member`], and [`ResourceCheckResult::caveated`],
/// which enforce the shape invariants: `NotMember` and `Member` carry no
/// expression, and only `CaveatedMember` may list missing context fields.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct ResourceCheckResult {
    membership: Membership,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expression: Option<CaveatExpression>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    missing_expr_fields: Vec<String>,
}

impl ResourceCheckResult {
    pub fn not_member() -> ResourceCheckResult {
        ResourceCheckResult {
            membership: Membership::NotMember,
            expression: None,
            missing_expr_fields: Vec::new(),
        }
    }

    pub fn member() -> ResourceCheckResult {
        ResourceCheckResult {
            membership: Membership::Member,
            expression: None,
            missing_expr_fields: Vec::new(),
        }
    }

    pub fn caveated(
        expression: CaveatExpression,
        missing_expr_fields: Vec<String>,
    ) -> ResourceCheckResult {
        ResourceCheckResult {
            membership: Membership::CaveatedMember,
            expression: Some(expression),
            missing_expr_fields,
        }
    }

    pub fn membership(&self) -> Membership {
        self.membership
    }

    pub fn expression(&self) -> Option<&CaveatExpression> {
        self.expression.as_ref()
    }

    pub fn missing_expr_fields(&self) -> &[String] {
        &self.missing_expr_fields
    }
}

/// Whether the evaluator may stop at the first definitive membership or
/// must produce a result for every requested resource id. The latter is
/// required whenever the caller is batching.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ResultsSetting {
    AllowSingleResult,
    RequireAllResults,
}

/// Whether a check should collect a debug trace.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum DebugSetting {
    NoDebug,
    Debug,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct DispatchCheckRequest {
    pub meta: ResolverMeta,
    pub resource_relation: RelationReference,
    pub resource_ids: Vec<String>,
    pub subject: SubjectReference,
    /// Caller-supplied caveat context, merged under tuple context during
    /// caveat evaluation.
    #[serde(default)]
    pub context: Map<String, Value>,
    pub results_setting: ResultsSetting,
    pub debug: DebugSetting,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct DispatchCheckResponse {
    pub metadata: ResponseMeta,
    /// Outcome per requested resource id. Ids with no membership at all
    /// may be omitted under `AllowSingleResult`.
    pub results: BTreeMap<String, ResourceCheckResult>,
}

/// How far expansion follows userset indirections.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ExpansionMode {
    /// Stop at the first userset indirection, reporting the userset itself.
    Shallow,
    /// Expand usersets transitively, bounded by the depth budget.
    Recursive,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct DispatchExpandRequest {
    pub meta: ResolverMeta,
    pub resource: ObjectReference,
    pub relation: String,
    pub mode: ExpansionMode,
}

/// The set operation labelling an intermediate expansion node.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum SetOperation {
    Union,
    Intersection,
    Exclusion,
}

/// A node in the expanded permission tree, mirroring the rewrite that
/// produced it.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum TreeNode {
    Leaf {
        resource: ObjectReference,
        relation: String,
        subjects: Vec<SubjectReference>,
    },
    Intermediate {
        resource: ObjectReference,
        relation: String,
        operation: SetOperation,
        children: Vec<TreeNode>,
    },
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct DispatchExpandResponse {
    pub metadata: ResponseMeta,
    pub tree: TreeNode,
}

/// Whether a reachable resource is proven or merely possible.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ReachabilityStatus {
    /// The traversal crossed an intersection, exclusion, or caveat; a
    /// check is required to confirm membership.
    RequiresCheck,
    /// The traversal alone proves membership.
    HasPermission,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct ReachableResource {
    pub resource_id: String,
    pub status: ReachabilityStatus,
    /// Which of the requested subject ids this resource was reached from.
    pub for_subject_ids: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct DispatchReachableResourcesRequest {
    pub meta: ResolverMeta,
    pub resource_relation: RelationReference,
    /// The relation the subject ids live in; the ellipsis sentinel for
    /// concrete terminal subjects.
    pub subject_relation: RelationReference,
    pub subject_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

/// One streamed chunk of reachable resources.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct DispatchReachableResourcesResponse {
    pub resource: ReachableResource,
    pub after_response_cursor: Cursor,
    pub metadata: ResponseMeta,
}

/// Whether a resolved resource is unconditionally permitted.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    HasPermission,
    ConditionallyHasPermission,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct ResolvedResource {
    pub resource_id: String,
    pub status: PermissionStatus,
    /// Context fields the caller must supply to resolve the condition;
    /// populated only for `ConditionallyHasPermission`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_required_context: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct DispatchLookupResourcesRequest {
    pub meta: ResolverMeta,
    pub resource_relation: RelationReference,
    pub subject: SubjectReference,
    #[serde(default)]
    pub context: Map<String, Value>,
    /// 0 means no limit. Enforced after de-duplication and
    /// check-filtering.
    pub optional_limit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

/// One streamed chunk: a single resolved resource.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct DispatchLookupResourcesResponse {
    pub resource: ResolvedResource,
    pub after_response_cursor: Cursor,
    pub metadata: ResponseMeta,
}

/// A subject found by lookup-subjects, possibly caveated, possibly the
/// wildcard. A wildcard subject may carry exclusions produced by
/// exclusion nodes above it.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct FoundSubject {
    pub subject_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caveat_expression: Option<CaveatExpression>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_subjects: Vec<FoundSubject>,
}

impl FoundSubject {
    pub fn concrete(subject_id: impl Into<String>) -> FoundSubject {
        FoundSubject {
            subject_id: subject_id.into(),
            caveat_expression: None,
            excluded_subjects: Vec::new(),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.subject_id == crate::tuple::WILDCARD_ID
    }
}

/// The subjects found for one resource.
#[derive(
    Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema,
)]
pub struct FoundSubjects {
    pub subjects: Vec<FoundSubject>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct DispatchLookupSubjectsRequest {
    pub meta: ResolverMeta,
    pub resource_relation: RelationReference,
    pub resource_ids: Vec<String>,
    /// The kind of subject to collect, e.g. `user#...`.
    pub subject_relation: RelationReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

/// One streamed chunk: found subjects for a batch of resource ids.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct DispatchLookupSubjectsResponse {
    pub found_subjects_by_resource_id: BTreeMap<String, FoundSubjects>,
    pub after_response_cursor: Cursor,
    pub metadata: ResponseMeta,
}

/// One page of a reachable-resources stream as carried between peers.
///
/// Streaming dispatches travel peer-to-peer as cursor-driven pages; the
/// remote dispatcher turns pages back into a chunk stream.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct ReachableResourcesPage {
    pub chunks: Vec<DispatchReachableResourcesResponse>,
    /// Set when more results may follow; absent when the stream completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<Cursor>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct LookupResourcesPage {
    pub chunks: Vec<DispatchLookupResourcesResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<Cursor>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct LookupSubjectsPage {
    pub chunks: Vec<DispatchLookupSubjectsResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<Cursor>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_membership_lattice_order() {
        assert!(Membership::NotMember < Membership::CaveatedMember);
        assert!(Membership::CaveatedMember < Membership::Member);
    }

    #[test]
    fn test_meta_absorb_sums_counters_maxes_depth() {
        let mut meta = ResponseMeta::single_dispatch();
        meta.absorb(&ResponseMeta {
            dispatch_count: 3,
            cached_dispatch_count: 1,
            depth_required: 4,
            debug_info: None,
        });
        assert_eq!(meta.dispatch_count, 4);
        assert_eq!(meta.cached_dispatch_count, 1);
        assert_eq!(meta.depth_required, 4);
    }

    #[test]
    fn test_meta_absorb_hop_accounts_for_the_hop() {
        let mut meta = ResponseMeta::single_dispatch();
        meta.absorb_hop(&ResponseMeta {
            dispatch_count: 1,
            cached_dispatch_count: 0,
            depth_required: 1,
            debug_info: None,
        });
        assert_eq!(meta.depth_required, 2);
        assert_eq!(meta.dispatch_count, 2);
    }

    #[test]
    fn test_descend_decrements_depth() {
        let meta = ResolverMeta {
            at_revision: RevisionToken::new("7"),
            depth_remaining: 2,
        };
        assert_eq!(meta.descend().depth_remaining, 1);
        assert_eq!(meta.descend().descend().depth_remaining, 0);
        assert_eq!(meta.descend().at_revision, meta.at_revision);
    }

    #[test]
    fn test_check_result_invariants() {
        let member = ResourceCheckResult::member();
        assert_eq!(member.membership(), Membership::Member);
        assert!(member.expression().is_none());
        assert!(member.missing_expr_fields().is_empty());

        let not_member = ResourceCheckResult::not_member();
        assert!(not_member.expression().is_none());
    }
}
