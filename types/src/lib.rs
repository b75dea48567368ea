// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared types for the warden authorization engine.
//!
//! This crate holds the data model that every other warden crate speaks:
//! relation tuples and the references that name them, compiled permission
//! rewrites, caveat expressions, revision tokens, the dispatch wire types
//! exchanged between peers, and the transport-agnostic [`Error`] type.
//!
//! Nothing in this crate performs I/O. The types are deliberately plain so
//! that they can cross the peer RPC boundary (everything on the wire derives
//! `Serialize`/`Deserialize`/`JsonSchema`) and be compared structurally in
//! tests.

mod caveat;
mod cursor;
mod dispatch;
mod error;
mod rewrite;
mod tuple;

pub use caveat::CaveatExpression;
pub use caveat::CaveatReference;
pub use caveat::ContextualizedCaveat;
pub use cursor::Cursor;
pub use cursor::DISPATCH_VERSION;
pub use dispatch::CheckTrace;
pub use dispatch::DebugInfo;
pub use dispatch::DebugSetting;
pub use dispatch::DispatchCheckRequest;
pub use dispatch::DispatchCheckResponse;
pub use dispatch::DispatchExpandRequest;
pub use dispatch::DispatchExpandResponse;
pub use dispatch::DispatchLookupResourcesRequest;
pub use dispatch::DispatchLookupResourcesResponse;
pub use dispatch::DispatchLookupSubjectsRequest;
pub use dispatch::DispatchLookupSubjectsResponse;
pub use dispatch::DispatchReachableResourcesRequest;
pub use dispatch::DispatchReachableResourcesResponse;
pub use dispatch::ExpansionMode;
pub use dispatch::FoundSubject;
pub use dispatch::FoundSubjects;
pub use dispatch::LookupResourcesPage;
pub use dispatch::LookupSubjectsPage;
pub use dispatch::Membership;
pub use dispatch::PermissionStatus;
pub use dispatch::ReachabilityStatus;
pub use dispatch::ReachableResource;
pub use dispatch::ReachableResourcesPage;
pub use dispatch::ResolvedResource;
pub use dispatch::ResolverMeta;
pub use dispatch::ResourceCheckResult;
pub use dispatch::ResponseMeta;
pub use dispatch::ResultsSetting;
pub use dispatch::RevisionToken;
pub use dispatch::TreeNode;
pub use dispatch::SetOperation;
pub use error::Error;
pub use rewrite::CompiledRewrite;
pub use rewrite::NamespaceDefinition;
pub use rewrite::RelationDefinition;
pub use rewrite::SubjectTypeRestriction;
pub use tuple::ObjectReference;
pub use tuple::RelationReference;
pub use tuple::RelationTuple;
pub use tuple::SubjectReference;
pub use tuple::ELLIPSIS;
pub use tuple::WILDCARD_ID;

/// Convenience alias used by fallible operations throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;
