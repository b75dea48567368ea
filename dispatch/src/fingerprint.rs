// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Canonical dispatch fingerprints.
//!
//! A fingerprint is the identity of a sub-request: the cache keys on it
//! and the ring routes by it, so two peers asked the same question at the
//! same revision must derive the same bytes. The encoding is
//! length-prefixed fields in a fixed order per request kind, with
//! set-typed fields sorted and deduplicated first so that the key is
//! insensitive to caller-side ordering.

use serde_json::Map;
use serde_json::Value;
use sha2::Digest;
use sha2::Sha256;
use std::fmt;
use warden_types::Cursor;
use warden_types::DispatchCheckRequest;
use warden_types::DispatchExpandRequest;
use warden_types::DispatchLookupResourcesRequest;
use warden_types::DispatchLookupSubjectsRequest;
use warden_types::DispatchReachableResourcesRequest;
use warden_types::DebugSetting;
use warden_types::ExpansionMode;
use warden_types::RelationReference;
use warden_types::ResolverMeta;
use warden_types::ResultsSetting;
use warden_types::SubjectReference;

/// The identity of one dispatchable sub-request.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", hex::encode(&self.0[..8]))
    }
}

/// Incremental canonical encoder. Every field is written as a one-byte
/// tag, a little-endian length, and the bytes, so distinct field
/// sequences can never collide by concatenation.
struct Canon {
    hasher: Sha256,
}

impl Canon {
    fn new(kind: &'static str) -> Canon {
        let mut canon = Canon { hasher: Sha256::new() };
        canon.str_field(b'k', kind);
        canon
    }

    fn str_field(&mut self, tag: u8, value: &str) {
        self.hasher.update([tag]);
        self.hasher.update((value.len() as u64).to_le_bytes());
        self.hasher.update(value.as_bytes());
    }

    fn set_field(&mut self, tag: u8, values: &[String]) {
        let mut sorted: Vec<&str> =
            values.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        sorted.dedup();
        self.hasher.update([tag]);
        self.hasher.update((sorted.len() as u64).to_le_bytes());
        for value in sorted {
            self.str_field(b'e', value);
        }
    }

    fn meta(&mut self, meta: &ResolverMeta) {
        // depth_remaining deliberately excluded: the answer to a question
        // does not depend on the budget left to answer it, and including
        // it would fragment the cache across call depths.
        self.str_field(b'r', meta.at_revision.as_str());
    }

    fn relation(&mut self, tag: u8, relation: &RelationReference) {
        self.str_field(tag, &relation.namespace);
        self.str_field(tag, &relation.relation);
    }

    fn subject(&mut self, subject: &SubjectReference) {
        self.str_field(b's', &subject.object.namespace);
        self.str_field(b's', &subject.object.object_id);
        self.str_field(b's', subject.relation_or_ellipsis());
    }

    fn context(&mut self, context: &Map<String, Value>) {
        // serde_json serializes map keys in sorted order (the
        // preserve_order feature is not enabled), so this is canonical.
        let json = serde_json::to_vec(context).expect("context serializes");
        self.hasher.update([b'c']);
        self.hasher.update((json.len() as u64).to_le_bytes());
        self.hasher.update(&json);
    }

    fn cursor(&mut self, cursor: &Option<Cursor>) {
        match cursor {
            None => self.str_field(b'u', ""),
            Some(cursor) => {
                self.str_field(b'u', &cursor.dispatch_version.to_string());
                for section in &cursor.sections {
                    self.str_field(b'u', section);
                }
            }
        }
    }

    fn finish(self) -> Fingerprint {
        Fingerprint(self.hasher.finalize().into())
    }
}

pub fn check_request(request: &DispatchCheckRequest) -> Fingerprint {
    let mut canon = Canon::new("check");
    canon.meta(&request.meta);
    canon.relation(b'o', &request.resource_relation);
    canon.set_field(b'i', &request.resource_ids);
    canon.subject(&request.subject);
    canon.context(&request.context);
    canon.str_field(
        b'm',
        match request.results_setting {
            ResultsSetting::AllowSingleResult => "single",
            ResultsSetting::RequireAllResults => "all",
        },
    );
    canon.str_field(
        b'd',
        match request.debug {
            DebugSetting::NoDebug => "off",
            DebugSetting::Debug => "on",
        },
    );
    canon.finish()
}

pub fn expand_request(request: &DispatchExpandRequest) -> Fingerprint {
    let mut canon = Canon::new("expand");
    canon.meta(&request.meta);
    canon.str_field(b'o', &request.resource.namespace);
    canon.str_field(b'o', &request.resource.object_id);
    canon.str_field(b'o', &request.relation);
    canon.str_field(
        b'm',
        match request.mode {
            ExpansionMode::Shallow => "shallow",
            ExpansionMode::Recursive => "recursive",
        },
    );
    canon.finish()
}

pub fn reachable_resources_request(
    request: &DispatchReachableResourcesRequest,
) -> Fingerprint {
    let mut canon = Canon::new("reachable-resources");
    canon.meta(&request.meta);
    canon.relation(b'o', &request.resource_relation);
    canon.relation(b's', &request.subject_relation);
    canon.set_field(b'i', &request.subject_ids);
    canon.cursor(&request.cursor);
    canon.finish()
}

pub fn lookup_resources_request(
    request: &DispatchLookupResourcesRequest,
) -> Fingerprint {
    let mut canon = Canon::new("lookup-resources");
    canon.meta(&request.meta);
    canon.relation(b'o', &request.resource_relation);
    canon.subject(&request.subject);
    canon.context(&request.context);
    canon.str_field(b'l', &request.optional_limit.to_string());
    canon.cursor(&request.cursor);
    canon.finish()
}

pub fn lookup_subjects_request(
    request: &DispatchLookupSubjectsRequest,
) -> Fingerprint {
    let mut canon = Canon::new("lookup-subjects");
    canon.meta(&request.meta);
    canon.relation(b'o', &request.resource_relation);
    canon.set_field(b'i', &request.resource_ids);
    canon.relation(b's', &request.subject_relation);
    canon.cursor(&request.cursor);
    canon.finish()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use warden_types::RevisionToken;

    /// A minimal well-formed check request for cache and ring tests.
    pub(crate) fn check_request(resource_id: &str) -> DispatchCheckRequest {
        DispatchCheckRequest {
            meta: ResolverMeta {
                at_revision: RevisionToken::new("1"),
                depth_remaining: 50,
            },
            resource_relation: RelationReference::new("document", "view"),
            resource_ids: vec![resource_id.to_string()],
            subject: SubjectReference::object("user", "alice"),
            context: Map::new(),
            results_setting: ResultsSetting::RequireAllResults,
            debug: DebugSetting::NoDebug,
        }
    }
}
