// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared harness for engine integration tests: a memory datastore, a
//! single-node engine over it, and builders for the recurring request
//! shapes.

// Each test binary compiles its own copy; not every binary uses every
// helper.
#![allow(dead_code)]

use serde_json::Map;
use serde_json::Value;
use std::sync::Arc;
use warden_dispatch::caveats::registry_with_ts_after;
use warden_dispatch::stream::chunk_channel;
use warden_dispatch::stream::collect_chunks;
use warden_dispatch::DispatchEngine;
use warden_dispatch::DispatchTuning;
use warden_dispatch::Dispatcher;
use warden_dispatch::LocalOnlyPeers;
use warden_dispatch::MembershipView;
use warden_storage::MemoryDatastore;
use warden_types::Cursor;
use warden_types::DebugSetting;
use warden_types::DispatchCheckRequest;
use warden_types::DispatchCheckResponse;
use warden_types::DispatchLookupResourcesRequest;
use warden_types::DispatchLookupResourcesResponse;
use warden_types::DispatchReachableResourcesRequest;
use warden_types::DispatchReachableResourcesResponse;
use warden_types::RelationReference;
use warden_types::RelationTuple;
use warden_types::ResolverMeta;
use warden_types::Result;
use warden_types::ResultsSetting;
use warden_types::RevisionToken;
use warden_types::SubjectReference;

pub fn test_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

pub struct Harness {
    pub store: MemoryDatastore,
    pub engine: Arc<DispatchEngine>,
    /// Kept alive so membership updates remain possible mid-test.
    #[allow(dead_code)]
    pub view: MembershipView,
}

impl Harness {
    /// A single-node harness: the ring is empty, so everything resolves
    /// locally.
    pub fn new() -> Harness {
        Harness::with_tuning(DispatchTuning::default())
    }

    pub fn with_tuning(tuning: DispatchTuning) -> Harness {
        let store = MemoryDatastore::new();
        let (view, ring) = MembershipView::new(Vec::new(), 100);
        let engine = DispatchEngine::new(
            "test-node",
            Arc::new(store.clone()),
            registry_with_ts_after(),
            tuning,
            ring,
            Arc::new(LocalOnlyPeers),
            &test_logger(),
        );
        Harness { store, engine, view }
    }

    pub fn write(&self, tuples: &[&str]) -> RevisionToken {
        self.store.write_tuples(
            tuples
                .iter()
                .map(|t| t.parse::<RelationTuple>().expect("test tuple")),
        )
    }

    pub async fn check(
        &self,
        revision: &RevisionToken,
        resource_relation: (&str, &str),
        resource_ids: &[&str],
        subject: SubjectReference,
        depth: u32,
    ) -> Result<DispatchCheckResponse> {
        self.check_with_context(
            revision,
            resource_relation,
            resource_ids,
            subject,
            depth,
            Map::new(),
        )
        .await
    }

    pub async fn check_with_context(
        &self,
        revision: &RevisionToken,
        resource_relation: (&str, &str),
        resource_ids: &[&str],
        subject: SubjectReference,
        depth: u32,
        context: Map<String, Value>,
    ) -> Result<DispatchCheckResponse> {
        self.engine
            .dispatch_check(DispatchCheckRequest {
                meta: ResolverMeta {
                    at_revision: revision.clone(),
                    depth_remaining: depth,
                },
                resource_relation: RelationReference::new(
                    resource_relation.0,
                    resource_relation.1,
                ),
                resource_ids: resource_ids
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                subject,
                context,
                results_setting: ResultsSetting::RequireAllResults,
                debug: DebugSetting::NoDebug,
            })
            .await
    }

    /// Runs a reachable-resources stream to completion.
    pub async fn reachable(
        &self,
        revision: &RevisionToken,
        resource_relation: (&str, &str),
        subject_relation: (&str, &str),
        subject_ids: &[&str],
        cursor: Option<Cursor>,
    ) -> Result<Vec<DispatchReachableResourcesResponse>> {
        let (tx, rx) = chunk_channel(16);
        let request = DispatchReachableResourcesRequest {
            meta: ResolverMeta {
                at_revision: revision.clone(),
                depth_remaining: 50,
            },
            resource_relation: RelationReference::new(
                resource_relation.0,
                resource_relation.1,
            ),
            subject_relation: RelationReference::new(
                subject_relation.0,
                subject_relation.1,
            ),
            subject_ids: subject_ids
                .iter()
                .map(|s| s.to_string())
                .collect(),
            cursor,
        };
        let engine = Arc::clone(&self.engine);
        let worker = tokio::spawn(async move {
            engine.dispatch_reachable_resources(request, tx).await
        });
        let chunks = collect_chunks(rx).await;
        worker.await.expect("worker joins")?;
        Ok(chunks)
    }

    /// Runs a lookup-resources stream to completion.
    pub async fn lookup_resources(
        &self,
        revision: &RevisionToken,
        resource_relation: (&str, &str),
        subject: SubjectReference,
        limit: u32,
        cursor: Option<Cursor>,
    ) -> Result<Vec<DispatchLookupResourcesResponse>> {
        let (tx, rx) = chunk_channel(16);
        let request = DispatchLookupResourcesRequest {
            meta: ResolverMeta {
                at_revision: revision.clone(),
                depth_remaining: 50,
            },
            resource_relation: RelationReference::new(
                resource_relation.0,
                resource_relation.1,
            ),
            subject,
            context: Map::new(),
            optional_limit: limit,
            cursor,
        };
        let engine = Arc::clone(&self.engine);
        let worker = tokio::spawn(async move {
            engine.dispatch_lookup_resources(request, tx).await
        });
        let chunks = collect_chunks(rx).await;
        worker.await.expect("worker joins")?;
        Ok(chunks)
    }

}

pub fn user(id: &str) -> SubjectReference {
    SubjectReference::object("user", id)
}
