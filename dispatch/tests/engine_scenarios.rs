// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end engine scenarios over the in-memory datastore.

mod common;

use assert_matches::assert_matches;
use common::user;
use common::Harness;
use pretty_assertions::assert_eq;
use serde_json::json;
use serde_json::Map;
use std::collections::BTreeSet;
use warden_dispatch::Dispatcher;
use warden_types::CompiledRewrite;
use warden_types::Error;
use warden_types::Membership;
use warden_types::NamespaceDefinition;
use warden_types::ReachabilityStatus;
use warden_types::SubjectTypeRestriction;

fn document_with_viewer() -> NamespaceDefinition {
    NamespaceDefinition::new("document").with_relation(
        "viewer",
        vec![SubjectTypeRestriction::object("user")],
    )
}

#[tokio::test]
async fn test_direct_membership() {
    let harness = Harness::new();
    harness.store.set_namespace(document_with_viewer());
    let rev = harness.write(&["document:doc1#viewer@user:alice"]);

    let response = harness
        .check(&rev, ("document", "viewer"), &["doc1"], user("alice"), 50)
        .await
        .unwrap();

    assert_eq!(
        response.results["doc1"].membership(),
        Membership::Member
    );
    assert_eq!(response.metadata.dispatch_count, 1);
    assert_eq!(response.metadata.depth_required, 1);
    assert_eq!(response.metadata.cached_dispatch_count, 0);
}

#[tokio::test]
async fn test_non_member_is_absent() {
    let harness = Harness::new();
    harness.store.set_namespace(document_with_viewer());
    let rev = harness.write(&["document:doc1#viewer@user:alice"]);

    let response = harness
        .check(&rev, ("document", "viewer"), &["doc1"], user("mallory"), 50)
        .await
        .unwrap();
    assert!(response.results.is_empty());
}

#[tokio::test]
async fn test_computed_userset() {
    let harness = Harness::new();
    harness.store.set_namespace(
        NamespaceDefinition::new("document")
            .with_relation(
                "owner",
                vec![SubjectTypeRestriction::object("user")],
            )
            .with_permission(
                "edit",
                CompiledRewrite::computed_userset("owner"),
            ),
    );
    let rev = harness.write(&["document:doc1#owner@user:bob"]);

    let response = harness
        .check(&rev, ("document", "edit"), &["doc1"], user("bob"), 50)
        .await
        .unwrap();

    assert_eq!(response.results["doc1"].membership(), Membership::Member);
    assert_eq!(response.metadata.depth_required, 2);
}

#[tokio::test]
async fn test_tuple_to_userset() {
    let harness = Harness::new();
    harness.store.set_namespace(
        NamespaceDefinition::new("folder").with_relation(
            "viewer",
            vec![SubjectTypeRestriction::object("user")],
        ),
    );
    harness.store.set_namespace(
        NamespaceDefinition::new("document")
            .with_relation(
                "parent",
                vec![SubjectTypeRestriction::object("folder")],
            )
            .with_permission(
                "view",
                CompiledRewrite::tuple_to_userset("parent", "viewer"),
            ),
    );
    let rev = harness.write(&[
        "folder:f1#viewer@user:carol",
        "document:doc1#parent@folder:f1",
    ]);

    let response = harness
        .check(&rev, ("document", "view"), &["doc1"], user("carol"), 50)
        .await
        .unwrap();
    assert_eq!(response.results["doc1"].membership(), Membership::Member);

    let denied = harness
        .check(&rev, ("document", "view"), &["doc1"], user("mallory"), 50)
        .await
        .unwrap();
    assert!(denied.results.is_empty());
}

#[tokio::test]
async fn test_intersection_with_caveat() {
    let harness = Harness::new();
    harness.store.set_namespace(
        NamespaceDefinition::new("document")
            .with_relation(
                "editor",
                vec![SubjectTypeRestriction::object("user")],
            )
            .with_relation(
                "published",
                vec![SubjectTypeRestriction::object("user")],
            )
            .with_permission(
                "edit",
                CompiledRewrite::intersection(vec![
                    CompiledRewrite::computed_userset("editor"),
                    CompiledRewrite::computed_userset("published"),
                ]),
            ),
    );
    harness.write(&["document:doc1#editor@user:dan"]);
    let caveated = "document:doc1#published@user:dan"
        .parse::<warden_types::RelationTuple>()
        .unwrap()
        .with_caveat(
            warden_types::ContextualizedCaveat::new("ts_after")
                .with_context("min_ts", json!(100)),
        );
    let rev = harness.store.write_tuples([caveated]);

    let response = harness
        .check(&rev, ("document", "edit"), &["doc1"], user("dan"), 50)
        .await
        .unwrap();

    let result = &response.results["doc1"];
    assert_eq!(result.membership(), Membership::CaveatedMember);
    assert_eq!(result.missing_expr_fields(), &["now".to_string()]);
    let expression = result.expression().expect("caveated expression");
    assert_eq!(expression.caveat_names(), vec!["ts_after"]);

    // Supplying the missing context resolves the caveat definitively.
    let mut context = Map::new();
    context.insert("now".to_string(), json!(150));
    let satisfied = harness
        .check_with_context(
            &rev,
            ("document", "edit"),
            &["doc1"],
            user("dan"),
            50,
            context,
        )
        .await
        .unwrap();
    assert_eq!(
        satisfied.results["doc1"].membership(),
        Membership::Member
    );

    let mut early = Map::new();
    early.insert("now".to_string(), json!(50));
    let unsatisfied = harness
        .check_with_context(
            &rev,
            ("document", "edit"),
            &["doc1"],
            user("dan"),
            50,
            early,
        )
        .await
        .unwrap();
    assert!(unsatisfied.results.is_empty());
}

#[tokio::test]
async fn test_depth_exhaustion_on_cycle() {
    let harness = Harness::new();
    harness.store.set_namespace(
        NamespaceDefinition::new("x")
            .with_permission("a", CompiledRewrite::computed_userset("b"))
            .with_permission("b", CompiledRewrite::computed_userset("a")),
    );
    let rev = harness.write(&[]);

    let result =
        harness.check(&rev, ("x", "a"), &["y"], user("z"), 3).await;
    assert_matches!(result, Err(Error::DepthExceeded));
}

#[tokio::test]
async fn test_exclusion() {
    let harness = Harness::new();
    harness.store.set_namespace(
        NamespaceDefinition::new("document")
            .with_relation(
                "viewer",
                vec![SubjectTypeRestriction::object("user")],
            )
            .with_relation(
                "banned",
                vec![SubjectTypeRestriction::object("user")],
            )
            .with_permission(
                "view",
                CompiledRewrite::exclusion(
                    CompiledRewrite::computed_userset("viewer"),
                    CompiledRewrite::computed_userset("banned"),
                ),
            ),
    );
    let rev = harness.write(&[
        "document:doc1#viewer@user:eve",
        "document:doc1#banned@user:eve",
        "document:doc2#viewer@user:eve",
    ]);

    let response = harness
        .check(
            &rev,
            ("document", "view"),
            &["doc1", "doc2"],
            user("eve"),
            50,
        )
        .await
        .unwrap();
    assert!(!response.results.contains_key("doc1"));
    assert_eq!(response.results["doc2"].membership(), Membership::Member);
}

#[tokio::test]
async fn test_userset_indirection_through_groups() {
    let harness = Harness::new();
    harness.store.set_namespace(
        NamespaceDefinition::new("group").with_relation(
            "member",
            vec![
                SubjectTypeRestriction::object("user"),
                SubjectTypeRestriction::userset("group", "member"),
            ],
        ),
    );
    harness.store.set_namespace(
        NamespaceDefinition::new("document").with_relation(
            "viewer",
            vec![
                SubjectTypeRestriction::object("user"),
                SubjectTypeRestriction::userset("group", "member"),
            ],
        ),
    );
    let rev = harness.write(&[
        "document:doc1#viewer@group:root#member",
        "group:root#member@group:eng#member",
        "group:eng#member@user:fred",
    ]);

    let response = harness
        .check(&rev, ("document", "viewer"), &["doc1"], user("fred"), 50)
        .await
        .unwrap();
    assert_eq!(response.results["doc1"].membership(), Membership::Member);
    // doc -> root -> eng -> direct membership: three dispatch levels.
    assert_eq!(response.metadata.depth_required, 3);
}

#[tokio::test]
async fn test_wildcard_subject() {
    let harness = Harness::new();
    harness.store.set_namespace(document_with_viewer());
    let rev = harness.write(&["document:doc1#viewer@user:*"]);

    let response = harness
        .check(&rev, ("document", "viewer"), &["doc1"], user("anyone"), 50)
        .await
        .unwrap();
    assert_eq!(response.results["doc1"].membership(), Membership::Member);
}

#[tokio::test]
async fn test_cache_hit_equivalence() {
    let harness = Harness::new();
    harness.store.set_namespace(document_with_viewer());
    let rev = harness.write(&["document:doc1#viewer@user:alice"]);

    let first = harness
        .check(&rev, ("document", "viewer"), &["doc1"], user("alice"), 50)
        .await
        .unwrap();
    assert_eq!(first.metadata.cached_dispatch_count, 0);

    let second = harness
        .check(&rev, ("document", "viewer"), &["doc1"], user("alice"), 50)
        .await
        .unwrap();
    assert_eq!(second.results, first.results);
    assert_eq!(
        second.metadata.dispatch_count,
        second.metadata.cached_dispatch_count
    );
    // Depth accounting stays sound across the cache.
    assert_eq!(
        second.metadata.depth_required,
        first.metadata.depth_required
    );
}

#[tokio::test]
async fn test_new_revision_misses_the_cache() {
    let harness = Harness::new();
    harness.store.set_namespace(document_with_viewer());
    let rev1 = harness.write(&["document:doc1#viewer@user:alice"]);
    harness
        .check(&rev1, ("document", "viewer"), &["doc1"], user("alice"), 50)
        .await
        .unwrap();

    let rev2 = harness.write(&["document:doc2#viewer@user:alice"]);
    let at_rev2 = harness
        .check(&rev2, ("document", "viewer"), &["doc1"], user("alice"), 50)
        .await
        .unwrap();
    assert_eq!(at_rev2.metadata.cached_dispatch_count, 0);
}

#[tokio::test]
async fn test_invalid_arguments_rejected() {
    let harness = Harness::new();
    harness.store.set_namespace(document_with_viewer());
    let rev = harness.write(&[]);

    // No resource ids.
    let empty = harness
        .check(&rev, ("document", "viewer"), &[], user("alice"), 50)
        .await;
    assert_matches!(empty, Err(Error::InvalidArgument { .. }));

    // Unknown relation at this revision.
    let unknown = harness
        .check(&rev, ("document", "nonexistent"), &["doc1"], user("a"), 50)
        .await;
    assert_matches!(unknown, Err(Error::InvalidArgument { .. }));

    // Unknown namespace at this revision.
    let unknown_ns =
        harness.check(&rev, ("nope", "viewer"), &["doc1"], user("a"), 50).await;
    assert_matches!(unknown_ns, Err(Error::InvalidArgument { .. }));
}

#[tokio::test]
async fn test_stale_revision_surfaced() {
    // A dedicated engine around a low-retention store.
    let store = warden_storage::MemoryDatastore::with_retention(2);
    let (_view, ring) = warden_dispatch::MembershipView::new(Vec::new(), 100);
    let engine = warden_dispatch::DispatchEngine::new(
        "test-node",
        std::sync::Arc::new(store.clone()),
        warden_dispatch::caveats::registry_with_ts_after(),
        warden_dispatch::DispatchTuning::default(),
        ring,
        std::sync::Arc::new(warden_dispatch::LocalOnlyPeers),
        &common::test_logger(),
    );

    store.set_namespace(document_with_viewer());
    let old = store.write_tuples([
        "document:doc1#viewer@user:alice".parse().unwrap()
    ]);
    store.write_tuples(["document:doc2#viewer@user:a".parse().unwrap()]);
    store.write_tuples(["document:doc3#viewer@user:a".parse().unwrap()]);

    let result = engine
        .dispatch_check(warden_types::DispatchCheckRequest {
            meta: warden_types::ResolverMeta {
                at_revision: old,
                depth_remaining: 50,
            },
            resource_relation: warden_types::RelationReference::new(
                "document", "viewer",
            ),
            resource_ids: vec!["doc1".to_string()],
            subject: user("alice"),
            context: Map::new(),
            results_setting: warden_types::ResultsSetting::RequireAllResults,
            debug: warden_types::DebugSetting::NoDebug,
        })
        .await;
    assert_matches!(result, Err(Error::RevisionStale { .. }));
}

#[tokio::test]
async fn test_reachable_resources_through_groups() {
    let harness = Harness::new();
    harness.store.set_namespace(
        NamespaceDefinition::new("group").with_relation(
            "member",
            vec![
                SubjectTypeRestriction::object("user"),
                SubjectTypeRestriction::userset("group", "member"),
            ],
        ),
    );
    harness.store.set_namespace(
        NamespaceDefinition::new("document").with_relation(
            "viewer",
            vec![
                SubjectTypeRestriction::object("user"),
                SubjectTypeRestriction::userset("group", "member"),
            ],
        ),
    );
    let rev = harness.write(&[
        "document:doc1#viewer@user:ann",
        "document:doc2#viewer@group:eng#member",
        "document:doc3#viewer@group:root#member",
        "group:eng#member@user:ann",
        "group:root#member@group:eng#member",
    ]);

    let chunks = harness
        .reachable(
            &rev,
            ("document", "viewer"),
            ("user", "..."),
            &["ann"],
            None,
        )
        .await
        .unwrap();

    let found: BTreeSet<&str> = chunks
        .iter()
        .map(|c| c.resource.resource_id.as_str())
        .collect();
    assert_eq!(found, BTreeSet::from(["doc1", "doc2", "doc3"]));
    for chunk in &chunks {
        assert_eq!(
            chunk.resource.status,
            ReachabilityStatus::HasPermission
        );
        assert_eq!(chunk.resource.for_subject_ids, vec!["ann".to_string()]);
    }
}

#[tokio::test]
async fn test_reachable_resumes_as_a_suffix() {
    let harness = Harness::new();
    harness.store.set_namespace(
        NamespaceDefinition::new("group").with_relation(
            "member",
            vec![
                SubjectTypeRestriction::object("user"),
                SubjectTypeRestriction::userset("group", "member"),
            ],
        ),
    );
    harness.store.set_namespace(
        NamespaceDefinition::new("document").with_relation(
            "viewer",
            vec![
                SubjectTypeRestriction::object("user"),
                SubjectTypeRestriction::userset("group", "member"),
            ],
        ),
    );
    let mut fixtures = vec![
        "group:eng#member@user:ann".to_string(),
        "group:root#member@group:eng#member".to_string(),
    ];
    for i in 0..20 {
        fixtures.push(format!("document:direct{i:02}#viewer@user:ann"));
        fixtures.push(format!(
            "document:eng{i:02}#viewer@group:eng#member"
        ));
        fixtures.push(format!(
            "document:root{i:02}#viewer@group:root#member"
        ));
    }
    let fixture_refs: Vec<&str> =
        fixtures.iter().map(String::as_str).collect();
    let rev = harness.write(&fixture_refs);

    let full = harness
        .reachable(
            &rev,
            ("document", "viewer"),
            ("user", "..."),
            &["ann"],
            None,
        )
        .await
        .unwrap();
    let full_ids: Vec<&str> =
        full.iter().map(|c| c.resource.resource_id.as_str()).collect();
    assert_eq!(full_ids.len(), 60);

    // Resume from every position; the resumed stream must cover exactly
    // the suffix (duplicates permitted, losses not).
    for split in [1, 7, 20, 35, 59] {
        let cursor = full[split - 1].after_response_cursor.clone();
        let resumed = harness
            .reachable(
                &rev,
                ("document", "viewer"),
                ("user", "..."),
                &["ann"],
                Some(cursor),
            )
            .await
            .unwrap();
        let resumed_ids: BTreeSet<&str> = resumed
            .iter()
            .map(|c| c.resource.resource_id.as_str())
            .collect();
        let expected_suffix: BTreeSet<&str> =
            full_ids[split..].iter().copied().collect();
        for id in &expected_suffix {
            assert!(
                resumed_ids.contains(id),
                "resume at {} lost {}",
                split,
                id
            );
        }
    }
}

#[tokio::test]
async fn test_lookup_resources_with_cursor_pagination() {
    let harness = Harness::new();
    harness.store.set_namespace(
        NamespaceDefinition::new("document")
            .with_relation(
                "viewer",
                vec![SubjectTypeRestriction::object("user")],
            )
            .with_permission(
                "view",
                CompiledRewrite::computed_userset("viewer"),
            ),
    );
    let fixtures: Vec<String> = (0..1000)
        .map(|i| format!("document:doc{i:04}#viewer@user:e"))
        .collect();
    let fixture_refs: Vec<&str> =
        fixtures.iter().map(String::as_str).collect();
    let rev = harness.write(&fixture_refs);

    let mut all: BTreeSet<String> = BTreeSet::new();
    let mut cursor = None;
    let mut calls = 0;
    loop {
        let chunks = harness
            .lookup_resources(
                &rev,
                ("document", "view"),
                user("e"),
                250,
                cursor.clone(),
            )
            .await
            .unwrap();
        calls += 1;
        assert!(chunks.len() <= 250);
        let unique: BTreeSet<&str> = chunks
            .iter()
            .map(|c| c.resource.resource_id.as_str())
            .collect();
        assert_eq!(unique.len(), chunks.len(), "within-call duplicates");
        for chunk in &chunks {
            assert_eq!(
                chunk.resource.status,
                warden_types::PermissionStatus::HasPermission
            );
            all.insert(chunk.resource.resource_id.clone());
        }
        if chunks.len() < 250 {
            break;
        }
        cursor =
            Some(chunks.last().unwrap().after_response_cursor.clone());
        assert!(calls <= 5, "pagination failed to make progress");
    }

    assert_eq!(all.len(), 1000);
    assert!(calls >= 4);
}

#[tokio::test]
async fn test_lookup_resources_requires_check_path() {
    let harness = Harness::new();
    harness.store.set_namespace(
        NamespaceDefinition::new("document")
            .with_relation(
                "viewer",
                vec![SubjectTypeRestriction::object("user")],
            )
            .with_relation(
                "banned",
                vec![SubjectTypeRestriction::object("user")],
            )
            .with_permission(
                "view",
                CompiledRewrite::exclusion(
                    CompiledRewrite::computed_userset("viewer"),
                    CompiledRewrite::computed_userset("banned"),
                ),
            ),
    );
    let rev = harness.write(&[
        "document:doc1#viewer@user:eve",
        "document:doc2#viewer@user:eve",
        "document:doc2#banned@user:eve",
    ]);

    let chunks = harness
        .lookup_resources(&rev, ("document", "view"), user("eve"), 0, None)
        .await
        .unwrap();
    let ids: BTreeSet<&str> = chunks
        .iter()
        .map(|c| c.resource.resource_id.as_str())
        .collect();
    // doc2 is reachable but the check filters it out.
    assert_eq!(ids, BTreeSet::from(["doc1"]));
}

#[tokio::test]
async fn test_depth_monotonicity_across_scenarios() {
    let harness = Harness::new();
    harness.store.set_namespace(
        NamespaceDefinition::new("document")
            .with_relation(
                "owner",
                vec![SubjectTypeRestriction::object("user")],
            )
            .with_permission(
                "edit",
                CompiledRewrite::computed_userset("owner"),
            ),
    );
    let rev = harness.write(&["document:doc1#owner@user:bob"]);

    for depth in [2, 5, 50] {
        let response = harness
            .check(&rev, ("document", "edit"), &["doc1"], user("bob"), depth)
            .await
            .unwrap();
        assert!(response.metadata.depth_required <= depth);
        assert!(
            response.metadata.dispatch_count
                >= response.metadata.cached_dispatch_count
        );
    }
}

#[tokio::test]
async fn test_batched_check_reports_each_id() {
    let harness = Harness::new();
    harness.store.set_namespace(document_with_viewer());
    let rev = harness.write(&[
        "document:doc1#viewer@user:alice",
        "document:doc3#viewer@user:alice",
    ]);

    let response = harness
        .check(
            &rev,
            ("document", "viewer"),
            &["doc1", "doc2", "doc3"],
            user("alice"),
            50,
        )
        .await
        .unwrap();
    assert_eq!(response.results.len(), 2);
    assert_eq!(response.results["doc1"].membership(), Membership::Member);
    assert_eq!(response.results["doc3"].membership(), Membership::Member);
    assert!(!response.results.contains_key("doc2"));
}

#[tokio::test]
async fn test_lookup_subjects_forward_walk() {
    let harness = Harness::new();
    harness.store.set_namespace(
        NamespaceDefinition::new("group").with_relation(
            "member",
            vec![SubjectTypeRestriction::object("user")],
        ),
    );
    harness.store.set_namespace(
        NamespaceDefinition::new("document").with_relation(
            "viewer",
            vec![
                SubjectTypeRestriction::object("user"),
                SubjectTypeRestriction::userset("group", "member"),
            ],
        ),
    );
    let rev = harness.write(&[
        "document:doc1#viewer@user:ann",
        "document:doc1#viewer@group:eng#member",
        "group:eng#member@user:bob",
        "group:eng#member@user:carol",
    ]);

    let (tx, rx) = warden_dispatch::stream::chunk_channel(16);
    let engine = std::sync::Arc::clone(&harness.engine);
    let worker = tokio::spawn(async move {
        engine
            .dispatch_lookup_subjects(
                warden_types::DispatchLookupSubjectsRequest {
                    meta: warden_types::ResolverMeta {
                        at_revision: rev,
                        depth_remaining: 50,
                    },
                    resource_relation:
                        warden_types::RelationReference::new(
                            "document", "viewer",
                        ),
                    resource_ids: vec!["doc1".to_string()],
                    subject_relation:
                        warden_types::RelationReference::new("user", "..."),
                    cursor: None,
                },
                tx,
            )
            .await
    });
    let chunks = warden_dispatch::stream::collect_chunks(rx).await;
    worker.await.unwrap().unwrap();

    let mut subjects: BTreeSet<String> = BTreeSet::new();
    for chunk in chunks {
        if let Some(found) =
            chunk.found_subjects_by_resource_id.get("doc1")
        {
            subjects.extend(
                found.subjects.iter().map(|s| s.subject_id.clone()),
            );
        }
    }
    assert_eq!(
        subjects,
        BTreeSet::from([
            "ann".to_string(),
            "bob".to_string(),
            "carol".to_string()
        ])
    );
}

#[tokio::test]
async fn test_cancellation_stops_the_stream() {
    let harness = Harness::new();
    harness.store.set_namespace(document_with_viewer());
    let fixtures: Vec<String> = (0..500)
        .map(|i| format!("document:doc{i:03}#viewer@user:ann"))
        .collect();
    let fixture_refs: Vec<&str> =
        fixtures.iter().map(String::as_str).collect();
    let rev = harness.write(&fixture_refs);

    let (tx, mut rx) = warden_dispatch::stream::chunk_channel(2);
    let engine = std::sync::Arc::clone(&harness.engine);
    let worker = tokio::spawn(async move {
        engine
            .dispatch_reachable_resources(
                warden_types::DispatchReachableResourcesRequest {
                    meta: warden_types::ResolverMeta {
                        at_revision: rev,
                        depth_remaining: 50,
                    },
                    resource_relation:
                        warden_types::RelationReference::new(
                            "document", "viewer",
                        ),
                    subject_relation:
                        warden_types::RelationReference::new("user", "..."),
                    subject_ids: vec!["ann".to_string()],
                    cursor: None,
                },
                tx,
            )
            .await
    });

    // Take a few chunks, then walk away.
    for _ in 0..3 {
        assert!(rx.recv().await.is_some());
    }
    drop(rx);

    let outcome =
        tokio::time::timeout(std::time::Duration::from_secs(5), worker)
            .await
            .expect("producer terminates after cancellation")
            .expect("producer does not panic");
    assert_matches!(outcome, Err(Error::Canceled));
}
