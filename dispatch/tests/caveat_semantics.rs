// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Caveat expression semantics through the operators: negation under
//! exclusion, disjunction under union, and wildcard exclusions in
//! lookup-subjects.

mod common;

use common::user;
use common::Harness;
use serde_json::json;
use serde_json::Map;
use warden_dispatch::Dispatcher;
use warden_types::CaveatExpression;
use warden_types::CompiledRewrite;
use warden_types::ContextualizedCaveat;
use warden_types::Membership;
use warden_types::NamespaceDefinition;
use warden_types::RelationTuple;
use warden_types::RevisionToken;
use warden_types::SubjectTypeRestriction;
use warden_types::WILDCARD_ID;

fn caveated_tuple(text: &str, min_ts: i64) -> RelationTuple {
    text.parse::<RelationTuple>().unwrap().with_caveat(
        ContextualizedCaveat::new("ts_after")
            .with_context("min_ts", json!(min_ts)),
    )
}

fn with_now(now: i64) -> Map<String, serde_json::Value> {
    let mut context = Map::new();
    context.insert("now".to_string(), json!(now));
    context
}

#[tokio::test]
async fn test_exclusion_negates_the_subtracted_caveat() {
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
    harness.write(&["document:doc1#viewer@user:eve"]);
    let rev = harness
        .store
        .write_tuples([caveated_tuple("document:doc1#banned@user:eve", 100)]);

    // Without context: membership is conditional on the ban *not*
    // holding.
    let undecided = harness
        .check(&rev, ("document", "view"), &["doc1"], user("eve"), 50)
        .await
        .unwrap();
    let result = &undecided.results["doc1"];
    assert_eq!(result.membership(), Membership::CaveatedMember);
    assert_eq!(result.missing_expr_fields(), &["now".to_string()]);
    assert!(matches!(
        result.expression(),
        Some(CaveatExpression::Not { .. })
    ));

    // Ban active: excluded.
    let banned = harness
        .check_with_context(
            &rev,
            ("document", "view"),
            &["doc1"],
            user("eve"),
            50,
            with_now(150),
        )
        .await
        .unwrap();
    assert!(banned.results.is_empty());

    // Ban not yet active: member.
    let allowed = harness
        .check_with_context(
            &rev,
            ("document", "view"),
            &["doc1"],
            user("eve"),
            50,
            with_now(50),
        )
        .await
        .unwrap();
    assert_eq!(
        allowed.results["doc1"].membership(),
        Membership::Member
    );
}

#[tokio::test]
async fn test_union_disjoins_caveated_branches() {
    let harness = Harness::new();
    harness.store.set_namespace(
        NamespaceDefinition::new("document")
            .with_relation(
                "early",
                vec![SubjectTypeRestriction::object("user")],
            )
            .with_relation(
                "late",
                vec![SubjectTypeRestriction::object("user")],
            )
            .with_permission(
                "view",
                CompiledRewrite::union(vec![
                    CompiledRewrite::computed_userset("early"),
                    CompiledRewrite::computed_userset("late"),
                ]),
            ),
    );
    harness.store.write_tuples([caveated_tuple(
        "document:doc1#early@user:fay",
        100,
    )]);
    let rev = harness
        .store
        .write_tuples([caveated_tuple("document:doc1#late@user:fay", 200)]);

    // Both branches pending: the result is their disjunction.
    let undecided = harness
        .check(&rev, ("document", "view"), &["doc1"], user("fay"), 50)
        .await
        .unwrap();
    let result = &undecided.results["doc1"];
    assert_eq!(result.membership(), Membership::CaveatedMember);
    assert_eq!(result.missing_expr_fields(), &["now".to_string()]);
    assert!(matches!(
        result.expression(),
        Some(CaveatExpression::Or { .. })
    ));

    // One branch satisfied is enough.
    let satisfied = harness
        .check_with_context(
            &rev,
            ("document", "view"),
            &["doc1"],
            user("fay"),
            50,
            with_now(150),
        )
        .await
        .unwrap();
    assert_eq!(
        satisfied.results["doc1"].membership(),
        Membership::Member
    );

    // Neither branch holds.
    let unsatisfied = harness
        .check_with_context(
            &rev,
            ("document", "view"),
            &["doc1"],
            user("fay"),
            50,
            with_now(10),
        )
        .await
        .unwrap();
    assert!(unsatisfied.results.is_empty());
}

async fn lookup_doc1_subjects(
    harness: &Harness,
    rev: &RevisionToken,
) -> warden_types::FoundSubjects {
    let (tx, rx) = warden_dispatch::stream::chunk_channel(16);
    let engine = std::sync::Arc::clone(&harness.engine);
    let rev = rev.clone();
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
                            "document", "view",
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

    let mut found = warden_types::FoundSubjects::default();
    for chunk in chunks {
        if let Some(subjects) =
            chunk.found_subjects_by_resource_id.get("doc1")
        {
            found.subjects.extend(subjects.subjects.iter().cloned());
        }
    }
    found
}

#[tokio::test]
async fn test_lookup_subjects_wildcard_with_exclusions() {
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
        "document:doc1#viewer@user:*",
        "document:doc1#banned@user:mallory",
    ]);

    let found = lookup_doc1_subjects(&harness, &rev).await;
    assert_eq!(found.subjects.len(), 1);
    let wildcard = &found.subjects[0];
    assert_eq!(wildcard.subject_id, WILDCARD_ID);
    assert_eq!(wildcard.excluded_subjects.len(), 1);
    assert_eq!(wildcard.excluded_subjects[0].subject_id, "mallory");

    // The exclusion holds up under check: mallory is not a member,
    // anyone else is.
    let mallory = harness
        .check(&rev, ("document", "view"), &["doc1"], user("mallory"), 50)
        .await
        .unwrap();
    assert!(mallory.results.is_empty());
    let alice = harness
        .check(&rev, ("document", "view"), &["doc1"], user("alice"), 50)
        .await
        .unwrap();
    assert_eq!(alice.results["doc1"].membership(), Membership::Member);
}
