// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Property-based checks of the rewrite algebra identities: adding an
//! empty branch to a union, an everyone-branch to an intersection, or
//! subtracting an empty/everyone branch must behave like the identity
//! (or the empty) rewrite, for arbitrary small graphs.

mod common;

use common::user;
use common::Harness;
use proptest::prelude::*;
use std::collections::BTreeMap;
use warden_types::CompiledRewrite;
use warden_types::Membership;
use warden_types::NamespaceDefinition;
use warden_types::SubjectTypeRestriction;

const RESOURCES: u8 = 5;
const USERS: u8 = 4;

/// Random direct edges `document:doc{r}#a@user:u{u}`.
fn arb_edges() -> impl Strategy<Value = Vec<(u8, u8)>> {
    proptest::collection::vec((0..RESOURCES, 0..USERS), 0..16)
}

fn schema(view: CompiledRewrite) -> NamespaceDefinition {
    NamespaceDefinition::new("document")
        .with_relation("a", vec![SubjectTypeRestriction::object("user")])
        .with_relation("b", vec![SubjectTypeRestriction::object("user")])
        .with_relation(
            "everyone",
            vec![SubjectTypeRestriction::object("user")],
        )
        .with_permission("view", view)
}

/// Evaluates `view` over the generated edges (relation `b` stays empty;
/// relation `everyone` holds a wildcard for every document) and returns
/// the membership map for one subject.
fn memberships(
    view: CompiledRewrite,
    edges: &[(u8, u8)],
    subject: u8,
) -> BTreeMap<String, Membership> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("test runtime");
    runtime.block_on(async move {
        let harness = Harness::new();
        harness.store.set_namespace(schema(view));

        let mut fixtures: Vec<String> = edges
            .iter()
            .map(|(r, u)| format!("document:doc{}#a@user:u{}", r, u))
            .collect();
        for r in 0..RESOURCES {
            fixtures.push(format!("document:doc{}#everyone@user:*", r));
        }
        let fixture_refs: Vec<&str> =
            fixtures.iter().map(String::as_str).collect();
        let rev = harness.write(&fixture_refs);

        let resource_ids: Vec<String> =
            (0..RESOURCES).map(|r| format!("doc{}", r)).collect();
        let resource_refs: Vec<&str> =
            resource_ids.iter().map(String::as_str).collect();

        let response = harness
            .check(
                &rev,
                ("document", "view"),
                &resource_refs,
                user(&format!("u{}", subject)),
                50,
            )
            .await
            .expect("algebra check");

        assert!(
            response.metadata.dispatch_count
                >= response.metadata.cached_dispatch_count
        );
        assert!(response.metadata.depth_required <= 50);

        response
            .results
            .iter()
            .map(|(id, result)| (id.clone(), result.membership()))
            .collect()
    })
}

fn this_a() -> CompiledRewrite {
    CompiledRewrite::computed_userset("a")
}

fn empty_branch() -> CompiledRewrite {
    CompiledRewrite::computed_userset("b")
}

fn everyone_branch() -> CompiledRewrite {
    CompiledRewrite::computed_userset("everyone")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn union_with_not_member_is_identity(
        edges in arb_edges(),
        subject in 0..USERS,
    ) {
        let combined = memberships(
            CompiledRewrite::union(vec![this_a(), empty_branch()]),
            &edges,
            subject,
        );
        let alone = memberships(this_a(), &edges, subject);
        prop_assert_eq!(combined, alone);
    }

    #[test]
    fn intersection_with_member_is_identity(
        edges in arb_edges(),
        subject in 0..USERS,
    ) {
        let combined = memberships(
            CompiledRewrite::intersection(vec![
                this_a(),
                everyone_branch(),
            ]),
            &edges,
            subject,
        );
        let alone = memberships(this_a(), &edges, subject);
        prop_assert_eq!(combined, alone);
    }

    #[test]
    fn exclusion_of_not_member_is_identity(
        edges in arb_edges(),
        subject in 0..USERS,
    ) {
        let combined = memberships(
            CompiledRewrite::exclusion(this_a(), empty_branch()),
            &edges,
            subject,
        );
        let alone = memberships(this_a(), &edges, subject);
        prop_assert_eq!(combined, alone);
    }

    #[test]
    fn exclusion_of_member_is_empty(
        edges in arb_edges(),
        subject in 0..USERS,
    ) {
        let combined = memberships(
            CompiledRewrite::exclusion(this_a(), everyone_branch()),
            &edges,
            subject,
        );
        prop_assert!(combined.is_empty());
    }

    #[test]
    fn check_is_deterministic(
        edges in arb_edges(),
        subject in 0..USERS,
    ) {
        let first = memberships(this_a(), &edges, subject);
        let second = memberships(this_a(), &edges, subject);
        prop_assert_eq!(first, second);
    }
}
