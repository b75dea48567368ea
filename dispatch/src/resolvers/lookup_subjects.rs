// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The lookup-subjects resolver: the forward walk from resources to the
//! subjects that can reach them.
//!
//! Resources are processed in deterministic batches; each emitted chunk
//! carries the subject sets for one batch and a cursor counting the
//! resources already finished, so resumption skips whole resources.
//! Subject sets form their own algebra: union, intersection, and
//! subtraction must account for the wildcard subject (`*`) and its
//! exclusions, and for caveats on any edge crossed along the way.

use crate::caveats::CaveatOutcome;
use crate::engine::ResolverContext;
use crate::resolvers::MetaTracker;
use crate::stream::collect_chunks;
use crate::stream::ChunkSender;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Map;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use warden_storage::RelationshipFilter;
use warden_types::CaveatExpression;
use warden_types::CaveatReference;
use warden_types::CompiledRewrite;
use warden_types::ContextualizedCaveat;
use warden_types::Cursor;
use warden_types::DispatchLookupSubjectsRequest;
use warden_types::DispatchLookupSubjectsResponse;
use warden_types::Error;
use warden_types::FoundSubject;
use warden_types::FoundSubjects;
use warden_types::RelationReference;
use warden_types::Result;
use warden_types::WILDCARD_ID;

/// Resources resolved per emitted chunk.
const RESOURCE_BATCH_SIZE: usize = 32;

pub(crate) async fn resolve(
    ctx: ResolverContext,
    request: DispatchLookupSubjectsRequest,
    output: ChunkSender<DispatchLookupSubjectsResponse>,
) -> Result<()> {
    let definition = ctx
        .store
        .namespace(
            &request.meta.at_revision,
            &request.resource_relation.namespace,
        )
        .await?;
    let relation = definition
        .relation(&request.resource_relation.relation)
        .ok_or_else(|| {
            Error::unknown_relation(
                &request.resource_relation.namespace,
                &request.resource_relation.relation,
            )
        })?;

    let mut resource_ids = request.resource_ids.clone();
    resource_ids.sort_unstable();
    resource_ids.dedup();

    let processed = match request
        .cursor
        .as_ref()
        .filter(|cursor| cursor.is_current())
        .and_then(|cursor| cursor.head())
    {
        Some(section) => {
            section.parse().map_err(|_| Error::InvalidArgument {
                message: String::from("malformed cursor position"),
            })?
        }
        None => 0,
    };

    let evaluation = Evaluation { ctx: &ctx, request: &request };
    let mut meta = MetaTracker::new();

    let mut done = processed.min(resource_ids.len());
    while done < resource_ids.len() {
        let batch: Vec<String> = resource_ids
            [done..(done + RESOURCE_BATCH_SIZE).min(resource_ids.len())]
            .to_vec();
        let batch_len = batch.len();

        let sets =
            evaluation.evaluate(&relation.rewrite, batch, &mut meta).await?;
        done += batch_len;

        let found_subjects_by_resource_id: BTreeMap<String, FoundSubjects> =
            sets.into_iter()
                .filter(|(_, set)| !set.is_empty())
                .map(|(id, set)| (id, set.into_found_subjects()))
                .collect();
        if found_subjects_by_resource_id.is_empty()
            && done < resource_ids.len()
        {
            // Nothing to report for this batch; fold it into the next
            // chunk's cursor instead of emitting an empty one.
            continue;
        }

        output
            .send(DispatchLookupSubjectsResponse {
                found_subjects_by_resource_id,
                after_response_cursor: Cursor::at(vec![done.to_string()]),
                metadata: meta.take(),
            })
            .await?;
    }
    Ok(())
}

/// The subjects found for one resource, keyed by subject id (the
/// wildcard lives under its `*` key like any other).
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct SubjectSet {
    subjects: BTreeMap<String, FoundSubject>,
}

type SubjectSets = BTreeMap<String, SubjectSet>;

/// Membership of one concrete subject id in a set, accounting for the
/// wildcard and its exclusions: `None` means not a member; `Some(None)`
/// means an unconditional member; `Some(Some(expr))` a caveated one.
type MemberCondition = Option<Option<CaveatExpression>>;

fn and_exprs(
    a: Option<CaveatExpression>,
    b: Option<CaveatExpression>,
) -> Option<CaveatExpression> {
    match (a, b) {
        (None, None) => None,
        (Some(expr), None) | (None, Some(expr)) => Some(expr),
        (Some(a), Some(b)) => Some(CaveatExpression::and(vec![a, b])),
    }
}

fn or_exprs(
    a: Option<CaveatExpression>,
    b: Option<CaveatExpression>,
) -> Option<CaveatExpression> {
    // An unconditional side makes the disjunction unconditional.
    match (a, b) {
        (Some(a), Some(b)) => Some(CaveatExpression::or(vec![a, b])),
        _ => None,
    }
}

impl SubjectSet {
    pub(crate) fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    fn wildcard(&self) -> Option<&FoundSubject> {
        self.subjects.get(WILDCARD_ID)
    }

    pub(crate) fn insert(&mut self, subject: FoundSubject) {
        match self.subjects.get_mut(&subject.subject_id) {
            None => {
                self.subjects.insert(subject.subject_id.clone(), subject);
            }
            Some(existing) => {
                // Same subject found twice: union of the two findings.
                existing.caveat_expression = or_exprs(
                    existing.caveat_expression.take(),
                    subject.caveat_expression,
                );
                if existing.subject_id == WILDCARD_ID {
                    let mine: Vec<FoundSubject> =
                        std::mem::take(&mut existing.excluded_subjects);
                    existing.excluded_subjects = intersect_exclusions(
                        mine,
                        subject.excluded_subjects,
                    );
                }
            }
        }
    }

    fn membership_condition(&self, subject_id: &str) -> MemberCondition {
        if let Some(found) = self.subjects.get(subject_id) {
            return Some(found.caveat_expression.clone());
        }
        let wildcard = self.wildcard()?;
        let excluded = wildcard
            .excluded_subjects
            .iter()
            .find(|excluded| excluded.subject_id == subject_id);
        match excluded {
            // Excluded outright.
            Some(entry) if entry.caveat_expression.is_none() => None,
            // Excluded only when the exclusion's caveat holds.
            Some(entry) => Some(and_exprs(
                wildcard.caveat_expression.clone(),
                entry
                    .caveat_expression
                    .clone()
                    .map(CaveatExpression::not),
            )),
            None => Some(wildcard.caveat_expression.clone()),
        }
    }

    fn concrete_ids(&self) -> impl Iterator<Item = &String> {
        self.subjects.keys().filter(|id| id.as_str() != WILDCARD_ID)
    }

    pub(crate) fn union(mut self, other: SubjectSet) -> SubjectSet {
        for (_, subject) in other.subjects {
            self.insert(subject);
        }
        self
    }

    pub(crate) fn intersect(self, other: SubjectSet) -> SubjectSet {
        let mut result = SubjectSet::default();
        let candidate_ids: BTreeSet<String> = self
            .concrete_ids()
            .chain(other.concrete_ids())
            .cloned()
            .collect();
        for id in candidate_ids {
            let (Some(a), Some(b)) = (
                self.membership_condition(&id),
                other.membership_condition(&id),
            ) else {
                continue;
            };
            result.insert(FoundSubject {
                subject_id: id,
                caveat_expression: and_exprs(a, b),
                excluded_subjects: Vec::new(),
            });
        }
        if let (Some(a), Some(b)) = (self.wildcard(), other.wildcard()) {
            // Both sides cover everything; an id is excluded from the
            // intersection if either side excludes it.
            let mut exclusions: BTreeMap<String, FoundSubject> =
                BTreeMap::new();
            for excluded in a
                .excluded_subjects
                .iter()
                .chain(b.excluded_subjects.iter())
            {
                // Concrete membership on the other side already handled
                // above; only exclude ids not reinstated concretely.
                if self.subjects.contains_key(&excluded.subject_id)
                    || other.subjects.contains_key(&excluded.subject_id)
                {
                    continue;
                }
                match exclusions.get_mut(&excluded.subject_id) {
                    None => {
                        exclusions.insert(
                            excluded.subject_id.clone(),
                            excluded.clone(),
                        );
                    }
                    Some(existing) => {
                        existing.caveat_expression = or_exprs(
                            existing.caveat_expression.take(),
                            excluded.caveat_expression.clone(),
                        );
                    }
                }
            }
            result.insert(FoundSubject {
                subject_id: WILDCARD_ID.to_string(),
                caveat_expression: and_exprs(
                    a.caveat_expression.clone(),
                    b.caveat_expression.clone(),
                ),
                excluded_subjects: exclusions.into_values().collect(),
            });
        }
        result
    }

    pub(crate) fn subtract(self, other: SubjectSet) -> SubjectSet {
        let mut result = SubjectSet::default();
        let other_wildcard = other.wildcard().cloned();

        for (id, subject) in &self.subjects {
            if id == WILDCARD_ID {
                continue;
            }
            let mut caveat = subject.caveat_expression.clone();

            match other.membership_condition(id) {
                // Unconditionally subtracted.
                Some(None) => continue,
                // Conditionally subtracted: survives when the condition
                // fails.
                Some(Some(expr)) => {
                    caveat =
                        and_exprs(caveat, Some(CaveatExpression::not(expr)));
                }
                None => (),
            }
            result.insert(FoundSubject {
                subject_id: id.clone(),
                caveat_expression: caveat,
                excluded_subjects: Vec::new(),
            });
        }

        if let Some(wildcard) = self.wildcard() {
            match &other_wildcard {
                Some(other_wild)
                    if other_wild.caveat_expression.is_none() =>
                {
                    // Everything is subtracted; nothing survives of the
                    // wildcard. (Ids the subtrahend excluded from its own
                    // wildcard are a pathological double negative; they
                    // are dropped conservatively.)
                }
                other_wild => {
                    let mut exclusions: Vec<FoundSubject> =
                        wildcard.excluded_subjects.clone();
                    // Every concrete subject of the subtrahend becomes
                    // an exclusion, conditional on its own caveat.
                    for (id, subject) in &other.subjects {
                        if id == WILDCARD_ID {
                            continue;
                        }
                        exclusions.push(FoundSubject {
                            subject_id: id.clone(),
                            caveat_expression: subject
                                .caveat_expression
                                .clone(),
                            excluded_subjects: Vec::new(),
                        });
                    }
                    let caveat = match other_wild {
                        Some(other_wild) => and_exprs(
                            wildcard.caveat_expression.clone(),
                            other_wild
                                .caveat_expression
                                .clone()
                                .map(CaveatExpression::not),
                        ),
                        None => wildcard.caveat_expression.clone(),
                    };
                    result.insert(FoundSubject {
                        subject_id: WILDCARD_ID.to_string(),
                        caveat_expression: caveat,
                        excluded_subjects: exclusions,
                    });
                }
            }
        }
        result
    }

    fn apply_edge_caveat(
        mut self,
        edge: &Option<CaveatExpression>,
    ) -> SubjectSet {
        if let Some(edge) = edge {
            for subject in self.subjects.values_mut() {
                subject.caveat_expression = and_exprs(
                    subject.caveat_expression.take(),
                    Some(edge.clone()),
                );
            }
        }
        self
    }

    fn into_found_subjects(self) -> FoundSubjects {
        FoundSubjects { subjects: self.subjects.into_values().collect() }
    }
}

/// Intersection of two wildcard exclusion lists (an id stays excluded
/// from the union of two wildcards only if both excluded it).
fn intersect_exclusions(
    a: Vec<FoundSubject>,
    b: Vec<FoundSubject>,
) -> Vec<FoundSubject> {
    let b_by_id: BTreeMap<String, FoundSubject> = b
        .into_iter()
        .map(|subject| (subject.subject_id.clone(), subject))
        .collect();
    a.into_iter()
        .filter_map(|mut subject| {
            let other = b_by_id.get(&subject.subject_id)?;
            // Both exclusions must hold for the id to stay excluded.
            subject.caveat_expression = match (
                subject.caveat_expression.take(),
                other.caveat_expression.clone(),
            ) {
                (None, None) => None,
                (Some(expr), None) | (None, Some(expr)) => Some(expr),
                (Some(a), Some(b)) => {
                    Some(CaveatExpression::and(vec![a, b]))
                }
            };
            Some(subject)
        })
        .collect()
}

struct Evaluation<'a> {
    ctx: &'a ResolverContext,
    request: &'a DispatchLookupSubjectsRequest,
}

impl<'a> Evaluation<'a> {
    /// Evaluates the caveat on a stored tuple with no caller context:
    /// `Ok(None)` means the edge is open, `Ok(Some(expr))` pending, and
    /// `Err` is reserved for unknown caveats. A definitively-false caveat
    /// is reported through the bool.
    fn edge_caveat(
        &self,
        caveat: &Option<ContextualizedCaveat>,
    ) -> Result<(bool, Option<CaveatExpression>)> {
        let Some(caveat) = caveat else {
            return Ok((true, None));
        };
        let reference = CaveatReference::from(caveat);
        match self.ctx.caveats.evaluate(&reference, &Map::new())? {
            CaveatOutcome::True => Ok((true, None)),
            CaveatOutcome::False => Ok((false, None)),
            CaveatOutcome::Missing(_) => {
                Ok((true, Some(CaveatExpression::leaf(reference))))
            }
        }
    }

    fn evaluate<'b>(
        &'b self,
        node: &'b CompiledRewrite,
        resource_ids: Vec<String>,
        meta: &'b mut MetaTracker,
    ) -> BoxFuture<'b, Result<SubjectSets>> {
        async move {
            match node {
                CompiledRewrite::This => {
                    self.evaluate_this(resource_ids, meta).await
                }
                CompiledRewrite::ComputedUserset { relation } => {
                    self.sub_lookup(
                        RelationReference::new(
                            &self.request.resource_relation.namespace,
                            relation,
                        ),
                        resource_ids,
                        meta,
                    )
                    .await
                }
                CompiledRewrite::TupleToUserset {
                    tupleset_relation,
                    computed_userset_relation,
                } => {
                    self.evaluate_tuple_to_userset(
                        tupleset_relation,
                        computed_userset_relation,
                        resource_ids,
                        meta,
                    )
                    .await
                }
                CompiledRewrite::Union { children } => {
                    let mut combined: SubjectSets = BTreeMap::new();
                    for child in children {
                        let sets = self
                            .evaluate(child, resource_ids.clone(), meta)
                            .await?;
                        for (id, set) in sets {
                            let merged = match combined.remove(&id) {
                                None => set,
                                Some(existing) => existing.union(set),
                            };
                            combined.insert(id, merged);
                        }
                    }
                    Ok(combined)
                }
                CompiledRewrite::Intersection { children } => {
                    let mut iter = children.iter();
                    let Some(first) = iter.next() else {
                        return Ok(BTreeMap::new());
                    };
                    let mut combined = self
                        .evaluate(first, resource_ids.clone(), meta)
                        .await?;
                    for child in iter {
                        if combined.is_empty() {
                            break;
                        }
                        let sets = self
                            .evaluate(child, resource_ids.clone(), meta)
                            .await?;
                        combined = combined
                            .into_iter()
                            .filter_map(|(id, set)| {
                                let other = sets.get(&id)?;
                                let intersected =
                                    set.intersect(other.clone());
                                (!intersected.is_empty())
                                    .then_some((id, intersected))
                            })
                            .collect();
                    }
                    Ok(combined)
                }
                CompiledRewrite::Exclusion { base, subtracted } => {
                    let base_sets = self
                        .evaluate(base, resource_ids.clone(), meta)
                        .await?;
                    if base_sets.is_empty() {
                        return Ok(base_sets);
                    }
                    let subtracted_sets = self
                        .evaluate(subtracted, resource_ids.clone(), meta)
                        .await?;
                    Ok(base_sets
                        .into_iter()
                        .filter_map(|(id, set)| {
                            let result = match subtracted_sets.get(&id) {
                                None => set,
                                Some(other) => {
                                    set.subtract(other.clone())
                                }
                            };
                            (!result.is_empty()).then_some((id, result))
                        })
                        .collect())
                }
            }
        }
        .boxed()
    }

    async fn evaluate_this(
        &self,
        resource_ids: Vec<String>,
        meta: &mut MetaTracker,
    ) -> Result<SubjectSets> {
        let request = self.request;
        let target = &request.subject_relation;
        let filter = RelationshipFilter::namespace(
            &request.resource_relation.namespace,
        )
        .object_ids(resource_ids)
        .relation(&request.resource_relation.relation);
        let tuples = self
            .ctx
            .store
            .query_relationships(&request.meta.at_revision, &filter)
            .await?;

        let mut sets: SubjectSets = BTreeMap::new();

        struct Indirection {
            userset_ids: BTreeSet<String>,
            origins: Vec<(String, String, Option<CaveatExpression>)>,
        }
        let mut indirections: BTreeMap<(String, String), Indirection> =
            BTreeMap::new();

        for tuple in tuples {
            let (open, edge) = self.edge_caveat(&tuple.caveat)?;
            if !open {
                continue;
            }
            let subject = &tuple.subject;
            let matches_target = subject.object.namespace
                == target.namespace
                && subject.relation_or_ellipsis() == target.relation;

            if matches_target {
                sets.entry(tuple.resource.object_id.clone())
                    .or_default()
                    .insert(FoundSubject {
                        subject_id: subject.object.object_id.clone(),
                        caveat_expression: edge,
                        excluded_subjects: Vec::new(),
                    });
                continue;
            }

            if let Some(userset_relation) = &subject.optional_relation {
                let entry = indirections
                    .entry((
                        subject.object.namespace.clone(),
                        userset_relation.clone(),
                    ))
                    .or_insert_with(|| Indirection {
                        userset_ids: BTreeSet::new(),
                        origins: Vec::new(),
                    });
                entry
                    .userset_ids
                    .insert(subject.object.object_id.clone());
                entry.origins.push((
                    tuple.resource.object_id.clone(),
                    subject.object.object_id.clone(),
                    edge,
                ));
            }
        }

        for ((namespace, relation), indirection) in indirections {
            let found = self
                .sub_lookup(
                    RelationReference::new(namespace, relation),
                    indirection.userset_ids.into_iter().collect(),
                    meta,
                )
                .await?;
            for (resource_id, userset_id, edge) in indirection.origins {
                if let Some(set) = found.get(&userset_id) {
                    let gated = set.clone().apply_edge_caveat(&edge);
                    let merged = match sets.remove(&resource_id) {
                        None => gated,
                        Some(existing) => existing.union(gated),
                    };
                    sets.insert(resource_id, merged);
                }
            }
        }

        Ok(sets)
    }

    async fn evaluate_tuple_to_userset(
        &self,
        tupleset_relation: &str,
        computed_userset_relation: &str,
        resource_ids: Vec<String>,
        meta: &mut MetaTracker,
    ) -> Result<SubjectSets> {
        let request = self.request;
        let filter = RelationshipFilter::namespace(
            &request.resource_relation.namespace,
        )
        .object_ids(resource_ids)
        .relation(tupleset_relation);
        let tuples = self
            .ctx
            .store
            .query_relationships(&request.meta.at_revision, &filter)
            .await?;

        struct Targets {
            target_ids: BTreeSet<String>,
            origins: Vec<(String, String, Option<CaveatExpression>)>,
        }
        let mut by_namespace: BTreeMap<String, Targets> = BTreeMap::new();
        for tuple in tuples {
            let (open, edge) = self.edge_caveat(&tuple.caveat)?;
            if !open {
                continue;
            }
            let entry = by_namespace
                .entry(tuple.subject.object.namespace.clone())
                .or_insert_with(|| Targets {
                    target_ids: BTreeSet::new(),
                    origins: Vec::new(),
                });
            entry.target_ids.insert(tuple.subject.object.object_id.clone());
            entry.origins.push((
                tuple.resource.object_id.clone(),
                tuple.subject.object.object_id.clone(),
                edge,
            ));
        }

        let mut sets: SubjectSets = BTreeMap::new();
        for (namespace, targets) in by_namespace {
            let found = self
                .sub_lookup(
                    RelationReference::new(
                        namespace,
                        computed_userset_relation,
                    ),
                    targets.target_ids.into_iter().collect(),
                    meta,
                )
                .await?;
            for (resource_id, target_id, edge) in targets.origins {
                if let Some(set) = found.get(&target_id) {
                    let gated = set.clone().apply_edge_caveat(&edge);
                    let merged = match sets.remove(&resource_id) {
                        None => gated,
                        Some(existing) => existing.union(gated),
                    };
                    sets.insert(resource_id, merged);
                }
            }
        }
        Ok(sets)
    }

    /// Issues a sub-lookup-subjects dispatch and materializes its chunks
    /// back into subject sets.
    async fn sub_lookup(
        &self,
        resource_relation: RelationReference,
        resource_ids: Vec<String>,
        meta: &mut MetaTracker,
    ) -> Result<SubjectSets> {
        let (rx, handle) =
            self.ctx.sub_lookup_subjects(DispatchLookupSubjectsRequest {
                meta: self.request.meta.descend(),
                resource_relation,
                resource_ids,
                subject_relation: self.request.subject_relation.clone(),
                cursor: None,
            });
        let chunks = collect_chunks(rx).await;
        handle
            .await
            .map_err(|_| Error::internal("subjects sub-stream panicked"))??;

        let mut sets: SubjectSets = BTreeMap::new();
        for chunk in chunks {
            meta.absorb_child_chunk(&chunk.metadata);
            for (resource_id, found) in chunk.found_subjects_by_resource_id
            {
                let set = sets.entry(resource_id).or_default();
                for subject in found.subjects {
                    set.insert(subject);
                }
            }
        }
        Ok(sets)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn concrete(id: &str) -> FoundSubject {
        FoundSubject::concrete(id)
    }

    fn caveated(id: &str, caveat: &str) -> FoundSubject {
        FoundSubject {
            subject_id: id.to_string(),
            caveat_expression: Some(CaveatExpression::leaf(
                CaveatReference {
                    caveat_name: caveat.to_string(),
                    context: Map::new(),
                },
            )),
            excluded_subjects: Vec::new(),
        }
    }

    fn wildcard(excluded: Vec<FoundSubject>) -> FoundSubject {
        FoundSubject {
            subject_id: WILDCARD_ID.to_string(),
            caveat_expression: None,
            excluded_subjects: excluded,
        }
    }

    fn set(subjects: Vec<FoundSubject>) -> SubjectSet {
        let mut set = SubjectSet::default();
        for subject in subjects {
            set.insert(subject);
        }
        set
    }

    fn ids(set: &SubjectSet) -> Vec<&str> {
        set.subjects.keys().map(String::as_str).collect()
    }

    #[test]
    fn test_union_dedups_and_prefers_unconditional() {
        let merged = set(vec![caveated("alice", "c1"), concrete("bob")])
            .union(set(vec![concrete("alice")]));
        assert_eq!(ids(&merged), vec!["alice", "bob"]);
        assert!(
            merged.subjects["alice"].caveat_expression.is_none(),
            "unconditional finding absorbs the caveated one"
        );
    }

    #[test]
    fn test_intersect_concrete() {
        let result = set(vec![concrete("alice"), concrete("bob")])
            .intersect(set(vec![concrete("bob"), concrete("carol")]));
        assert_eq!(ids(&result), vec!["bob"]);
    }

    #[test]
    fn test_intersect_with_wildcard_keeps_concretes() {
        let result = set(vec![concrete("alice"), concrete("bob")])
            .intersect(set(vec![wildcard(vec![concrete("bob")])]));
        assert_eq!(ids(&result), vec!["alice"]);
    }

    #[test]
    fn test_intersect_caveats_conjoin() {
        let result = set(vec![caveated("alice", "c1")])
            .intersect(set(vec![caveated("alice", "c2")]));
        let expr = result.subjects["alice"]
            .caveat_expression
            .as_ref()
            .expect("caveated intersection");
        assert_eq!(expr.caveat_names(), vec!["c1", "c2"]);
    }

    #[test]
    fn test_subtract_concrete() {
        let result = set(vec![concrete("alice"), concrete("bob")])
            .subtract(set(vec![concrete("bob")]));
        assert_eq!(ids(&result), vec!["alice"]);
    }

    #[test]
    fn test_subtract_caveated_subtrahend_negates() {
        let result = set(vec![concrete("alice")])
            .subtract(set(vec![caveated("alice", "banned_if")]));
        let expr = result.subjects["alice"]
            .caveat_expression
            .as_ref()
            .expect("conditional survival");
        assert_eq!(expr.caveat_names(), vec!["banned_if"]);
    }

    #[test]
    fn test_subtract_concrete_from_wildcard_records_exclusion() {
        let result = set(vec![wildcard(Vec::new())])
            .subtract(set(vec![concrete("mallory")]));
        let wild = result.subjects[WILDCARD_ID].clone();
        assert_eq!(wild.excluded_subjects.len(), 1);
        assert_eq!(wild.excluded_subjects[0].subject_id, "mallory");
    }

    #[test]
    fn test_subtract_wildcard_annihilates() {
        let result = set(vec![concrete("alice"), wildcard(Vec::new())])
            .subtract(set(vec![wildcard(Vec::new())]));
        assert!(result.is_empty());
    }

    #[test]
    fn test_wildcard_exclusion_blocks_membership() {
        let set_with_exclusion =
            set(vec![wildcard(vec![concrete("mallory")])]);
        assert!(set_with_exclusion
            .membership_condition("mallory")
            .is_none());
        assert!(set_with_exclusion
            .membership_condition("alice")
            .is_some());
    }
}
