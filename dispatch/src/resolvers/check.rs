// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The check resolver: interprets a compiled rewrite for a batch of
//! resource ids against one subject.
//!
//! Evaluation is purely functional over the pinned snapshot; operator
//! nodes fan out concurrently and fold with the membership lattice
//! `NotMember < CaveatedMember < Member`. Result maps carry only ids with
//! at least caveated membership; absence means not-a-member.

use crate::caveats::CaveatOutcome;
use crate::engine::ResolverContext;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::FutureExt;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use warden_storage::RelationshipFilter;
use warden_types::CaveatExpression;
use warden_types::CaveatReference;
use warden_types::CheckTrace;
use warden_types::CompiledRewrite;
use warden_types::ContextualizedCaveat;
use warden_types::DebugInfo;
use warden_types::DebugSetting;
use warden_types::DispatchCheckRequest;
use warden_types::DispatchCheckResponse;
use warden_types::Error;
use warden_types::Membership;
use warden_types::RelationReference;
use warden_types::ResourceCheckResult;
use warden_types::ResponseMeta;
use warden_types::Result;
use warden_types::ResultsSetting;

/// Resolves one check request against local storage.
pub(crate) async fn resolve(
    ctx: ResolverContext,
    request: DispatchCheckRequest,
) -> Result<DispatchCheckResponse> {
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

    let evaluation = Evaluation { ctx: &ctx, request: &request };
    let outcome = evaluation
        .evaluate(
            &relation.rewrite,
            request.resource_ids.clone(),
            request.results_setting,
        )
        .await?;

    let mut metadata = ResponseMeta::single_dispatch();
    metadata.absorb(&outcome.meta);
    if request.debug == DebugSetting::Debug {
        metadata.debug_info = Some(DebugInfo {
            check: CheckTrace {
                resource_relation: request.resource_relation.clone(),
                resource_ids: request.resource_ids.clone(),
                subject: request.subject.clone(),
                results: outcome.results.clone(),
                children: outcome.traces,
            },
        });
    }

    Ok(DispatchCheckResponse { metadata, results: outcome.results })
}

/// What evaluating one rewrite node produced: memberships, sub-dispatch
/// accounting, and (under debug) the traces of the sub-dispatches
/// issued.
#[derive(Default)]
struct NodeOutcome {
    results: BTreeMap<String, ResourceCheckResult>,
    meta: ResponseMeta,
    traces: Vec<CheckTrace>,
}

impl NodeOutcome {
    fn absorb_sub_response(&mut self, response: &DispatchCheckResponse) {
        self.meta.absorb_hop(&response.metadata);
        if let Some(debug_info) = &response.metadata.debug_info {
            self.traces.push(debug_info.check.clone());
        }
    }
}

/// A caveat gate on one edge of the evaluation: the edge either passes
/// results through unchanged, or attaches a pending caveat expression.
/// Edges whose caveat evaluated definitively false are dropped before a
/// gate is ever built.
#[derive(Clone)]
enum EdgeGate {
    Open,
    Pending { expression: CaveatExpression, missing: Vec<String> },
}

impl EdgeGate {
    /// Applies the gate to a membership that flowed through the edge.
    fn apply(&self, result: ResourceCheckResult) -> ResourceCheckResult {
        match self {
            EdgeGate::Open => result,
            EdgeGate::Pending { expression, missing } => {
                match result.membership() {
                    Membership::NotMember => result,
                    Membership::Member => ResourceCheckResult::caveated(
                        expression.clone(),
                        missing.clone(),
                    ),
                    Membership::CaveatedMember => {
                        let mut fields = missing.clone();
                        for field in result.missing_expr_fields() {
                            if !fields.contains(field) {
                                fields.push(field.clone());
                            }
                        }
                        let inner = result
                            .expression()
                            .cloned()
                            .expect("caveated result carries expression");
                        ResourceCheckResult::caveated(
                            CaveatExpression::and(vec![
                                expression.clone(),
                                inner,
                            ]),
                            fields,
                        )
                    }
                }
            }
        }
    }
}

/// Folds `result` into `map[id]` with the OR (least-upper-bound) rule.
fn or_into(
    map: &mut BTreeMap<String, ResourceCheckResult>,
    id: &str,
    result: ResourceCheckResult,
) {
    if result.membership() == Membership::NotMember {
        return;
    }
    match map.get(id) {
        None => {
            map.insert(id.to_string(), result);
        }
        Some(existing) => {
            if existing.membership() == Membership::Member {
                return;
            }
            if result.membership() == Membership::Member {
                map.insert(id.to_string(), result);
                return;
            }
            // Both caveated: OR the expressions, union the missing
            // fields.
            let mut missing = existing.missing_expr_fields().to_vec();
            for field in result.missing_expr_fields() {
                if !missing.contains(field) {
                    missing.push(field.clone());
                }
            }
            let merged = CaveatExpression::or(vec![
                existing
                    .expression()
                    .cloned()
                    .expect("caveated result carries expression"),
                result
                    .expression()
                    .cloned()
                    .expect("caveated result carries expression"),
            ]);
            map.insert(
                id.to_string(),
                ResourceCheckResult::caveated(merged, missing),
            );
        }
    }
}

struct Evaluation<'a> {
    ctx: &'a ResolverContext,
    request: &'a DispatchCheckRequest,
}

impl<'a> Evaluation<'a> {
    /// Whether the results so far satisfy the caller and evaluation may
    /// stop.
    fn satisfied(
        &self,
        results: &BTreeMap<String, ResourceCheckResult>,
        resource_ids: &[String],
        setting: ResultsSetting,
    ) -> bool {
        match setting {
            ResultsSetting::AllowSingleResult => results
                .values()
                .any(|r| r.membership() == Membership::Member),
            ResultsSetting::RequireAllResults => resource_ids.iter().all(
                |id| {
                    results
                        .get(id)
                        .map(|r| r.membership() == Membership::Member)
                        .unwrap_or(false)
                },
            ),
        }
    }

    /// Builds the caveat gate for a stored tuple, or `None` when the
    /// tuple's caveat is definitively false under the merged context.
    fn tuple_gate(
        &self,
        caveat: &Option<ContextualizedCaveat>,
    ) -> Result<Option<EdgeGate>> {
        let Some(caveat) = caveat else {
            return Ok(Some(EdgeGate::Open));
        };
        let reference = CaveatReference::from(caveat);
        match self.ctx.caveats.evaluate(&reference, &self.request.context)? {
            CaveatOutcome::True => Ok(Some(EdgeGate::Open)),
            CaveatOutcome::False => Ok(None),
            CaveatOutcome::Missing(missing) => Ok(Some(EdgeGate::Pending {
                expression: CaveatExpression::leaf(reference),
                missing,
            })),
        }
    }

    fn evaluate(
        &'a self,
        node: &'a CompiledRewrite,
        resource_ids: Vec<String>,
        setting: ResultsSetting,
    ) -> BoxFuture<'a, Result<NodeOutcome>> {
        match node {
            CompiledRewrite::This => {
                self.evaluate_this(resource_ids, setting).boxed()
            }
            CompiledRewrite::ComputedUserset { relation } => self
                .evaluate_computed_userset(relation, resource_ids, setting)
                .boxed(),
            CompiledRewrite::TupleToUserset {
                tupleset_relation,
                computed_userset_relation,
            } => self
                .evaluate_tuple_to_userset(
                    tupleset_relation,
                    computed_userset_relation,
                    resource_ids,
                )
                .boxed(),
            CompiledRewrite::Union { children } => {
                self.evaluate_union(children, resource_ids, setting).boxed()
            }
            CompiledRewrite::Intersection { children } => self
                .evaluate_intersection(children, resource_ids)
                .boxed(),
            CompiledRewrite::Exclusion { base, subtracted } => self
                .evaluate_exclusion(base, subtracted, resource_ids)
                .boxed(),
        }
    }

    /// Direct tuples in this relation's column: terminal subjects (and
    /// wildcards) match immediately; userset subjects batch into one
    /// sub-check per referenced relation.
    async fn evaluate_this(
        &self,
        resource_ids: Vec<String>,
        setting: ResultsSetting,
    ) -> Result<NodeOutcome> {
        let request = self.request;
        let filter = RelationshipFilter::namespace(
            &request.resource_relation.namespace,
        )
        .object_ids(resource_ids.iter().cloned())
        .relation(&request.resource_relation.relation);
        let tuples = self
            .ctx
            .store
            .query_relationships(&request.meta.at_revision, &filter)
            .await?;

        let mut outcome = NodeOutcome::default();

        // (namespace, relation) -> the userset object ids to check, and
        // which resources each one feeds (through which gate).
        struct Group {
            member_ids: BTreeSet<String>,
            origins: Vec<(String, String, EdgeGate)>,
        }
        let mut groups: BTreeMap<(String, String), Group> = BTreeMap::new();

        for tuple in &tuples {
            let subject = &tuple.subject;
            let direct_match = subject.object == request.subject.object
                && subject.relation_or_ellipsis()
                    == request.subject.relation_or_ellipsis();
            let wildcard_match = !request.subject.is_userset()
                && !subject.is_userset()
                && subject.is_wildcard()
                && subject.object.namespace
                    == request.subject.object.namespace;

            if direct_match || wildcard_match {
                let Some(gate) = self.tuple_gate(&tuple.caveat)? else {
                    continue;
                };
                or_into(
                    &mut outcome.results,
                    &tuple.resource.object_id,
                    gate.apply(ResourceCheckResult::member()),
                );
                continue;
            }

            if let Some(userset_relation) = &subject.optional_relation {
                let Some(gate) = self.tuple_gate(&tuple.caveat)? else {
                    continue;
                };
                let group = groups
                    .entry((
                        subject.object.namespace.clone(),
                        userset_relation.clone(),
                    ))
                    .or_insert_with(|| Group {
                        member_ids: BTreeSet::new(),
                        origins: Vec::new(),
                    });
                group.member_ids.insert(subject.object.object_id.clone());
                group.origins.push((
                    tuple.resource.object_id.clone(),
                    subject.object.object_id.clone(),
                    gate,
                ));
            }
        }

        if groups.is_empty()
            || self.satisfied(&outcome.results, &resource_ids, setting)
        {
            return Ok(outcome);
        }

        let mut pending: FuturesUnordered<_> = groups
            .into_iter()
            .map(|((namespace, relation), group)| async move {
                let sub = DispatchCheckRequest {
                    meta: request.meta.descend(),
                    resource_relation: RelationReference::new(
                        namespace, relation,
                    ),
                    resource_ids: group
                        .member_ids
                        .iter()
                        .cloned()
                        .collect(),
                    subject: request.subject.clone(),
                    context: request.context.clone(),
                    // Fan-in needs per-userset membership.
                    results_setting: ResultsSetting::RequireAllResults,
                    debug: request.debug,
                };
                self.ctx.sub_check(sub).await.map(|r| (group.origins, r))
            })
            .collect();

        while let Some(completed) = pending.next().await {
            let (origins, response) = completed?;
            outcome.absorb_sub_response(&response);
            for (resource_id, userset_id, gate) in origins {
                if let Some(member) = response.results.get(&userset_id) {
                    or_into(
                        &mut outcome.results,
                        &resource_id,
                        gate.apply(member.clone()),
                    );
                }
            }
            if self.satisfied(&outcome.results, &resource_ids, setting) {
                break;
            }
        }

        Ok(outcome)
    }

    /// Rewrite to another relation on the same resources: one
    /// sub-dispatch.
    async fn evaluate_computed_userset(
        &self,
        relation: &str,
        resource_ids: Vec<String>,
        setting: ResultsSetting,
    ) -> Result<NodeOutcome> {
        let request = self.request;
        let sub = DispatchCheckRequest {
            meta: request.meta.descend(),
            resource_relation: RelationReference::new(
                &request.resource_relation.namespace,
                relation,
            ),
            resource_ids,
            subject: request.subject.clone(),
            context: request.context.clone(),
            results_setting: setting,
            debug: request.debug,
        };
        let response = self.ctx.sub_check(sub).await?;
        let mut outcome = NodeOutcome::default();
        outcome.absorb_sub_response(&response);
        outcome.results = response.results;
        Ok(outcome)
    }

    /// Arrow traversal: walk the tupleset column, then check the computed
    /// relation on every subject found there, fanning results back into
    /// the originating resources.
    async fn evaluate_tuple_to_userset(
        &self,
        tupleset_relation: &str,
        computed_userset_relation: &str,
        resource_ids: Vec<String>,
    ) -> Result<NodeOutcome> {
        let request = self.request;
        let filter = RelationshipFilter::namespace(
            &request.resource_relation.namespace,
        )
        .object_ids(resource_ids.iter().cloned())
        .relation(tupleset_relation);
        let tuples = self
            .ctx
            .store
            .query_relationships(&request.meta.at_revision, &filter)
            .await?;

        struct Group {
            target_ids: BTreeSet<String>,
            origins: Vec<(String, String, EdgeGate)>,
        }
        let mut groups: BTreeMap<String, Group> = BTreeMap::new();
        for tuple in &tuples {
            let Some(gate) = self.tuple_gate(&tuple.caveat)? else {
                continue;
            };
            let group = groups
                .entry(tuple.subject.object.namespace.clone())
                .or_insert_with(|| Group {
                    target_ids: BTreeSet::new(),
                    origins: Vec::new(),
                });
            group
                .target_ids
                .insert(tuple.subject.object.object_id.clone());
            group.origins.push((
                tuple.resource.object_id.clone(),
                tuple.subject.object.object_id.clone(),
                gate,
            ));
        }

        let mut outcome = NodeOutcome::default();
        let computed = computed_userset_relation.to_string();
        let mut pending: FuturesUnordered<_> = groups
            .into_iter()
            .map(|(namespace, group)| {
                let computed = computed.clone();
                async move {
                    let sub = DispatchCheckRequest {
                        meta: request.meta.descend(),
                        resource_relation: RelationReference::new(
                            namespace, computed,
                        ),
                        resource_ids: group
                            .target_ids
                            .iter()
                            .cloned()
                            .collect(),
                        subject: request.subject.clone(),
                        context: request.context.clone(),
                        results_setting: ResultsSetting::RequireAllResults,
                        debug: request.debug,
                    };
                    self.ctx
                        .sub_check(sub)
                        .await
                        .map(|r| (group.origins, r))
                }
            })
            .collect();

        while let Some(completed) = pending.next().await {
            let (origins, response) = completed?;
            outcome.absorb_sub_response(&response);
            for (resource_id, target_id, gate) in origins {
                if let Some(member) = response.results.get(&target_id) {
                    or_into(
                        &mut outcome.results,
                        &resource_id,
                        gate.apply(member.clone()),
                    );
                }
            }
        }

        Ok(outcome)
    }

    /// Children run concurrently; per resource id the fold is the
    /// membership least-upper-bound, with caveat expressions OR-ed.
    async fn evaluate_union(
        &'a self,
        children: &'a [CompiledRewrite],
        resource_ids: Vec<String>,
        setting: ResultsSetting,
    ) -> Result<NodeOutcome> {
        let mut outcome = NodeOutcome::default();
        let mut pending: FuturesUnordered<_> = children
            .iter()
            .map(|child| {
                self.evaluate(child, resource_ids.clone(), setting)
            })
            .collect();

        while let Some(completed) = pending.next().await {
            let child = completed?;
            outcome.meta.absorb(&child.meta);
            outcome.traces.extend(child.traces);
            for (id, result) in child.results {
                or_into(&mut outcome.results, &id, result);
            }
            if self.satisfied(&outcome.results, &resource_ids, setting) {
                // Dropping the remaining futures cancels their
                // sub-dispatches.
                break;
            }
        }
        Ok(outcome)
    }

    /// All children must admit an id. Children run with
    /// `RequireAllResults` (each must report every id it can), and
    /// evaluation stops early once no id can survive.
    async fn evaluate_intersection(
        &'a self,
        children: &'a [CompiledRewrite],
        resource_ids: Vec<String>,
    ) -> Result<NodeOutcome> {
        let mut outcome = NodeOutcome::default();
        if children.is_empty() {
            return Ok(outcome);
        }

        let mut pending: FuturesUnordered<_> = children
            .iter()
            .map(|child| {
                self.evaluate(
                    child,
                    resource_ids.clone(),
                    ResultsSetting::RequireAllResults,
                )
            })
            .collect();

        // id -> (lattice minimum so far, collected caveat expressions).
        let mut candidates: BTreeMap<
            String,
            (Membership, Vec<CaveatExpression>, Vec<String>),
        > = resource_ids
            .iter()
            .map(|id| (id.clone(), (Membership::Member, Vec::new(), Vec::new())))
            .collect();

        while let Some(completed) = pending.next().await {
            let child = completed?;
            outcome.meta.absorb(&child.meta);
            outcome.traces.extend(child.traces);
            candidates.retain(|id, (membership, exprs, missing)| {
                match child.results.get(id.as_str()) {
                    None => false,
                    Some(result) => match result.membership() {
                        Membership::NotMember => false,
                        Membership::Member => true,
                        Membership::CaveatedMember => {
                            *membership = Membership::CaveatedMember;
                            exprs.push(
                                result
                                    .expression()
                                    .cloned()
                                    .expect("caveated result carries expression"),
                            );
                            for field in result.missing_expr_fields() {
                                if !missing.contains(field) {
                                    missing.push(field.clone());
                                }
                            }
                            true
                        }
                    },
                }
            });
            if candidates.is_empty() {
                break;
            }
        }

        for (id, (membership, exprs, missing)) in candidates {
            let result = match membership {
                Membership::Member => ResourceCheckResult::member(),
                _ => ResourceCheckResult::caveated(
                    CaveatExpression::and(exprs),
                    missing,
                ),
            };
            outcome.results.insert(id, result);
        }
        Ok(outcome)
    }

    /// Base minus subtracted. The subtracted side is only evaluated for
    /// ids the base admitted.
    async fn evaluate_exclusion(
        &'a self,
        base: &'a CompiledRewrite,
        subtracted: &'a CompiledRewrite,
        resource_ids: Vec<String>,
    ) -> Result<NodeOutcome> {
        let mut outcome = NodeOutcome::default();
        let base_outcome = self
            .evaluate(
                base,
                resource_ids,
                ResultsSetting::RequireAllResults,
            )
            .await?;
        outcome.meta.absorb(&base_outcome.meta);
        outcome.traces.extend(base_outcome.traces);
        if base_outcome.results.is_empty() {
            return Ok(outcome);
        }

        let candidate_ids: Vec<String> =
            base_outcome.results.keys().cloned().collect();
        let subtracted_outcome = self
            .evaluate(
                subtracted,
                candidate_ids,
                ResultsSetting::RequireAllResults,
            )
            .await?;
        outcome.meta.absorb(&subtracted_outcome.meta);
        outcome.traces.extend(subtracted_outcome.traces);

        for (id, base_result) in base_outcome.results {
            let result = match subtracted_outcome.results.get(&id) {
                None => base_result,
                Some(sub) => match sub.membership() {
                    Membership::Member => continue,
                    Membership::NotMember => base_result,
                    Membership::CaveatedMember => {
                        let negated = CaveatExpression::not(
                            sub.expression()
                                .cloned()
                                .expect("caveated result carries expression"),
                        );
                        let mut missing =
                            base_result.missing_expr_fields().to_vec();
                        for field in sub.missing_expr_fields() {
                            if !missing.contains(field) {
                                missing.push(field.clone());
                            }
                        }
                        let expression = match base_result.expression() {
                            Some(base_expr) => CaveatExpression::and(vec![
                                base_expr.clone(),
                                negated,
                            ]),
                            None => negated,
                        };
                        ResourceCheckResult::caveated(expression, missing)
                    }
                },
            };
            outcome.results.insert(id, result);
        }
        Ok(outcome)
    }
}
