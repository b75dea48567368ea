// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The reachable-resources resolver: the reverse walk from a set of
//! subjects to every resource of a relation they could have.
//!
//! The relation's rewrite compiles into an ordered list of steps, each
//! enumerating one way an edge can lead into the relation: direct
//! tuples, userset indirections, computed-userset aliases, and arrow
//! traversals. Steps run sequentially so the stream has one total
//! order, which is what makes the cursor meaningful: its head section
//! is the step index, and the tail is the position within that step (a
//! count for local enumerations, the sub-stream's own cursor for
//! recursive ones).
//!
//! A userset indirection pointing back at the walked relation itself
//! (nested groups being the canonical case) is not dispatched: it is a
//! transitive closure over one column, computed as a local fixed point
//! seeded by everything the earlier steps reached. Indirections into
//! *other* relations dispatch a sub-walk; a schema cycle through those
//! is terminated by the depth budget, like every other cycle.
//!
//! The stream may contain duplicates; consumers tolerate them.
//! `HAS_PERMISSION` is claimed only when the entire path was purely
//! additive and uncaveated; anything else is `REQUIRES_CHECK`.

use crate::engine::ResolverContext;
use crate::resolvers::MetaTracker;
use crate::stream::ChunkSender;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;
use warden_storage::RelationshipFilter;
use warden_storage::SubjectFilter;
use warden_types::CompiledRewrite;
use warden_types::Cursor;
use warden_types::DispatchReachableResourcesRequest;
use warden_types::DispatchReachableResourcesResponse;
use warden_types::Error;
use warden_types::NamespaceDefinition;
use warden_types::ReachabilityStatus;
use warden_types::ReachableResource;
use warden_types::RelationReference;
use warden_types::Result;
use warden_types::ELLIPSIS;

/// One way an edge can lead into the target relation.
#[derive(Clone, Debug, PartialEq)]
enum StepKind {
    /// The subject relation is the target relation itself: each subject
    /// id is a resource.
    EmitSelf,
    /// Direct tuples whose terminal subject is one of ours (or the
    /// wildcard).
    Direct,
    /// Direct tuples whose subject is a userset of this very relation:
    /// the transitive closure over the column, seeded by every resource
    /// the earlier steps reached.
    SelfUserset,
    /// Direct tuples whose subject is a userset of another relation:
    /// recurse to find which of those usersets our subjects reach.
    DirectUserset { target: RelationReference },
    /// The relation is an alias: resources reachable through the
    /// aliased relation are reachable here, id for id.
    Computed { relation: String },
    /// Arrow traversal, reversed: find reachable arrow targets, then
    /// map them back through the tupleset column.
    TupleToUserset { tupleset_relation: String, target: RelationReference },
}

#[derive(Clone, Debug)]
struct Step {
    kind: StepKind,
    /// Whether a result produced by this step, on its own, proves
    /// membership.
    status: ReachabilityStatus,
}

/// Compiles the rewrite into the ordered step list. Intersections
/// contribute only their first operand and exclusions only their base:
/// that is sufficient for completeness (a member must be reachable
/// through every operand) and everything beneath them is demoted to
/// `REQUIRES_CHECK`.
fn build_plan(
    definition: &NamespaceDefinition,
    request: &DispatchReachableResourcesRequest,
    rewrite: &CompiledRewrite,
) -> Result<Vec<Step>> {
    let mut plan = Vec::new();
    if request.subject_relation == request.resource_relation {
        plan.push(Step {
            kind: StepKind::EmitSelf,
            status: ReachabilityStatus::HasPermission,
        });
    }
    walk(definition, request, rewrite, true, &mut plan)?;
    // The closure step must run after everything that can seed it.
    plan.sort_by_key(|step| step.kind == StepKind::SelfUserset);
    Ok(plan)
}

fn walk(
    definition: &NamespaceDefinition,
    request: &DispatchReachableResourcesRequest,
    node: &CompiledRewrite,
    pure: bool,
    plan: &mut Vec<Step>,
) -> Result<()> {
    let status = if pure {
        ReachabilityStatus::HasPermission
    } else {
        ReachabilityStatus::RequiresCheck
    };
    match node {
        CompiledRewrite::This => {
            plan.push(Step { kind: StepKind::Direct, status });
            let relation = definition
                .relation(&request.resource_relation.relation)
                .ok_or_else(|| {
                    Error::unknown_relation(
                        &request.resource_relation.namespace,
                        &request.resource_relation.relation,
                    )
                })?;
            for subject_type in &relation.subject_types {
                let Some(userset_relation) =
                    &subject_type.optional_relation
                else {
                    continue;
                };
                let target = RelationReference::new(
                    &subject_type.namespace,
                    userset_relation,
                );
                let kind = if target == request.resource_relation {
                    StepKind::SelfUserset
                } else {
                    StepKind::DirectUserset { target }
                };
                if !plan.iter().any(|step| step.kind == kind) {
                    plan.push(Step { kind, status });
                }
            }
        }
        CompiledRewrite::ComputedUserset { relation } => {
            plan.push(Step {
                kind: StepKind::Computed { relation: relation.clone() },
                status,
            });
        }
        CompiledRewrite::TupleToUserset {
            tupleset_relation,
            computed_userset_relation,
        } => {
            let tupleset = definition
                .relation(tupleset_relation)
                .ok_or_else(|| {
                    Error::unknown_relation(
                        &request.resource_relation.namespace,
                        tupleset_relation,
                    )
                })?;
            for subject_type in &tupleset.subject_types {
                if subject_type.optional_relation.is_none() {
                    plan.push(Step {
                        kind: StepKind::TupleToUserset {
                            tupleset_relation: tupleset_relation.clone(),
                            target: RelationReference::new(
                                &subject_type.namespace,
                                computed_userset_relation,
                            ),
                        },
                        status,
                    });
                }
            }
        }
        CompiledRewrite::Union { children } => {
            for child in children {
                walk(definition, request, child, pure, plan)?;
            }
        }
        CompiledRewrite::Intersection { children } => {
            if let Some(first) = children.first() {
                walk(definition, request, first, false, plan)?;
            }
        }
        CompiledRewrite::Exclusion { base, .. } => {
            walk(definition, request, base, false, plan)?;
        }
    }
    Ok(())
}

/// Everything reached so far in this walk, in emission order. Seeds the
/// self-userset closure and carries per-resource provenance.
#[derive(Default)]
struct Reached {
    order: Vec<String>,
    resources: BTreeMap<String, ReachedResource>,
}

#[derive(Clone)]
struct ReachedResource {
    status: ReachabilityStatus,
    for_subject_ids: BTreeSet<String>,
}

impl Reached {
    /// Records a reached resource; returns whether it is new.
    fn record(
        &mut self,
        resource_id: &str,
        status: ReachabilityStatus,
        for_subject_ids: &[String],
    ) -> bool {
        match self.resources.get_mut(resource_id) {
            Some(existing) => {
                existing
                    .for_subject_ids
                    .extend(for_subject_ids.iter().cloned());
                if status == ReachabilityStatus::HasPermission {
                    existing.status = status;
                }
                false
            }
            None => {
                self.order.push(resource_id.to_string());
                self.resources.insert(
                    resource_id.to_string(),
                    ReachedResource {
                        status,
                        for_subject_ids: for_subject_ids
                            .iter()
                            .cloned()
                            .collect(),
                    },
                );
                true
            }
        }
    }
}

/// How a step runs: silently rebuilding state for the closure, resuming
/// from a saved position, or emitting from the start.
enum StepMode {
    /// The step completed in an earlier call (we are resumed past it):
    /// recompute what it reached, emit nothing.
    Silent,
    /// The step is where the cursor points: skip up to the saved
    /// position, emit the rest.
    Resume(Cursor),
    /// Emit everything.
    Emit,
}

impl StepMode {
    fn position(&self) -> Cursor {
        match self {
            StepMode::Resume(position) => position.clone(),
            _ => Cursor::start(),
        }
    }

    fn emitting(&self) -> bool {
        !matches!(self, StepMode::Silent)
    }
}

struct Emitter {
    output: ChunkSender<DispatchReachableResourcesResponse>,
    meta: MetaTracker,
}

impl Emitter {
    async fn emit(
        &mut self,
        resource_id: String,
        status: ReachabilityStatus,
        for_subject_ids: Vec<String>,
        after_response_cursor: Cursor,
    ) -> Result<()> {
        let chunk = DispatchReachableResourcesResponse {
            resource: ReachableResource {
                resource_id,
                status,
                for_subject_ids,
            },
            after_response_cursor,
            metadata: self.meta.take(),
        };
        self.output.send(chunk).await
    }
}

fn parse_position(section: &str) -> Result<usize> {
    section.parse().map_err(|_| Error::InvalidArgument {
        message: String::from("malformed cursor position"),
    })
}

fn combine(
    step: &Step,
    child: ReachabilityStatus,
    caveated_edge: bool,
) -> ReachabilityStatus {
    if step.status == ReachabilityStatus::HasPermission
        && child == ReachabilityStatus::HasPermission
        && !caveated_edge
    {
        ReachabilityStatus::HasPermission
    } else {
        ReachabilityStatus::RequiresCheck
    }
}

pub(crate) async fn resolve(
    ctx: ResolverContext,
    request: DispatchReachableResourcesRequest,
    output: ChunkSender<DispatchReachableResourcesResponse>,
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

    let plan = build_plan(&definition, &request, &relation.rewrite)?;

    let mut subject_ids: Vec<String> = request.subject_ids.clone();
    subject_ids.sort_unstable();
    subject_ids.dedup();

    // A stale-version cursor restarts the stream.
    let cursor =
        request.cursor.clone().filter(|cursor| cursor.is_current());
    let (start_step, start_position) = match &cursor {
        Some(cursor) if !cursor.sections.is_empty() => {
            let head = cursor.head().expect("nonempty cursor has a head");
            (parse_position(head)?, cursor.tail())
        }
        _ => (0, Cursor::start()),
    };

    let mut emitter = Emitter { output, meta: MetaTracker::new() };
    let mut reached = Reached::default();

    for (index, step) in plan.iter().enumerate() {
        let mode = if index < start_step {
            StepMode::Silent
        } else if index == start_step {
            StepMode::Resume(start_position.clone())
        } else {
            StepMode::Emit
        };
        run_step(
            &ctx,
            &request,
            &subject_ids,
            index,
            step,
            mode,
            &mut reached,
            &mut emitter,
        )
        .await?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_step(
    ctx: &ResolverContext,
    request: &DispatchReachableResourcesRequest,
    subject_ids: &[String],
    index: usize,
    step: &Step,
    mode: StepMode,
    reached: &mut Reached,
    emitter: &mut Emitter,
) -> Result<()> {
    match &step.kind {
        StepKind::EmitSelf => {
            let position = mode.position();
            let skip = match position.head() {
                Some(section) => parse_position(section)?,
                None => 0,
            };
            for (offset, subject_id) in subject_ids.iter().enumerate() {
                reached.record(
                    subject_id,
                    step.status,
                    &[subject_id.clone()],
                );
                if !mode.emitting() || offset < skip {
                    continue;
                }
                emitter
                    .emit(
                        subject_id.clone(),
                        step.status,
                        vec![subject_id.clone()],
                        Cursor::at(vec![
                            index.to_string(),
                            (offset + 1).to_string(),
                        ]),
                    )
                    .await?;
            }
            Ok(())
        }

        StepKind::Direct => {
            run_direct_step(
                ctx, request, subject_ids, index, step, mode, reached,
                emitter,
            )
            .await
        }

        StepKind::SelfUserset => {
            run_self_userset_step(
                ctx, request, index, step, mode, reached, emitter,
            )
            .await
        }

        StepKind::Computed { relation } => {
            let target = RelationReference::new(
                &request.resource_relation.namespace,
                relation,
            );
            run_recursive_step(
                ctx,
                request,
                subject_ids,
                index,
                step,
                mode,
                reached,
                emitter,
                target,
                Mapping::Identity,
            )
            .await
        }

        StepKind::DirectUserset { target } => {
            run_recursive_step(
                ctx,
                request,
                subject_ids,
                index,
                step,
                mode,
                reached,
                emitter,
                target.clone(),
                Mapping::SubjectColumn {
                    relation: request.resource_relation.relation.clone(),
                    subject_relation: Some(target.relation.clone()),
                    subject_namespace: target.namespace.clone(),
                },
            )
            .await
        }

        StepKind::TupleToUserset { tupleset_relation, target } => {
            run_recursive_step(
                ctx,
                request,
                subject_ids,
                index,
                step,
                mode,
                reached,
                emitter,
                target.clone(),
                Mapping::SubjectColumn {
                    relation: tupleset_relation.clone(),
                    subject_relation: None,
                    subject_namespace: target.namespace.clone(),
                },
            )
            .await
        }
    }
}

/// Direct tuples: enumerate the column once, group by resource in
/// first-seen (structural) order, and emit with a count-based position.
#[allow(clippy::too_many_arguments)]
async fn run_direct_step(
    ctx: &ResolverContext,
    request: &DispatchReachableResourcesRequest,
    subject_ids: &[String],
    index: usize,
    step: &Step,
    mode: StepMode,
    reached: &mut Reached,
    emitter: &mut Emitter,
) -> Result<()> {
    let position = mode.position();
    let skip = match position.head() {
        Some(section) => parse_position(section)?,
        None => 0,
    };

    let want_terminal = request.subject_relation.relation == ELLIPSIS;
    let filter =
        RelationshipFilter::namespace(&request.resource_relation.namespace)
            .relation(&request.resource_relation.relation)
            .subject(
                SubjectFilter::namespace(&request.subject_relation.namespace)
                    .relation(&request.subject_relation.relation),
            );
    let tuples = ctx
        .store
        .query_relationships(&request.meta.at_revision, &filter)
        .await?;

    struct Found {
        for_subject_ids: BTreeSet<String>,
        proven: bool,
    }
    let mut order: Vec<String> = Vec::new();
    let mut found: BTreeMap<String, Found> = BTreeMap::new();

    for tuple in &tuples {
        let wildcard = want_terminal && tuple.subject.is_wildcard();
        let matched: Vec<&String> = if wildcard {
            subject_ids.iter().collect()
        } else if subject_ids
            .binary_search(&tuple.subject.object.object_id)
            .is_ok()
        {
            vec![&tuple.subject.object.object_id]
        } else {
            continue;
        };

        let resource_id = &tuple.resource.object_id;
        if !found.contains_key(resource_id) {
            order.push(resource_id.clone());
            found.insert(
                resource_id.clone(),
                Found { for_subject_ids: BTreeSet::new(), proven: false },
            );
        }
        let entry =
            found.get_mut(resource_id).expect("entry inserted above");
        entry.for_subject_ids.extend(matched.into_iter().cloned());
        if tuple.caveat.is_none() {
            entry.proven = true;
        }
    }

    for (offset, resource_id) in order.iter().enumerate() {
        let entry = &found[resource_id];
        let status = if step.status == ReachabilityStatus::HasPermission
            && entry.proven
        {
            ReachabilityStatus::HasPermission
        } else {
            ReachabilityStatus::RequiresCheck
        };
        let for_subject_ids: Vec<String> =
            entry.for_subject_ids.iter().cloned().collect();
        reached.record(resource_id, status, &for_subject_ids);
        if !mode.emitting() || offset < skip {
            continue;
        }
        emitter
            .emit(
                resource_id.clone(),
                status,
                for_subject_ids,
                Cursor::at(vec![
                    index.to_string(),
                    (offset + 1).to_string(),
                ]),
            )
            .await?;
    }
    Ok(())
}

/// The transitive closure of a self-referential userset column: a
/// breadth-first fixed point over the data, seeded by everything the
/// earlier steps reached. Data cycles terminate because a resource is
/// expanded at most once.
async fn run_self_userset_step(
    ctx: &ResolverContext,
    request: &DispatchReachableResourcesRequest,
    index: usize,
    step: &Step,
    mode: StepMode,
    reached: &mut Reached,
    emitter: &mut Emitter,
) -> Result<()> {
    let position = mode.position();
    let skip = match position.head() {
        Some(section) => parse_position(section)?,
        None => 0,
    };

    let mut queue: VecDeque<String> = reached.order.iter().cloned().collect();
    let mut expanded: BTreeSet<String> = queue.iter().cloned().collect();
    let mut emitted_in_step = 0usize;

    while let Some(object_id) = queue.pop_front() {
        let source = match reached.resources.get(&object_id) {
            Some(source) => source.clone(),
            None => continue,
        };
        let filter = RelationshipFilter::namespace(
            &request.resource_relation.namespace,
        )
        .relation(&request.resource_relation.relation)
        .subject(
            SubjectFilter::namespace(
                &request.resource_relation.namespace,
            )
            .object_id(&object_id)
            .relation(&request.resource_relation.relation),
        );
        let containing = ctx
            .store
            .query_relationships(&request.meta.at_revision, &filter)
            .await?;

        for tuple in containing {
            let resource_id = tuple.resource.object_id;
            let status =
                combine(step, source.status, tuple.caveat.is_some());
            let for_subject_ids: Vec<String> =
                source.for_subject_ids.iter().cloned().collect();
            let newly_reached =
                reached.record(&resource_id, status, &for_subject_ids);
            if expanded.insert(resource_id.clone()) {
                queue.push_back(resource_id.clone());
            }
            if !newly_reached {
                continue;
            }
            emitted_in_step += 1;
            if !mode.emitting() || emitted_in_step <= skip {
                continue;
            }
            emitter
                .emit(
                    resource_id,
                    status,
                    for_subject_ids,
                    Cursor::at(vec![
                        index.to_string(),
                        emitted_in_step.to_string(),
                    ]),
                )
                .await?;
        }
    }
    Ok(())
}

/// How resources found by a recursive sub-walk map back to resources of
/// the requested relation.
enum Mapping {
    /// Ids carry over unchanged (computed userset).
    Identity,
    /// Each found object appears as the subject of tuples in the given
    /// column; those tuples' resources are reachable.
    SubjectColumn {
        relation: String,
        /// `Some` for userset indirection, `None` for arrow targets.
        subject_relation: Option<String>,
        subject_namespace: String,
    },
}

#[allow(clippy::too_many_arguments)]
async fn run_recursive_step(
    ctx: &ResolverContext,
    request: &DispatchReachableResourcesRequest,
    subject_ids: &[String],
    index: usize,
    step: &Step,
    mode: StepMode,
    reached: &mut Reached,
    emitter: &mut Emitter,
    target: RelationReference,
    mapping: Mapping,
) -> Result<()> {
    // A silent replay re-derives the whole step; only a live resume
    // hands the saved position down to the sub-stream.
    let position = mode.position();
    let child_cursor = if position.sections.is_empty() {
        None
    } else {
        Some(position)
    };

    let sub_request = DispatchReachableResourcesRequest {
        meta: request.meta.descend(),
        resource_relation: target,
        subject_relation: request.subject_relation.clone(),
        subject_ids: subject_ids.to_vec(),
        cursor: child_cursor,
    };

    let (mut rx, handle) = ctx.sub_reachable_resources(sub_request);

    // The cursor attached to all but the last mapped emission of a child
    // chunk points *before* that chunk, so a resumer re-derives the
    // whole chunk (duplicates are permitted; losses are not).
    let mut previous_child_cursor = Cursor::start();

    while let Some(chunk) = rx.recv().await {
        emitter.meta.absorb_child_chunk(&chunk.metadata);
        let after = chunk.after_response_cursor.clone();

        match &mapping {
            Mapping::Identity => {
                let status = combine(step, chunk.resource.status, false);
                reached.record(
                    &chunk.resource.resource_id,
                    status,
                    &chunk.resource.for_subject_ids,
                );
                if mode.emitting() {
                    emitter
                        .emit(
                            chunk.resource.resource_id.clone(),
                            status,
                            chunk.resource.for_subject_ids.clone(),
                            after.clone().pushed(index.to_string()),
                        )
                        .await?;
                }
            }
            Mapping::SubjectColumn {
                relation,
                subject_relation,
                subject_namespace,
            } => {
                let mut subject_filter =
                    SubjectFilter::namespace(subject_namespace)
                        .object_id(&chunk.resource.resource_id);
                subject_filter = match subject_relation {
                    Some(userset_relation) => {
                        subject_filter.relation(userset_relation)
                    }
                    None => subject_filter.relation(ELLIPSIS),
                };
                let filter = RelationshipFilter::namespace(
                    &request.resource_relation.namespace,
                )
                .relation(relation)
                .subject(subject_filter);
                let mapped = ctx
                    .store
                    .query_relationships(&request.meta.at_revision, &filter)
                    .await?;

                for (offset, tuple) in mapped.iter().enumerate() {
                    let last = offset + 1 == mapped.len();
                    let cursor_base = if last {
                        after.clone()
                    } else {
                        previous_child_cursor.clone()
                    };
                    let status = combine(
                        step,
                        chunk.resource.status,
                        tuple.caveat.is_some(),
                    );
                    reached.record(
                        &tuple.resource.object_id,
                        status,
                        &chunk.resource.for_subject_ids,
                    );
                    if !mode.emitting() {
                        continue;
                    }
                    emitter
                        .emit(
                            tuple.resource.object_id.clone(),
                            status,
                            chunk.resource.for_subject_ids.clone(),
                            cursor_base.pushed(index.to_string()),
                        )
                        .await?;
                }
            }
        }

        previous_child_cursor = after;
    }

    handle
        .await
        .map_err(|_| Error::internal("reachable sub-stream panicked"))?
}
