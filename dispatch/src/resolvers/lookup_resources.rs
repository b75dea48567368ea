// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The lookup-resources resolver: reachable-resources composed with a
//! batched check.
//!
//! Candidates stream in from the reverse walk. Those the walk already
//! proved are passed through; the rest accumulate into batches and go
//! through one check per batch (the batch shape is what makes this
//! composition affordable). Emission preserves the walk's order so that
//! each resolved resource can carry the walk cursor that produced it,
//! which is also this stream's cursor: resuming hands it straight back
//! to the walk. De-duplication happens before the limit is applied;
//! neither survives a resume, so consumers may see duplicates across
//! cursor boundaries.

use crate::engine::ResolverContext;
use crate::resolvers::MetaTracker;
use crate::stream::ChunkSender;
use std::collections::BTreeSet;
use std::collections::HashSet;
use warden_types::Cursor;
use warden_types::DebugSetting;
use warden_types::DispatchCheckRequest;
use warden_types::DispatchLookupResourcesRequest;
use warden_types::DispatchLookupResourcesResponse;
use warden_types::DispatchReachableResourcesRequest;
use warden_types::Error;
use warden_types::Membership;
use warden_types::PermissionStatus;
use warden_types::ReachabilityStatus;
use warden_types::RelationReference;
use warden_types::ResolvedResource;
use warden_types::Result;
use warden_types::ResultsSetting;

/// How many `REQUIRES_CHECK` candidates are verified per batched check.
const CHECK_BATCH_SIZE: usize = 64;

/// One candidate awaiting emission, in walk order.
enum Pending {
    /// Proven by the walk; no check needed.
    Proven { resource_id: String, cursor: Cursor },
    /// Needs membership confirmed (or refuted) by the batched check.
    Unverified { resource_id: String, cursor: Cursor },
}

pub(crate) async fn resolve(
    ctx: ResolverContext,
    request: DispatchLookupResourcesRequest,
    output: ChunkSender<DispatchLookupResourcesResponse>,
) -> Result<()> {
    let subject_relation = RelationReference::new(
        &request.subject.object.namespace,
        request.subject.relation_or_ellipsis(),
    );

    let walk_request = DispatchReachableResourcesRequest {
        meta: request.meta.descend(),
        resource_relation: request.resource_relation.clone(),
        subject_relation,
        subject_ids: vec![request.subject.object.object_id.clone()],
        cursor: request
            .cursor
            .clone()
            .filter(|cursor| cursor.is_current()),
    };
    let (mut rx, walk_handle) = ctx.sub_reachable_resources(walk_request);

    let mut state = State {
        ctx: &ctx,
        request: &request,
        output,
        meta: MetaTracker::new(),
        seen: HashSet::new(),
        emitted: 0,
        batch: Vec::new(),
        unverified: 0,
    };

    let mut limit_reached = false;
    while let Some(chunk) = rx.recv().await {
        state.meta.absorb_child_chunk(&chunk.metadata);

        if !state.seen.insert(chunk.resource.resource_id.clone()) {
            continue;
        }
        let pending = match chunk.resource.status {
            ReachabilityStatus::HasPermission => Pending::Proven {
                resource_id: chunk.resource.resource_id,
                cursor: chunk.after_response_cursor,
            },
            ReachabilityStatus::RequiresCheck => {
                state.unverified += 1;
                Pending::Unverified {
                    resource_id: chunk.resource.resource_id,
                    cursor: chunk.after_response_cursor,
                }
            }
        };
        state.batch.push(pending);

        if state.unverified >= CHECK_BATCH_SIZE {
            if state.flush().await? {
                limit_reached = true;
                break;
            }
        }
    }

    if !limit_reached {
        state.flush().await?;
        // The walk completed; surface any terminal error it hit.
        walk_handle
            .await
            .map_err(|_| Error::internal("lookup sub-walk panicked"))??;
    } else {
        // Dropping the receiver cancels the walk; its task unwinds on
        // the next send.
        drop(rx);
    }
    Ok(())
}

struct State<'a> {
    ctx: &'a ResolverContext,
    request: &'a DispatchLookupResourcesRequest,
    output: ChunkSender<DispatchLookupResourcesResponse>,
    meta: MetaTracker,
    seen: HashSet<String>,
    emitted: u32,
    batch: Vec<Pending>,
    unverified: usize,
}

impl State<'_> {
    /// Verifies the batch's unverified candidates with one check, then
    /// emits the whole batch in walk order. Returns true once the limit
    /// has been reached.
    async fn flush(&mut self) -> Result<bool> {
        if self.batch.is_empty() {
            return Ok(false);
        }

        let to_check: BTreeSet<String> = self
            .batch
            .iter()
            .filter_map(|pending| match pending {
                Pending::Unverified { resource_id, .. } => {
                    Some(resource_id.clone())
                }
                Pending::Proven { .. } => None,
            })
            .collect();

        let check_results = if to_check.is_empty() {
            Default::default()
        } else {
            let response = self
                .ctx
                .sub_check(DispatchCheckRequest {
                    meta: self.request.meta.descend(),
                    resource_relation: self
                        .request
                        .resource_relation
                        .clone(),
                    resource_ids: to_check.into_iter().collect(),
                    subject: self.request.subject.clone(),
                    context: self.request.context.clone(),
                    results_setting: ResultsSetting::RequireAllResults,
                    debug: DebugSetting::NoDebug,
                })
                .await?;
            self.meta.absorb_child_response(&response.metadata);
            response.results
        };

        for pending in std::mem::take(&mut self.batch) {
            let resolved = match pending {
                Pending::Proven { resource_id, cursor } => Some((
                    ResolvedResource {
                        resource_id,
                        status: PermissionStatus::HasPermission,
                        missing_required_context: Vec::new(),
                    },
                    cursor,
                )),
                Pending::Unverified { resource_id, cursor } => {
                    match check_results.get(&resource_id) {
                        None => None,
                        Some(result) => match result.membership() {
                            Membership::NotMember => None,
                            Membership::Member => Some((
                                ResolvedResource {
                                    resource_id,
                                    status:
                                        PermissionStatus::HasPermission,
                                    missing_required_context: Vec::new(),
                                },
                                cursor,
                            )),
                            Membership::CaveatedMember => Some((
                                ResolvedResource {
                                    resource_id,
                                    status: PermissionStatus
                                        ::ConditionallyHasPermission,
                                    missing_required_context: result
                                        .missing_expr_fields()
                                        .to_vec(),
                                },
                                cursor,
                            )),
                        },
                    }
                }
            };

            if let Some((resource, cursor)) = resolved {
                self.output
                    .send(DispatchLookupResourcesResponse {
                        resource,
                        after_response_cursor: cursor,
                        metadata: self.meta.take(),
                    })
                    .await?;
                self.emitted += 1;
                if self.request.optional_limit > 0
                    && self.emitted >= self.request.optional_limit
                {
                    self.batch.clear();
                    self.unverified = 0;
                    return Ok(true);
                }
            }
        }
        self.unverified = 0;
        Ok(false)
    }
}
