// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The expand resolver: materializes the permission tree for one
//! `resource#relation`.
//!
//! The produced tree mirrors the rewrite that defines the relation.
//! Shallow expansion reports userset subjects (and arrow targets) as
//! leaves; recursive expansion follows them through sub-dispatches,
//! bounded only by the depth budget. Cycles are not detected; they
//! exhaust the budget.

use crate::engine::ResolverContext;
use futures::future::try_join_all;
use futures::future::BoxFuture;
use futures::FutureExt;
use warden_storage::RelationshipFilter;
use warden_types::CompiledRewrite;
use warden_types::DispatchExpandRequest;
use warden_types::DispatchExpandResponse;
use warden_types::Error;
use warden_types::ExpansionMode;
use warden_types::ObjectReference;
use warden_types::RelationTuple;
use warden_types::ResponseMeta;
use warden_types::Result;
use warden_types::SetOperation;
use warden_types::SubjectReference;
use warden_types::TreeNode;

pub(crate) async fn resolve(
    ctx: ResolverContext,
    request: DispatchExpandRequest,
) -> Result<DispatchExpandResponse> {
    let definition = ctx
        .store
        .namespace(&request.meta.at_revision, &request.resource.namespace)
        .await?;
    let relation =
        definition.relation(&request.relation).ok_or_else(|| {
            Error::unknown_relation(
                &request.resource.namespace,
                &request.relation,
            )
        })?;

    let expansion = Expansion { ctx: &ctx, request: &request };
    let (tree, sub_meta) = expansion.expand(&relation.rewrite).await?;

    let mut metadata = ResponseMeta::single_dispatch();
    metadata.absorb(&sub_meta);
    Ok(DispatchExpandResponse { metadata, tree })
}

struct Expansion<'a> {
    ctx: &'a ResolverContext,
    request: &'a DispatchExpandRequest,
}

impl<'a> Expansion<'a> {
    fn leaf(&self, subjects: Vec<SubjectReference>) -> TreeNode {
        TreeNode::Leaf {
            resource: self.request.resource.clone(),
            relation: self.request.relation.clone(),
            subjects,
        }
    }

    fn intermediate(
        &self,
        operation: SetOperation,
        children: Vec<TreeNode>,
    ) -> TreeNode {
        TreeNode::Intermediate {
            resource: self.request.resource.clone(),
            relation: self.request.relation.clone(),
            operation,
            children,
        }
    }

    async fn sub_expand(
        &self,
        resource: ObjectReference,
        relation: String,
    ) -> Result<(TreeNode, ResponseMeta)> {
        let response = self
            .ctx
            .sub_expand(DispatchExpandRequest {
                meta: self.request.meta.descend(),
                resource,
                relation,
                mode: self.request.mode,
            })
            .await?;
        let mut meta = ResponseMeta::default();
        meta.absorb_hop(&response.metadata);
        Ok((response.tree, meta))
    }

    fn expand(
        &'a self,
        node: &'a CompiledRewrite,
    ) -> BoxFuture<'a, Result<(TreeNode, ResponseMeta)>> {
        match node {
            CompiledRewrite::This => self.expand_this().boxed(),
            CompiledRewrite::ComputedUserset { relation } => async move {
                self.sub_expand(
                    self.request.resource.clone(),
                    relation.clone(),
                )
                .await
            }
            .boxed(),
            CompiledRewrite::TupleToUserset {
                tupleset_relation,
                computed_userset_relation,
            } => self
                .expand_tuple_to_userset(
                    tupleset_relation,
                    computed_userset_relation,
                )
                .boxed(),
            CompiledRewrite::Union { children } => self
                .expand_operator(SetOperation::Union, children.iter())
                .boxed(),
            CompiledRewrite::Intersection { children } => self
                .expand_operator(SetOperation::Intersection, children.iter())
                .boxed(),
            CompiledRewrite::Exclusion { base, subtracted } => self
                .expand_operator(
                    SetOperation::Exclusion,
                    [base.as_ref(), subtracted.as_ref()].into_iter(),
                )
                .boxed(),
        }
    }

    async fn read_column(
        &self,
        relation: &str,
    ) -> Result<Vec<RelationTuple>> {
        let filter =
            RelationshipFilter::namespace(&self.request.resource.namespace)
                .object_ids([self.request.resource.object_id.clone()])
                .relation(relation);
        self.ctx
            .store
            .query_relationships(&self.request.meta.at_revision, &filter)
            .await
    }

    async fn expand_this(&self) -> Result<(TreeNode, ResponseMeta)> {
        let tuples = self.read_column(&self.request.relation).await?;

        let mut terminal = Vec::new();
        let mut usersets = Vec::new();
        for tuple in tuples {
            if tuple.subject.is_userset() {
                usersets.push(tuple.subject);
            } else {
                terminal.push(tuple.subject);
            }
        }

        match self.request.mode {
            ExpansionMode::Shallow => {
                terminal.extend(usersets);
                Ok((self.leaf(terminal), ResponseMeta::default()))
            }
            ExpansionMode::Recursive if usersets.is_empty() => {
                Ok((self.leaf(terminal), ResponseMeta::default()))
            }
            ExpansionMode::Recursive => {
                let expansions =
                    try_join_all(usersets.into_iter().map(|subject| {
                        let relation = subject
                            .optional_relation
                            .clone()
                            .expect("userset subject has a relation");
                        self.sub_expand(subject.object, relation)
                    }))
                    .await?;

                let mut meta = ResponseMeta::default();
                let mut children = vec![self.leaf(terminal)];
                for (tree, sub_meta) in expansions {
                    meta.absorb(&sub_meta);
                    children.push(tree);
                }
                Ok((
                    self.intermediate(SetOperation::Union, children),
                    meta,
                ))
            }
        }
    }

    async fn expand_tuple_to_userset(
        &self,
        tupleset_relation: &str,
        computed_userset_relation: &str,
    ) -> Result<(TreeNode, ResponseMeta)> {
        let tuples = self.read_column(tupleset_relation).await?;

        if self.request.mode == ExpansionMode::Shallow {
            // Report each arrow target as the userset it denotes.
            let subjects = tuples
                .into_iter()
                .map(|tuple| SubjectReference {
                    object: tuple.subject.object,
                    optional_relation: Some(
                        computed_userset_relation.to_string(),
                    ),
                })
                .collect();
            return Ok((self.leaf(subjects), ResponseMeta::default()));
        }

        let expansions = try_join_all(tuples.into_iter().map(|tuple| {
            self.sub_expand(
                tuple.subject.object,
                computed_userset_relation.to_string(),
            )
        }))
        .await?;

        let mut meta = ResponseMeta::default();
        let mut children = Vec::new();
        for (tree, sub_meta) in expansions {
            meta.absorb(&sub_meta);
            children.push(tree);
        }
        Ok((self.intermediate(SetOperation::Union, children), meta))
    }

    async fn expand_operator(
        &'a self,
        operation: SetOperation,
        children: impl Iterator<Item = &'a CompiledRewrite> + Send + 'a,
    ) -> Result<(TreeNode, ResponseMeta)> {
        let expanded =
            try_join_all(children.map(|child| self.expand(child))).await?;
        let mut meta = ResponseMeta::default();
        let mut nodes = Vec::new();
        for (tree, sub_meta) in expanded {
            meta.absorb(&sub_meta);
            nodes.push(tree);
        }
        Ok((self.intermediate(operation, nodes), meta))
    }
}
