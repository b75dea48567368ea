// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP entrypoint functions for the warden peer dispatch API.
//!
//! The two unary dispatches map straight onto request/response
//! endpoints. The three streaming dispatches travel as cursor-driven
//! pages: each call runs the stream up to one page worth of chunks and
//! returns the cursor to continue from, which is how unbounded
//! enumerations cross the peer boundary without long-lived streams.

use crate::context::ServerContext;
use dropshot::endpoint;
use dropshot::ApiDescription;
use dropshot::HttpError;
use dropshot::HttpResponseOk;
use dropshot::HttpResponseUpdatedNoContent;
use dropshot::Query;
use dropshot::RequestContext;
use dropshot::TypedBody;
use schemars::JsonSchema;
use serde::Deserialize;
use slog::info;
use std::future::Future;
use std::sync::Arc;
use warden_dispatch::stream::chunk_channel;
use warden_dispatch::Dispatcher;
use warden_dispatch::Peer;
use warden_types::Cursor;
use warden_types::DispatchCheckRequest;
use warden_types::DispatchCheckResponse;
use warden_types::DispatchExpandRequest;
use warden_types::DispatchExpandResponse;
use warden_types::DispatchLookupResourcesRequest;
use warden_types::DispatchLookupResourcesResponse;
use warden_types::DispatchLookupSubjectsRequest;
use warden_types::DispatchLookupSubjectsResponse;
use warden_types::DispatchReachableResourcesRequest;
use warden_types::DispatchReachableResourcesResponse;
use warden_types::Error;
use warden_types::LookupResourcesPage;
use warden_types::LookupSubjectsPage;
use warden_types::ReachableResourcesPage;

/// Hard ceiling on a requested page size, whatever the caller asks for.
const MAX_PAGE_LIMIT: usize = 1024;

type Context = Arc<ServerContext>;

pub fn api() -> ApiDescription<Context> {
    let mut api = ApiDescription::new();
    api.register(dispatch_check).expect("registered dispatch_check");
    api.register(dispatch_expand).expect("registered dispatch_expand");
    api.register(dispatch_reachable_resources_page)
        .expect("registered dispatch_reachable_resources_page");
    api.register(dispatch_lookup_resources_page)
        .expect("registered dispatch_lookup_resources_page");
    api.register(dispatch_lookup_subjects_page)
        .expect("registered dispatch_lookup_subjects_page");
    api.register(peers_get).expect("registered peers_get");
    api.register(peers_put).expect("registered peers_put");
    api
}

/// Applies the server-wide request deadline to one dispatch.
async fn with_deadline<T>(
    apictx: &ServerContext,
    operation: impl Future<Output = Result<T, Error>>,
) -> Result<T, HttpError> {
    let deadline = apictx.dispatch_config.request_timeout();
    match tokio::time::timeout(deadline, operation).await {
        Ok(result) => result.map_err(HttpError::from),
        Err(_) => Err(HttpError::from(Error::DeadlineExceeded)),
    }
}

#[derive(Deserialize, JsonSchema)]
struct PageParams {
    /// Maximum chunks to return; defaults to the server's stream window.
    limit: Option<usize>,
}

impl PageParams {
    fn limit(&self, apictx: &ServerContext) -> usize {
        self.limit
            .unwrap_or(apictx.dispatch_config.stream_window)
            .clamp(1, MAX_PAGE_LIMIT)
    }
}

/// Runs a streaming dispatch for up to `limit` chunks. A full page means
/// there may be more; the final chunk's cursor is where to resume.
async fn collect_page<T, F>(
    apictx: &ServerContext,
    limit: usize,
    cursor_of: fn(&T) -> &Cursor,
    run: F,
) -> Result<(Vec<T>, Option<Cursor>), Error>
where
    T: Send + 'static,
    F: FnOnce(
        warden_dispatch::stream::ChunkSender<T>,
    )
        -> tokio::task::JoinHandle<Result<(), Error>>,
{
    let (tx, mut rx) = chunk_channel(apictx.dispatch_config.stream_window);
    let worker = run(tx);

    let mut chunks = Vec::new();
    while chunks.len() < limit {
        match rx.recv().await {
            Some(chunk) => chunks.push(chunk),
            None => break,
        }
    }
    let full_page = chunks.len() == limit;
    drop(rx);

    if !full_page {
        // The stream ended on its own; surface any terminal error.
        worker
            .await
            .map_err(|_| Error::internal("stream worker panicked"))??;
        return Ok((chunks, None));
    }

    let next_cursor = chunks.last().map(|chunk| cursor_of(chunk).clone());
    Ok((chunks, next_cursor))
}

/// Check membership for a batch of resources.
#[endpoint {
    method = POST,
    path = "/dispatch/check",
}]
async fn dispatch_check(
    rqctx: RequestContext<Context>,
    body: TypedBody<DispatchCheckRequest>,
) -> Result<HttpResponseOk<DispatchCheckResponse>, HttpError> {
    let apictx = rqctx.context();
    let response =
        with_deadline(apictx, apictx.engine.dispatch_check(body.into_inner()))
            .await?;
    Ok(HttpResponseOk(response))
}

/// Expand the permission tree for one resource and relation.
#[endpoint {
    method = POST,
    path = "/dispatch/expand",
}]
async fn dispatch_expand(
    rqctx: RequestContext<Context>,
    body: TypedBody<DispatchExpandRequest>,
) -> Result<HttpResponseOk<DispatchExpandResponse>, HttpError> {
    let apictx = rqctx.context();
    let response = with_deadline(
        apictx,
        apictx.engine.dispatch_expand(body.into_inner()),
    )
    .await?;
    Ok(HttpResponseOk(response))
}

/// One page of the reachable-resources stream.
#[endpoint {
    method = POST,
    path = "/dispatch/reachable-resources/page",
}]
async fn dispatch_reachable_resources_page(
    rqctx: RequestContext<Context>,
    query: Query<PageParams>,
    body: TypedBody<DispatchReachableResourcesRequest>,
) -> Result<HttpResponseOk<ReachableResourcesPage>, HttpError> {
    let apictx = rqctx.context();
    let limit = query.into_inner().limit(apictx);
    let request = body.into_inner();
    let engine = Arc::clone(&apictx.engine);

    let (chunks, next_cursor) = with_deadline(
        apictx,
        collect_page(
            apictx,
            limit,
            |chunk: &DispatchReachableResourcesResponse| {
                &chunk.after_response_cursor
            },
            move |tx| {
                tokio::spawn(async move {
                    engine.dispatch_reachable_resources(request, tx).await
                })
            },
        ),
    )
    .await?;
    Ok(HttpResponseOk(ReachableResourcesPage { chunks, next_cursor }))
}

/// One page of the lookup-resources stream.
#[endpoint {
    method = POST,
    path = "/dispatch/lookup-resources/page",
}]
async fn dispatch_lookup_resources_page(
    rqctx: RequestContext<Context>,
    query: Query<PageParams>,
    body: TypedBody<DispatchLookupResourcesRequest>,
) -> Result<HttpResponseOk<LookupResourcesPage>, HttpError> {
    let apictx = rqctx.context();
    let limit = query.into_inner().limit(apictx);
    let request = body.into_inner();
    let engine = Arc::clone(&apictx.engine);

    let (chunks, next_cursor) = with_deadline(
        apictx,
        collect_page(
            apictx,
            limit,
            |chunk: &DispatchLookupResourcesResponse| {
                &chunk.after_response_cursor
            },
            move |tx| {
                tokio::spawn(async move {
                    engine.dispatch_lookup_resources(request, tx).await
                })
            },
        ),
    )
    .await?;
    Ok(HttpResponseOk(LookupResourcesPage { chunks, next_cursor }))
}

/// One page of the lookup-subjects stream.
#[endpoint {
    method = POST,
    path = "/dispatch/lookup-subjects/page",
}]
async fn dispatch_lookup_subjects_page(
    rqctx: RequestContext<Context>,
    query: Query<PageParams>,
    body: TypedBody<DispatchLookupSubjectsRequest>,
) -> Result<HttpResponseOk<LookupSubjectsPage>, HttpError> {
    let apictx = rqctx.context();
    let limit = query.into_inner().limit(apictx);
    let request = body.into_inner();
    let engine = Arc::clone(&apictx.engine);

    let (chunks, next_cursor) = with_deadline(
        apictx,
        collect_page(
            apictx,
            limit,
            |chunk: &DispatchLookupSubjectsResponse| {
                &chunk.after_response_cursor
            },
            move |tx| {
                tokio::spawn(async move {
                    engine.dispatch_lookup_subjects(request, tx).await
                })
            },
        ),
    )
    .await?;
    Ok(HttpResponseOk(LookupSubjectsPage { chunks, next_cursor }))
}

/// The server's current view of cluster membership.
#[endpoint {
    method = GET,
    path = "/peers",
}]
async fn peers_get(
    rqctx: RequestContext<Context>,
) -> Result<HttpResponseOk<Vec<Peer>>, HttpError> {
    let apictx = rqctx.context();
    Ok(HttpResponseOk(apictx.membership.current().peers().to_vec()))
}

/// Replaces the membership view. In-flight dispatches keep the ring they
/// resolved against; new dispatches route on the rebuilt ring.
#[endpoint {
    method = PUT,
    path = "/peers",
}]
async fn peers_put(
    rqctx: RequestContext<Context>,
    body: TypedBody<Vec<Peer>>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let apictx = rqctx.context();
    let peers = body.into_inner();
    info!(
        apictx.log, "replacing peer membership";
        "peer_count" => peers.len(),
    );
    apictx.membership.update(peers);
    Ok(HttpResponseUpdatedNoContent())
}
