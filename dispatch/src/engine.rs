// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The engine: depth enforcement, caching, and routing for every
//! dispatch.
//!
//! A [`DispatchEngine`] is the concrete [`Dispatcher`]. For each call it
//! validates the depth budget, consults the dispatch cache, and routes:
//! the owning peer for the request's fingerprint is looked up on the ring,
//! and the request either runs in-process (when the owner is this node, or
//! the ring is empty) or travels to the owner over the peer transport.
//! Local and remote execution share the resolver code path, so behavior
//! is identical wherever the key happens to hash.

use crate::cache::CacheLookup;
use crate::cache::CachedResponse;
use crate::cache::DispatchCache;
use crate::caveats::CaveatRegistry;
use crate::fingerprint;
use crate::fingerprint::Fingerprint;
use crate::resolvers;
use crate::ring::Peer;
use crate::ring::RingHandle;
use crate::stream::chunk_channel;
use crate::stream::ChunkSender;
use crate::Dispatcher;
use async_trait::async_trait;
use slog::debug;
use slog::error;
use slog::o;
use slog::warn;
use slog::Logger;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use warden_storage::RelationshipReader;
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
use warden_types::ResolverMeta;
use warden_types::ResponseMeta;
use warden_types::Result;
use warden_types::RevisionToken;

/// Streams longer than this are not admitted to the dispatch cache; the
/// tee stops buffering rather than holding an unbounded copy.
const MAX_CACHED_STREAM_CHUNKS: usize = 1024;

/// Engine tuning. Field defaults match the service configuration
/// defaults.
#[derive(Clone, Debug)]
pub struct DispatchTuning {
    /// Initial `depth_remaining` assigned by the server to requests that
    /// arrive from API clients rather than from peers.
    pub max_depth: u32,
    /// Per-request cap on concurrently outstanding sub-dispatches.
    pub concurrency_limit: usize,
    /// Dispatch cache budget in approximate bytes. Zero disables
    /// admission (coalescing still applies).
    pub cache_max_cost_bytes: u64,
    /// Optional upper bound on entry lifetime.
    pub cache_ttl: Option<Duration>,
    /// Chunk window for each stream, and the page size used between
    /// peers.
    pub stream_window: usize,
}

impl Default for DispatchTuning {
    fn default() -> DispatchTuning {
        DispatchTuning {
            max_depth: 50,
            concurrency_limit: 50,
            cache_max_cost_bytes: 64 * 1024 * 1024,
            cache_ttl: None,
            stream_window: 128,
        }
    }
}

/// The transport to one remote peer. Streaming dispatches travel as
/// cursor-driven pages; implementations perform their own bounded
/// transport-level retries and surface persistent failure as
/// `Error::PeerUnavailable`.
#[async_trait]
pub trait PeerDispatch: Send + Sync {
    async fn check(
        &self,
        request: DispatchCheckRequest,
    ) -> Result<DispatchCheckResponse>;

    async fn expand(
        &self,
        request: DispatchExpandRequest,
    ) -> Result<DispatchExpandResponse>;

    async fn reachable_resources_page(
        &self,
        request: DispatchReachableResourcesRequest,
        page_limit: usize,
    ) -> Result<ReachableResourcesPage>;

    async fn lookup_resources_page(
        &self,
        request: DispatchLookupResourcesRequest,
        page_limit: usize,
    ) -> Result<LookupResourcesPage>;

    async fn lookup_subjects_page(
        &self,
        request: DispatchLookupSubjectsRequest,
        page_limit: usize,
    ) -> Result<LookupSubjectsPage>;
}

/// Hands out (and may pool) transports per peer.
pub trait PeerDispatchFactory: Send + Sync {
    fn dispatch_to(&self, peer: &Peer) -> Arc<dyn PeerDispatch>;
}

/// A factory for single-node deployments and tests: any attempt to reach
/// a remote peer reports it unavailable, which sends the engine down its
/// local-fallback path.
pub struct LocalOnlyPeers;

struct UnreachablePeer {
    id: String,
}

impl UnreachablePeer {
    fn unavailable(&self) -> Error {
        Error::PeerUnavailable {
            peer: self.id.clone(),
            message: String::from("no peer transport configured"),
        }
    }
}

#[async_trait]
impl PeerDispatch for UnreachablePeer {
    async fn check(
        &self,
        _request: DispatchCheckRequest,
    ) -> Result<DispatchCheckResponse> {
        Err(self.unavailable())
    }

    async fn expand(
        &self,
        _request: DispatchExpandRequest,
    ) -> Result<DispatchExpandResponse> {
        Err(self.unavailable())
    }

    async fn reachable_resources_page(
        &self,
        _request: DispatchReachableResourcesRequest,
        _page_limit: usize,
    ) -> Result<ReachableResourcesPage> {
        Err(self.unavailable())
    }

    async fn lookup_resources_page(
        &self,
        _request: DispatchLookupResourcesRequest,
        _page_limit: usize,
    ) -> Result<LookupResourcesPage> {
        Err(self.unavailable())
    }

    async fn lookup_subjects_page(
        &self,
        _request: DispatchLookupSubjectsRequest,
        _page_limit: usize,
    ) -> Result<LookupSubjectsPage> {
        Err(self.unavailable())
    }
}

impl PeerDispatchFactory for LocalOnlyPeers {
    fn dispatch_to(&self, peer: &Peer) -> Arc<dyn PeerDispatch> {
        Arc::new(UnreachablePeer { id: peer.id.clone() })
    }
}

/// Everything a local resolver needs: storage, the way back into the
/// engine for sub-dispatches, the caveat set, tuning, and the per-request
/// concurrency limiter.
#[derive(Clone)]
pub(crate) struct ResolverContext {
    pub store: Arc<dyn RelationshipReader>,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub caveats: Arc<CaveatRegistry>,
    pub tuning: Arc<DispatchTuning>,
    limiter: Arc<Semaphore>,
    pub log: Logger,
}

impl ResolverContext {
    /// Issues a sub-check, holding a concurrency permit for its duration.
    pub async fn sub_check(
        &self,
        request: DispatchCheckRequest,
    ) -> Result<DispatchCheckResponse> {
        let _permit = self.acquire().await?;
        self.dispatcher.dispatch_check(request).await
    }

    pub async fn sub_expand(
        &self,
        request: DispatchExpandRequest,
    ) -> Result<DispatchExpandResponse> {
        let _permit = self.acquire().await?;
        self.dispatcher.dispatch_expand(request).await
    }

    /// Starts a sub-stream of reachable resources on its own task,
    /// returning the chunk receiver and the completion handle. The
    /// permit is held until the sub-stream finishes.
    pub fn sub_reachable_resources(
        &self,
        request: DispatchReachableResourcesRequest,
    ) -> (
        mpsc::Receiver<DispatchReachableResourcesResponse>,
        JoinHandle<Result<()>>,
    ) {
        let (tx, rx) = chunk_channel(self.tuning.stream_window);
        let dispatcher = Arc::clone(&self.dispatcher);
        let limiter = Arc::clone(&self.limiter);
        let handle = tokio::spawn(async move {
            let _permit = limiter
                .acquire_owned()
                .await
                .map_err(|_| Error::Canceled)?;
            dispatcher.dispatch_reachable_resources(request, tx).await
        });
        (rx, handle)
    }

    pub fn sub_lookup_subjects(
        &self,
        request: DispatchLookupSubjectsRequest,
    ) -> (
        mpsc::Receiver<DispatchLookupSubjectsResponse>,
        JoinHandle<Result<()>>,
    ) {
        let (tx, rx) = chunk_channel(self.tuning.stream_window);
        let dispatcher = Arc::clone(&self.dispatcher);
        let limiter = Arc::clone(&self.limiter);
        let handle = tokio::spawn(async move {
            let _permit = limiter
                .acquire_owned()
                .await
                .map_err(|_| Error::Canceled)?;
            dispatcher.dispatch_lookup_subjects(request, tx).await
        });
        (rx, handle)
    }

    async fn acquire(&self) -> Result<tokio::sync::SemaphorePermit<'_>> {
        // The semaphore is never closed.
        self.limiter
            .acquire()
            .await
            .map_err(|_| Error::internal("request limiter closed"))
    }
}

/// The distributed dispatcher.
pub struct DispatchEngine {
    local_peer_id: String,
    store: Arc<dyn RelationshipReader>,
    caveats: Arc<CaveatRegistry>,
    tuning: Arc<DispatchTuning>,
    cache: DispatchCache,
    ring: RingHandle,
    peers: Arc<dyn PeerDispatchFactory>,
    log: Logger,
    me: Weak<DispatchEngine>,
}

impl DispatchEngine {
    pub fn new(
        local_peer_id: impl Into<String>,
        store: Arc<dyn RelationshipReader>,
        caveats: CaveatRegistry,
        tuning: DispatchTuning,
        ring: RingHandle,
        peers: Arc<dyn PeerDispatchFactory>,
        log: &Logger,
    ) -> Arc<DispatchEngine> {
        let local_peer_id = local_peer_id.into();
        let cache =
            DispatchCache::new(tuning.cache_max_cost_bytes, tuning.cache_ttl);
        let log = log.new(o!(
            "component" => "DispatchEngine",
            "peer_id" => local_peer_id.clone(),
        ));
        Arc::new_cyclic(|me| DispatchEngine {
            local_peer_id,
            store,
            caveats: Arc::new(caveats),
            tuning: Arc::new(tuning),
            cache,
            ring,
            peers,
            log,
            me: me.clone(),
        })
    }

    pub fn tuning(&self) -> &DispatchTuning {
        &self.tuning
    }

    /// Builds the resolver metadata for a request arriving from an API
    /// client (as opposed to a peer, which supplies its own).
    pub fn root_meta(&self, at_revision: RevisionToken) -> ResolverMeta {
        ResolverMeta { at_revision, depth_remaining: self.tuning.max_depth }
    }

    fn resolver_context(&self) -> Result<ResolverContext> {
        let dispatcher: Arc<dyn Dispatcher> =
            self.me.upgrade().ok_or_else(|| {
                Error::internal("engine dropped while dispatch in flight")
            })?;
        Ok(ResolverContext {
            store: Arc::clone(&self.store),
            dispatcher,
            caveats: Arc::clone(&self.caveats),
            tuning: Arc::clone(&self.tuning),
            limiter: Arc::new(Semaphore::new(self.tuning.concurrency_limit)),
            log: self.log.clone(),
        })
    }

    fn validate_meta(meta: &ResolverMeta) -> Result<()> {
        if meta.depth_remaining == 0 {
            return Err(Error::DepthExceeded);
        }
        Ok(())
    }

    /// Which peer owns `key` right now, if that peer is not us.
    fn route(&self, key: &Fingerprint) -> Option<Peer> {
        let ring = self.ring.current();
        match ring.lookup(key) {
            Some(peer) if peer.id != self.local_peer_id => {
                Some(peer.clone())
            }
            _ => None,
        }
    }

    /// After a peer failed: if the membership view has changed and now
    /// names a different (non-local) owner, try once more there.
    fn rehashed_route(
        &self,
        key: &Fingerprint,
        failed_peer: &Peer,
    ) -> Option<Peer> {
        self.route(key).filter(|peer| peer.id != failed_peer.id)
    }

    fn check_from_cache(
        &self,
        value: CachedResponse,
    ) -> Result<DispatchCheckResponse> {
        match value {
            CachedResponse::Check(response) => Ok(DispatchCheckResponse {
                metadata: ResponseMeta::cache_hit(
                    response.metadata.depth_required,
                ),
                results: response.results,
            }),
            other => Err(self.cache_type_mismatch("check", &other)),
        }
    }

    fn expand_from_cache(
        &self,
        value: CachedResponse,
    ) -> Result<DispatchExpandResponse> {
        match value {
            CachedResponse::Expand(response) => Ok(DispatchExpandResponse {
                metadata: ResponseMeta::cache_hit(
                    response.metadata.depth_required,
                ),
                tree: response.tree,
            }),
            other => Err(self.cache_type_mismatch("expand", &other)),
        }
    }

    fn cache_type_mismatch(
        &self,
        wanted: &str,
        got: &CachedResponse,
    ) -> Error {
        error!(
            self.log,
            "dispatch cache returned a mismatched entry type";
            "wanted" => wanted,
            "got" => ?got,
        );
        Error::internal(format!(
            "dispatch cache returned a non-{} entry for a {} fingerprint",
            wanted, wanted
        ))
    }

    async fn execute_check(
        &self,
        key: &Fingerprint,
        request: DispatchCheckRequest,
    ) -> Result<DispatchCheckResponse> {
        match self.route(key) {
            None => {
                let ctx = self.resolver_context()?;
                resolvers::check::resolve(ctx, request).await
            }
            Some(peer) => {
                let transport = self.peers.dispatch_to(&peer);
                match transport.check(request.clone()).await {
                    Ok(response) => Ok(response),
                    Err(Error::PeerUnavailable { .. }) => {
                        if let Some(next) = self.rehashed_route(key, &peer) {
                            let transport = self.peers.dispatch_to(&next);
                            if let Ok(response) =
                                transport.check(request.clone()).await
                            {
                                return Ok(response);
                            }
                        }
                        warn!(
                            self.log,
                            "peer unavailable; executing check locally";
                            "peer" => &peer.id,
                        );
                        let ctx = self.resolver_context()?;
                        resolvers::check::resolve(ctx, request).await
                    }
                    Err(error) => Err(error),
                }
            }
        }
    }

    async fn execute_expand(
        &self,
        key: &Fingerprint,
        request: DispatchExpandRequest,
    ) -> Result<DispatchExpandResponse> {
        match self.route(key) {
            None => {
                let ctx = self.resolver_context()?;
                resolvers::expand::resolve(ctx, request).await
            }
            Some(peer) => {
                let transport = self.peers.dispatch_to(&peer);
                match transport.expand(request.clone()).await {
                    Ok(response) => Ok(response),
                    Err(Error::PeerUnavailable { .. }) => {
                        if let Some(next) = self.rehashed_route(key, &peer) {
                            let transport = self.peers.dispatch_to(&next);
                            if let Ok(response) =
                                transport.expand(request.clone()).await
                            {
                                return Ok(response);
                            }
                        }
                        warn!(
                            self.log,
                            "peer unavailable; executing expand locally";
                            "peer" => &peer.id,
                        );
                        let ctx = self.resolver_context()?;
                        resolvers::expand::resolve(ctx, request).await
                    }
                    Err(error) => Err(error),
                }
            }
        }
    }

    /// Whether a streaming request is eligible for cache admission: only
    /// streams that start from the very beginning.
    fn stream_cacheable(cursor: &Option<Cursor>) -> bool {
        match cursor {
            None => true,
            Some(cursor) => cursor.sections.is_empty(),
        }
    }

    /// The depth a cached entry needed when it was computed. An entry
    /// that needed more depth than this request has left cannot answer
    /// it: replaying it would claim `depth_required > depth_remaining`.
    fn cached_depth(value: &CachedResponse) -> u32 {
        fn max_chunk_depth<'a>(
            depths: impl Iterator<Item = &'a ResponseMeta>,
        ) -> u32 {
            depths.map(|meta| meta.depth_required).max().unwrap_or(0)
        }
        match value {
            CachedResponse::Check(response) => {
                response.metadata.depth_required
            }
            CachedResponse::Expand(response) => {
                response.metadata.depth_required
            }
            CachedResponse::ReachableResources(chunks) => {
                max_chunk_depth(chunks.iter().map(|c| &c.metadata))
            }
            CachedResponse::LookupResources(chunks) => {
                max_chunk_depth(chunks.iter().map(|c| &c.metadata))
            }
            CachedResponse::LookupSubjects(chunks) => {
                max_chunk_depth(chunks.iter().map(|c| &c.metadata))
            }
        }
    }
}

/// Forwards cached or remote chunks while keeping a bounded copy for
/// cache admission on successful completion.
struct StreamTee<T> {
    output: ChunkSender<T>,
    buffer: Option<Vec<T>>,
}

impl<T: Clone> StreamTee<T> {
    fn new(output: ChunkSender<T>, buffering: bool) -> StreamTee<T> {
        StreamTee {
            output,
            buffer: if buffering { Some(Vec::new()) } else { None },
        }
    }

    async fn send(&mut self, chunk: T) -> Result<()> {
        if let Some(buffer) = &mut self.buffer {
            if buffer.len() >= MAX_CACHED_STREAM_CHUNKS {
                // Too large to admit; stop copying.
                self.buffer = None;
            } else {
                buffer.push(chunk.clone());
            }
        }
        self.output.send(chunk).await
    }

    fn into_buffer(self) -> Option<Vec<T>> {
        self.buffer
    }
}

macro_rules! streaming_dispatch {
    (
        $self:ident, $request:ident, $output:ident,
        key = $fingerprint:path,
        cached = $cached_variant:path,
        page = $page_method:ident,
        label = $label:literal
    ) => {{
        Self::validate_meta(&$request.meta)?;
        let key = $fingerprint(&$request);
        let cacheable = Self::stream_cacheable(&$request.cursor);

        if cacheable {
            match $self.cache.lookup(key, $request.meta.depth_remaining) {
                CacheLookup::Hit(value)
                    if Self::cached_depth(&value)
                        > $request.meta.depth_remaining =>
                {
                    // Computed under a larger budget; replaying it would
                    // overstate what this request can prove.
                    let mut tee = StreamTee::new($output, false);
                    return $self
                        .$page_method(&key, $request, &mut tee)
                        .await;
                }
                CacheLookup::Hit($cached_variant(chunks)) => {
                    debug!($self.log, "dispatch cache hit (stream)";
                        "kind" => $label);
                    for chunk in chunks {
                        $output.send(chunk).await?;
                    }
                    return Ok(());
                }
                CacheLookup::Hit(other) => {
                    return Err($self.cache_type_mismatch($label, &other));
                }
                CacheLookup::Wait(waiter) => {
                    match waiter.wait().await {
                        Some(value)
                            if Self::cached_depth(&value)
                                > $request.meta.depth_remaining => {}
                        Some($cached_variant(chunks)) => {
                            for chunk in chunks {
                                $output.send(chunk).await?;
                            }
                            return Ok(());
                        }
                        _ => {}
                    }
                    // Leader failed (or produced a mismatched type, which
                    // insert-time typing prevents); compute uncached.
                    let mut tee = StreamTee::new($output, false);
                    return $self
                        .$page_method(&key, $request, &mut tee)
                        .await;
                }
                CacheLookup::Miss(guard) => {
                    let mut tee = StreamTee::new($output, true);
                    let result =
                        $self.$page_method(&key, $request, &mut tee).await;
                    if result.is_ok() {
                        if let Some(chunks) = tee.into_buffer() {
                            guard.complete($cached_variant(chunks));
                        }
                    }
                    return result;
                }
            }
        }

        let mut tee = StreamTee::new($output, false);
        $self.$page_method(&key, $request, &mut tee).await
    }};
}

macro_rules! streaming_executor {
    (
        $name:ident,
        request = $request_ty:ty,
        chunk = $chunk_ty:ty,
        page = $page_call:ident,
        resolve = $resolve:path,
        label = $label:literal
    ) => {
        async fn $name(
            &self,
            key: &Fingerprint,
            request: $request_ty,
            tee: &mut StreamTee<$chunk_ty>,
        ) -> Result<()> {
            match self.route(key) {
                None => {
                    let ctx = self.resolver_context()?;
                    let (tx, mut rx) =
                        chunk_channel(self.tuning.stream_window);
                    let worker = tokio::spawn($resolve(ctx, request, tx));
                    while let Some(chunk) = rx.recv().await {
                        tee.send(chunk).await?;
                    }
                    worker.await.map_err(|_| {
                        Error::internal("resolver task panicked")
                    })?
                }
                Some(peer) => {
                    // A stream, once begun on a peer, stays there even if
                    // membership changes mid-flight; only brand-new
                    // dispatches see the rebuilt ring. Failure to begin
                    // falls back like the unary methods.
                    let transport = self.peers.dispatch_to(&peer);
                    let mut cursor = request.cursor.clone();
                    let mut first_page = true;
                    loop {
                        let mut paged = request.clone();
                        paged.cursor = cursor.clone();
                        let page = match transport
                            .$page_call(paged, self.tuning.stream_window)
                            .await
                        {
                            Ok(page) => page,
                            Err(Error::PeerUnavailable { .. })
                                if first_page =>
                            {
                                warn!(
                                    self.log,
                                    "peer unavailable; executing stream \
                                     locally";
                                    "peer" => &peer.id,
                                    "kind" => $label,
                                );
                                let ctx = self.resolver_context()?;
                                let (tx, mut rx) = chunk_channel(
                                    self.tuning.stream_window,
                                );
                                let worker =
                                    tokio::spawn($resolve(ctx, request, tx));
                                while let Some(chunk) = rx.recv().await {
                                    tee.send(chunk).await?;
                                }
                                return worker.await.map_err(|_| {
                                    Error::internal(
                                        "resolver task panicked",
                                    )
                                })?;
                            }
                            Err(error) => return Err(error),
                        };
                        first_page = false;
                        for chunk in page.chunks {
                            tee.send(chunk).await?;
                        }
                        match page.next_cursor {
                            Some(next) => cursor = Some(next),
                            None => break,
                        }
                    }
                    Ok(())
                }
            }
        }
    };
}

impl DispatchEngine {
    streaming_executor!(
        execute_reachable_resources,
        request = DispatchReachableResourcesRequest,
        chunk = DispatchReachableResourcesResponse,
        page = reachable_resources_page,
        resolve = resolvers::reachable::resolve,
        label = "reachable-resources"
    );

    streaming_executor!(
        execute_lookup_resources,
        request = DispatchLookupResourcesRequest,
        chunk = DispatchLookupResourcesResponse,
        page = lookup_resources_page,
        resolve = resolvers::lookup_resources::resolve,
        label = "lookup-resources"
    );

    streaming_executor!(
        execute_lookup_subjects,
        request = DispatchLookupSubjectsRequest,
        chunk = DispatchLookupSubjectsResponse,
        page = lookup_subjects_page,
        resolve = resolvers::lookup_subjects::resolve,
        label = "lookup-subjects"
    );
}

#[async_trait]
impl Dispatcher for DispatchEngine {
    async fn dispatch_check(
        &self,
        request: DispatchCheckRequest,
    ) -> Result<DispatchCheckResponse> {
        Self::validate_meta(&request.meta)?;
        if request.resource_ids.is_empty() {
            return Err(Error::invalid_argument(
                "check requires at least one resource id",
            ));
        }

        let key = fingerprint::check_request(&request);
        match self.cache.lookup(key, request.meta.depth_remaining) {
            CacheLookup::Hit(value)
                if Self::cached_depth(&value)
                    <= request.meta.depth_remaining =>
            {
                debug!(self.log, "dispatch cache hit"; "kind" => "check");
                self.check_from_cache(value)
            }
            // A hit that needed more depth than we have left cannot
            // answer this request; resolve honestly within the budget.
            CacheLookup::Hit(_) => self.execute_check(&key, request).await,
            CacheLookup::Wait(waiter) => match waiter.wait().await {
                Some(value)
                    if Self::cached_depth(&value)
                        <= request.meta.depth_remaining =>
                {
                    self.check_from_cache(value)
                }
                _ => {
                    // The leader failed; compute for ourselves, caching
                    // directly on success.
                    let response = self.execute_check(&key, request).await?;
                    self.cache
                        .insert(key, CachedResponse::Check(response.clone()));
                    Ok(response)
                }
            },
            CacheLookup::Miss(guard) => {
                let response = self.execute_check(&key, request).await?;
                guard.complete(CachedResponse::Check(response.clone()));
                Ok(response)
            }
        }
    }

    async fn dispatch_expand(
        &self,
        request: DispatchExpandRequest,
    ) -> Result<DispatchExpandResponse> {
        Self::validate_meta(&request.meta)?;

        let key = fingerprint::expand_request(&request);
        match self.cache.lookup(key, request.meta.depth_remaining) {
            CacheLookup::Hit(value)
                if Self::cached_depth(&value)
                    <= request.meta.depth_remaining =>
            {
                debug!(self.log, "dispatch cache hit"; "kind" => "expand");
                self.expand_from_cache(value)
            }
            CacheLookup::Hit(_) => self.execute_expand(&key, request).await,
            CacheLookup::Wait(waiter) => match waiter.wait().await {
                Some(value)
                    if Self::cached_depth(&value)
                        <= request.meta.depth_remaining =>
                {
                    self.expand_from_cache(value)
                }
                _ => {
                    let response =
                        self.execute_expand(&key, request).await?;
                    self.cache.insert(
                        key,
                        CachedResponse::Expand(response.clone()),
                    );
                    Ok(response)
                }
            },
            CacheLookup::Miss(guard) => {
                let response = self.execute_expand(&key, request).await?;
                guard.complete(CachedResponse::Expand(response.clone()));
                Ok(response)
            }
        }
    }

    async fn dispatch_reachable_resources(
        &self,
        request: DispatchReachableResourcesRequest,
        output: ChunkSender<DispatchReachableResourcesResponse>,
    ) -> Result<()> {
        if request.subject_ids.is_empty() {
            return Err(Error::invalid_argument(
                "reachable-resources requires at least one subject id",
            ));
        }
        streaming_dispatch!(
            self, request, output,
            key = fingerprint::reachable_resources_request,
            cached = CachedResponse::ReachableResources,
            page = execute_reachable_resources,
            label = "reachable-resources"
        )
    }

    async fn dispatch_lookup_resources(
        &self,
        request: DispatchLookupResourcesRequest,
        output: ChunkSender<DispatchLookupResourcesResponse>,
    ) -> Result<()> {
        streaming_dispatch!(
            self, request, output,
            key = fingerprint::lookup_resources_request,
            cached = CachedResponse::LookupResources,
            page = execute_lookup_resources,
            label = "lookup-resources"
        )
    }

    async fn dispatch_lookup_subjects(
        &self,
        request: DispatchLookupSubjectsRequest,
        output: ChunkSender<DispatchLookupSubjectsResponse>,
    ) -> Result<()> {
        if request.resource_ids.is_empty() {
            return Err(Error::invalid_argument(
                "lookup-subjects requires at least one resource id",
            ));
        }
        streaming_dispatch!(
            self, request, output,
            key = fingerprint::lookup_subjects_request,
            cached = CachedResponse::LookupSubjects,
            page = execute_lookup_subjects,
            label = "lookup-subjects"
        )
    }
}
