// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The distributed permission-resolution engine.
//!
//! A [`DispatchEngine`] answers the five dispatch questions (check, expand,
//! reachable-resources, lookup-resources, lookup-subjects) over a
//! revision-pinned relationship graph. Each question decomposes into a tree
//! of sub-dispatches; every sub-dispatch flows back through the engine so
//! that it can be answered from the dispatch cache, routed to the peer that
//! owns its key on the consistent-hash ring, or resolved locally against
//! storage.
//!
//! The pieces, bottom up:
//!
//! - [`caveats`]: evaluation of named caveats against merged context.
//! - [`stream`]: bounded chunk channels used by the streaming dispatches.
//! - [`fingerprint`]: canonical request keys shared by the cache and ring.
//! - [`ring`]: the consistent-hash ring over the peer membership view.
//! - [`cache`]: cost-bounded memoization with single-flight coalescing.
//! - `resolvers`: the per-question resolution logic.
//! - [`engine`]: the [`Dispatcher`] implementation tying it all together.

pub mod cache;
pub mod caveats;
pub mod engine;
pub mod fingerprint;
pub mod ring;
pub mod stream;

mod resolvers;

pub use engine::DispatchEngine;
pub use engine::DispatchTuning;
pub use engine::LocalOnlyPeers;
pub use engine::PeerDispatch;
pub use engine::PeerDispatchFactory;
pub use ring::MembershipView;
pub use ring::Peer;
pub use ring::Ring;
pub use ring::RingHandle;

use async_trait::async_trait;
use stream::ChunkSender;
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
use warden_types::Result;

/// The single routing point for sub-dispatches.
///
/// Resolvers never call each other directly: every sub-question goes back
/// through a `Dispatcher` so that caching, depth accounting, and peer
/// routing apply uniformly no matter where in the tree the question arose.
///
/// Unary methods return their response; streaming methods push chunks into
/// the supplied sender as they become available and return once the stream
/// is complete. Dropping the receiving end cancels the stream and
/// everything beneath it.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch_check(
        &self,
        request: DispatchCheckRequest,
    ) -> Result<DispatchCheckResponse>;

    async fn dispatch_expand(
        &self,
        request: DispatchExpandRequest,
    ) -> Result<DispatchExpandResponse>;

    async fn dispatch_reachable_resources(
        &self,
        request: DispatchReachableResourcesRequest,
        output: ChunkSender<DispatchReachableResourcesResponse>,
    ) -> Result<()>;

    async fn dispatch_lookup_resources(
        &self,
        request: DispatchLookupResourcesRequest,
        output: ChunkSender<DispatchLookupResourcesResponse>,
    ) -> Result<()>;

    async fn dispatch_lookup_subjects(
        &self,
        request: DispatchLookupSubjectsRequest,
        output: ChunkSender<DispatchLookupSubjectsResponse>,
    ) -> Result<()>;
}
