// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The engine's peer transport, backed by the HTTP client.
//!
//! One client per peer endpoint, created lazily and reused across
//! dispatches so connections stay warm. Ring rebuilds do not drop the
//! pool: a peer that left simply stops being asked for.

use async_trait::async_trait;
use slog::Logger;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use warden_client::Client;
use warden_dispatch::Peer;
use warden_dispatch::PeerDispatch;
use warden_dispatch::PeerDispatchFactory;
use warden_types::DispatchCheckRequest;
use warden_types::DispatchCheckResponse;
use warden_types::DispatchExpandRequest;
use warden_types::DispatchExpandResponse;
use warden_types::DispatchLookupResourcesRequest;
use warden_types::DispatchLookupSubjectsRequest;
use warden_types::DispatchReachableResourcesRequest;
use warden_types::LookupResourcesPage;
use warden_types::LookupSubjectsPage;
use warden_types::ReachableResourcesPage;
use warden_types::Result;

pub struct HttpPeerFactory {
    log: Logger,
    pool: Mutex<HashMap<String, Arc<HttpPeer>>>,
}

impl HttpPeerFactory {
    pub fn new(log: &Logger) -> HttpPeerFactory {
        HttpPeerFactory {
            log: log.clone(),
            pool: Mutex::new(HashMap::new()),
        }
    }
}

impl PeerDispatchFactory for HttpPeerFactory {
    fn dispatch_to(&self, peer: &Peer) -> Arc<dyn PeerDispatch> {
        let mut pool = self.pool.lock().unwrap();
        let transport = pool
            .entry(peer.endpoint.clone())
            .or_insert_with(|| {
                Arc::new(HttpPeer {
                    client: Client::new(&peer.endpoint, self.log.clone()),
                })
            });
        Arc::clone(transport) as Arc<dyn PeerDispatch>
    }
}

struct HttpPeer {
    client: Client,
}

#[async_trait]
impl PeerDispatch for HttpPeer {
    async fn check(
        &self,
        request: DispatchCheckRequest,
    ) -> Result<DispatchCheckResponse> {
        self.client.check(&request).await
    }

    async fn expand(
        &self,
        request: DispatchExpandRequest,
    ) -> Result<DispatchExpandResponse> {
        self.client.expand(&request).await
    }

    async fn reachable_resources_page(
        &self,
        request: DispatchReachableResourcesRequest,
        page_limit: usize,
    ) -> Result<ReachableResourcesPage> {
        self.client.reachable_resources_page(&request, page_limit).await
    }

    async fn lookup_resources_page(
        &self,
        request: DispatchLookupResourcesRequest,
        page_limit: usize,
    ) -> Result<LookupResourcesPage> {
        self.client.lookup_resources_page(&request, page_limit).await
    }

    async fn lookup_subjects_page(
        &self,
        request: DispatchLookupSubjectsRequest,
        page_limit: usize,
    ) -> Result<LookupSubjectsPage> {
        self.client.lookup_subjects_page(&request, page_limit).await
    }
}
