// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client for the warden peer dispatch API.
//!
//! One [`Client`] per peer endpoint; it reuses its underlying connection
//! pool across calls, retries transport-level failures with a bounded
//! exponential backoff, and maps wire errors back into
//! [`warden_types::Error`] kinds so dispatch semantics survive the hop.
//! HTTP-level (semantic) errors are never retried here; retryability is
//! the caller's decision, made on the reconstituted error kind.

use dropshot::HttpErrorResponseBody;
use serde::de::DeserializeOwned;
use serde::Serialize;
use slog::debug;
use slog::o;
use slog::Logger;
use std::time::Duration;
use warden_types::Cursor;
use warden_types::DispatchCheckRequest;
use warden_types::DispatchCheckResponse;
use warden_types::DispatchExpandRequest;
use warden_types::DispatchExpandResponse;
use warden_types::DispatchLookupResourcesRequest;
use warden_types::DispatchLookupSubjectsRequest;
use warden_types::DispatchReachableResourcesRequest;
use warden_types::Error;
use warden_types::LookupResourcesPage;
use warden_types::LookupSubjectsPage;
use warden_types::ReachableResourcesPage;
use warden_types::Result;

/// Backoff policy for transport-level retries: quick, and strictly
/// bounded so a dead peer is reported (and rerouted around) promptly.
fn retry_policy() -> backoff::ExponentialBackoff {
    backoff::ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(50))
        .with_max_interval(Duration::from_millis(500))
        .with_max_elapsed_time(Some(Duration::from_secs(3)))
        .build()
}

pub struct Client {
    base_url: String,
    client: reqwest::Client,
    log: Logger,
}

impl Client {
    /// Creates a client for the peer API at `base_url`
    /// (e.g. `http://[::1]:12700`).
    pub fn new(base_url: &str, log: Logger) -> Client {
        Client {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            log: log.new(o!(
                "component" => "WardenClient",
                "peer" => base_url.to_string(),
            )),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn unavailable(&self, message: impl std::fmt::Display) -> Error {
        Error::PeerUnavailable {
            peer: self.base_url.clone(),
            message: message.to_string(),
        }
    }

    /// POSTs `body`, retrying transport failures per [`retry_policy`].
    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let operation = || async {
            let response = self
                .client
                .post(&url)
                .json(body)
                .send()
                .await
                .map_err(backoff::Error::transient)?;
            Ok(response)
        };
        let response = backoff::future::retry(retry_policy(), operation)
            .await
            .map_err(|error: reqwest::Error| self.unavailable(error))?;
        self.read_response(path, response).await
    }

    async fn read_response<T: DeserializeOwned>(
        &self,
        path: &str,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|error| self.unavailable(error));
        }

        debug!(
            self.log, "peer returned an error";
            "path" => path,
            "status" => status.as_u16(),
        );
        let body: HttpErrorResponseBody = response
            .json()
            .await
            .map_err(|error| self.unavailable(error))?;
        Err(Error::from_response(path, body))
    }

    pub async fn check(
        &self,
        request: &DispatchCheckRequest,
    ) -> Result<DispatchCheckResponse> {
        self.post("/dispatch/check", request).await
    }

    pub async fn expand(
        &self,
        request: &DispatchExpandRequest,
    ) -> Result<DispatchExpandResponse> {
        self.post("/dispatch/expand", request).await
    }

    pub async fn reachable_resources_page(
        &self,
        request: &DispatchReachableResourcesRequest,
        page_limit: usize,
    ) -> Result<ReachableResourcesPage> {
        self.post(
            &format!(
                "/dispatch/reachable-resources/page?limit={}",
                page_limit
            ),
            request,
        )
        .await
    }

    pub async fn lookup_resources_page(
        &self,
        request: &DispatchLookupResourcesRequest,
        page_limit: usize,
    ) -> Result<LookupResourcesPage> {
        self.post(
            &format!("/dispatch/lookup-resources/page?limit={}", page_limit),
            request,
        )
        .await
    }

    pub async fn lookup_subjects_page(
        &self,
        request: &DispatchLookupSubjectsRequest,
        page_limit: usize,
    ) -> Result<LookupSubjectsPage> {
        self.post(
            &format!("/dispatch/lookup-subjects/page?limit={}", page_limit),
            request,
        )
        .await
    }

    /// Replaces the peer membership view on the server (the delivery
    /// path of the external membership oracle).
    pub async fn peers_put(&self, peers: &[PeerInfo]) -> Result<()> {
        let url = format!("{}/peers", self.base_url);
        let response = self
            .client
            .put(&url)
            .json(&peers)
            .send()
            .await
            .map_err(|error| self.unavailable(error))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body: HttpErrorResponseBody = response
            .json()
            .await
            .map_err(|error| self.unavailable(error))?;
        Err(Error::from_response("/peers", body))
    }

    pub async fn peers_get(&self) -> Result<Vec<PeerInfo>> {
        let url = format!("{}/peers", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|error| self.unavailable(error))?;
        self.read_response("/peers", response).await
    }

    /// Drains an entire reachable-resources stream page by page.
    /// Intended for tools and tests; the dispatcher consumes pages
    /// incrementally instead.
    pub async fn reachable_resources_all(
        &self,
        request: &DispatchReachableResourcesRequest,
        page_limit: usize,
    ) -> Result<ReachableResourcesPage> {
        let mut chunks = Vec::new();
        let mut cursor: Option<Cursor> = request.cursor.clone();
        loop {
            let mut paged = request.clone();
            paged.cursor = cursor;
            let page =
                self.reachable_resources_page(&paged, page_limit).await?;
            chunks.extend(page.chunks);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => {
                    return Ok(ReachableResourcesPage {
                        chunks,
                        next_cursor: None,
                    })
                }
            }
        }
    }
}

/// A peer as named in the membership view.
///
/// This mirrors the engine's `Peer` type; it is redeclared here so the
/// client stays a leaf crate of the wire contract alone.
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    serde::Deserialize,
    serde::Serialize,
)]
pub struct PeerInfo {
    pub id: String,
    pub endpoint: String,
}
