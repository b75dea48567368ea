// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The warden server: a dispatch engine wired to storage, peer
//! transports, and the dropshot API that peers (and tools) call.

mod config;
mod context;
mod peers;

pub mod http_entrypoints;

pub use config::Config;
pub use config::DispatchConfig;
pub use context::ServerContext;
pub use peers::HttpPeerFactory;

use slog::info;
use slog::o;
use slog::Logger;
use std::net::SocketAddr;
use std::sync::Arc;
use warden_dispatch::caveats::registry_with_ts_after;
use warden_dispatch::DispatchEngine;
use warden_dispatch::MembershipView;
use warden_storage::MemoryDatastore;

type HttpServer = dropshot::HttpServer<Arc<ServerContext>>;

pub struct Server {
    apictx: Arc<ServerContext>,
    http_server: HttpServer,
}

impl Server {
    /// Start a warden server.
    pub async fn start(config: Config, log: Logger) -> Result<Server, String> {
        let log = log.new(o!("name" => config.peer_id.clone()));
        info!(log, "setting up warden server");

        let datastore = MemoryDatastore::new();
        let (membership, ring) = MembershipView::new(
            config.peers.clone(),
            config.dispatch.virtual_nodes_per_peer,
        );
        let engine = DispatchEngine::new(
            &config.peer_id,
            Arc::new(datastore.clone()),
            registry_with_ts_after(),
            config.dispatch.tuning(),
            ring,
            Arc::new(HttpPeerFactory::new(&log)),
            &log,
        );

        let apictx = Arc::new(ServerContext {
            engine,
            datastore,
            membership,
            dispatch_config: config.dispatch.clone(),
            log: log.clone(),
        });

        let http_server = dropshot::ServerBuilder::new(
            http_entrypoints::api(),
            Arc::clone(&apictx),
            log.new(o!("component" => "dropshot")),
        )
        .config(config.dropshot.clone())
        .start()
        .map_err(|error| {
            format!("initializing http server: {}", error)
        })?;

        info!(
            log, "warden server started";
            "local_addr" => %http_server.local_addr(),
        );
        Ok(Server { apictx, http_server })
    }

    /// The address the peer API is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.http_server.local_addr()
    }

    /// Shared server state; tests seed fixtures through this.
    pub fn apictx(&self) -> &Arc<ServerContext> {
        &self.apictx
    }

    /// Shut the server down.
    pub async fn close(self) -> Result<(), String> {
        self.http_server.close().await
    }

    /// Wait for the server to shut down.
    ///
    /// Note that this doesn't initiate a graceful shutdown; it waits for
    /// something else to do so.
    pub async fn wait_for_finish(self) -> Result<(), String> {
        self.http_server.wait_for_shutdown().await
    }
}

/// Start an instance of the [Server], building the logger from the
/// configuration.
pub async fn start_server(config: Config) -> Result<Server, String> {
    let log = config
        .log
        .to_logger("warden")
        .map_err(|message| format!("initializing logger: {}", message))?;
    Server::start(config, log).await
}
