// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared state available to all HTTP request handlers.

use crate::config::DispatchConfig;
use slog::Logger;
use std::sync::Arc;
use warden_dispatch::DispatchEngine;
use warden_dispatch::MembershipView;
use warden_storage::MemoryDatastore;

pub struct ServerContext {
    pub engine: Arc<DispatchEngine>,
    /// The dev-mode datastore backing the engine. Production deployments
    /// substitute a real adapter; tests seed fixtures through this.
    pub datastore: MemoryDatastore,
    /// The writable side of the ring's membership view, fed by the
    /// peers endpoint.
    pub membership: MembershipView,
    pub dispatch_config: DispatchConfig,
    pub log: Logger,
}
