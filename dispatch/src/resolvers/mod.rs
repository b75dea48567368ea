// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-question resolution logic.
//!
//! Each resolver answers one dispatch question against local storage,
//! issuing sub-dispatches (back through the engine) wherever the answer
//! depends on another relation, another resource, or another peer's share
//! of the graph.

pub(crate) mod check;
pub(crate) mod expand;
pub(crate) mod lookup_resources;
pub(crate) mod lookup_subjects;
pub(crate) mod reachable;

use warden_types::ResponseMeta;

/// Per-stream dispatch accounting shared by the streaming resolvers:
/// counters are emitted as deltas on each chunk (so the consumer can sum
/// them), while the depth high-water mark is carried absolutely (so the
/// consumer can max it).
pub(crate) struct MetaTracker {
    pending_dispatch: u32,
    pending_cached: u32,
    depth_required: u32,
}

impl MetaTracker {
    pub(crate) fn new() -> MetaTracker {
        // The local dispatch itself.
        MetaTracker {
            pending_dispatch: 1,
            pending_cached: 0,
            depth_required: 1,
        }
    }

    /// Folds in the accounting of a chunk received from a sub-stream one
    /// hop down.
    pub(crate) fn absorb_child_chunk(&mut self, child: &ResponseMeta) {
        self.pending_dispatch =
            self.pending_dispatch.saturating_add(child.dispatch_count);
        self.pending_cached = self
            .pending_cached
            .saturating_add(child.cached_dispatch_count);
        self.depth_required = self
            .depth_required
            .max(child.depth_required.saturating_add(1));
    }

    /// Folds in a unary sub-response one hop down.
    pub(crate) fn absorb_child_response(&mut self, child: &ResponseMeta) {
        self.absorb_child_chunk(child);
    }

    pub(crate) fn take(&mut self) -> ResponseMeta {
        ResponseMeta {
            dispatch_count: std::mem::take(&mut self.pending_dispatch),
            cached_dispatch_count: std::mem::take(&mut self.pending_cached),
            depth_required: self.depth_required,
            debug_info: None,
        }
    }
}
