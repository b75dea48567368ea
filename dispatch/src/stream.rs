// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded chunk channels for the streaming dispatches.
//!
//! Each stream is a `tokio` mpsc channel whose capacity is the configured
//! stream window. A producer suspends when the window is full; a consumer
//! that drops its receiver cancels the producer (and, transitively, every
//! sub-stream the producer holds a sender for), because the next send
//! fails and the producer unwinds with `Error::Canceled`.

use tokio::sync::mpsc;
use warden_types::Error;
use warden_types::Result;

/// The sending half of a dispatch stream.
#[derive(Debug)]
pub struct ChunkSender<T> {
    tx: mpsc::Sender<T>,
}

impl<T> Clone for ChunkSender<T> {
    fn clone(&self) -> Self {
        ChunkSender { tx: self.tx.clone() }
    }
}

impl<T> ChunkSender<T> {
    /// Sends one chunk, suspending while the window is full. Returns
    /// `Error::Canceled` if the consumer has gone away.
    pub async fn send(&self, chunk: T) -> Result<()> {
        self.tx.send(chunk).await.map_err(|_| Error::Canceled)
    }

    /// Whether the consumer has gone away. Producers with expensive work
    /// pending may poll this to stop early rather than discovering the
    /// cancellation at the next send.
    pub fn is_canceled(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Creates a stream with the given window (clamped to at least 1).
pub fn chunk_channel<T>(
    window: usize,
) -> (ChunkSender<T>, mpsc::Receiver<T>) {
    let (tx, rx) = mpsc::channel(window.max(1));
    (ChunkSender { tx }, rx)
}

/// Drains a receiver to completion, collecting every chunk. Useful where
/// a caller wants the materialized result rather than the stream.
pub async fn collect_chunks<T>(mut rx: mpsc::Receiver<T>) -> Vec<T> {
    let mut chunks = Vec::new();
    while let Some(chunk) = rx.recv().await {
        chunks.push(chunk);
    }
    chunks
}
