// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory copy-on-write snapshot datastore.
//!
//! Revisions are integers rendered as decimal strings. Every write clones
//! the current snapshot, applies the change, and publishes it under the
//! next revision, so reads at any retained revision stay consistent
//! forever. A bounded retention window lets tests exercise the
//! revision-vacuumed path.

use crate::RelationshipFilter;
use crate::RelationshipReader;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use warden_types::Error;
use warden_types::NamespaceDefinition;
use warden_types::RelationTuple;
use warden_types::Result;
use warden_types::RevisionToken;

/// How many historical revisions are readable by default.
const DEFAULT_RETAINED_REVISIONS: usize = 1024;

#[derive(Clone, Default)]
struct Snapshot {
    /// Sorted by structural key; kept sorted on insert so snapshot reads
    /// are deterministic.
    tuples: Vec<RelationTuple>,
    namespaces: BTreeMap<String, NamespaceDefinition>,
}

struct Inner {
    snapshots: BTreeMap<u64, Arc<Snapshot>>,
    head: u64,
}

/// The in-memory snapshot store. Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct MemoryDatastore {
    inner: Arc<Mutex<Inner>>,
    retained_revisions: usize,
}

impl MemoryDatastore {
    pub fn new() -> MemoryDatastore {
        MemoryDatastore::with_retention(DEFAULT_RETAINED_REVISIONS)
    }

    pub fn with_retention(retained_revisions: usize) -> MemoryDatastore {
        let mut snapshots = BTreeMap::new();
        snapshots.insert(0, Arc::new(Snapshot::default()));
        MemoryDatastore {
            inner: Arc::new(Mutex::new(Inner { snapshots, head: 0 })),
            retained_revisions: retained_revisions.max(1),
        }
    }

    /// Writes tuples, producing a new head revision. Duplicate tuples
    /// (structural equality) are written once.
    pub fn write_tuples(
        &self,
        tuples: impl IntoIterator<Item = RelationTuple>,
    ) -> RevisionToken {
        self.advance(|snapshot| {
            for tuple in tuples {
                let key = tuple.structural_key();
                match snapshot
                    .tuples
                    .binary_search_by_key(&key, |t| t.structural_key())
                {
                    // Same column and subject: the new tuple (and its
                    // caveat context) replaces the old one.
                    Ok(index) => snapshot.tuples[index] = tuple,
                    Err(index) => snapshot.tuples.insert(index, tuple),
                }
            }
        })
    }

    /// Deletes tuples by structural key, producing a new head revision.
    pub fn delete_tuples<'a>(
        &self,
        tuples: impl IntoIterator<Item = &'a RelationTuple>,
    ) -> RevisionToken {
        self.advance(|snapshot| {
            for tuple in tuples {
                let key = tuple.structural_key();
                if let Ok(index) = snapshot
                    .tuples
                    .binary_search_by_key(&key, |t| t.structural_key())
                {
                    snapshot.tuples.remove(index);
                }
            }
        })
    }

    /// Installs (or replaces) a compiled namespace definition, producing a
    /// new head revision.
    pub fn set_namespace(
        &self,
        definition: NamespaceDefinition,
    ) -> RevisionToken {
        self.advance(|snapshot| {
            snapshot.namespaces.insert(definition.name.clone(), definition);
        })
    }

    fn advance(
        &self,
        apply: impl FnOnce(&mut Snapshot),
    ) -> RevisionToken {
        let mut inner = self.inner.lock().unwrap();
        let mut snapshot = (**inner
            .snapshots
            .get(&inner.head)
            .expect("head snapshot always retained"))
        .clone();
        apply(&mut snapshot);
        inner.head += 1;
        let head = inner.head;
        inner.snapshots.insert(head, Arc::new(snapshot));
        while inner.snapshots.len() > self.retained_revisions {
            let oldest =
                *inner.snapshots.keys().next().expect("nonempty snapshots");
            inner.snapshots.remove(&oldest);
        }
        RevisionToken::new(head.to_string())
    }

    fn snapshot(&self, revision: &RevisionToken) -> Result<Arc<Snapshot>> {
        let parsed: u64 = revision.as_str().parse().map_err(|_| {
            Error::invalid_argument(format!(
                "unparseable revision token {:?}",
                revision.as_str()
            ))
        })?;
        let inner = self.inner.lock().unwrap();
        if parsed > inner.head {
            return Err(Error::invalid_argument(format!(
                "revision {} is in the future (head is {})",
                parsed, inner.head
            )));
        }
        inner.snapshots.get(&parsed).cloned().ok_or_else(|| {
            Error::RevisionStale { revision: revision.as_str().to_string() }
        })
    }
}

impl Default for MemoryDatastore {
    fn default() -> Self {
        MemoryDatastore::new()
    }
}

#[async_trait]
impl RelationshipReader for MemoryDatastore {
    async fn query_relationships(
        &self,
        revision: &RevisionToken,
        filter: &RelationshipFilter,
    ) -> Result<Vec<RelationTuple>> {
        let snapshot = self.snapshot(revision)?;
        Ok(snapshot
            .tuples
            .iter()
            .filter(|tuple| filter.matches(tuple))
            .cloned()
            .collect())
    }

    async fn head_revision(&self) -> Result<RevisionToken> {
        let inner = self.inner.lock().unwrap();
        Ok(RevisionToken::new(inner.head.to_string()))
    }

    async fn namespace(
        &self,
        revision: &RevisionToken,
        namespace: &str,
    ) -> Result<NamespaceDefinition> {
        let snapshot = self.snapshot(revision)?;
        snapshot.namespaces.get(namespace).cloned().ok_or_else(|| {
            Error::invalid_argument(format!(
                "namespace {:?} is not defined at revision {}",
                namespace, revision
            ))
        })
    }
}
