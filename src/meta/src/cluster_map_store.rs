// Copyright 2026 The Metasync Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;

use metasync_common::cluster_map::{ClusterMapSnapshot, ClusterMapSnapshotBuilder};
use metasync_common::error::Result;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock};
use tracing::info;

type Listener = Box<dyn Fn(&Arc<ClusterMapSnapshot>, &Arc<ClusterMapSnapshot>) + Send + Sync>;

/// Owns the current [`ClusterMapSnapshot`] and provides atomic,
/// copy-on-write updates. `get` is a pointer read behind a `RwLock` and
/// never waits on an in-flight update; `begin_update` takes an exclusive
/// token so at most one draft exists at a time.
pub struct ClusterMapStore {
    current: RwLock<Arc<ClusterMapSnapshot>>,
    update_token: Arc<AsyncMutex<()>>,
    listeners: Mutex<Vec<Listener>>,
}

impl ClusterMapStore {
    pub fn new(initial: ClusterMapSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
            update_token: Arc::new(AsyncMutex::new(())),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub async fn get(&self) -> Arc<ClusterMapSnapshot> {
        self.current.read().await.clone()
    }

    /// Registers a listener invoked with `(old, new)` after every commit.
    /// Listener notification is serialized with respect to other commits:
    /// it runs on the committer's task while the exclusive update token is
    /// still held.
    pub fn subscribe(
        &self,
        listener: impl Fn(&Arc<ClusterMapSnapshot>, &Arc<ClusterMapSnapshot>) + Send + Sync + 'static,
    ) {
        self.listeners.lock().push(Box::new(listener));
    }

    /// Acquires the exclusive update token and returns a draft seeded from
    /// the current snapshot. Dropping the guard without calling
    /// [`UpdateGuard::commit`] discards the draft and changes nothing.
    pub async fn begin_update(&self) -> UpdateGuard<'_> {
        let permit = self.update_token.clone().lock_owned().await;
        let draft = self.get().await.begin_update();
        UpdateGuard {
            store: self,
            _permit: permit,
            draft: Some(draft),
        }
    }

    fn notify(&self, old: &Arc<ClusterMapSnapshot>, new: &Arc<ClusterMapSnapshot>) {
        for listener in self.listeners.lock().iter() {
            listener(old, new);
        }
    }

    /// Adopts an already-built snapshot verbatim, as a receiver does with a
    /// primary's broadcast payload rather than building a draft locally.
    /// Still serialized through the exclusive update token so it can never
    /// race a concurrent `begin_update`.
    pub async fn replace(&self, new: ClusterMapSnapshot) -> Arc<ClusterMapSnapshot> {
        let _permit = self.update_token.clone().lock_owned().await;
        let new = Arc::new(new);
        let old = {
            let mut guard = self.current.write().await;
            let old = guard.clone();
            *guard = new.clone();
            old
        };
        info!(old_version = old.version(), new_version = new.version(), "cluster map replaced from peer");
        self.notify(&old, &new);
        new
    }
}

/// An exclusive in-progress update, returned by [`ClusterMapStore::begin_update`].
pub struct UpdateGuard<'a> {
    store: &'a ClusterMapStore,
    _permit: OwnedMutexGuard<()>,
    draft: Option<ClusterMapSnapshotBuilder>,
}

impl UpdateGuard<'_> {
    pub fn draft_mut(&mut self) -> &mut ClusterMapSnapshotBuilder {
        self.draft.as_mut().expect("draft already consumed")
    }

    /// Finalizes the draft, swaps it in atomically, and notifies
    /// subscribers with `(old, new)`.
    pub async fn commit(mut self) -> Result<Arc<ClusterMapSnapshot>> {
        let draft = self.draft.take().expect("draft already consumed");
        let new = Arc::new(draft.commit()?);
        let old = {
            let mut guard = self.store.current.write().await;
            let old = guard.clone();
            *guard = new.clone();
            old
        };
        info!(old_version = old.version(), new_version = new.version(), "cluster map committed");
        self.store.notify(&old, &new);
        Ok(new)
    }

    /// Explicit discard, for readability at call sites; equivalent to
    /// dropping the guard.
    pub fn discard(mut self) {
        self.draft.take();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use metasync_common::node::{NodeDescriptor, NodeId, Role};

    use super::*;

    #[tokio::test]
    async fn get_reflects_last_commit() {
        let store = ClusterMapStore::new(ClusterMapSnapshot::empty());
        assert_eq!(store.get().await.version(), 0);

        let mut guard = store.begin_update().await;
        guard
            .draft_mut()
            .upsert(NodeDescriptor::new(NodeId::from("p0"), Role::Gateway, "http://p0"));
        guard.commit().await.unwrap();

        assert_eq!(store.get().await.version(), 1);
    }

    #[tokio::test]
    async fn discarded_draft_changes_nothing() {
        let store = ClusterMapStore::new(ClusterMapSnapshot::empty());
        let mut guard = store.begin_update().await;
        guard
            .draft_mut()
            .upsert(NodeDescriptor::new(NodeId::from("p0"), Role::Gateway, "http://p0"));
        guard.discard();
        assert_eq!(store.get().await.version(), 0);
    }

    #[tokio::test]
    async fn listeners_see_old_and_new() {
        let store = ClusterMapStore::new(ClusterMapSnapshot::empty());
        let seen_old = Arc::new(AtomicU64::new(u64::MAX));
        let seen_new = Arc::new(AtomicU64::new(u64::MAX));
        let (o, n) = (seen_old.clone(), seen_new.clone());
        store.subscribe(move |old, new| {
            o.store(old.version(), Ordering::SeqCst);
            n.store(new.version(), Ordering::SeqCst);
        });

        let guard = store.begin_update().await;
        guard.commit().await.unwrap();

        assert_eq!(seen_old.load(Ordering::SeqCst), 0);
        assert_eq!(seen_new.load(Ordering::SeqCst), 1);
    }
}
