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

use std::collections::HashMap;
use std::sync::Arc;

use metasync_common::cluster_map::ClusterMapSnapshot;
use metasync_common::node::NodeId;
use metasync_common::revs::Tag;
use metasync_meta::ClusterMapStore;
use parking_lot::Mutex;
use tracing::{info, warn};

/// Pluggable acceptance logic for one non-`smap` tag (e.g. `bucketmd`,
/// `token`). Implementors own their local store and whatever CoW path it
/// uses; the handler only needs enough to enforce the downgrade check and
/// hand off accepted bytes.
pub trait TagHandler: Send + Sync {
    fn local_version(&self) -> u64;
    fn version_of(&self, bytes: &[u8]) -> metasync_common::error::Result<u64>;
    fn commit(&self, bytes: &[u8]) -> metasync_common::error::Result<()>;
}

#[derive(Debug, Clone)]
pub enum ReceiveOutcome {
    Accepted { tag: Tag, version: u64 },
    Rejected { tag: Tag, incoming: u64, local: u64 },
    Error { tag: Tag, message: String },
}

impl ReceiveOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ReceiveOutcome::Accepted { .. })
    }
}

/// Validates and applies an incoming replication payload, per peer. The
/// cluster map (`smap`) is handled directly against the local
/// [`ClusterMapStore`], since it carries a membership-reconciliation
/// exception that generic tags don't need; every other tag goes through a
/// registered [`TagHandler`].
pub struct ReceiveHandler {
    self_id: NodeId,
    cms_store: Arc<ClusterMapStore>,
    handlers: Mutex<HashMap<Tag, Arc<dyn TagHandler>>>,
}

impl ReceiveHandler {
    pub fn new(self_id: NodeId, cms_store: Arc<ClusterMapStore>) -> Self {
        Self {
            self_id,
            cms_store,
            handlers: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, tag: Tag, handler: Arc<dyn TagHandler>) {
        self.handlers.lock().insert(tag, handler);
    }

    /// Processes one payload, as received from the wire: a flat map of
    /// `tag -> serialized artifact` plus `tag-action -> serialized action`
    /// (both present as JSON text, possibly double-encoded per the wire
    /// contract). Unknown tags are ignored.
    pub async fn handle(&self, payload: &HashMap<String, String>) -> Vec<ReceiveOutcome> {
        let mut outcomes = Vec::new();

        let smap_tag = Tag::new(Tag::SMAP);
        if let Some(bytes) = payload.get(smap_tag.as_str()) {
            outcomes.push(self.handle_smap(bytes.as_bytes()).await);
        }

        let handlers: Vec<(Tag, Arc<dyn TagHandler>)> =
            self.handlers.lock().iter().map(|(t, h)| (t.clone(), h.clone())).collect();
        for (tag, handler) in handlers {
            if tag == smap_tag {
                continue;
            }
            if let Some(bytes) = payload.get(tag.as_str()) {
                outcomes.push(Self::handle_generic(&tag, handler.as_ref(), bytes.as_bytes()));
            }
        }

        outcomes
    }

    async fn handle_smap(&self, bytes: &[u8]) -> ReceiveOutcome {
        let tag = Tag::new(Tag::SMAP);
        let incoming: ClusterMapSnapshot = match serde_json::from_slice(bytes) {
            Ok(v) => v,
            Err(err) => return ReceiveOutcome::Error { tag, message: err.to_string() },
        };

        let local = self.cms_store.get().await;
        let is_downgrade = incoming.version() < local.version();

        // Whitelisted exception: a node that has fallen out of the CMS it
        // knows about, but is still in its own local one, is allowed to
        // accept a same-or-lower version from the primary while it
        // reconciles membership.
        let reconciling = !incoming.contains(&self.self_id) && local.contains(&self.self_id);

        if is_downgrade && !reconciling {
            warn!(incoming = incoming.version(), local = local.version(), "rejected smap downgrade");
            return ReceiveOutcome::Rejected {
                tag,
                incoming: incoming.version(),
                local: local.version(),
            };
        }

        let version = incoming.version();
        self.cms_store.replace(incoming).await;
        info!(version, "accepted smap from peer");
        ReceiveOutcome::Accepted { tag, version }
    }

    fn handle_generic(tag: &Tag, handler: &dyn TagHandler, bytes: &[u8]) -> ReceiveOutcome {
        let incoming_version = match handler.version_of(bytes) {
            Ok(v) => v,
            Err(err) => return ReceiveOutcome::Error { tag: tag.clone(), message: err.to_string() },
        };
        let local_version = handler.local_version();
        if incoming_version < local_version {
            warn!(%tag, incoming_version, local_version, "rejected downgrade");
            return ReceiveOutcome::Rejected {
                tag: tag.clone(),
                incoming: incoming_version,
                local: local_version,
            };
        }
        if let Err(err) = handler.commit(bytes) {
            return ReceiveOutcome::Error { tag: tag.clone(), message: err.to_string() };
        }
        ReceiveOutcome::Accepted {
            tag: tag.clone(),
            version: incoming_version,
        }
    }
}

#[cfg(test)]
mod tests {
    use metasync_common::node::{NodeDescriptor, Role};

    use super::*;

    struct CountingHandler {
        version: Mutex<u64>,
    }

    impl TagHandler for CountingHandler {
        fn local_version(&self) -> u64 {
            *self.version.lock()
        }

        fn version_of(&self, bytes: &[u8]) -> metasync_common::error::Result<u64> {
            Ok(serde_json::from_slice::<u64>(bytes)?)
        }

        fn commit(&self, bytes: &[u8]) -> metasync_common::error::Result<()> {
            *self.version.lock() = self.version_of(bytes)?;
            Ok(())
        }
    }

    fn store() -> Arc<ClusterMapStore> {
        Arc::new(ClusterMapStore::new(ClusterMapSnapshot::empty()))
    }

    #[tokio::test]
    async fn accepts_higher_version() {
        let handler = ReceiveHandler::new(NodeId::from("self"), store());
        let tag = Tag::new(Tag::BUCKETMD);
        handler.register(tag.clone(), Arc::new(CountingHandler { version: Mutex::new(1) }));

        let mut payload = HashMap::new();
        payload.insert(tag.as_str().to_string(), serde_json::to_string(&2u64).unwrap());

        let outcomes = handler.handle(&payload).await;
        assert!(outcomes.iter().any(|o| o.is_accepted()));
    }

    #[tokio::test]
    async fn rejects_downgrade() {
        let handler = ReceiveHandler::new(NodeId::from("self"), store());
        let tag = Tag::new(Tag::BUCKETMD);
        handler.register(tag.clone(), Arc::new(CountingHandler { version: Mutex::new(5) }));

        let mut payload = HashMap::new();
        payload.insert(tag.as_str().to_string(), serde_json::to_string(&4u64).unwrap());

        let outcomes = handler.handle(&payload).await;
        assert!(matches!(outcomes[0], ReceiveOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn reconciling_node_accepts_smap_downgrade() {
        let cms_store = store();
        let mut guard = cms_store.begin_update().await;
        guard.draft_mut().upsert(NodeDescriptor::new(NodeId::from("self"), Role::Target, "http://self"));
        guard.draft_mut().upsert(NodeDescriptor::new(NodeId::from("p0"), Role::Gateway, "http://p0"));
        guard.commit().await.unwrap();
        // Local CMS is now at version 1 and contains "self".

        let handler = ReceiveHandler::new(NodeId::from("self"), cms_store.clone());

        // Incoming smap is version 0 (lower) and does not mention "self".
        let incoming = ClusterMapSnapshot::empty();
        let mut payload = HashMap::new();
        payload.insert(Tag::SMAP.to_string(), serde_json::to_string(&incoming).unwrap());

        let outcomes = handler.handle(&payload).await;
        assert!(outcomes[0].is_accepted(), "reconciling node should accept the downgrade");
    }
}
