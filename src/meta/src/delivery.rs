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

use metasync_common::cluster_map::{ClusterMapSnapshot, Scope};
use metasync_common::node::NodeId;
use metasync_common::revs::Tag;
use parking_lot::Mutex;

use crate::registry::VersionedArtifactRegistry;

/// Maintained only on the primary: for each known peer, the last version of
/// each tag it has acknowledged. Entries are created lazily on first
/// broadcast to a new peer and garbage-collected once the peer disappears
/// from the cluster map (see [`Self::retain_peers`]).
#[derive(Default)]
pub struct PeerDeliveryState {
    delivered: Mutex<HashMap<NodeId, HashMap<Tag, u64>>>,
}

impl PeerDeliveryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `peer` has acknowledged `tag` at `version`. Versions
    /// never decrease for a given (peer, tag).
    pub fn record(&self, peer: &NodeId, tag: &Tag, version: u64) {
        let mut delivered = self.delivered.lock();
        let per_tag = delivered.entry(peer.clone()).or_default();
        let slot = per_tag.entry(tag.clone()).or_insert(0);
        if version > *slot {
            *slot = version;
        }
    }

    pub fn delivered_version(&self, peer: &NodeId, tag: &Tag) -> u64 {
        self.delivered
            .lock()
            .get(peer)
            .and_then(|m| m.get(tag))
            .copied()
            .unwrap_or(0)
    }

    pub fn has_entry(&self, peer: &NodeId) -> bool {
        self.delivered.lock().contains_key(peer)
    }

    fn is_in_sync(&self, peer: &NodeId, tag: &Tag, registry: &VersionedArtifactRegistry) -> bool {
        self.delivered_version(peer, tag) == registry.last_version(tag)
    }

    /// Deletes delivery state for any node id no longer present in `cms`
    /// (step 7, "housekeep", of `doSync`).
    pub fn retain_peers(&self, cms: &ClusterMapSnapshot) {
        self.delivered.lock().retain(|id, _| cms.contains(id));
    }

    /// Drops all delivery state. Called on losing primacy: a future
    /// re-election starts with no assumptions about what past peers had
    /// acknowledged.
    pub fn clear(&self) {
        self.delivered.lock().clear();
    }

    /// Peers that owe at least one tag at least one version, or have no
    /// delivery record at all (just-joined).
    pub fn pending_peers(
        &self,
        cms: &ClusterMapSnapshot,
        self_id: &NodeId,
        registry: &VersionedArtifactRegistry,
    ) -> Vec<NodeId> {
        let tags = registry.tags();
        cms.members(Scope::All, self_id)
            .into_iter()
            .filter_map(|member| {
                let out_of_sync = !self.has_entry(&member.id)
                    || tags.iter().any(|tag| !self.is_in_sync(&member.id, tag, registry));
                out_of_sync.then_some(member.id)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use metasync_common::node::{NodeDescriptor, Role};
    use metasync_common::revs::{ActionEnvelope, Artifact};
    use serde::Serialize;

    use super::*;

    #[derive(Debug, Serialize)]
    struct Smap {
        version: u64,
    }

    impl Artifact for Smap {
        fn tag(&self) -> Tag {
            Tag::new(Tag::SMAP)
        }

        fn version(&self) -> u64 {
            self.version
        }

        fn marshal(&self) -> serde_json::Result<Vec<u8>> {
            serde_json::to_vec(self)
        }
    }

    fn cms_with(ids: &[&str]) -> ClusterMapSnapshot {
        let mut draft = ClusterMapSnapshot::empty().begin_update();
        for id in ids {
            draft.upsert(NodeDescriptor::new(NodeId::from(*id), Role::Target, format!("http://{id}")));
        }
        draft.commit().unwrap()
    }

    #[test]
    fn versions_never_decrease() {
        let state = PeerDeliveryState::new();
        let peer = NodeId::from("t1");
        let tag = Tag::new(Tag::SMAP);
        state.record(&peer, &tag, 5);
        state.record(&peer, &tag, 3);
        assert_eq!(state.delivered_version(&peer, &tag), 5);
    }

    #[test]
    fn just_joined_peer_is_pending() {
        let state = PeerDeliveryState::new();
        let registry = VersionedArtifactRegistry::new();
        registry
            .store(Arc::new(Smap { version: 1 }), &ActionEnvelope::new("test", 0), false)
            .unwrap();
        let cms = cms_with(&["t1"]);
        let pending = state.pending_peers(&cms, &NodeId::from("self"), &registry);
        assert_eq!(pending, vec![NodeId::from("t1")]);
    }

    #[test]
    fn in_sync_peer_is_not_pending() {
        let state = PeerDeliveryState::new();
        let registry = VersionedArtifactRegistry::new();
        registry
            .store(Arc::new(Smap { version: 1 }), &ActionEnvelope::new("test", 0), false)
            .unwrap();
        let cms = cms_with(&["t1"]);
        state.record(&NodeId::from("t1"), &Tag::new(Tag::SMAP), 1);
        let pending = state.pending_peers(&cms, &NodeId::from("self"), &registry);
        assert!(pending.is_empty());
    }

    #[test]
    fn retain_peers_drops_evicted_nodes() {
        let state = PeerDeliveryState::new();
        state.record(&NodeId::from("t1"), &Tag::new(Tag::SMAP), 1);
        let cms = cms_with(&[]);
        state.retain_peers(&cms);
        assert!(!state.has_entry(&NodeId::from("t1")));
    }
}
