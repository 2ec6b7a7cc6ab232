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

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::node::{NodeDescriptor, NodeId, Role};
use crate::revs::{Artifact, Tag};

/// Immutable Cluster Map Snapshot (CMS / "smap"): the authoritative
/// membership record at a point in time. Two snapshots are never mutated in
/// place; a membership change always produces a new, higher-versioned one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMapSnapshot {
    version: u64,
    primary: Option<NodeId>,
    gateways: HashMap<NodeId, NodeDescriptor>,
    targets: HashMap<NodeId, NodeDescriptor>,
}

impl ClusterMapSnapshot {
    pub fn empty() -> Self {
        Self {
            version: 0,
            primary: None,
            gateways: HashMap::new(),
            targets: HashMap::new(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn primary(&self) -> Option<&NodeId> {
        self.primary.as_ref()
    }

    pub fn is_primary(&self, id: &NodeId) -> bool {
        self.primary.as_ref() == Some(id)
    }

    pub fn gateways(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.gateways.values()
    }

    pub fn targets(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.targets.values()
    }

    pub fn get(&self, id: &NodeId) -> Option<&NodeDescriptor> {
        self.gateways.get(id).or_else(|| self.targets.get(id))
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.gateways.contains_key(id) || self.targets.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.gateways.len() + self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Members matching `scope`, excluding `exclude` (typically "self").
    pub fn members(&self, scope: Scope, exclude: &NodeId) -> Vec<NodeDescriptor> {
        let iter: Box<dyn Iterator<Item = &NodeDescriptor>> = match scope {
            Scope::Gateways => Box::new(self.gateways()),
            Scope::Targets => Box::new(self.targets()),
            Scope::All => Box::new(self.gateways().chain(self.targets())),
        };
        iter.filter(|d| &d.id != exclude).cloned().collect()
    }

    /// Starts a copy-on-write draft seeded with this snapshot's contents,
    /// bumped to the next version.
    pub fn begin_update(&self) -> ClusterMapSnapshotBuilder {
        ClusterMapSnapshotBuilder {
            version: self.version + 1,
            primary: self.primary.clone(),
            gateways: self.gateways.clone(),
            targets: self.targets.clone(),
        }
    }

    fn validate(&self) -> Result<()> {
        if let Some(primary) = &self.primary {
            if !self.gateways.contains_key(primary) {
                return Err(Error::InvalidClusterMap(format!(
                    "primary {primary} is not a known gateway"
                )));
            }
        }
        Ok(())
    }
}

/// The cluster map is itself a REVS artifact under the `smap` tag: the
/// metasyncer publishes it through the same registry/broadcast path as any
/// other replicated value.
impl Artifact for ClusterMapSnapshot {
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

/// The subset of a [`ClusterMapSnapshot`] a broadcast targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Gateways,
    Targets,
    All,
}

/// A mutable draft obtained from [`ClusterMapSnapshot::begin_update`].
/// Dropped without calling [`Self::commit`], it changes nothing: the
/// exclusive update token is released and the draft discarded.
pub struct ClusterMapSnapshotBuilder {
    version: u64,
    primary: Option<NodeId>,
    gateways: HashMap<NodeId, NodeDescriptor>,
    targets: HashMap<NodeId, NodeDescriptor>,
}

impl ClusterMapSnapshotBuilder {
    pub fn set_primary(&mut self, id: Option<NodeId>) -> &mut Self {
        self.primary = id;
        self
    }

    pub fn upsert(&mut self, node: NodeDescriptor) -> &mut Self {
        match node.role {
            Role::Gateway => {
                self.gateways.insert(node.id.clone(), node);
            }
            Role::Target => {
                self.targets.insert(node.id.clone(), node);
            }
        }
        self
    }

    pub fn remove(&mut self, id: &NodeId) -> &mut Self {
        self.gateways.remove(id);
        self.targets.remove(id);
        if self.primary.as_ref() == Some(id) {
            self.primary = None;
        }
        self
    }

    /// Finalizes the draft into an immutable snapshot, checking the
    /// "primary must be a known gateway" invariant.
    pub fn commit(self) -> Result<ClusterMapSnapshot> {
        let snapshot = ClusterMapSnapshot {
            version: self.version,
            primary: self.primary,
            gateways: self.gateways,
            targets: self.targets,
        };
        snapshot.validate()?;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gw(id: &str) -> NodeDescriptor {
        NodeDescriptor::new(NodeId::from(id), Role::Gateway, format!("http://{id}"))
    }

    fn tgt(id: &str) -> NodeDescriptor {
        NodeDescriptor::new(NodeId::from(id), Role::Target, format!("http://{id}"))
    }

    #[test]
    fn empty_has_version_zero() {
        let cms = ClusterMapSnapshot::empty();
        assert_eq!(cms.version(), 0);
        assert!(cms.is_empty());
    }

    #[test]
    fn commit_bumps_version_and_is_immutable_afterwards() {
        let base = ClusterMapSnapshot::empty();
        let mut draft = base.begin_update();
        draft.upsert(gw("p0"));
        draft.set_primary(Some(NodeId::from("p0")));
        let v1 = draft.commit().unwrap();
        assert_eq!(v1.version(), 1);
        assert_eq!(base.version(), 0, "original snapshot untouched");

        let mut draft2 = v1.begin_update();
        draft2.upsert(tgt("t1"));
        let v2 = draft2.commit().unwrap();
        assert_eq!(v2.version(), 2);
        assert_eq!(v1.len(), 1, "v1 unaffected by v2's draft");
        assert_eq!(v2.len(), 2);
    }

    #[test]
    fn primary_must_be_a_known_gateway() {
        let mut draft = ClusterMapSnapshot::empty().begin_update();
        draft.set_primary(Some(NodeId::from("ghost")));
        assert!(draft.commit().is_err());
    }

    #[test]
    fn removing_primary_clears_it() {
        let mut draft = ClusterMapSnapshot::empty().begin_update();
        draft.upsert(gw("p0"));
        draft.set_primary(Some(NodeId::from("p0")));
        draft.remove(&NodeId::from("p0"));
        let cms = draft.commit().unwrap();
        assert!(cms.primary().is_none());
    }

    #[test]
    fn members_excludes_self_and_filters_by_scope() {
        let mut draft = ClusterMapSnapshot::empty().begin_update();
        draft.upsert(gw("p0"));
        draft.upsert(gw("p1"));
        draft.upsert(tgt("t0"));
        let cms = draft.commit().unwrap();

        let gateways = cms.members(Scope::Gateways, &NodeId::from("p0"));
        assert_eq!(gateways.len(), 1);
        assert_eq!(gateways[0].id, NodeId::from("p1"));

        let all = cms.members(Scope::All, &NodeId::from("p0"));
        assert_eq!(all.len(), 2);
    }
}
