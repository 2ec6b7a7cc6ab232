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

use metasync_common::cluster_map::{ClusterMapSnapshot, Scope};
use metasync_common::node::{NetworkPlane, NodeId};
use tokio::sync::mpsc;
use tracing::warn;

use crate::caller::{CallResult, PeerCaller, Request};
use crate::timeout::Timeout;

/// Fans one request out to a selected subset of the cluster map, in
/// parallel, streaming per-peer results back as they arrive.
pub struct Broadcaster {
    caller: Arc<PeerCaller>,
}

impl Broadcaster {
    pub fn new(caller: Arc<PeerCaller>) -> Self {
        Self { caller }
    }

    /// Snapshots `scope` out of `cms` (excluding `self_id`), dispatches one
    /// call per peer concurrently, and returns a channel that yields each
    /// result as it completes. The channel's buffer is sized to the peer
    /// count, so it never blocks a completing task; it closes once every
    /// dispatched call has reported in. Every dispatched call runs to
    /// completion even if the receiver is dropped early — there are no
    /// orphaned tasks, only results nobody reads.
    pub fn broadcast(
        &self,
        cms: &ClusterMapSnapshot,
        self_id: &NodeId,
        scope: Scope,
        plane: NetworkPlane,
        req: Request,
        timeout: Timeout,
    ) -> mpsc::Receiver<CallResult> {
        let peers = cms.members(scope, self_id);
        self.broadcast_to(peers, plane, req, timeout)
    }

    /// Like [`Self::broadcast`] but against an explicit, already-filtered
    /// peer list (used for the refused-peer and pending-set retry paths,
    /// where the target set is not "a scope of the current CMS" anymore).
    pub fn broadcast_to(
        &self,
        peers: Vec<metasync_common::node::NodeDescriptor>,
        plane: NetworkPlane,
        req: Request,
        timeout: Timeout,
    ) -> mpsc::Receiver<CallResult> {
        if peers.is_empty() {
            warn!("broadcast scope is empty, closing stream with no calls issued");
            let (_tx, rx) = mpsc::channel(1);
            return rx;
        }

        let (tx, rx) = mpsc::channel(peers.len());
        for peer in peers {
            let caller = Arc::clone(&self.caller);
            let req = req.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = caller.call(&peer, plane, &req, timeout).await;
                // If the consumer stopped reading, the send fails and the
                // result is dropped; the call itself already ran to completion.
                let _ = tx.send(result).await;
            });
        }
        rx
    }
}

#[cfg(test)]
mod tests {
    use metasync_common::node::{NodeDescriptor, Role};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn empty_scope_closes_immediately() {
        let caller = Arc::new(PeerCaller::new(
            Duration::from_millis(50),
            Duration::from_secs(1),
        ));
        let broadcaster = Broadcaster::new(caller);
        let cms = ClusterMapSnapshot::empty();
        let mut rx = broadcaster.broadcast(
            &cms,
            &NodeId::from("self"),
            Scope::All,
            NetworkPlane::IntraControl,
            Request::new(reqwest::Method::POST, "/v1/metasync"),
            Timeout::Default,
        );
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn self_is_excluded_from_broadcast() {
        let caller = Arc::new(PeerCaller::new(
            Duration::from_millis(50),
            Duration::from_secs(1),
        ));
        let broadcaster = Broadcaster::new(caller);
        let mut draft = ClusterMapSnapshot::empty().begin_update();
        draft.upsert(NodeDescriptor::new(
            NodeId::from("p0"),
            Role::Gateway,
            "http://127.0.0.1:1",
        ));
        let cms = draft.commit().unwrap();

        let mut rx = broadcaster.broadcast(
            &cms,
            &NodeId::from("p0"),
            Scope::All,
            NetworkPlane::IntraControl,
            Request::new(reqwest::Method::POST, "/v1/metasync"),
            Timeout::Default,
        );
        assert!(rx.recv().await.is_none(), "self-only CMS yields no calls");
    }
}
