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

use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metasync_common::cluster_map::{ClusterMapSnapshot, Scope};
use metasync_common::node::{NetworkPlane, NodeId};
use metasync_common::revs::{ActionEnvelope, Artifact, Tag};
use metasync_rpc_client::{Broadcaster, Request, Timeout};
use reqwest::Method;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::cluster_map_store::ClusterMapStore;
use crate::delivery::PeerDeliveryState;
use crate::registry::VersionedArtifactRegistry;

/// Path the metasyncer's own broadcast traffic rides on, per the wire
/// payload contract: `/v<api-ver>/metasync` on the intra-control plane.
const METASYNC_PATH: &str = "/v1/metasync";

/// Upper bound on the number of immediate refused-peer retry rounds within
/// a single `doSync` invocation (step 6). Named rather than left as a bare
/// literal since the retry horizon itself — not any particular count — is
/// the thing that matters; callers who need more resilience than this get
/// it from the periodic pending-set timer instead.
const MAX_REFUSED_RETRIES: u32 = 10;

/// The narrow capability the metasyncer needs from whatever owns the
/// cluster map and primacy status. Kept as a trait so the metasyncer never
/// holds a back-reference to its owner.
#[async_trait]
pub trait GatewayCapability: Send + Sync {
    async fn snapshot_cms(&self) -> Arc<ClusterMapSnapshot>;
    fn is_primary(&self) -> bool;
}

/// Default [`GatewayCapability`] backed directly by a [`ClusterMapStore`]
/// and an externally-driven primacy flag (set by the leader-election
/// subsystem, which is out of scope for this crate).
pub struct CmsCapability {
    store: Arc<ClusterMapStore>,
    primary: Arc<AtomicBool>,
}

impl CmsCapability {
    pub fn new(store: Arc<ClusterMapStore>, primary: Arc<AtomicBool>) -> Self {
        Self { store, primary }
    }
}

#[async_trait]
impl GatewayCapability for CmsCapability {
    async fn snapshot_cms(&self) -> Arc<ClusterMapSnapshot> {
        self.store.get().await
    }

    fn is_primary(&self) -> bool {
        self.primary.load(Ordering::SeqCst)
    }
}

/// One `(artifact, action)` pair submitted for synchronization.
pub struct SyncPair {
    pub artifact: Arc<dyn Artifact>,
    pub action: ActionEnvelope,
}

pub enum WorkKind {
    Sync(Vec<SyncPair>),
    /// A bare nudge carrying no artifacts; re-broadcasts every tag currently
    /// published, paired with whatever action envelope was frozen alongside
    /// it at `store` time, without touching the registry. Carries no
    /// caller-supplied envelope of its own — a notify always resends the
    /// actions already on record, never a fresh one.
    Notify,
}

/// A unit of work submitted to the metasyncer loop. `done`, if present,
/// receives the failed-peer count once processing completes.
pub struct WorkRequest {
    pub kind: WorkKind,
    pub done: Option<oneshot::Sender<u32>>,
}

/// The single-writer loop that consumes sync/notify requests, builds the
/// wire payload, broadcasts it, tracks per-peer delivery, and schedules
/// retries for refused or still-pending peers. Exactly one task runs
/// `run`; all other access is through the bounded work channel.
pub struct Metasyncer {
    self_id: NodeId,
    capability: Arc<dyn GatewayCapability>,
    broadcaster: Arc<Broadcaster>,
    registry: Arc<VersionedArtifactRegistry>,
    delivery: Arc<PeerDeliveryState>,
    cplane_operation: Duration,
    max_keepalive: Duration,
    retry_sync_time: Duration,
    work_tx: mpsc::Sender<WorkRequest>,
    shutdown: watch::Sender<bool>,
}

impl Metasyncer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_id: NodeId,
        capability: Arc<dyn GatewayCapability>,
        broadcaster: Arc<Broadcaster>,
        registry: Arc<VersionedArtifactRegistry>,
        delivery: Arc<PeerDeliveryState>,
        cplane_operation: Duration,
        max_keepalive: Duration,
        retry_sync_time: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<WorkRequest>) {
        let (work_tx, work_rx) = mpsc::channel(128);
        let (shutdown, _) = watch::channel(false);
        (
            Arc::new(Self {
                self_id,
                capability,
                broadcaster,
                registry,
                delivery,
                cplane_operation,
                max_keepalive,
                retry_sync_time,
                work_tx,
                shutdown,
            }),
            work_rx,
        )
    }

    /// Submits a sync request. Dropped (logged, not queued) if this node
    /// is not currently primary — per the spec, every caller path checks
    /// primacy before enqueuing.
    pub async fn sync(&self, pairs: Vec<SyncPair>) -> Option<oneshot::Receiver<u32>> {
        self.enqueue(WorkKind::Sync(pairs)).await
    }

    /// Submits a bare notification, nudging peers to re-observe already
    /// published state without publishing anything new. Always resends every
    /// tag's stored action envelope; there is no per-call envelope to pass
    /// in.
    pub async fn notify(&self) -> Option<oneshot::Receiver<u32>> {
        self.enqueue(WorkKind::Notify).await
    }

    async fn enqueue(&self, kind: WorkKind) -> Option<oneshot::Receiver<u32>> {
        if !self.capability.is_primary() {
            warn!("dropping work request submitted to a non-primary node");
            return None;
        }
        let (done_tx, done_rx) = oneshot::channel();
        let req = WorkRequest {
            kind,
            done: Some(done_tx),
        };
        if self.work_tx.send(req).await.is_err() {
            warn!("metasyncer loop is not running, dropping work request");
            return None;
        }
        Some(done_rx)
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Spawns the single-writer loop. `work_rx` is the receiver half
    /// returned by [`Self::new`]; moving it here statically guarantees at
    /// most one consumer.
    pub fn spawn(self: Arc<Self>, work_rx: mpsc::Receiver<WorkRequest>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(work_rx).await })
    }

    async fn run(self: Arc<Self>, mut work_rx: mpsc::Receiver<WorkRequest>) {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut retry_deadline: Option<tokio::time::Instant> = None;

        loop {
            let sleep_until_retry = async {
                match retry_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => futures::future::pending::<()>().await,
                }
            };

            tokio::select! {
                maybe_req = work_rx.recv() => {
                    match maybe_req {
                        Some(req) => {
                            let failed = self.do_sync(req.kind).await;
                            if let Some(done) = req.done {
                                let _ = done.send(failed);
                            }
                            retry_deadline = self.compute_retry_deadline().await;
                        }
                        None => break,
                    }
                }
                _ = sleep_until_retry => {
                    self.handle_pending().await;
                    retry_deadline = self.compute_retry_deadline().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn compute_retry_deadline(&self) -> Option<tokio::time::Instant> {
        let cms = self.capability.snapshot_cms().await;
        let pending = self.delivery.pending_peers(&cms, &self.self_id, &self.registry);
        if pending.is_empty() {
            None
        } else {
            Some(tokio::time::Instant::now() + self.retry_sync_time)
        }
    }

    /// Resets all internal state tracked across sync attempts. Invoked the
    /// moment the loop discovers it is no longer primary — a later
    /// re-election starts with a clean slate rather than stale assumptions
    /// about what past peers had acknowledged.
    fn become_non_primary(&self) {
        self.registry.clear();
        self.delivery.clear();
    }

    fn has_undelivered_peers(&self, cms: &ClusterMapSnapshot, tag: &Tag) -> bool {
        let last = self.registry.last_version(tag);
        cms.members(Scope::All, &self.self_id)
            .iter()
            .any(|peer| self.delivery.delivered_version(&peer.id, tag) < last)
    }

    /// The six-step `doSync` algorithm plus housekeeping. Returns the
    /// number of peers left un-synced after the immediate retry rounds.
    async fn do_sync(&self, kind: WorkKind) -> u32 {
        if !self.capability.is_primary() {
            warn!("lost primacy before processing queued work, dropping");
            self.become_non_primary();
            return 0;
        }

        // Step 1: CoW audit.
        if let Err(err) = self.registry.audit_all() {
            error!(error = %err, "copy-on-write invariant violated");
            panic!("copy-on-write invariant violated: {err}");
        }

        let cms = self.capability.snapshot_cms().await;

        // Steps 2 & 3: filter/upgrade and publish.
        let (to_send, force_retry, method) = match kind {
            WorkKind::Sync(pairs) => {
                let mut to_send = Vec::new();
                let mut force_retry = None;
                for pair in pairs {
                    let tag = pair.artifact.tag();
                    let artifact: Arc<dyn Artifact> = if tag.as_str() == Tag::SMAP {
                        match pair.artifact.version().cmp(&cms.version()) {
                            CmpOrdering::Greater => {
                                error!(
                                    submitted = pair.artifact.version(),
                                    current = cms.version(),
                                    "smap newer than current cluster map"
                                );
                                panic!(
                                    "smap version {} exceeds current cluster map version {}",
                                    pair.artifact.version(),
                                    cms.version()
                                );
                            }
                            CmpOrdering::Less => Arc::new((*cms).clone()),
                            CmpOrdering::Equal => pair.artifact,
                        }
                    } else {
                        pair.artifact
                    };

                    let last = self.registry.last_version(&tag);
                    let undelivered = self.has_undelivered_peers(&cms, &tag);

                    if artifact.version() < last {
                        warn!(%tag, version = artifact.version(), last, "dropping stale sync submission");
                        continue;
                    }
                    if artifact.version() == last && !undelivered {
                        continue;
                    }

                    if let Err(err) = self.registry.store(artifact, &pair.action, undelivered) {
                        error!(%tag, error = %err, "registry rejected artifact");
                        panic!("registry invariant violated for tag {tag}: {err}");
                    }

                    if pair.action.new_node_id.is_some() {
                        force_retry = pair.action.new_node_id.clone();
                    }
                    to_send.push(tag);
                }
                (to_send, force_retry, Method::PUT)
            }
            WorkKind::Notify => (self.registry.tags(), None, Method::POST),
        };

        if to_send.is_empty() {
            return 0;
        }

        // Step 4: broadcast.
        let payload = self.build_payload(&to_send);
        let body = serde_json::to_vec(&payload).unwrap_or_default();
        let req = Request::new(method, METASYNC_PATH).with_json_body(body.into());
        let timeout = Timeout::Explicit(self.cplane_operation * 2);

        let peers = cms.members(Scope::All, &self.self_id);
        let mut rx = self.broadcaster.broadcast_to(peers, NetworkPlane::IntraControl, req.clone(), timeout);

        // Step 5: classify outcomes.
        let mut refused: HashSet<NodeId> = HashSet::new();
        let mut permanent_failures: u32 = 0;
        while let Some(result) = rx.recv().await {
            if result.is_ok() {
                for tag in &to_send {
                    self.delivery.record(&result.peer, tag, self.registry.last_version(tag));
                }
                continue;
            }
            let force = force_retry.as_ref() == Some(&result.peer);
            if result.outcome.is_connection_refused() || force {
                refused.insert(result.peer);
            } else {
                warn!(peer = %result.peer, outcome = ?result.outcome, "permanent failure this attempt");
                permanent_failures += 1;
            }
        }

        // Step 6: immediate refused-retry.
        let mut round = 0;
        while !refused.is_empty() && round < MAX_REFUSED_RETRIES {
            round += 1;
            tokio::time::sleep(self.cplane_operation).await;

            let cms = self.capability.snapshot_cms().await;
            if !self.capability.is_primary() {
                self.become_non_primary();
                return permanent_failures + refused.len() as u32;
            }

            let retry_peers = cms
                .members(Scope::All, &self.self_id)
                .into_iter()
                .filter(|p| refused.contains(&p.id))
                .collect::<Vec<_>>();
            if retry_peers.is_empty() {
                break;
            }

            let mut rx = self.broadcaster.broadcast_to(
                retry_peers,
                NetworkPlane::IntraControl,
                req.clone(),
                Timeout::Explicit(self.max_keepalive),
            );
            while let Some(result) = rx.recv().await {
                if result.is_ok() {
                    for tag in &to_send {
                        self.delivery.record(&result.peer, tag, self.registry.last_version(tag));
                    }
                    refused.remove(&result.peer);
                }
            }
        }

        // Step 7: housekeep. Drop delivery state for any NodeID no longer in
        // the current cluster map, so stale rows don't linger until the next
        // unrelated pending-retry firing.
        self.delivery.retain_peers(&self.capability.snapshot_cms().await);

        permanent_failures + refused.len() as u32
    }

    /// Re-broadcasts the full last-published set to the pending set on the
    /// periodic retry timer. Never touches the registry.
    async fn handle_pending(&self) {
        let cms = self.capability.snapshot_cms().await;
        if !self.capability.is_primary() {
            self.become_non_primary();
            return;
        }
        let pending_ids = self.delivery.pending_peers(&cms, &self.self_id, &self.registry);
        if pending_ids.is_empty() {
            return;
        }
        let tags = self.registry.tags();
        if tags.is_empty() {
            return;
        }

        let payload = self.build_payload(&tags);
        let body = serde_json::to_vec(&payload).unwrap_or_default();
        let req = Request::new(Method::PUT, METASYNC_PATH).with_json_body(body.into());

        let pending_peers = cms
            .members(Scope::All, &self.self_id)
            .into_iter()
            .filter(|p| pending_ids.contains(&p.id))
            .collect::<Vec<_>>();

        let mut rx = self.broadcaster.broadcast_to(
            pending_peers,
            NetworkPlane::IntraControl,
            req,
            Timeout::Explicit(self.cplane_operation),
        );
        while let Some(result) = rx.recv().await {
            if result.is_ok() {
                for tag in &tags {
                    self.delivery.record(&result.peer, tag, self.registry.last_version(tag));
                }
            }
        }

        // Step 7 equivalent: drop delivery state for peers that vanished
        // from the cluster map while this retry round was in flight.
        self.delivery.retain_peers(&self.capability.snapshot_cms().await);
    }

    fn build_payload(&self, tags: &[Tag]) -> HashMap<String, String> {
        let mut payload = HashMap::new();
        for tag in tags {
            if let Some(bytes) = self.registry.frozen_bytes(tag) {
                payload.insert(tag.as_str().to_string(), String::from_utf8_lossy(&bytes).into_owned());
            }
            if let Some(bytes) = self.registry.action_bytes(tag) {
                payload.insert(tag.action_key(), String::from_utf8_lossy(&bytes).into_owned());
            }
        }
        payload
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use metasync_common::node::{NodeDescriptor, Role};
    use metasync_rpc_client::PeerCaller;
    use serde::Serialize;

    use super::*;

    #[derive(Debug, Serialize)]
    struct Bucketmd {
        version: u64,
    }

    impl Artifact for Bucketmd {
        fn tag(&self) -> Tag {
            Tag::new(Tag::BUCKETMD)
        }

        fn version(&self) -> u64 {
            self.version
        }

        fn marshal(&self) -> serde_json::Result<Vec<u8>> {
            serde_json::to_vec(self)
        }
    }

    struct FixedCapability {
        store: Arc<ClusterMapStore>,
        primary: bool,
    }

    #[async_trait]
    impl GatewayCapability for FixedCapability {
        async fn snapshot_cms(&self) -> Arc<ClusterMapSnapshot> {
            self.store.get().await
        }

        fn is_primary(&self) -> bool {
            self.primary
        }
    }

    async fn harness(primary: bool) -> (Arc<Metasyncer>, mpsc::Receiver<WorkRequest>) {
        let store = Arc::new(ClusterMapStore::new(ClusterMapSnapshot::empty()));
        let mut guard = store.begin_update().await;
        guard
            .draft_mut()
            .upsert(NodeDescriptor::new(NodeId::from("self"), Role::Gateway, "http://127.0.0.1:1"));
        guard.commit().await.unwrap();

        let capability = Arc::new(FixedCapability { store, primary });
        let caller = Arc::new(PeerCaller::new(Duration::from_millis(20), Duration::from_millis(50)));
        let broadcaster = Arc::new(Broadcaster::new(caller));
        let registry = Arc::new(VersionedArtifactRegistry::new());
        let delivery = Arc::new(PeerDeliveryState::new());

        Metasyncer::new(
            NodeId::from("self"),
            capability,
            broadcaster,
            registry,
            delivery,
            Duration::from_millis(10),
            Duration::from_millis(20),
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn non_primary_enqueue_is_dropped() {
        let (metasyncer, _rx) = harness(false).await;
        let result = metasyncer
            .sync(vec![SyncPair {
                artifact: Arc::new(Bucketmd { version: 1 }),
                action: ActionEnvelope::new("test", 0),
            }])
            .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn self_only_cms_sync_has_no_failures() {
        let (metasyncer, work_rx) = harness(true).await;
        let handle = Arc::clone(&metasyncer).spawn(work_rx);

        let done = metasyncer
            .sync(vec![SyncPair {
                artifact: Arc::new(Bucketmd { version: 1 }),
                action: ActionEnvelope::new("test", 0),
            }])
            .await
            .unwrap();
        let failed = done.await.unwrap();
        assert_eq!(failed, 0, "self-only cluster map yields no broadcast targets");

        metasyncer.stop();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn notify_does_not_touch_the_registry() {
        let (metasyncer, work_rx) = harness(true).await;
        let handle = Arc::clone(&metasyncer).spawn(work_rx);

        let done = metasyncer
            .sync(vec![SyncPair {
                artifact: Arc::new(Bucketmd { version: 1 }),
                action: ActionEnvelope::new("test", 0),
            }])
            .await
            .unwrap();
        done.await.unwrap();
        let version_before = metasyncer.registry.last_version(&Tag::new(Tag::BUCKETMD));

        let done = metasyncer.notify().await.unwrap();
        let failed = done.await.unwrap();
        assert_eq!(failed, 0, "self-only cluster map yields no broadcast targets");
        assert_eq!(
            metasyncer.registry.last_version(&Tag::new(Tag::BUCKETMD)),
            version_before,
            "notify must not publish a new version"
        );

        metasyncer.stop();
        let _ = handle.await;
    }
}
