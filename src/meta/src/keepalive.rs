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
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metasync_common::config::{KeepaliveTrackerConfig, KeepaliveVariant, KeepaliveVariantConfig};
use metasync_common::node::{NetworkPlane, NodeDescriptor, NodeId, Role};
use metasync_rpc_client::{LivenessSink, PeerCaller, Request, Timeout};
use parking_lot::Mutex;
use reqwest::Method;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cluster_map_store::ClusterMapStore;

/// Health-check path probed on every peer; mirrors the spec's
/// `/v<api-ver>/health` route (see `metasync_meta_service`).
const HEALTH_PATH: &str = "/v1/health";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Alive,
    Suspect,
    Dead,
}

/// Notified when the tracker evicts a peer from the cluster map, so the
/// metasyncer can emit a membership-change action to the rest of the
/// cluster.
pub trait EvictionSink: Send + Sync {
    fn peer_evicted(&self, peer: NodeId);
}

struct PeerState {
    /// Milliseconds since the tracker's epoch. Updated with a
    /// compare-and-swap that only ever advances the value, so a
    /// `heardFrom` racing with the probe loop can never move it backwards.
    last_seen_millis: AtomicU64,
    ewma_rtt_millis: AtomicU64,
    status: Mutex<Status>,
    /// Set while a dedicated suspect-retry task owns this peer, so the main
    /// probe loop doesn't also probe it on the regular tick cadence.
    retrying: AtomicBool,
}

impl PeerState {
    fn new(now_millis: u64) -> Self {
        Self {
            last_seen_millis: AtomicU64::new(now_millis),
            ewma_rtt_millis: AtomicU64::new(0),
            status: Mutex::new(Status::Alive),
            retrying: AtomicBool::new(false),
        }
    }

    fn bump_last_seen(&self, now_millis: u64) {
        let mut current = self.last_seen_millis.load(Ordering::Acquire);
        while now_millis > current {
            match self.last_seen_millis.compare_exchange_weak(
                current,
                now_millis,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    fn record_rtt(&self, rtt: Duration, factor: u32) {
        let sample = rtt.as_millis() as u64;
        let prev = self.ewma_rtt_millis.load(Ordering::Relaxed);
        let damped = if prev == 0 {
            sample
        } else {
            prev + (sample.saturating_sub(prev)) / u64::from(factor.max(1))
        };
        self.ewma_rtt_millis.store(damped, Ordering::Relaxed);
    }
}

/// Probes peers from the current cluster map on a single dedicated
/// scheduler and evicts any that stop responding. Two variants share one
/// state machine per peer (Alive / Suspect / Dead): *heartbeat* probes at a
/// fixed interval, *average* scales the interval by an EWMA of recent
/// round-trip times damped by a configured factor.
pub struct KeepaliveTracker {
    self_id: NodeId,
    config: KeepaliveTrackerConfig,
    caller: Arc<PeerCaller>,
    cms_store: Arc<ClusterMapStore>,
    epoch: Instant,
    peers: Mutex<HashMap<NodeId, Arc<PeerState>>>,
    eviction_sink: Mutex<Option<Arc<dyn EvictionSink>>>,
    shutdown: watch::Sender<bool>,
}

impl KeepaliveTracker {
    pub fn new(
        self_id: NodeId,
        config: KeepaliveTrackerConfig,
        caller: Arc<PeerCaller>,
        cms_store: Arc<ClusterMapStore>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            self_id,
            config,
            caller,
            cms_store,
            epoch: Instant::now(),
            peers: Mutex::new(HashMap::new()),
            eviction_sink: Mutex::new(None),
            shutdown,
        })
    }

    pub fn set_eviction_sink(&self, sink: Arc<dyn EvictionSink>) {
        *self.eviction_sink.lock() = Some(sink);
    }

    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn variant_for(&self, role: Role) -> &KeepaliveVariantConfig {
        match role {
            Role::Gateway => &self.config.proxy,
            Role::Target => &self.config.target,
        }
    }

    fn state_for(&self, peer: &NodeId) -> Arc<PeerState> {
        self.peers
            .lock()
            .entry(peer.clone())
            .or_insert_with(|| Arc::new(PeerState::new(self.now_millis())))
            .clone()
    }

    /// Alive threshold, in milliseconds, for this peer's configured
    /// variant: for `average`, the base interval is inflated by the
    /// peer's EWMA round-trip time damped by `factor`.
    fn alive_threshold_millis(&self, variant: &KeepaliveVariantConfig, state: &PeerState) -> u64 {
        let base = variant.interval().as_millis() as u64;
        let effective = match variant.name {
            KeepaliveVariant::Heartbeat => base,
            KeepaliveVariant::Average => {
                base + state.ewma_rtt_millis.load(Ordering::Relaxed) / u64::from(variant.factor.max(1))
            }
        };
        effective.saturating_mul(u64::from(variant.factor.max(1)))
    }

    /// Spawns the probe loop on a single dedicated task. The base tick
    /// interval is the shorter of the proxy/target intervals so neither
    /// variant goes unprobed for longer than it configured.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let base_interval = self.config.proxy.interval().min(self.config.target.interval());
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(base_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.tick().await,
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn tick(self: &Arc<Self>) {
        let cms = self.cms_store.get().await;
        for member in cms.members(metasync_common::cluster_map::Scope::All, &self.self_id) {
            let state = self.state_for(&member.id);
            if state.retrying.load(Ordering::Acquire) {
                // A dedicated suspect-retry task already owns this peer's
                // probing cadence; don't double-probe it here.
                continue;
            }

            let variant = self.variant_for(member.role).clone();
            let elapsed = self.now_millis().saturating_sub(state.last_seen_millis.load(Ordering::Acquire));

            if elapsed <= self.alive_threshold_millis(&variant, &state) {
                continue;
            }

            if self.probe_once(&member, &variant, &state).await {
                continue;
            }

            let timeout_deadline = variant.interval().as_millis() as u64 * u64::from(self.config.timeout_factor);
            if elapsed >= timeout_deadline {
                *state.status.lock() = Status::Dead;
                self.evict(&member.id).await;
            } else {
                warn!(peer = %member.id, "keepalive probe failed, marking suspect");
                *state.status.lock() = Status::Suspect;
                self.spawn_suspect_retry(member, variant, state);
            }
        }
    }

    /// Issues one probe to `member`, recording the RTT and resetting
    /// liveness on success. Returns whether it succeeded.
    async fn probe_once(&self, member: &NodeDescriptor, variant: &KeepaliveVariantConfig, state: &PeerState) -> bool {
        let started = Instant::now();
        let result = self
            .caller
            .call(
                member,
                NetworkPlane::IntraControl,
                &Request::new(Method::GET, HEALTH_PATH),
                Timeout::Default,
            )
            .await;

        if result.is_ok() {
            state.record_rtt(started.elapsed(), variant.factor);
            self.heard_from(&member.id);
            true
        } else {
            false
        }
    }

    /// Spawns a dedicated task that re-probes a `Suspect` peer immediately,
    /// then backs off (doubling each failed attempt, capped at
    /// `retry_factor * interval` per the spec) until the peer answers again
    /// or the `Dead` threshold is reached. At most one such task runs per
    /// peer at a time, guarded by `PeerState::retrying`.
    fn spawn_suspect_retry(self: &Arc<Self>, member: NodeDescriptor, variant: KeepaliveVariantConfig, state: Arc<PeerState>) {
        if state.retrying.swap(true, Ordering::AcqRel) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_suspect_retry(member, variant, state).await;
        });
    }

    async fn run_suspect_retry(self: Arc<Self>, member: NodeDescriptor, variant: KeepaliveVariantConfig, state: Arc<PeerState>) {
        let cap = variant.interval() * self.config.retry_factor.max(1);
        let mut backoff = variant.interval().min(cap);

        loop {
            if self.probe_once(&member, &variant, &state).await {
                break;
            }

            let elapsed = self.now_millis().saturating_sub(state.last_seen_millis.load(Ordering::Acquire));
            let timeout_deadline = variant.interval().as_millis() as u64 * u64::from(self.config.timeout_factor);
            if elapsed >= timeout_deadline {
                *state.status.lock() = Status::Dead;
                self.evict(&member.id).await;
                break;
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(cap);
        }

        state.retrying.store(false, Ordering::Release);
    }

    async fn evict(&self, peer: &NodeId) {
        let mut guard = self.cms_store.begin_update().await;
        guard.draft_mut().remove(peer);
        match guard.commit().await {
            Ok(new_cms) => {
                info!(peer = %peer, new_version = new_cms.version(), "evicted unresponsive peer");
                self.peers.lock().remove(peer);
                if let Some(sink) = self.eviction_sink.lock().clone() {
                    sink.peer_evicted(peer.clone());
                }
            }
            Err(err) => warn!(peer = %peer, error = %err, "failed to commit eviction"),
        }
    }
}

impl LivenessSink for KeepaliveTracker {
    /// Resets the peer to `Alive` without issuing a probe — any successful
    /// control-plane call doubles as a liveness signal.
    fn heard_from(&self, peer: &NodeId) {
        let state = self.state_for(peer);
        state.bump_last_seen(self.now_millis());
        *state.status.lock() = Status::Alive;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use metasync_common::cluster_map::ClusterMapSnapshot;
    use metasync_common::node::NodeDescriptor;

    use super::*;

    fn variant(interval_secs: u64, factor: u32) -> KeepaliveVariantConfig {
        KeepaliveVariantConfig {
            interval_secs,
            name: KeepaliveVariant::Heartbeat,
            factor,
        }
    }

    fn tracker(caller: Arc<PeerCaller>) -> Arc<KeepaliveTracker> {
        let config = KeepaliveTrackerConfig {
            proxy: variant(1, 3),
            target: variant(1, 3),
            retry_factor: 5,
            timeout_factor: 10,
        };
        let cms_store = Arc::new(ClusterMapStore::new(ClusterMapSnapshot::empty()));
        KeepaliveTracker::new(NodeId::from("self"), config, caller, cms_store)
    }

    fn caller() -> Arc<PeerCaller> {
        Arc::new(PeerCaller::new(Duration::from_millis(50), Duration::from_secs(1)))
    }

    #[tokio::test]
    async fn heard_from_marks_alive() {
        let t = tracker(caller());
        let peer = NodeId::from("t1");
        t.heard_from(&peer);
        assert_eq!(*t.state_for(&peer).status.lock(), Status::Alive);
    }

    #[tokio::test]
    async fn last_seen_never_moves_backwards() {
        let t = tracker(caller());
        let peer = NodeId::from("t1");
        let state = t.state_for(&peer);
        state.bump_last_seen(1000);
        state.bump_last_seen(10);
        assert_eq!(state.last_seen_millis.load(Ordering::Acquire), 1000);
    }

    struct RecordingSink {
        called: Arc<AtomicBool>,
    }

    impl EvictionSink for RecordingSink {
        fn peer_evicted(&self, _peer: NodeId) {
            self.called.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn sustained_failure_evicts_and_notifies_sink() {
        let t = tracker(caller());
        let called = Arc::new(AtomicBool::new(false));
        t.set_eviction_sink(Arc::new(RecordingSink { called: called.clone() }));

        let mut guard = t.cms_store.begin_update().await;
        guard
            .draft_mut()
            .upsert(NodeDescriptor::new(NodeId::from("t1"), Role::Target, "http://127.0.0.1:1"));
        guard.commit().await.unwrap();

        // Force the peer's last-seen far enough in the past to exceed the
        // dead threshold without waiting on a real probe failure.
        let state = t.state_for(&NodeId::from("t1"));
        state.last_seen_millis.store(0, Ordering::Release);
        t.evict(&NodeId::from("t1")).await;

        assert!(called.load(Ordering::SeqCst));
        assert!(!t.cms_store.get().await.contains(&NodeId::from("t1")));
    }

    #[tokio::test]
    async fn spawn_suspect_retry_is_idempotent() {
        let t = tracker(caller());
        let member = NodeDescriptor::new(NodeId::from("t1"), Role::Target, "http://127.0.0.1:1");
        let state = t.state_for(&NodeId::from("t1"));

        // Simulate a retry task already in flight for this peer.
        state.retrying.store(true, Ordering::Release);
        // A second call must not spawn a competing task or touch the flag.
        t.spawn_suspect_retry(member, t.config.target.clone(), state.clone());
        assert!(state.retrying.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn suspect_peer_is_evicted_by_its_own_retry_task_without_waiting_for_a_tick() {
        let config = KeepaliveTrackerConfig {
            proxy: variant(1, 1),
            target: variant(1, 1),
            retry_factor: 1,
            timeout_factor: 1,
        };
        let cms_store = Arc::new(ClusterMapStore::new(ClusterMapSnapshot::empty()));
        let t = KeepaliveTracker::new(NodeId::from("self"), config, caller(), cms_store);

        let mut guard = t.cms_store.begin_update().await;
        guard
            .draft_mut()
            .upsert(NodeDescriptor::new(NodeId::from("t1"), Role::Target, "http://127.0.0.1:1"));
        guard.commit().await.unwrap();

        let member = NodeDescriptor::new(NodeId::from("t1"), Role::Target, "http://127.0.0.1:1");
        let state = t.state_for(&NodeId::from("t1"));
        state.last_seen_millis.store(0, Ordering::Release);

        // Mark suspect directly (as `tick` would after a first failed probe)
        // and hand the peer to its dedicated retry task, bypassing the
        // regular tick cadence entirely.
        *state.status.lock() = Status::Suspect;
        t.spawn_suspect_retry(member, t.config.target.clone(), state.clone());
        assert!(state.retrying.load(Ordering::Acquire));

        for _ in 0..200 {
            if !t.cms_store.get().await.contains(&NodeId::from("t1")) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(!t.cms_store.get().await.contains(&NodeId::from("t1")), "unreachable suspect peer should self-evict");
    }
}
