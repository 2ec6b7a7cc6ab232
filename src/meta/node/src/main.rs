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

//! Boots one cluster member: loads configuration, wires the core
//! components together, serves the replication HTTP surface, and shuts
//! everything down cleanly on `SIGINT`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use metasync_common::cluster_map::ClusterMapSnapshot;
use metasync_common::config::Config;
use metasync_common::node::{self, NodeDescriptor, NodeId, Role};
use metasync_common::revs::ActionEnvelope;
use metasync_meta::{CmsCapability, ClusterMapStore, EvictionSink, KeepaliveTracker, Metasyncer, PeerDeliveryState, SyncPair, VersionedArtifactRegistry};
use metasync_meta_service::{router, AppState, ReceiveHandler};
use metasync_rpc_client::{Broadcaster, PeerCaller};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CliRole {
    Gateway,
    Target,
}

impl From<CliRole> for Role {
    fn from(value: CliRole) -> Self {
        match value {
            CliRole::Gateway => Role::Gateway,
            CliRole::Target => Role::Target,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "metasync-node", about = "Cluster metadata replication node")]
struct Opts {
    /// Path to the node's TOML configuration file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Role this process plays in the cluster.
    #[arg(long, value_enum, default_value = "target")]
    role: CliRole,

    /// Start as the primary gateway. Only meaningful with `--role gateway`;
    /// in production this signal would come from a separate leader-election
    /// subsystem, which is out of scope here.
    #[arg(long, default_value_t = false)]
    primary: bool,
}

/// Re-broadcasts the cluster map whenever the keepalive tracker evicts a
/// peer, so the rest of the cluster observes the membership change without
/// waiting on the next periodic retry.
struct EvictionBridge {
    self_id: NodeId,
    cms_store: Arc<ClusterMapStore>,
    metasyncer: Arc<Metasyncer>,
}

impl EvictionSink for EvictionBridge {
    fn peer_evicted(&self, peer: NodeId) {
        let self_id = self.self_id.clone();
        let cms_store = self.cms_store.clone();
        let metasyncer = self.metasyncer.clone();
        tokio::spawn(async move {
            let cms = cms_store.get().await;
            let action = ActionEnvelope::new("peer-evicted", cms.version());
            metasyncer
                .sync(vec![SyncPair {
                    artifact: Arc::new((*cms).clone()),
                    action,
                }])
                .await;
            info!(peer = %peer, self_id = %self_id, "re-broadcast cluster map after eviction");
        });
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn self_descriptor(id: NodeId, role: Role, config: &Config) -> NodeDescriptor {
    let public_url = format!("http://{}:{}", config.net.ipv4, config.net.l4.port);
    let mut descriptor = NodeDescriptor::new(id, role, public_url);

    if config.net.uses_intra_control() {
        let host = config.net.ipv4_intra_control.as_deref().unwrap_or(&config.net.ipv4);
        let port = config.net.l4.port_intra_control.unwrap_or(config.net.l4.port);
        descriptor = descriptor.with_intra_control(format!("http://{host}:{port}"));
    }
    if config.net.uses_intra_data() {
        let host = config.net.ipv4_intra_data.as_deref().unwrap_or(&config.net.ipv4);
        let port = config.net.l4.port_intra_data.unwrap_or(config.net.l4.port);
        descriptor = descriptor.with_intra_data(format!("http://{host}:{port}"));
    }
    descriptor
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let opts = Opts::parse();

    let config = Config::load(&opts.config).with_context(|| format!("loading config from {}", opts.config.display()))?;
    let role: Role = opts.role.into();
    let self_id = node::derive_node_id(&config.net.ipv4, config.net.l4.port);
    let descriptor = self_descriptor(self_id.clone(), role, &config);

    info!(self_id = %self_id, role = ?role, primary = opts.primary, "starting metasync node");

    let mut initial = ClusterMapSnapshot::empty().begin_update();
    initial.upsert(descriptor.clone());
    if opts.primary {
        if role != Role::Gateway {
            anyhow::bail!("--primary requires --role gateway");
        }
        initial.set_primary(Some(self_id.clone()));
    }
    let cms_store = Arc::new(ClusterMapStore::new(initial.commit()?));

    let probe_caller = Arc::new(PeerCaller::new(config.timeout.default_timeout(), config.timeout.default_long()));
    let tracker = KeepaliveTracker::new(self_id.clone(), config.keepalivetracker.clone(), probe_caller, cms_store.clone());

    let broadcast_caller = Arc::new(
        PeerCaller::new(config.timeout.default_timeout(), config.timeout.default_long())
            .with_liveness_sink(tracker.clone()),
    );
    let broadcaster = Arc::new(Broadcaster::new(broadcast_caller));

    let registry = Arc::new(VersionedArtifactRegistry::new());
    let delivery = Arc::new(PeerDeliveryState::new());
    let primary_flag = Arc::new(AtomicBool::new(opts.primary));
    let capability = Arc::new(CmsCapability::new(cms_store.clone(), primary_flag.clone()));

    let (metasyncer, work_rx) = Metasyncer::new(
        self_id.clone(),
        capability,
        broadcaster,
        registry,
        delivery,
        config.timeout.cplane_operation(),
        config.timeout.max_keepalive(),
        config.periodic.retry_sync_time(),
    );
    let metasyncer_handle = metasyncer.clone().spawn(work_rx);

    tracker.set_eviction_sink(Arc::new(EvictionBridge {
        self_id: self_id.clone(),
        cms_store: cms_store.clone(),
        metasyncer: metasyncer.clone(),
    }));
    let keepalive_handle = tracker.clone().spawn();

    let receive_handler = Arc::new(ReceiveHandler::new(self_id.clone(), cms_store.clone()));
    let app = router(AppState {
        receive_handler,
        cms_store: cms_store.clone(),
    });

    let addr: SocketAddr = format!("{}:{}", config.net.ipv4, config.net.l4.port)
        .parse()
        .with_context(|| "parsing net.ipv4/net.l4.port as a socket address")?;
    let listener = tokio::net::TcpListener::bind(addr).await.with_context(|| format!("binding {addr}"))?;
    info!(%addr, "listening");

    // Registration runs in the background so a first-launched primary can
    // come up without deadlocking on its own not-yet-bound listener.
    {
        let config = config.clone();
        let descriptor = descriptor.clone();
        tokio::spawn(async move {
            let reg_caller = PeerCaller::new(config.timeout.default_timeout(), config.timeout.default_long());
            if let Err(err) = metasync_meta_service::registration::register(&reg_caller, &config.proxy, &descriptor, role == Role::Gateway).await {
                warn!(error = %err, "registration handshake did not complete");
            }
        });
    }

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    };

    if let Err(err) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
        error!(error = %err, "server exited with error");
    }

    tracker.stop();
    metasyncer.stop();
    let _ = keepalive_handle.await;
    let _ = metasyncer_handle.await;

    Ok(())
}
