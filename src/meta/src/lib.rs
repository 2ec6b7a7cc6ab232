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

//! The metadata replication core: the Cluster Map Store, the Versioned
//! Artifact Registry, the Keepalive Tracker, and the Metasyncer single-
//! writer loop that ties them together.

pub mod cluster_map_store;
pub mod delivery;
pub mod keepalive;
pub mod metasyncer;
pub mod registry;

pub use cluster_map_store::{ClusterMapStore, UpdateGuard};
pub use delivery::PeerDeliveryState;
pub use keepalive::{EvictionSink, KeepaliveTracker};
pub use metasyncer::{CmsCapability, GatewayCapability, Metasyncer, SyncPair, WorkKind, WorkRequest};
pub use registry::VersionedArtifactRegistry;
