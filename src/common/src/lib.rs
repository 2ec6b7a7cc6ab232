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

//! Shared data model for the cluster metadata replication core: node
//! identity, the cluster map snapshot, the REVS artifact contract, and the
//! configuration surface. Nothing in this crate talks to the network.

pub mod cluster_map;
pub mod config;
pub mod error;
pub mod node;
pub mod revs;

pub use cluster_map::{ClusterMapSnapshot, ClusterMapSnapshotBuilder};
pub use config::Config;
pub use error::{Error, Result};
pub use node::{NetworkPlane, NodeDescriptor, NodeId, Role};
pub use revs::{ActionEnvelope, Artifact, Tag};
