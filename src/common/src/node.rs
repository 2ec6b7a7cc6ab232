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

use std::env;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Environment variable that, when set, overrides derived node identity.
pub const NODE_ID_ENV_VAR: &str = "AIS_DAEMONID";

/// Unique identifier of a cluster member. Identity is by value, not by
/// descriptor contents: two [`NodeDescriptor`]s with the same id are the
/// same node even if their URLs changed across a restart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Role a node plays in the cluster. Gateways route client traffic and one
/// of them is primary; targets hold object data. The core only cares about
/// this distinction when filtering broadcast scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Gateway,
    Target,
}

/// One of the (up to three) network planes a peer can be reached on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkPlane {
    Public,
    IntraControl,
    IntraData,
}

/// Everything the rest of the core needs to know about one cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub id: NodeId,
    pub role: Role,
    pub public_url: String,
    /// Falls back to `public_url` when the intra-control plane is not
    /// configured separately (same IP and port as public).
    pub intra_control_url: String,
    /// Falls back to `public_url` when the intra-data plane is not
    /// configured separately.
    pub intra_data_url: String,
}

impl NodeDescriptor {
    pub fn new(id: NodeId, role: Role, public_url: impl Into<String>) -> Self {
        let public_url = public_url.into();
        Self {
            id,
            role,
            intra_control_url: public_url.clone(),
            intra_data_url: public_url.clone(),
            public_url,
        }
    }

    pub fn with_intra_control(mut self, url: impl Into<String>) -> Self {
        self.intra_control_url = url.into();
        self
    }

    pub fn with_intra_data(mut self, url: impl Into<String>) -> Self {
        self.intra_data_url = url.into();
        self
    }

    /// Base URL to use for a call on the given network plane.
    pub fn base_url(&self, plane: NetworkPlane) -> &str {
        match plane {
            NetworkPlane::Public => &self.public_url,
            NetworkPlane::IntraControl => &self.intra_control_url,
            NetworkPlane::IntraData => &self.intra_data_url,
        }
    }
}

/// Derives a node id from `AIS_DAEMONID`, falling back to the low 20 bits of
/// a 32-bit FNV-1a hash of `host:port`, zero-padded to a fixed-width numeric
/// string. Deterministic so that a node restarting on the same address
/// rejoins under the same identity.
pub fn derive_node_id(host: &str, port: u16) -> NodeId {
    if let Ok(id) = env::var(NODE_ID_ENV_VAR) {
        if !id.is_empty() {
            return NodeId(id);
        }
    }
    let mut hasher = Fnv1a::default();
    format!("{host}:{port}").hash(&mut hasher);
    let low20 = (hasher.finish() as u32) & 0x000f_ffff;
    NodeId(format!("{low20:07}"))
}

/// Small FNV-1a hasher so node-id derivation is stable across Rust versions
/// and does not depend on `std`'s randomized `SipHash`.
struct Fnv1a {
    state: u64,
}

impl Default for Fnv1a {
    fn default() -> Self {
        Self {
            state: 0xcbf2_9ce4_8422_2325,
        }
    }
}

impl Hasher for Fnv1a {
    fn finish(&self) -> u64 {
        self.state
    }

    fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.state ^= *byte as u64;
            self.state = self.state.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }
}
