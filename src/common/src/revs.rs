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

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::node::NodeId;

/// Names one kind of REVS (Replicated, Versioned, Shared artifact). The
/// alphabet is open-ended: any component may mint a new tag as long as it
/// implements [`Artifact`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag(pub String);

impl Tag {
    pub const SMAP: &'static str = "smap";
    pub const BUCKETMD: &'static str = "bucketmd";
    pub const TOKEN: &'static str = "token";

    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key used on the wire for the action envelope paired with this tag.
    pub fn action_key(&self) -> String {
        format!("{}-action", self.0)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Tag {
    fn from(value: &str) -> Self {
        Tag::new(value)
    }
}

/// A named, versioned, serializable value that the metasyncer can publish
/// and broadcast. Implementors own their wire representation; the core only
/// ever handles the tag, the version and the serialized bytes.
///
/// Contract (the CoW invariant): two calls to `marshal` for an artifact at
/// the *same* tag and version must return byte-identical output. Producing
/// a different payload for an already-published version is a bug in the
/// caller, not something this trait can prevent — the registry enforces it
/// at `store` time by keeping the first serialization around for
/// comparison.
pub trait Artifact: fmt::Debug + Send + Sync {
    fn tag(&self) -> Tag;
    fn version(&self) -> u64;
    fn marshal(&self) -> serde_json::Result<Vec<u8>>;
}

/// Metadata that accompanies every artifact on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionEnvelope {
    /// Free-form, e.g. `"register-target"`.
    pub action: String,
    /// The sender's CMS version at the time this envelope was built.
    pub sender_cms_version: u64,
    /// A joining node that must be retried aggressively on refusal,
    /// regardless of its error class.
    pub new_node_id: Option<NodeId>,
}

impl ActionEnvelope {
    pub fn new(action: impl Into<String>, sender_cms_version: u64) -> Self {
        Self {
            action: action.into(),
            sender_cms_version,
            new_node_id: None,
        }
    }

    pub fn with_new_node(mut self, id: NodeId) -> Self {
        self.new_node_id = Some(id);
        self
    }

    pub fn marshal(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    struct Smap {
        version: u64,
        primary: String,
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

    #[test]
    fn marshal_is_deterministic_for_identical_content() {
        let a = Smap {
            version: 4,
            primary: "p0".into(),
        };
        let b = Smap {
            version: 4,
            primary: "p0".into(),
        };
        assert_eq!(a.marshal().unwrap(), b.marshal().unwrap());
    }

    #[test]
    fn action_key_suffix() {
        let tag = Tag::new(Tag::BUCKETMD);
        assert_eq!(tag.action_key(), "bucketmd-action");
    }
}
