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
use std::sync::Arc;

use metasync_common::error::{Error, Result};
use metasync_common::revs::{ActionEnvelope, Artifact, Tag};
use parking_lot::Mutex;

struct Entry {
    version: u64,
    artifact: Arc<dyn Artifact>,
    /// The serialization recorded at `store` time. A later mismatch between
    /// this and a fresh `marshal()` of the live artifact means something
    /// mutated a published payload in place.
    frozen_bytes: Vec<u8>,
    action_bytes: Vec<u8>,
}

/// Holds the set of replicated artifacts by tag, enforcing non-decremental
/// versioning and the copy-on-write invariant.
pub struct VersionedArtifactRegistry {
    entries: Mutex<HashMap<Tag, Entry>>,
}

impl Default for VersionedArtifactRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionedArtifactRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn current(&self, tag: &Tag) -> Option<Arc<dyn Artifact>> {
        self.entries.lock().get(tag).map(|e| e.artifact.clone())
    }

    pub fn last_version(&self, tag: &Tag) -> u64 {
        self.entries.lock().get(tag).map_or(0, |e| e.version)
    }

    /// The recorded serialization for whatever is currently published under
    /// `tag`, used to assemble the wire payload without re-marshaling.
    pub fn frozen_bytes(&self, tag: &Tag) -> Option<Vec<u8>> {
        self.entries.lock().get(tag).map(|e| e.frozen_bytes.clone())
    }

    /// The recorded action envelope bytes paired with the currently
    /// published artifact under `tag`.
    pub fn action_bytes(&self, tag: &Tag) -> Option<Vec<u8>> {
        self.entries.lock().get(tag).map(|e| e.action_bytes.clone())
    }

    pub fn tags(&self) -> Vec<Tag> {
        self.entries.lock().keys().cloned().collect()
    }

    /// Admits `artifact` (with its accompanying action envelope) under its
    /// own tag, subject to:
    ///
    /// 1. **Non-decremental.** The new version must be `>=` the current one.
    ///    Equal versions are admitted only when `has_undelivered_peers` is
    ///    true (a peer still needs this exact version sent to it).
    /// 2. **Copy-on-write.** If the version is unchanged, the freshly
    ///    marshaled bytes must match what was recorded for that version.
    pub fn store(
        &self,
        artifact: Arc<dyn Artifact>,
        action: &ActionEnvelope,
        has_undelivered_peers: bool,
    ) -> Result<()> {
        let tag = artifact.tag();
        let bytes = artifact.marshal()?;
        let action_bytes = action.marshal()?;
        let mut entries = self.entries.lock();

        if let Some(existing) = entries.get(&tag) {
            if artifact.version() < existing.version {
                return Err(Error::Invariant(format!(
                    "tag {tag}: attempted to store version {} below current {}",
                    artifact.version(),
                    existing.version
                )));
            }
            if artifact.version() == existing.version {
                if !has_undelivered_peers {
                    return Err(Error::Invariant(format!(
                        "tag {tag}: re-stored version {} with no undelivered peers (duplicate should have been filtered upstream)",
                        artifact.version()
                    )));
                }
                if bytes != existing.frozen_bytes {
                    return Err(Error::Invariant(format!(
                        "tag {tag}: copy-on-write violation — version {} was re-serialized with different content",
                        artifact.version()
                    )));
                }
            }
        }

        entries.insert(
            tag,
            Entry {
                version: artifact.version(),
                artifact,
                frozen_bytes: bytes,
                action_bytes,
            },
        );
        Ok(())
    }

    /// Re-marshals the artifact currently published under `tag` and
    /// compares it against the bytes recorded at `store` time. A mismatch
    /// means the artifact was mutated in place after publication — a fatal
    /// invariant violation, not a recoverable error.
    pub fn audit(&self, tag: &Tag) -> Result<()> {
        let entries = self.entries.lock();
        let Some(entry) = entries.get(tag) else {
            return Ok(());
        };
        let fresh = entry.artifact.marshal()?;
        if fresh != entry.frozen_bytes {
            return Err(Error::Invariant(format!(
                "tag {tag}: published version {} was mutated in place after publication",
                entry.version
            )));
        }
        Ok(())
    }

    /// Audits every published tag; see [`Self::audit`].
    pub fn audit_all(&self) -> Result<()> {
        for tag in self.tags() {
            self.audit(&tag)?;
        }
        Ok(())
    }

    /// Drops every published entry. Called when this node loses primacy: a
    /// future re-election starts the registry fresh rather than CoW-
    /// checking against records a different writer may have superseded.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use serde::Serialize;

    use super::*;

    #[derive(Debug, Serialize)]
    struct Fake {
        version: u64,
        payload: String,
    }

    impl Artifact for Fake {
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

    fn action() -> ActionEnvelope {
        ActionEnvelope::new("test", 0)
    }

    #[test]
    fn store_then_store_same_is_idempotent() {
        let registry = VersionedArtifactRegistry::new();
        let a = Arc::new(Fake {
            version: 1,
            payload: "x".into(),
        });
        registry.store(a.clone(), &action(), false).unwrap();
        // Equal version with no undelivered peers and identical bytes would
        // be rejected by the real flow upstream (duplicate filtering); here
        // we exercise the undelivered-peer path instead.
        registry.store(a, &action(), true).unwrap();
        assert_eq!(registry.last_version(&Tag::new(Tag::SMAP)), 1);
    }

    #[test]
    fn decrementing_version_is_rejected() {
        let registry = VersionedArtifactRegistry::new();
        registry
            .store(
                Arc::new(Fake {
                    version: 5,
                    payload: "x".into(),
                }),
                &action(),
                false,
            )
            .unwrap();
        let err = registry.store(
            Arc::new(Fake {
                version: 4,
                payload: "y".into(),
            }),
            &action(),
            false,
        );
        assert!(err.is_err());
    }

    #[test]
    fn same_version_different_bytes_is_cow_violation() {
        let registry = VersionedArtifactRegistry::new();
        registry
            .store(
                Arc::new(Fake {
                    version: 1,
                    payload: "x".into(),
                }),
                &action(),
                false,
            )
            .unwrap();
        let err = registry.store(
            Arc::new(Fake {
                version: 1,
                payload: "different".into(),
            }),
            &action(),
            true,
        );
        assert!(err.is_err());
    }

    /// An artifact whose `marshal()` output changes across calls, modeling
    /// external code mutating a published payload in place via interior
    /// mutability.
    struct Mutating {
        version: u64,
        calls: AtomicU64,
    }

    impl std::fmt::Debug for Mutating {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("Mutating").finish()
        }
    }

    impl Artifact for Mutating {
        fn tag(&self) -> Tag {
            Tag::new(Tag::BUCKETMD)
        }

        fn version(&self) -> u64 {
            self.version
        }

        fn marshal(&self) -> serde_json::Result<Vec<u8>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            serde_json::to_vec(&n)
        }
    }

    #[test]
    fn audit_catches_in_place_mutation() {
        let registry = VersionedArtifactRegistry::new();
        let artifact = Arc::new(Mutating {
            version: 1,
            calls: AtomicU64::new(0),
        });
        registry.store(artifact, &action(), false).unwrap();
        let err = registry.audit(&Tag::new(Tag::BUCKETMD));
        assert!(err.is_err(), "second marshal() differs from the frozen one");
    }
}
