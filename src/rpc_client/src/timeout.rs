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

use std::time::Duration;

/// Which timeout policy a call should use. `Explicit` durations longer than
/// the caller's configured default timeout are routed onto the long-lived
/// client automatically — see [`crate::caller::PeerCaller::call`].
#[derive(Debug, Clone, Copy)]
pub enum Timeout {
    /// Short timeout, for keepalive probes and control-plane operations.
    Default,
    /// Long timeout, for bulk or slow operations.
    Long,
    /// Caller-supplied duration.
    Explicit(Duration),
}
