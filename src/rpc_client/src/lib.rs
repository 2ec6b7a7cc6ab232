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

//! The intra-cluster RPC substrate: a single-peer [`caller::PeerCaller`]
//! and the [`broadcast::Broadcaster`] built on top of it.

pub mod broadcast;
pub mod caller;
pub mod timeout;

pub use broadcast::Broadcaster;
pub use caller::{CallResult, LivenessSink, Outcome, PeerCaller, Request};
pub use timeout::Timeout;
