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

//! The HTTP-facing half of replication: the wire-contract routes, the
//! receive-side acceptance logic, and the registration handshake client.

pub mod error;
pub mod receive;
pub mod registration;
pub mod routes;

pub use error::{Result, ServiceError};
pub use receive::{ReceiveHandler, ReceiveOutcome, TagHandler};
pub use routes::{router, AppState};
