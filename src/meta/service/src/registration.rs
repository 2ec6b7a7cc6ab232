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

use metasync_common::config::ProxyConfig;
use metasync_common::node::{NetworkPlane, NodeDescriptor, NodeId, Role};
use metasync_rpc_client::{CallResult, PeerCaller, Request, Timeout};
use reqwest::Method;
use tracing::{info, warn};

use crate::error::{Result, ServiceError};

const CLUSTER_PATH: &str = "/v1/cluster";
const CLUSTER_PROXY_PATH: &str = "/v1/cluster/proxy";
const ATTEMPTS_PER_URL: u32 = 2;

/// POSTs `descriptor` to the registration endpoint, trying the primary
/// URL, then the discovery URL, then the original URL — each only if
/// distinct from every URL already tried — with two attempts per URL.
pub async fn register(caller: &PeerCaller, proxy: &ProxyConfig, descriptor: &NodeDescriptor, as_gateway: bool) -> Result<()> {
    let path = if as_gateway { CLUSTER_PROXY_PATH } else { CLUSTER_PATH };
    let body = serde_json::to_vec(descriptor).map_err(ServiceError::MalformedPayload)?;

    let mut tried = Vec::new();
    for url in [Some(&proxy.primary_url), proxy.discovery_url.as_ref(), proxy.original_url.as_ref()]
        .into_iter()
        .flatten()
    {
        if tried.contains(url) {
            continue;
        }
        tried.push(url.clone());

        for attempt in 1..=ATTEMPTS_PER_URL {
            let result = post_descriptor(caller, url, path, body.clone()).await;
            if result.is_ok() {
                info!(url = %url, attempt, "registration accepted");
                return Ok(());
            }
            warn!(url = %url, attempt, outcome = ?result.outcome, "registration attempt failed");
        }
    }

    Err(ServiceError::RegistrationExhausted(tried.join(", ")))
}

async fn post_descriptor(caller: &PeerCaller, base_url: &str, path: &str, body: Vec<u8>) -> CallResult {
    // The registration target isn't a cluster member yet, so there is no
    // real id to address it by; only `public_url` is consulted by `call`.
    let target = NodeDescriptor::new(NodeId::from("registration-target"), Role::Target, base_url);
    caller
        .call(&target, NetworkPlane::Public, &Request::new(Method::POST, path).with_json_body(body.into()), Timeout::Default)
        .await
}
