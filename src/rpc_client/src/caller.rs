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

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use metasync_common::node::{NetworkPlane, NodeDescriptor, NodeId};
use reqwest::Method;
use tracing::trace;

use crate::timeout::Timeout;

/// Notified whenever a call to a peer completes successfully, so that
/// control-plane traffic can double as a liveness signal.
pub trait LivenessSink: Send + Sync {
    fn heard_from(&self, peer: &NodeId);
}

/// One outbound request, independent of which peer it is sent to. The base
/// URL is filled in per-peer at call time from the requested network plane.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn with_json_body(mut self, body: Bytes) -> Self {
        self.headers
            .push(("content-type".to_string(), "application/json".to_string()));
        self.body = Some(body);
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

/// How a call to a peer concluded. Mirrors the error taxonomy in the spec:
/// network refusal, timeout, other transport error, and HTTP status >= 400
/// (with the response body preserved for diagnostics).
#[derive(Debug, Clone)]
pub enum Outcome {
    Ok,
    ConnectionRefused,
    Timeout,
    OtherTransport(String),
    HttpStatus { status: u16, body: String },
}

impl Outcome {
    /// True when the spec's "refused" bucket applies: connection refusal or
    /// the peer being a brand-new node (the latter is decided by the
    /// metasyncer, not here).
    pub fn is_connection_refused(&self) -> bool {
        matches!(self, Outcome::ConnectionRefused)
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok)
    }
}

#[derive(Debug, Clone)]
pub struct CallResult {
    pub peer: NodeId,
    pub outcome: Outcome,
    pub body: Option<Bytes>,
}

impl CallResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Sends one typed request to one peer with a chosen timeout, and
/// classifies the outcome. Fully thread-safe: `reqwest::Client` is `Clone +
/// Send + Sync` and shares its connection pool across calls.
pub struct PeerCaller {
    default_client: reqwest::Client,
    long_client: reqwest::Client,
    default_timeout: Duration,
    long_timeout: Duration,
    liveness: Option<Arc<dyn LivenessSink>>,
}

impl PeerCaller {
    pub fn new(default_timeout: Duration, long_timeout: Duration) -> Self {
        Self {
            default_client: reqwest::Client::builder()
                .timeout(default_timeout)
                .build()
                .expect("default reqwest client"),
            long_client: reqwest::Client::builder()
                .timeout(long_timeout)
                .build()
                .expect("long reqwest client"),
            default_timeout,
            long_timeout,
            liveness: None,
        }
    }

    pub fn with_liveness_sink(mut self, sink: Arc<dyn LivenessSink>) -> Self {
        self.liveness = Some(sink);
        self
    }

    fn client_and_timeout(&self, timeout: Timeout) -> (&reqwest::Client, Duration) {
        match timeout {
            Timeout::Default => (&self.default_client, self.default_timeout),
            Timeout::Long => (&self.long_client, self.long_timeout),
            // A caller-supplied timeout that exceeds the default client's
            // budget is routed onto the long-lived client automatically.
            Timeout::Explicit(d) if d > self.default_timeout => (&self.long_client, d),
            Timeout::Explicit(d) => (&self.default_client, d),
        }
    }

    pub async fn call(
        &self,
        peer: &NodeDescriptor,
        plane: NetworkPlane,
        req: &Request,
        timeout: Timeout,
    ) -> CallResult {
        let (client, per_call_timeout) = self.client_and_timeout(timeout);
        let url = format!("{}{}", peer.base_url(plane), req.path);

        let mut builder = client
            .request(req.method.clone(), &url)
            .timeout(per_call_timeout);
        for (k, v) in &req.query {
            builder = builder.query(&[(k, v)]);
        }
        for (k, v) in &req.headers {
            builder = builder.header(k.as_str(), v.as_str());
        }
        if let Some(body) = req.body.clone() {
            builder = builder.body(body);
        }

        let result = match builder.send().await {
            Ok(resp) => {
                let status = resp.status();
                let body = resp.bytes().await.unwrap_or_default();
                if status.as_u16() >= 400 {
                    CallResult {
                        peer: peer.id.clone(),
                        outcome: Outcome::HttpStatus {
                            status: status.as_u16(),
                            body: String::from_utf8_lossy(&body).into_owned(),
                        },
                        body: Some(body),
                    }
                } else {
                    CallResult {
                        peer: peer.id.clone(),
                        outcome: Outcome::Ok,
                        body: Some(body),
                    }
                }
            }
            Err(err) => CallResult {
                peer: peer.id.clone(),
                outcome: classify(&err),
                body: None,
            },
        };

        if result.is_ok() {
            trace!(peer = %result.peer, %url, "peer call succeeded");
            if let Some(sink) = &self.liveness {
                sink.heard_from(&result.peer);
            }
        }
        result
    }
}

fn classify(err: &reqwest::Error) -> Outcome {
    if err.is_timeout() {
        return Outcome::Timeout;
    }
    if err.is_connect() {
        let mut source = err.source();
        while let Some(inner) = source {
            if let Some(io_err) = inner.downcast_ref::<std::io::Error>() {
                if io_err.kind() == std::io::ErrorKind::ConnectionRefused {
                    return Outcome::ConnectionRefused;
                }
            }
            source = inner.source();
        }
        // Any other connect-phase failure (DNS, TLS, host unreachable) is
        // bucketed with connection refusal: both mean "the peer is not
        // there right now", which is the distinction the retry logic cares
        // about.
        return Outcome::ConnectionRefused;
    }
    Outcome::OtherTransport(err.to_string())
}
