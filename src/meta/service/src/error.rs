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

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("malformed replication payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    #[error("downgrade rejected for tag {tag}: incoming version {incoming} < local version {local}")]
    Downgrade { tag: String, incoming: u64, local: u64 },

    #[error(transparent)]
    Common(#[from] metasync_common::error::Error),

    #[error("registration failed against every configured URL: {0}")]
    RegistrationExhausted(String),
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServiceError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
            ServiceError::Downgrade { .. } => StatusCode::CONFLICT,
            ServiceError::Common(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::RegistrationExhausted(_) => StatusCode::BAD_GATEWAY,
        };
        (status, self.to_string()).into_response()
    }
}
