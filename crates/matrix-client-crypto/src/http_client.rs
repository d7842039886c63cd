// Copyright 2024 The Matrix.org Foundation C.I.C.
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

//! The HTTP capability the orchestration code uses to reach the homeserver.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use http::{Method, StatusCode};
use matrix_client_common::AsyncTraitDeps;
use serde_json::Value as JsonValue;
use thiserror::Error;

/// The prefix of the client-server API an endpoint lives under.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClientPrefix {
    /// `/_matrix/client/v3`.
    #[default]
    V3,
    /// `/_matrix/client/unstable`.
    Unstable,
}

impl ClientPrefix {
    /// The path prefix.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V3 => "/_matrix/client/v3",
            Self::Unstable => "/_matrix/client/unstable",
        }
    }
}

/// Options for a single request.
#[derive(Clone, Copy, Debug, Default)]
pub struct RequestOptions {
    /// The API prefix the path is relative to.
    pub prefix: ClientPrefix,
}

/// An authenticated HTTP client for the client-server API.
///
/// Implementations send the request with the access token of the current
/// session and decode the JSON response body. Non-2xx responses need to be
/// converted into a [`HttpError::Matrix`] error using
/// [`MatrixError::from_response`].
#[async_trait]
pub trait HttpClient: AsyncTraitDeps {
    /// Send a request to the homeserver.
    ///
    /// * `path` - The path relative to the prefix in `opts`, with already
    ///   percent-encoded path segments.
    /// * `query` - Query parameters, not yet encoded.
    /// * `body` - The JSON body of the request, if any.
    async fn authed_request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<JsonValue>,
        opts: RequestOptions,
    ) -> Result<JsonValue, HttpError>;
}

/// An error response of the homeserver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatrixError {
    /// The HTTP status of the response.
    pub status: StatusCode,
    /// The Matrix error code, e.g. `M_NOT_FOUND`.
    pub errcode: String,
    /// The human readable error message.
    pub error: String,
    /// How long the server wants us to wait before retrying, for rate-limit
    /// errors.
    pub retry_after_ms: Option<u64>,
}

impl MatrixError {
    /// Build the error from the status and JSON body of a response.
    ///
    /// Missing fields are tolerated, a body without `errcode` results in
    /// `M_UNKNOWN`.
    pub fn from_response(status: StatusCode, body: &JsonValue) -> Self {
        let errcode = body.get("errcode").and_then(JsonValue::as_str).unwrap_or("M_UNKNOWN");
        let error = body.get("error").and_then(JsonValue::as_str).unwrap_or_default();
        let retry_after_ms = body.get("retry_after_ms").and_then(JsonValue::as_u64);

        Self { status, errcode: errcode.to_owned(), error: error.to_owned(), retry_after_ms }
    }

    /// Is this a `M_NOT_FOUND` error.
    pub fn is_not_found(&self) -> bool {
        self.errcode == "M_NOT_FOUND"
    }

    /// Is this a rate-limit error.
    pub fn is_rate_limited(&self) -> bool {
        self.errcode == "M_LIMIT_EXCEEDED" || self.status == StatusCode::TOO_MANY_REQUESTS
    }

    /// The delay the server asked for before retrying, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_ms.filter(|ms| *ms > 0).map(Duration::from_millis)
    }
}

impl fmt::Display for MatrixError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} / {}] {}", self.status.as_u16(), self.errcode, self.error)
    }
}

/// Error type for the [`HttpClient`].
#[derive(Error, Debug)]
pub enum HttpError {
    /// The server replied with an error.
    #[error("the server returned an error: {0}")]
    Matrix(MatrixError),

    /// The request didn't reach the server or the response got lost.
    #[error("the request failed to reach the server: {0}")]
    Connection(String),

    /// The response couldn't be deserialized.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl HttpError {
    /// The Matrix error returned by the server, if this is one.
    pub fn as_matrix_error(&self) -> Option<&MatrixError> {
        as_variant::as_variant!(self, Self::Matrix)
    }
}

/// Percent-encode a single path segment.
///
/// Everything but the unreserved characters of RFC 3986 is encoded, which
/// takes care of the `/` and `+` found in base64 session ids.
pub(crate) fn encode_path_segment(segment: &str) -> String {
    let mut encoded = String::with_capacity(segment.len());

    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(char::from(byte));
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }

    encoded
}
