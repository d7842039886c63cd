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

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use http::Method;
use ruma::TransactionId;
use serde_json::{json, Value as JsonValue};
use tokio::sync::Mutex;
use tracing::{debug, instrument, trace, warn};

use crate::{
    backend::CryptoBackend,
    error::OutgoingRequestError,
    http_client::{encode_path_segment, HttpClient, HttpError, RequestOptions},
    requests::{OutgoingRequest, OutgoingRequests, OutgoingVerificationRequest, ToDeviceRequest},
    verification::VerificationTransport,
};

/// Sends the outgoing requests of the crypto backend to the homeserver and
/// hands the responses back to the backend.
#[derive(Clone, Debug)]
pub struct OutgoingRequestProcessor {
    backend: Arc<dyn CryptoBackend>,
    http: Arc<dyn HttpClient>,
}

impl OutgoingRequestProcessor {
    /// Create a new processor.
    pub fn new(backend: Arc<dyn CryptoBackend>, http: Arc<dyn HttpClient>) -> Self {
        Self { backend, http }
    }

    /// Send a request and mark it as sent once the server replied.
    #[instrument(
        skip_all,
        fields(request_id = %request.request_id, kind = ?request.request.kind())
    )]
    pub async fn make_outgoing_request(
        &self,
        request: &OutgoingRequest,
    ) -> Result<(), OutgoingRequestError> {
        let response = self.send(&request.request_id, &request.request).await?;

        trace!("Got a response, marking the request as sent");
        self.backend
            .mark_request_as_sent(&request.request_id, request.request.kind(), &response)
            .await?;

        Ok(())
    }

    /// Send a to-device request the backend handed out, e.g. a room key share.
    pub async fn send_to_device(
        &self,
        request: &ToDeviceRequest,
    ) -> Result<(), OutgoingRequestError> {
        let request = OutgoingRequest::from(request.clone());
        self.make_outgoing_request(&request).await
    }

    async fn send(
        &self,
        request_id: &TransactionId,
        request: &OutgoingRequests,
    ) -> Result<JsonValue, HttpError> {
        let opts = RequestOptions::default();

        match request {
            OutgoingRequests::KeysUpload(body) => {
                self.http
                    .authed_request(Method::POST, "/keys/upload", &[], Some(body.clone()), opts)
                    .await
            }
            OutgoingRequests::KeysQuery(r) => {
                let body = serde_json::to_value(r)?;
                self.http.authed_request(Method::POST, "/keys/query", &[], Some(body), opts).await
            }
            OutgoingRequests::KeysClaim(r) => {
                let body = serde_json::to_value(r)?;
                self.http.authed_request(Method::POST, "/keys/claim", &[], Some(body), opts).await
            }
            OutgoingRequests::SignatureUpload(body) => {
                self.http
                    .authed_request(
                        Method::POST,
                        "/keys/signatures/upload",
                        &[],
                        Some(body.clone()),
                        opts,
                    )
                    .await
            }
            OutgoingRequests::KeysBackup(r) => {
                let body = json!({ "rooms": r.rooms });
                self.http
                    .authed_request(
                        Method::PUT,
                        "/room_keys/keys",
                        &[("version", r.version.as_str())],
                        Some(body),
                        opts,
                    )
                    .await
            }
            OutgoingRequests::ToDeviceRequest(r) => {
                let path = format!(
                    "/sendToDevice/{}/{}",
                    encode_path_segment(&r.event_type),
                    encode_path_segment(request_id.as_str())
                );
                self.http.authed_request(Method::PUT, &path, &[], Some(r.body()), opts).await
            }
            OutgoingRequests::RoomMessage(r) => {
                let path = format!(
                    "/rooms/{}/send/{}/{}",
                    encode_path_segment(r.room_id.as_str()),
                    encode_path_segment(&r.event_type),
                    encode_path_segment(r.txn_id.as_str())
                );
                self.http
                    .authed_request(Method::PUT, &path, &[], Some(r.content.clone()), opts)
                    .await
            }
        }
    }
}

#[async_trait]
impl VerificationTransport for OutgoingRequestProcessor {
    async fn send_verification_request(
        &self,
        request: OutgoingVerificationRequest,
    ) -> Result<JsonValue, OutgoingRequestError> {
        let response = match request {
            OutgoingVerificationRequest::ToDevice(r) => {
                self.send(&r.txn_id, &OutgoingRequests::ToDeviceRequest(r.clone())).await?
            }
            OutgoingVerificationRequest::InRoom(r) => {
                self.send(&r.txn_id, &OutgoingRequests::RoomMessage(r.clone())).await?
            }
        };

        Ok(response)
    }
}

/// Processes the outgoing requests of the crypto backend, coalescing
/// concurrent calls.
///
/// Only one pass over the outgoing requests runs at a time. A caller that
/// arrives while a pass is running waits for the next pass, any further
/// callers arriving in the meantime share that next pass.
#[derive(Debug)]
pub struct OutgoingRequestsManager {
    processor: OutgoingRequestProcessor,
    processing: Mutex<()>,
    requested_passes: AtomicU64,
    completed_passes: AtomicU64,
    stopped: AtomicBool,
}

impl OutgoingRequestsManager {
    /// Create a new manager using the given processor.
    pub fn new(processor: OutgoingRequestProcessor) -> Self {
        Self {
            processor,
            processing: Mutex::new(()),
            requested_passes: AtomicU64::new(0),
            completed_passes: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    /// The processor used to send requests.
    pub fn processor(&self) -> &OutgoingRequestProcessor {
        &self.processor
    }

    /// Make sure every outgoing request the backend had when this method was
    /// called has been sent out.
    ///
    /// Every request of the pass is attempted, the first failure is returned
    /// once the pass is over.
    pub async fn do_process_outgoing_requests(&self) -> Result<(), OutgoingRequestError> {
        let ticket = self.requested_passes.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = self.processing.lock().await;

        if self.stopped.load(Ordering::SeqCst) {
            return Err(OutgoingRequestError::Stopped);
        }

        if self.completed_passes.load(Ordering::SeqCst) >= ticket {
            trace!("A pass that started after our call already finished");
            return Ok(());
        }

        // Every call which grabbed a ticket until now is covered by this pass.
        let covered = self.requested_passes.load(Ordering::SeqCst);
        let result = self.process_outgoing_requests().await;
        self.completed_passes.fetch_max(covered, Ordering::SeqCst);

        result
    }

    async fn process_outgoing_requests(&self) -> Result<(), OutgoingRequestError> {
        let requests = self.processor.backend.outgoing_requests().await?;
        debug!(count = requests.len(), "Processing outgoing requests");

        let mut first_error = None;

        for request in requests {
            if self.stopped.load(Ordering::SeqCst) {
                return Err(OutgoingRequestError::Stopped);
            }

            if let Err(e) = self.processor.make_outgoing_request(&request).await {
                warn!(
                    request_id = %request.request_id,
                    "Failed to process an outgoing request: {e}"
                );
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Stop processing requests, pending and future calls fail with
    /// [`OutgoingRequestError::Stopped`].
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches2::assert_let;
    use http::Method;
    use matrix_client_test::ALICE;
    use serde_json::json;

    use super::{OutgoingRequestProcessor, OutgoingRequestsManager};
    use crate::{
        error::OutgoingRequestError,
        http_client::HttpError,
        requests::{KeysQueryRequest, OutgoingRequest, OutgoingRequests, RequestKind},
        testing::{FakeBackend, FakeHttp},
    };

    fn keys_query_request(id: &str) -> OutgoingRequest {
        let mut request = KeysQueryRequest::default();
        request.device_keys.insert(ALICE.to_owned(), Vec::new());

        OutgoingRequest { request_id: id.into(), request: OutgoingRequests::KeysQuery(request) }
    }

    #[tokio::test]
    async fn test_requests_are_sent_and_marked() {
        let backend = Arc::new(FakeBackend::default());
        let http = Arc::new(FakeHttp::new(|_, _| Ok(json!({}))));
        backend.push_outgoing_request(keys_query_request("query-1"));

        let manager = OutgoingRequestsManager::new(OutgoingRequestProcessor::new(
            backend.clone(),
            http.clone(),
        ));
        manager.do_process_outgoing_requests().await.unwrap();

        let sent = http.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].method, Method::POST);
        assert_eq!(sent[0].path, "/keys/query");
        assert_eq!(backend.marked_as_sent(), vec![("query-1".to_owned(), RequestKind::KeysQuery)]);
    }

    #[tokio::test]
    async fn test_failures_are_reported_after_the_pass() {
        let backend = Arc::new(FakeBackend::default());
        let http = Arc::new(FakeHttp::new(|_, path| {
            if path == "/keys/query" {
                Err(HttpError::Connection("offline".to_owned()))
            } else {
                Ok(json!({}))
            }
        }));
        backend.push_outgoing_request(keys_query_request("query-1"));
        backend.push_outgoing_request(OutgoingRequest {
            request_id: "upload-1".into(),
            request: OutgoingRequests::KeysUpload(json!({ "one_time_keys": {} })),
        });

        let manager =
            OutgoingRequestsManager::new(OutgoingRequestProcessor::new(backend.clone(), http));
        let result = manager.do_process_outgoing_requests().await;

        assert_let!(Err(OutgoingRequestError::Http(HttpError::Connection(_))) = result);
        // The upload was still attempted and marked.
        assert_eq!(
            backend.marked_as_sent(),
            vec![("upload-1".to_owned(), RequestKind::KeysUpload)]
        );
    }

    #[tokio::test]
    async fn test_stopped_manager_refuses_to_process() {
        let backend = Arc::new(FakeBackend::default());
        let http = Arc::new(FakeHttp::new(|_, _| Ok(json!({}))));
        backend.push_outgoing_request(keys_query_request("query-1"));

        let manager = OutgoingRequestsManager::new(OutgoingRequestProcessor::new(
            backend.clone(),
            http.clone(),
        ));
        manager.stop();

        assert_let!(
            Err(OutgoingRequestError::Stopped) = manager.do_process_outgoing_requests().await
        );
        assert!(http.requests().is_empty());
    }
}
