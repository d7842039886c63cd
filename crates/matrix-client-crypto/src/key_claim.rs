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
    atomic::{AtomicBool, Ordering},
    Arc,
};

use ruma::OwnedUserId;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::{
    backend::CryptoBackend,
    error::OutgoingRequestError,
    outgoing::OutgoingRequestProcessor,
    requests::OutgoingRequests,
};

/// Establishes Olm sessions with the devices of room members.
///
/// The backend can only have one `/keys/claim` request in flight, otherwise
/// it would hand out the same one-time keys twice, so all claims go through
/// a single lock.
#[derive(Debug)]
pub struct KeyClaimManager {
    backend: Arc<dyn CryptoBackend>,
    processor: OutgoingRequestProcessor,
    claim_lock: Mutex<()>,
    stopped: AtomicBool,
}

impl KeyClaimManager {
    /// Create a new key claim manager.
    pub fn new(backend: Arc<dyn CryptoBackend>, processor: OutgoingRequestProcessor) -> Self {
        Self { backend, processor, claim_lock: Mutex::new(()), stopped: AtomicBool::new(false) }
    }

    /// Make sure we have an Olm session with every known device of the given
    /// users, claiming one-time keys for the devices that lack one.
    #[instrument(skip_all, fields(user_count = users.len()))]
    pub async fn ensure_sessions_for_users(
        &self,
        users: &[OwnedUserId],
    ) -> Result<(), OutgoingRequestError> {
        let _guard = self.claim_lock.lock().await;

        if self.stopped.load(Ordering::SeqCst) {
            return Err(OutgoingRequestError::Stopped);
        }

        let Some(request) = self.backend.get_missing_sessions(users).await? else {
            debug!("No missing Olm sessions");
            return Ok(());
        };

        if !matches!(request.request, OutgoingRequests::KeysClaim(_)) {
            return Err(OutgoingRequestError::UnexpectedRequest { expected: "keys claim" });
        }

        debug!(request_id = %request.request_id, "Claiming one-time keys");
        self.processor.make_outgoing_request(&request).await
    }

    /// Stop the manager, further calls fail with
    /// [`OutgoingRequestError::Stopped`].
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches2::assert_let;
    use matrix_client_test::{ALICE, BOB};
    use serde_json::json;

    use super::KeyClaimManager;
    use crate::{
        error::OutgoingRequestError,
        outgoing::OutgoingRequestProcessor,
        requests::{KeysClaimRequest, OutgoingRequest, OutgoingRequests, RequestKind},
        testing::{FakeBackend, FakeHttp},
    };

    #[tokio::test]
    async fn test_claims_missing_sessions() {
        let backend = Arc::new(FakeBackend::default());
        let http = Arc::new(FakeHttp::new(|_, _| Ok(json!({ "one_time_keys": {} }))));
        backend.set_missing_sessions(Some(OutgoingRequest {
            request_id: "claim-1".into(),
            request: OutgoingRequests::KeysClaim(KeysClaimRequest::default()),
        }));

        let processor = OutgoingRequestProcessor::new(backend.clone(), http.clone());
        let manager = KeyClaimManager::new(backend.clone(), processor);
        manager.ensure_sessions_for_users(&[ALICE.to_owned(), BOB.to_owned()]).await.unwrap();

        assert_eq!(http.requests()[0].path, "/keys/claim");
        assert_eq!(backend.marked_as_sent(), vec![("claim-1".to_owned(), RequestKind::KeysClaim)]);
    }

    #[tokio::test]
    async fn test_no_request_without_missing_sessions() {
        let backend = Arc::new(FakeBackend::default());
        let http = Arc::new(FakeHttp::new(|_, _| Ok(json!({}))));

        let processor = OutgoingRequestProcessor::new(backend.clone(), http.clone());
        let manager = KeyClaimManager::new(backend, processor);
        manager.ensure_sessions_for_users(&[ALICE.to_owned()]).await.unwrap();

        assert!(http.requests().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_unexpected_requests() {
        let backend = Arc::new(FakeBackend::default());
        let http = Arc::new(FakeHttp::new(|_, _| Ok(json!({}))));
        backend.set_missing_sessions(Some(OutgoingRequest {
            request_id: "upload".into(),
            request: OutgoingRequests::KeysUpload(json!({})),
        }));

        let processor = OutgoingRequestProcessor::new(backend.clone(), http.clone());
        let manager = KeyClaimManager::new(backend, processor);
        let result = manager.ensure_sessions_for_users(&[ALICE.to_owned()]).await;

        assert_let!(Err(OutgoingRequestError::UnexpectedRequest { .. }) = result);
        assert!(http.requests().is_empty());
    }
}
