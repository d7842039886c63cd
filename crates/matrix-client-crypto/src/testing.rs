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

//! In-memory stand-ins for the crypto engine and the homeserver.

use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use http::Method;
use matrix_client_common::deserialized_responses::{
    DecryptedRoomEvent, DecryptionFailureCode, EncryptionInfo,
};
use ruma::{OwnedUserId, RoomId, TransactionId};
use serde_json::{json, Value as JsonValue};

use crate::{
    backend::{BackupKeys, CryptoBackend, IdentityKeys, RoomKeyImportResult},
    backups::{BackedUpRoomKey, BackupDecryptionKey, KeyBackupInfo, MEGOLM_BACKUP_V1_ALGORITHM},
    encryption_settings::EncryptionSettings,
    error::{CryptoBackendError, DecryptionError},
    http_client::{HttpClient, HttpError, RequestOptions},
    requests::{OutgoingRequest, RequestKind, ToDeviceRequest},
};

/// The response of `/room_keys/version` for a megolm backup.
pub fn backup_info_json(version: &str, public_key: &str) -> JsonValue {
    json!({
        "algorithm": MEGOLM_BACKUP_V1_ALGORITHM,
        "auth_data": {
            "public_key": public_key,
            "signatures": {},
        },
        "version": version,
        "count": 1,
        "etag": "1",
    })
}

#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<JsonValue>,
}

type Handler = dyn Fn(&Method, &str) -> Result<JsonValue, HttpError> + Send + Sync;

/// A homeserver answering requests with a closure, recording every request.
pub struct FakeHttp {
    handler: Box<Handler>,
    requests: Mutex<Vec<RecordedRequest>>,
    delay: Mutex<Option<Duration>>,
}

impl FakeHttp {
    pub fn new(
        handler: impl Fn(&Method, &str) -> Result<JsonValue, HttpError> + Send + Sync + 'static,
    ) -> Self {
        Self { handler: Box::new(handler), requests: Default::default(), delay: Default::default() }
    }

    /// Delay every response, the handler is still called when the request
    /// is made.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl fmt::Debug for FakeHttp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeHttp").finish_non_exhaustive()
    }
}

#[async_trait]
impl HttpClient for FakeHttp {
    async fn authed_request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<JsonValue>,
        _opts: RequestOptions,
    ) -> Result<JsonValue, HttpError> {
        self.requests.lock().unwrap().push(RecordedRequest {
            method: method.clone(),
            path: path.to_owned(),
            query: query.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect(),
            body,
        });

        let response = (self.handler)(&method, path);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        response
    }
}

/// A backup key which "decrypts" session data by returning its `plain` field.
#[derive(Debug)]
pub struct FakeBackupKey {
    public_key: String,
}

impl FakeBackupKey {
    pub fn new(public_key: &str) -> Self {
        Self { public_key: public_key.to_owned() }
    }
}

impl BackupDecryptionKey for FakeBackupKey {
    fn megolm_v1_public_key(&self) -> String {
        self.public_key.clone()
    }

    fn decrypt_session_data(
        &self,
        session_data: &JsonValue,
    ) -> Result<JsonValue, CryptoBackendError> {
        session_data
            .get("plain")
            .cloned()
            .ok_or_else(|| CryptoBackendError::Other("bad MAC".to_owned()))
    }
}

/// A crypto engine which records the calls made into it.
///
/// Encryption prefixes the `body` of the content with `encrypted:`, an event
/// can be decrypted once a key for its `session_id` was imported.
#[derive(Debug, Default)]
pub struct FakeBackend {
    calls: Mutex<Vec<String>>,
    tracked_users: Mutex<HashSet<OwnedUserId>>,
    missing_sessions: Mutex<Option<OutgoingRequest>>,
    room_key_shares: Mutex<Vec<ToDeviceRequest>>,
    share_delay: Mutex<Option<Duration>>,
    outgoing_requests: Mutex<Vec<OutgoingRequest>>,
    marked_as_sent: Mutex<Vec<(String, RequestKind)>>,
    encrypted_bodies: Mutex<Vec<String>>,
    backup_trusted: Mutex<bool>,
    backup_keys: Mutex<BackupKeys>,
    imported_keys: Mutex<Vec<(BackedUpRoomKey, String)>>,
}

impl FakeBackend {
    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn push_outgoing_request(&self, request: OutgoingRequest) {
        self.outgoing_requests.lock().unwrap().push(request);
    }

    pub fn marked_as_sent(&self) -> Vec<(String, RequestKind)> {
        self.marked_as_sent.lock().unwrap().clone()
    }

    pub fn set_missing_sessions(&self, request: Option<OutgoingRequest>) {
        *self.missing_sessions.lock().unwrap() = request;
    }

    pub fn set_room_key_shares(&self, requests: Vec<ToDeviceRequest>) {
        *self.room_key_shares.lock().unwrap() = requests;
    }

    pub fn set_share_delay(&self, delay: Option<Duration>) {
        *self.share_delay.lock().unwrap() = delay;
    }

    pub fn encrypted_bodies(&self) -> Vec<String> {
        self.encrypted_bodies.lock().unwrap().clone()
    }

    pub fn tracked_users(&self) -> HashSet<OwnedUserId> {
        self.tracked_users.lock().unwrap().clone()
    }

    pub fn set_backup_trusted(&self, trusted: bool) {
        *self.backup_trusted.lock().unwrap() = trusted;
    }

    pub fn set_backup_keys(
        &self,
        decryption_key: Option<Arc<dyn BackupDecryptionKey>>,
        backup_version: Option<&str>,
    ) {
        *self.backup_keys.lock().unwrap() =
            BackupKeys { decryption_key, backup_version: backup_version.map(ToOwned::to_owned) };
    }

    pub fn imported_keys(&self) -> Vec<(BackedUpRoomKey, String)> {
        self.imported_keys.lock().unwrap().clone()
    }
}

#[async_trait]
impl CryptoBackend for FakeBackend {
    fn identity_keys(&self) -> IdentityKeys {
        IdentityKeys { curve25519: "curve_key".to_owned(), ed25519: "ed_key".to_owned() }
    }

    async fn decrypt_room_event(
        &self,
        _room_id: &RoomId,
        event: &JsonValue,
    ) -> Result<DecryptedRoomEvent, DecryptionError> {
        let content = &event["content"];
        let session_id = content["session_id"].as_str().unwrap_or_default();

        let known =
            self.imported_keys.lock().unwrap().iter().any(|(k, _)| k.session_id == session_id);
        if !known {
            return Err(DecryptionError::new(
                DecryptionFailureCode::MegolmUnknownInboundSessionId,
                "unknown session",
            )
            .with_session_id(session_id));
        }

        let sender: OwnedUserId = serde_json::from_value(event["sender"].clone()).map_err(|e| {
            DecryptionError::new(DecryptionFailureCode::UnknownError, e.to_string())
        })?;

        Ok(DecryptedRoomEvent {
            event: content["plaintext"].clone(),
            encryption_info: EncryptionInfo {
                sender,
                sender_device: None,
                sender_curve25519_key: content["sender_key"]
                    .as_str()
                    .unwrap_or_default()
                    .to_owned(),
                claimed_ed25519_key: None,
                forwarding_curve25519_key_chain: Vec::new(),
                session_id: Some(session_id.to_owned()),
            },
        })
    }

    async fn encrypt_room_event(
        &self,
        _room_id: &RoomId,
        event_type: &str,
        content: &JsonValue,
    ) -> Result<JsonValue, CryptoBackendError> {
        self.record(format!("encrypt_room_event:{event_type}"));

        let body = content["body"].as_str().unwrap_or_default().to_owned();
        self.encrypted_bodies.lock().unwrap().push(body.clone());

        Ok(json!({
            "algorithm": "m.megolm.v1.aes-sha2",
            "ciphertext": format!("encrypted:{body}"),
            "session_id": "session",
        }))
    }

    async fn update_tracked_users(&self, users: &[OwnedUserId]) -> Result<(), CryptoBackendError> {
        self.record(format!("update_tracked_users:{}", users.len()));
        self.tracked_users.lock().unwrap().extend(users.iter().cloned());
        Ok(())
    }

    async fn get_missing_sessions(
        &self,
        users: &[OwnedUserId],
    ) -> Result<Option<OutgoingRequest>, CryptoBackendError> {
        self.record(format!("get_missing_sessions:{}", users.len()));
        Ok(self.missing_sessions.lock().unwrap().take())
    }

    async fn share_room_key(
        &self,
        _room_id: &RoomId,
        users: &[OwnedUserId],
        settings: &EncryptionSettings,
    ) -> Result<Vec<ToDeviceRequest>, CryptoBackendError> {
        self.record(format!(
            "share_room_key:{}:{}",
            users.len(),
            settings.only_allow_trusted_devices
        ));

        let delay = *self.share_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        Ok(std::mem::take(&mut *self.room_key_shares.lock().unwrap()))
    }

    async fn discard_room_key(&self, _room_id: &RoomId) -> Result<bool, CryptoBackendError> {
        self.record("discard_room_key");
        Ok(true)
    }

    async fn outgoing_requests(&self) -> Result<Vec<OutgoingRequest>, CryptoBackendError> {
        self.record("outgoing_requests");
        Ok(std::mem::take(&mut *self.outgoing_requests.lock().unwrap()))
    }

    async fn mark_request_as_sent(
        &self,
        request_id: &TransactionId,
        kind: RequestKind,
        _response: &JsonValue,
    ) -> Result<(), CryptoBackendError> {
        self.record(format!("mark_request_as_sent:{kind:?}"));
        self.marked_as_sent.lock().unwrap().push((request_id.to_string(), kind));
        Ok(())
    }

    async fn is_backup_trusted(&self, _info: &KeyBackupInfo) -> Result<bool, CryptoBackendError> {
        Ok(*self.backup_trusted.lock().unwrap())
    }

    async fn backup_keys(&self) -> Result<BackupKeys, CryptoBackendError> {
        Ok(self.backup_keys.lock().unwrap().clone())
    }

    async fn import_backed_up_room_keys(
        &self,
        keys: Vec<BackedUpRoomKey>,
        backup_version: &str,
    ) -> Result<RoomKeyImportResult, CryptoBackendError> {
        let total_count = keys.len();
        self.imported_keys
            .lock()
            .unwrap()
            .extend(keys.into_iter().map(|k| (k, backup_version.to_owned())));

        Ok(RoomKeyImportResult { imported_count: total_count, total_count })
    }
}
