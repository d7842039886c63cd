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

use std::sync::Arc;

use async_trait::async_trait;
use matrix_client_common::{deserialized_responses::DecryptedRoomEvent, AsyncTraitDeps};
use ruma::{OwnedUserId, RoomId, TransactionId};
use serde_json::Value as JsonValue;

use crate::{
    backups::{BackedUpRoomKey, BackupDecryptionKey, KeyBackupInfo},
    encryption_settings::EncryptionSettings,
    error::{CryptoBackendError, DecryptionError},
    requests::{OutgoingRequest, RequestKind, ToDeviceRequest},
};

/// The public identity keys of our own device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityKeys {
    /// The unpadded base64 Curve25519 key.
    pub curve25519: String,
    /// The unpadded base64 Ed25519 key.
    pub ed25519: String,
}

/// The key backup material the backend has stored.
#[derive(Clone, Debug, Default)]
pub struct BackupKeys {
    /// The private key used to decrypt room keys from the backup.
    pub decryption_key: Option<Arc<dyn BackupDecryptionKey>>,
    /// The backup version the decryption key belongs to.
    pub backup_version: Option<String>,
}

/// The result of importing room keys.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RoomKeyImportResult {
    /// How many keys were imported.
    pub imported_count: usize,
    /// How many keys were handed to the backend in total.
    pub total_count: usize,
}

/// The cryptographic engine.
///
/// The engine owns the Olm account, the Olm and Megolm sessions and the
/// device lists of tracked users. Everything in this crate orchestrates
/// calls into it and shuttles its requests to the homeserver.
#[async_trait]
pub trait CryptoBackend: AsyncTraitDeps {
    /// The identity keys of our own device.
    fn identity_keys(&self) -> IdentityKeys;

    /// Decrypt a `m.room.encrypted` event.
    ///
    /// Failures are classified by the [`DecryptionFailureCode`] carried in
    /// the error.
    ///
    /// [`DecryptionFailureCode`]: matrix_client_common::deserialized_responses::DecryptionFailureCode
    async fn decrypt_room_event(
        &self,
        room_id: &RoomId,
        event: &JsonValue,
    ) -> Result<DecryptedRoomEvent, DecryptionError>;

    /// Encrypt a room message using the current outbound group session of the
    /// room, returning the content of the `m.room.encrypted` event.
    async fn encrypt_room_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: &JsonValue,
    ) -> Result<JsonValue, CryptoBackendError>;

    /// Start tracking the devices of the given users, users which are already
    /// tracked are ignored.
    async fn update_tracked_users(&self, users: &[OwnedUserId]) -> Result<(), CryptoBackendError>;

    /// Get a `/keys/claim` request for the devices of the given users we
    /// don't have an Olm session with.
    async fn get_missing_sessions(
        &self,
        users: &[OwnedUserId],
    ) -> Result<Option<OutgoingRequest>, CryptoBackendError>;

    /// Share the room key of the room with the devices of the given users,
    /// creating a new outbound group session if needed.
    async fn share_room_key(
        &self,
        room_id: &RoomId,
        users: &[OwnedUserId],
        settings: &EncryptionSettings,
    ) -> Result<Vec<ToDeviceRequest>, CryptoBackendError>;

    /// Invalidate the current outbound group session of the room, returns
    /// whether a session existed.
    async fn discard_room_key(&self, room_id: &RoomId) -> Result<bool, CryptoBackendError>;

    /// The requests that need to be sent out to the homeserver.
    async fn outgoing_requests(&self) -> Result<Vec<OutgoingRequest>, CryptoBackendError>;

    /// Hand the response of an outgoing request back to the backend.
    async fn mark_request_as_sent(
        &self,
        request_id: &TransactionId,
        kind: RequestKind,
        response: &JsonValue,
    ) -> Result<(), CryptoBackendError>;

    /// Is the given backup version signed by a key we trust.
    async fn is_backup_trusted(&self, info: &KeyBackupInfo) -> Result<bool, CryptoBackendError>;

    /// The backup decryption key, and the version it belongs to, if we have
    /// one.
    async fn backup_keys(&self) -> Result<BackupKeys, CryptoBackendError>;

    /// Import room keys that were downloaded from the key backup. Events
    /// waiting for one of those keys are retried by the backend.
    async fn import_backed_up_room_keys(
        &self,
        keys: Vec<BackedUpRoomKey>,
        backup_version: &str,
    ) -> Result<RoomKeyImportResult, CryptoBackendError>;
}
