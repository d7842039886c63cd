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

//! Server-side key backup support.
//!
//! The [`BackupManager`] keeps track of the backup version the client
//! currently trusts, the [`PerSessionKeyBackupDownloader`] fetches single
//! room keys from that backup whenever an event can't be decrypted because
//! the room key is missing.

use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

use http::Method;
use matrix_client_common::AsyncTraitDeps;
use ruma::{OwnedRoomId, RoomId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::{
    backend::{CryptoBackend, RoomKeyImportResult},
    error::CryptoBackendError,
    http_client::{HttpClient, HttpError, RequestOptions},
};

mod downloader;

pub use downloader::{
    BackupDownloaderSettings, ConfigurationProblem, KeyDownloadError, PerSessionKeyBackupDownloader,
};

/// The only backup algorithm we support.
pub const MEGOLM_BACKUP_V1_ALGORITHM: &str = "m.megolm_backup.v1.curve25519-aes-sha2";

/// Information about a backup version, as returned by the
/// `/room_keys/version` endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyBackupInfo {
    /// The algorithm used to encrypt the keys in the backup.
    pub algorithm: String,
    /// Algorithm specific data, contains the public key and the signatures of
    /// the backup for the megolm algorithm.
    pub auth_data: Map<String, JsonValue>,
    /// The version of the backup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// The number of keys stored in the backup.
    #[serde(default)]
    pub count: u64,
    /// An opaque string changing whenever keys are added to the backup.
    #[serde(default)]
    pub etag: String,
}

impl KeyBackupInfo {
    /// The Curve25519 public key of the backup, if it uses the megolm
    /// algorithm.
    pub fn megolm_v1_public_key(&self) -> Option<&str> {
        (self.algorithm == MEGOLM_BACKUP_V1_ALGORITHM)
            .then(|| self.auth_data.get("public_key").and_then(JsonValue::as_str))
            .flatten()
    }
}

/// A single room key as stored in the backup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyBackupSession {
    /// The index of the first message in the session the key can decrypt.
    pub first_message_index: u64,
    /// The number of times the key was forwarded.
    pub forwarded_count: u64,
    /// Was the device that uploaded the key verified when it did so.
    pub is_verified: bool,
    /// The encrypted room key.
    pub session_data: JsonValue,
}

/// A decrypted room key from the backup, ready to be imported.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackedUpRoomKey {
    /// The room the key belongs to.
    pub room_id: OwnedRoomId,
    /// The id of the megolm session.
    pub session_id: String,
    /// The encryption algorithm the session uses.
    pub algorithm: String,
    /// The Curve25519 key of the device that created the session.
    pub sender_key: String,
    /// The exported session key.
    pub session_key: String,
    /// The Ed25519 keys the sender claimed to own.
    #[serde(default)]
    pub sender_claimed_keys: BTreeMap<String, String>,
    /// The devices the key was forwarded through.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
}

/// The private key of a backup.
pub trait BackupDecryptionKey: AsyncTraitDeps {
    /// The public key matching this private key, used to check that the
    /// key belongs to a backup version.
    fn megolm_v1_public_key(&self) -> String;

    /// Decrypt the `session_data` of a backed up room key.
    ///
    /// Returns the decrypted JSON, without the room and session ids which
    /// aren't part of the encrypted payload.
    fn decrypt_session_data(&self, session_data: &JsonValue)
        -> Result<JsonValue, CryptoBackendError>;
}

/// Decrypts room keys downloaded from a specific backup version.
#[derive(Clone, Debug)]
pub struct BackupDecryptor {
    key: Arc<dyn BackupDecryptionKey>,
}

impl BackupDecryptor {
    /// Create a decryptor using the given backup key.
    pub fn new(key: Arc<dyn BackupDecryptionKey>) -> Self {
        Self { key }
    }

    /// The public key of the backup key.
    pub fn public_key(&self) -> String {
        self.key.megolm_v1_public_key()
    }

    /// Decrypt the sessions of a room.
    ///
    /// Sessions that fail to decrypt are skipped.
    pub fn decrypt_sessions(
        &self,
        room_id: &RoomId,
        sessions: BTreeMap<String, KeyBackupSession>,
    ) -> Vec<BackedUpRoomKey> {
        sessions
            .into_iter()
            .filter_map(|(session_id, session)| {
                match self.decrypt_session(room_id, &session_id, &session) {
                    Ok(key) => Some(key),
                    Err(e) => {
                        warn!(%room_id, %session_id, "Failed to decrypt a backed up room key: {e}");
                        None
                    }
                }
            })
            .collect()
    }

    fn decrypt_session(
        &self,
        room_id: &RoomId,
        session_id: &str,
        session: &KeyBackupSession,
    ) -> Result<BackedUpRoomKey, CryptoBackendError> {
        let mut decrypted = self.key.decrypt_session_data(&session.session_data)?;

        if let Some(object) = decrypted.as_object_mut() {
            object.insert("room_id".to_owned(), room_id.as_str().into());
            object.insert("session_id".to_owned(), session_id.into());
        }

        Ok(serde_json::from_value(decrypted)?)
    }
}

/// Changes to the backup state that other components react to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackupEvent {
    /// The backup got enabled or disabled.
    KeyBackupStatusChanged {
        /// Is a backup now active.
        enabled: bool,
    },
    /// A new backup decryption key was stored.
    DecryptionKeyCached,
    /// Room keys downloaded from the backup were imported, events encrypted
    /// with them can now be decrypted.
    RoomKeysImported {
        /// The imported sessions.
        keys: Vec<RoomKeyInfo>,
    },
}

/// Identifies a room key, the megolm session of a room.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomKeyInfo {
    /// The room the session belongs to.
    pub room_id: OwnedRoomId,
    /// The id of the megolm session.
    pub session_id: String,
}

impl From<&BackedUpRoomKey> for RoomKeyInfo {
    fn from(key: &BackedUpRoomKey) -> Self {
        Self { room_id: key.room_id.clone(), session_id: key.session_id.clone() }
    }
}

/// Keeps track of the backup version we currently trust.
#[derive(Debug)]
pub struct BackupManager {
    backend: Arc<dyn CryptoBackend>,
    http: Arc<dyn HttpClient>,
    active_backup: RwLock<Option<KeyBackupInfo>>,
    events: broadcast::Sender<BackupEvent>,
}

impl BackupManager {
    /// Create a new manager, no backup is active until
    /// [`BackupManager::check_key_backup_and_enable`] found a trusted one.
    pub fn new(backend: Arc<dyn CryptoBackend>, http: Arc<dyn HttpClient>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self { backend, http, active_backup: RwLock::new(None), events }
    }

    /// Fetch the current backup version from the server.
    ///
    /// Returns `None` if there's no backup on the server.
    pub async fn request_key_backup_version(&self) -> Result<Option<KeyBackupInfo>, HttpError> {
        let response = self
            .http
            .authed_request(Method::GET, "/room_keys/version", &[], None, RequestOptions::default())
            .await;

        match response {
            Ok(response) => Ok(Some(serde_json::from_value(response)?)),
            Err(HttpError::Matrix(e)) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The version of the backup we currently trust, if any.
    pub fn active_backup_version(&self) -> Option<String> {
        self.active_backup.read().unwrap().as_ref().and_then(|info| info.version.clone())
    }

    /// Subscribe to changes of the backup state.
    pub fn subscribe(&self) -> broadcast::Receiver<BackupEvent> {
        self.events.subscribe()
    }

    /// Check the backup on the server and enable it if we trust it.
    ///
    /// Returns whether a backup is active afterwards. Subscribers are notified
    /// if that changed, or if the active version changed.
    #[instrument(skip(self))]
    pub async fn check_key_backup_and_enable(&self) -> Result<bool, crate::OutgoingRequestError> {
        let info = self.request_key_backup_version().await?;

        let trusted = match &info {
            Some(info) if info.megolm_v1_public_key().is_some() => {
                self.backend.is_backup_trusted(info).await?
            }
            Some(info) => {
                info!(algorithm = info.algorithm, "Unsupported backup algorithm");
                false
            }
            None => false,
        };

        let new_backup = info.filter(|_| trusted);
        let enabled = new_backup.is_some();

        let changed = {
            let mut active = self.active_backup.write().unwrap();
            let changed =
                active.as_ref().map(|i| &i.version) != new_backup.as_ref().map(|i| &i.version);
            *active = new_backup;
            changed
        };

        if changed {
            debug!(enabled, "The key backup status changed");
            // Nobody listening is fine.
            let _ = self.events.send(BackupEvent::KeyBackupStatusChanged { enabled });
        }

        Ok(enabled)
    }

    /// Notify the listeners that a new backup decryption key was stored.
    pub fn on_decryption_key_cached(&self) {
        let _ = self.events.send(BackupEvent::DecryptionKeyCached);
    }

    /// Create a decryptor for the active backup, if we have the private key
    /// of that very backup version.
    pub async fn create_backup_decryptor(
        &self,
    ) -> Result<Option<BackupDecryptor>, CryptoBackendError> {
        let Some(active_version) = self.active_backup_version() else {
            return Ok(None);
        };

        let keys = self.backend.backup_keys().await?;

        Ok(match (keys.decryption_key, keys.backup_version) {
            (Some(key), Some(version)) if version == active_version => {
                Some(BackupDecryptor::new(key))
            }
            _ => None,
        })
    }

    /// Import room keys downloaded from the backup.
    ///
    /// Subscribers get a [`BackupEvent::RoomKeysImported`] once the backend
    /// imported at least one of them.
    pub async fn import_backed_up_room_keys(
        &self,
        keys: Vec<BackedUpRoomKey>,
        backup_version: &str,
    ) -> Result<RoomKeyImportResult, CryptoBackendError> {
        let infos: Vec<RoomKeyInfo> = keys.iter().map(RoomKeyInfo::from).collect();
        let result = self.backend.import_backed_up_room_keys(keys, backup_version).await?;

        if result.imported_count > 0 {
            let _ = self.events.send(BackupEvent::RoomKeysImported { keys: infos });
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Arc};

    use assert_matches2::assert_let;
    use http::StatusCode;
    use ruma::room_id;
    use serde_json::json;

    use super::{
        BackupDecryptor, BackupEvent, BackupManager, KeyBackupInfo, KeyBackupSession, RoomKeyInfo,
    };
    use crate::{
        http_client::{HttpError, MatrixError},
        testing::{backup_info_json, FakeBackend, FakeBackupKey, FakeHttp},
    };

    #[test]
    fn test_public_key_only_for_megolm_backups() {
        let info: KeyBackupInfo = serde_json::from_value(backup_info_json("1", "pubkey")).unwrap();
        assert_eq!(info.megolm_v1_public_key(), Some("pubkey"));

        let mut other = info.clone();
        other.algorithm = "org.example.backup".to_owned();
        assert_eq!(other.megolm_v1_public_key(), None);
    }

    #[test]
    fn test_decryptor_stamps_ids_and_skips_failures() {
        let decryptor = BackupDecryptor::new(Arc::new(FakeBackupKey::new("pubkey")));

        let mut sessions = BTreeMap::new();
        sessions.insert(
            "good".to_owned(),
            KeyBackupSession {
                first_message_index: 0,
                forwarded_count: 0,
                is_verified: true,
                session_data: json!({
                    "plain": {
                        "algorithm": "m.megolm.v1.aes-sha2",
                        "sender_key": "sender",
                        "session_key": "key",
                    }
                }),
            },
        );
        sessions.insert(
            "broken".to_owned(),
            KeyBackupSession {
                first_message_index: 0,
                forwarded_count: 0,
                is_verified: true,
                session_data: json!({ "ciphertext": "garbage" }),
            },
        );

        let keys = decryptor.decrypt_sessions(room_id!("!room:localhost"), sessions);

        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].session_id, "good");
        assert_eq!(keys[0].room_id, "!room:localhost");
    }

    #[tokio::test]
    async fn test_missing_backup_is_not_an_error() {
        let http = Arc::new(FakeHttp::new(|_, _| {
            Err(HttpError::Matrix(MatrixError::from_response(
                StatusCode::NOT_FOUND,
                &json!({ "errcode": "M_NOT_FOUND", "error": "No current backup version" }),
            )))
        }));
        let manager = BackupManager::new(Arc::new(FakeBackend::default()), http);

        assert_eq!(manager.request_key_backup_version().await.unwrap(), None);
        assert!(!manager.check_key_backup_and_enable().await.unwrap());
    }

    #[tokio::test]
    async fn test_trusted_backup_is_enabled() {
        let backend = Arc::new(FakeBackend::default());
        backend.set_backup_trusted(true);
        backend.set_backup_keys(Some(Arc::new(FakeBackupKey::new("pubkey"))), Some("1"));
        let http = Arc::new(FakeHttp::new(|_, _| Ok(backup_info_json("1", "pubkey"))));

        let manager = BackupManager::new(backend, http);
        let mut events = manager.subscribe();

        assert!(manager.check_key_backup_and_enable().await.unwrap());
        assert_eq!(manager.active_backup_version().as_deref(), Some("1"));
        assert_eq!(
            events.recv().await.unwrap(),
            BackupEvent::KeyBackupStatusChanged { enabled: true }
        );

        // Nothing changed, nothing is sent.
        manager.check_key_backup_and_enable().await.unwrap();
        assert_let!(Err(_) = events.try_recv());

        assert!(manager.create_backup_decryptor().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_imported_keys_are_announced() {
        let backend = Arc::new(FakeBackend::default());
        let http = Arc::new(FakeHttp::new(|_, _| Ok(backup_info_json("1", "pubkey"))));
        let manager = BackupManager::new(backend.clone(), http);
        let mut events = manager.subscribe();

        let decryptor = BackupDecryptor::new(Arc::new(FakeBackupKey::new("pubkey")));
        let room_id = room_id!("!room:localhost");
        let session = KeyBackupSession {
            first_message_index: 0,
            forwarded_count: 0,
            is_verified: true,
            session_data: json!({
                "plain": {
                    "algorithm": "m.megolm.v1.aes-sha2",
                    "sender_key": "sender",
                    "session_key": "key",
                }
            }),
        };
        let keys =
            decryptor.decrypt_sessions(room_id, BTreeMap::from([("s".to_owned(), session)]));

        let result = manager.import_backed_up_room_keys(keys, "1").await.unwrap();
        assert_eq!(result.imported_count, 1);
        assert_eq!(backend.imported_keys().len(), 1);

        assert_let!(Ok(BackupEvent::RoomKeysImported { keys }) = events.try_recv());
        let expected = RoomKeyInfo { room_id: room_id.to_owned(), session_id: "s".to_owned() };
        assert_eq!(keys, vec![expected]);

        // Nothing imported, nothing announced.
        manager.import_backed_up_room_keys(Vec::new(), "1").await.unwrap();
        assert_let!(Err(_) = events.try_recv());
    }

    #[tokio::test]
    async fn test_untrusted_backup_is_not_enabled() {
        let backend = Arc::new(FakeBackend::default());
        let http = Arc::new(FakeHttp::new(|_, _| Ok(backup_info_json("1", "pubkey"))));

        let manager = BackupManager::new(backend, http);

        assert!(!manager.check_key_backup_and_enable().await.unwrap());
        assert_eq!(manager.active_backup_version(), None);
        assert!(manager.create_backup_decryptor().await.unwrap().is_none());
    }
}
