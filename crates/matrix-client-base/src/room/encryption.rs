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

use std::collections::BTreeSet;

use matrix_client_crypto::{
    backups::{PerSessionKeyBackupDownloader, RoomKeyInfo},
    CryptoBackend, EncryptionTargets, RoomEncryptionSettings,
};
use ruma::{events::room::member::MembershipState, RoomId};
use tracing::{debug, instrument, warn};

use super::{Room, RoomUpdate};
use crate::event::{EventKey, MatrixEvent};

/// Gets told about the room keys we're missing to decrypt an event.
pub trait MissingRoomKeyHandler: Send + Sync {
    /// An event of the room couldn't be decrypted, the room key of the
    /// session is unknown.
    fn on_missing_room_key(&self, room_id: &RoomId, session_id: &str);
}

impl MissingRoomKeyHandler for PerSessionKeyBackupDownloader {
    fn on_missing_room_key(&self, room_id: &RoomId, session_id: &str) {
        self.on_decryption_key_missing_error(room_id, session_id);
    }
}

impl Room {
    /// Try to decrypt an event of the room.
    ///
    /// On failure the event is marked as undecryptable, and the handler is
    /// told about the session if the room key is missing. Returns whether the
    /// event was decrypted.
    #[instrument(skip(self, backend, missing_keys), fields(room_id = %self.room_id))]
    pub async fn decrypt_event(
        &mut self,
        backend: &dyn CryptoBackend,
        key: EventKey,
        missing_keys: Option<&dyn MissingRoomKeyHandler>,
    ) -> bool {
        let Some(event) = self.arena.get(key) else { return false };
        if !event.is_encrypted() || event.clear_event().is_some() || event.is_redacted() {
            return false;
        }

        let raw = event.to_json();
        let session_id = event.session_id().map(ToOwned::to_owned);
        let item_id = event.item_id();

        let result = backend.decrypt_room_event(&self.room_id, &raw).await;

        let Some(event) = self.arena.get_mut(key) else { return false };
        let success = match result {
            Ok(decrypted) => {
                event.set_clear_data(decrypted);
                debug!(?item_id, "Decrypted an event");
                true
            }
            Err(error) => {
                let session_id = error.session_id.clone().or(session_id);
                warn!(?item_id, ?session_id, code = ?error.code, "Couldn't decrypt an event");

                if error.code.is_missing_key() {
                    if let (Some(handler), Some(session_id)) = (missing_keys, &session_id) {
                        handler.on_missing_room_key(&self.room_id, session_id);
                    }
                }

                event.set_decryption_failure(error.into_unable_to_decrypt_info());
                false
            }
        };

        if success {
            self.aggregate(key);
        }
        if let Some(event) = item_id {
            self.emit(RoomUpdate::Decrypted { event, success });
        }

        success
    }

    /// Retry the decryption of the events encrypted with a session, after
    /// its room key arrived. Returns the number of decrypted events.
    pub async fn retry_decryption(
        &mut self,
        backend: &dyn CryptoBackend,
        session_id: &str,
        missing_keys: Option<&dyn MissingRoomKeyHandler>,
    ) -> usize {
        let keys = self.undecrypted_events(|event| event.session_id() == Some(session_id));
        self.decrypt_events(backend, keys, missing_keys).await
    }

    /// Retry the decryption of the events waiting for any of the imported
    /// room keys, see [`BackupEvent::RoomKeysImported`]. Keys of other rooms
    /// are skipped. Returns the number of decrypted events.
    ///
    /// [`BackupEvent::RoomKeysImported`]: matrix_client_crypto::backups::BackupEvent::RoomKeysImported
    pub async fn on_room_keys_imported(
        &mut self,
        backend: &dyn CryptoBackend,
        keys: &[RoomKeyInfo],
        missing_keys: Option<&dyn MissingRoomKeyHandler>,
    ) -> usize {
        let sessions: BTreeSet<&str> = keys
            .iter()
            .filter(|key| key.room_id == self.room_id)
            .map(|key| key.session_id.as_str())
            .collect();

        if sessions.is_empty() {
            return 0;
        }

        debug!(
            room_id = %self.room_id,
            count = sessions.len(),
            "Room keys arrived, retrying decryption"
        );

        let keys = self.undecrypted_events(|event| {
            event.session_id().is_some_and(|session_id| sessions.contains(session_id))
        });
        self.decrypt_events(backend, keys, missing_keys).await
    }

    /// Try to decrypt every event of the room that doesn't have its cleartext
    /// yet. Returns the number of decrypted events.
    pub async fn decrypt_all_pending(
        &mut self,
        backend: &dyn CryptoBackend,
        missing_keys: Option<&dyn MissingRoomKeyHandler>,
    ) -> usize {
        let keys = self.undecrypted_events(|_| true);
        self.decrypt_events(backend, keys, missing_keys).await
    }

    fn undecrypted_events(&self, filter: impl Fn(&MatrixEvent) -> bool) -> Vec<EventKey> {
        self.arena
            .iter()
            .filter(|(_, event)| event.should_attempt_decryption() && filter(event))
            .map(|(key, _)| key)
            .collect()
    }

    async fn decrypt_events(
        &mut self,
        backend: &dyn CryptoBackend,
        keys: Vec<EventKey>,
        missing_keys: Option<&dyn MissingRoomKeyHandler>,
    ) -> usize {
        let mut decrypted = 0;
        for key in keys {
            if self.decrypt_event(backend, key, missing_keys).await {
                decrypted += 1;
            }
        }
        decrypted
    }

    /// The users who should receive the room key of the room, and the
    /// history visibility deciding if invited users do.
    pub fn encryption_targets(&self) -> EncryptionTargets {
        let state = self.current_state();

        EncryptionTargets {
            joined: state.users_with_membership(&MembershipState::Join),
            invited: state.users_with_membership(&MembershipState::Invite),
            history_visibility: state.history_visibility(),
        }
    }

    /// The encryption settings of the room, `None` if the room isn't
    /// encrypted.
    pub fn encryption_settings(&self) -> Option<RoomEncryptionSettings> {
        let content = self.current_state().encryption()?;

        match serde_json::from_value(content.clone()) {
            Ok(settings) => Some(settings),
            Err(error) => {
                warn!(room_id = %self.room_id, %error, "Invalid room encryption settings");
                None
            }
        }
    }
}
