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

//! Per-room management of the outbound group session.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, RwLock,
};

use itertools::Itertools;
use ruma::{
    events::room::{history_visibility::HistoryVisibility, member::MembershipState},
    EventEncryptionAlgorithm, OwnedRoomId, OwnedUserId, RoomId, UserId,
};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::{debug, error, instrument, trace};

use crate::{
    backend::CryptoBackend,
    encryption_settings::{EncryptionSettings, RoomEncryptionSettings},
    error::RoomEncryptorError,
    key_claim::KeyClaimManager,
    outgoing::OutgoingRequestsManager,
};

/// The members of a room we need to encrypt for, as seen by the room when
/// the encryption was requested.
#[derive(Clone, Debug)]
pub struct EncryptionTargets {
    /// Users whose membership is `join`.
    pub joined: Vec<OwnedUserId>,
    /// Users whose membership is `invite`.
    pub invited: Vec<OwnedUserId>,
    /// The current history visibility of the room.
    pub history_visibility: HistoryVisibility,
}

impl EncryptionTargets {
    /// Should invited members receive the room key.
    ///
    /// They do unless the history is only visible from the point a member
    /// joined.
    pub fn should_encrypt_for_invited_members(&self) -> bool {
        self.history_visibility != HistoryVisibility::Joined
    }

    /// The deduplicated, sorted list of users the room key is shared with.
    pub fn users(&self) -> Vec<OwnedUserId> {
        let invited = self.should_encrypt_for_invited_members().then_some(&self.invited);

        self.joined.iter().chain(invited.into_iter().flatten()).cloned().sorted().dedup().collect()
    }
}

/// The result of encrypting a room event.
#[derive(Clone, Debug)]
pub struct EncryptedEvent {
    /// The content of the `m.room.encrypted` event.
    pub content: JsonValue,
    /// Our own Curve25519 key.
    pub sender_curve25519_key: String,
    /// Our own Ed25519 key.
    pub claimed_ed25519_key: String,
}

/// Manages the encryption of events sent to a single room.
///
/// Requests to encrypt events are processed strictly in the order they
/// arrive, the room key is shared with the current members before every
/// encryption.
#[derive(Debug)]
pub struct RoomEncryptor {
    room_id: OwnedRoomId,
    settings: RoomEncryptionSettings,
    backend: Arc<dyn CryptoBackend>,
    outgoing_requests_manager: Arc<OutgoingRequestsManager>,
    key_claim_manager: Arc<KeyClaimManager>,
    /// Per-room override of the global "only trusted devices" policy.
    only_allow_trusted_devices: RwLock<Option<bool>>,
    /// Have we done the first full device tracking pass over the members.
    members_resolved: AtomicBool,
    /// Fair lock, encryption requests are served in FIFO order.
    current_encryption: Mutex<()>,
}

impl RoomEncryptor {
    /// Create a new encryptor for the room.
    ///
    /// Fails if the room uses an algorithm we can't encrypt with.
    pub fn new(
        room_id: &RoomId,
        settings: RoomEncryptionSettings,
        backend: Arc<dyn CryptoBackend>,
        outgoing_requests_manager: Arc<OutgoingRequestsManager>,
        key_claim_manager: Arc<KeyClaimManager>,
    ) -> Result<Self, RoomEncryptorError> {
        if settings.algorithm != EventEncryptionAlgorithm::MegolmV1AesSha2 {
            return Err(RoomEncryptorError::UnsupportedAlgorithm(settings.algorithm));
        }

        Ok(Self {
            room_id: room_id.to_owned(),
            settings,
            backend,
            outgoing_requests_manager,
            key_claim_manager,
            only_allow_trusted_devices: RwLock::new(None),
            members_resolved: AtomicBool::new(false),
            current_encryption: Mutex::new(()),
        })
    }

    /// The room this encryptor belongs to.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// The encryption settings of the room.
    pub fn settings(&self) -> &RoomEncryptionSettings {
        &self.settings
    }

    /// Override the global "only share keys with trusted devices" policy for
    /// this room, `None` falls back to the global policy.
    pub fn set_only_allow_trusted_devices(&self, value: Option<bool>) {
        *self.only_allow_trusted_devices.write().unwrap() = value;
    }

    /// Handle a new `m.room.encryption` event in the room.
    ///
    /// The settings can't change once set, an event with different settings
    /// is rejected and our settings stay in place.
    pub fn on_crypto_event(
        &self,
        settings: &RoomEncryptionSettings,
    ) -> Result<(), RoomEncryptorError> {
        if *settings == self.settings {
            return Ok(());
        }

        error!(
            room_id = %self.room_id,
            current = ?self.settings,
            rejected = ?settings,
            "Ignoring m.room.encryption event which requests a change of config"
        );

        Err(RoomEncryptorError::SettingsChanged {
            current: Box::new(self.settings.clone()),
            rejected: Box::new(settings.clone()),
        })
    }

    /// Handle a membership change of a room member.
    ///
    /// New members get their devices tracked right away, once the first full
    /// tracking pass over the members happened.
    pub async fn on_room_membership_changed(
        &self,
        user_id: &UserId,
        membership: &MembershipState,
        history_visibility: &HistoryVisibility,
    ) -> Result<(), RoomEncryptorError> {
        let is_target = match membership {
            MembershipState::Join => true,
            MembershipState::Invite => *history_visibility != HistoryVisibility::Joined,
            _ => false,
        };

        if is_target && self.members_resolved.load(Ordering::SeqCst) {
            debug!(
                room_id = %self.room_id,
                %user_id,
                "Starting to track the devices of a new member"
            );
            self.backend.update_tracked_users(&[user_id.to_owned()]).await?;
        }

        Ok(())
    }

    /// Share the room key with the current members without encrypting an
    /// event, so the first send in the room is fast.
    #[instrument(skip_all, fields(room_id = %self.room_id))]
    pub async fn prepare_for_encryption(
        &self,
        targets: &EncryptionTargets,
        global_only_allow_trusted_devices: bool,
    ) -> Result<(), RoomEncryptorError> {
        let _guard = self.current_encryption.lock().await;
        self.ensure_encryption_session(targets, global_only_allow_trusted_devices).await
    }

    /// Encrypt an event for the room.
    ///
    /// The room key is shared with the given targets first. Concurrent calls
    /// are served in the order they were made, a failed call doesn't affect
    /// the ones queued behind it.
    #[instrument(skip_all, fields(room_id = %self.room_id, event_type))]
    pub async fn encrypt_event(
        &self,
        event_type: &str,
        content: &JsonValue,
        targets: &EncryptionTargets,
        global_only_allow_trusted_devices: bool,
    ) -> Result<EncryptedEvent, RoomEncryptorError> {
        let _guard = self.current_encryption.lock().await;

        self.ensure_encryption_session(targets, global_only_allow_trusted_devices).await?;

        trace!("Encrypting the event content");
        let content = self.backend.encrypt_room_event(&self.room_id, event_type, content).await?;
        let keys = self.backend.identity_keys();

        Ok(EncryptedEvent {
            content,
            sender_curve25519_key: keys.curve25519,
            claimed_ed25519_key: keys.ed25519,
        })
    }

    /// Discard the current outbound group session, the next encryption will
    /// create and share a fresh one.
    pub async fn force_discard_session(&self) -> Result<bool, RoomEncryptorError> {
        let _guard = self.current_encryption.lock().await;
        Ok(self.backend.discard_room_key(&self.room_id).await?)
    }

    /// Make sure the room key is shared with every device of the targets.
    ///
    /// Needs to be called with the encryption lock held.
    async fn ensure_encryption_session(
        &self,
        targets: &EncryptionTargets,
        global_only_allow_trusted_devices: bool,
    ) -> Result<(), RoomEncryptorError> {
        let users = targets.users();

        if !self.members_resolved.load(Ordering::SeqCst) {
            // We might not have seen all members yet, so the backend might not be
            // tracking them, and we need their device keys before the room
            // key can be shared with them.
            debug!(user_count = users.len(), "First encryption in the room, tracking all members");
            self.backend.update_tracked_users(&users).await?;
            self.outgoing_requests_manager.do_process_outgoing_requests().await?;
            self.members_resolved.store(true, Ordering::SeqCst);
        } else {
            self.backend.update_tracked_users(&users).await?;
        }

        self.key_claim_manager.ensure_sessions_for_users(&users).await?;

        let only_allow_trusted_devices = self
            .only_allow_trusted_devices
            .read()
            .unwrap()
            .unwrap_or(global_only_allow_trusted_devices);
        let settings = EncryptionSettings::new(
            &self.settings,
            targets.history_visibility.clone(),
            only_allow_trusted_devices,
        );

        let requests = self.backend.share_room_key(&self.room_id, &users, &settings).await?;
        debug!(request_count = requests.len(), "Sharing the room key");

        for request in &requests {
            self.outgoing_requests_manager.processor().send_to_device(request).await?;
        }

        Ok(())
    }
}
