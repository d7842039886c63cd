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

use std::time::Duration;

use ruma::{events::room::history_visibility::HistoryVisibility, EventEncryptionAlgorithm};
use serde::{Deserialize, Serialize};

const ROTATION_PERIOD: Duration = Duration::from_millis(604_800_000);
const ROTATION_MESSAGES: u64 = 100;

/// The content of the `m.room.encryption` state event of a room.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomEncryptionSettings {
    /// The encryption algorithm to be used to encrypt messages sent in the
    /// room.
    pub algorithm: EventEncryptionAlgorithm,

    /// How long the session should be used before changing it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_period_ms: Option<u64>,

    /// How many messages should be sent before changing the session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_period_msgs: Option<u64>,
}

impl RoomEncryptionSettings {
    /// Settings for the megolm algorithm with the default rotation.
    pub fn megolm_v1() -> Self {
        Self {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            rotation_period_ms: None,
            rotation_period_msgs: None,
        }
    }
}

/// Settings for an encrypted room.
///
/// This determines the algorithm and rotation periods of a group session, and
/// which devices receive the room key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionSettings {
    /// The encryption algorithm that should be used in the room.
    pub algorithm: EventEncryptionAlgorithm,
    /// How long the session should be used before changing it.
    pub rotation_period: Duration,
    /// How many messages should be sent before changing the session.
    pub rotation_period_msgs: u64,
    /// The history visibility of the room when the session was created.
    pub history_visibility: HistoryVisibility,
    /// Only share the room key with devices that are verified or cross
    /// signed by their owner.
    pub only_allow_trusted_devices: bool,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            rotation_period: ROTATION_PERIOD,
            rotation_period_msgs: ROTATION_MESSAGES,
            history_visibility: HistoryVisibility::Shared,
            only_allow_trusted_devices: false,
        }
    }
}

impl EncryptionSettings {
    /// Create new encryption settings from the room encryption state, the
    /// current history visibility and the trust policy.
    pub fn new(
        content: &RoomEncryptionSettings,
        history_visibility: HistoryVisibility,
        only_allow_trusted_devices: bool,
    ) -> Self {
        let rotation_period =
            content.rotation_period_ms.map_or(ROTATION_PERIOD, Duration::from_millis);
        let rotation_period_msgs = content.rotation_period_msgs.unwrap_or(ROTATION_MESSAGES);

        Self {
            algorithm: content.algorithm.clone(),
            rotation_period,
            rotation_period_msgs,
            history_visibility,
            only_allow_trusted_devices,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ruma::events::room::history_visibility::HistoryVisibility;
    use serde_json::json;

    use super::{EncryptionSettings, RoomEncryptionSettings};

    #[test]
    fn test_encryption_settings_from_state_content() {
        let content: RoomEncryptionSettings = serde_json::from_value(json!({
            "algorithm": "m.megolm.v1.aes-sha2",
            "rotation_period_ms": 3_600_000,
        }))
        .unwrap();

        let settings = EncryptionSettings::new(&content, HistoryVisibility::Joined, true);

        assert_eq!(settings.rotation_period, Duration::from_secs(3600));
        assert_eq!(settings.rotation_period_msgs, 100);
        assert_eq!(settings.history_visibility, HistoryVisibility::Joined);
        assert!(settings.only_allow_trusted_devices);
    }
}
