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

//! Types describing the outcome of an attempt to decrypt a room event.

use std::fmt;

use ruma::{OwnedDeviceId, OwnedUserId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// The reason why an event couldn't be decrypted.
///
/// This is a closed set, every failure reported by a crypto backend needs to
/// be classified into one of these codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecryptionFailureCode {
    /// We don't have the room key the event was encrypted with.
    MegolmUnknownInboundSessionId,

    /// We have the room key, but it doesn't go back far enough to decrypt
    /// this particular message.
    MegolmUnknownMessageIndex,

    /// The sender of the room key deliberately withheld it from us.
    MegolmKeyWithheld,

    /// The room key was withheld because our device isn't verified.
    MegolmKeyWithheldForUnverifiedDevice,

    /// The message predates our device and key backup isn't set up.
    HistoricalMessageNoKeyBackup,

    /// The message predates our device, a key backup exists but we can't
    /// use it.
    HistoricalMessageBackupUnconfigured,

    /// The message predates our device and a working key backup didn't
    /// contain the key.
    HistoricalMessageWorkingBackup,

    /// The message was sent while we weren't a member of the room.
    HistoricalMessageUserNotJoined,

    /// The sender's identity was previously verified, but has changed.
    SenderIdentityPreviouslyVerified,

    /// The sending device isn't signed by its owner.
    UnsignedSenderDevice,

    /// We couldn't figure out which device sent the event.
    UnknownSenderDevice,

    /// Something else went wrong.
    UnknownError,
}

impl DecryptionFailureCode {
    /// Is this failure caused by a room key that we simply don't have yet.
    ///
    /// Failures of this class are worth an attempt to fetch the key from the
    /// server-side key backup.
    pub fn is_missing_key(&self) -> bool {
        matches!(self, Self::MegolmUnknownInboundSessionId | Self::MegolmUnknownMessageIndex)
    }

    /// The string representation of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MegolmUnknownInboundSessionId => "MEGOLM_UNKNOWN_INBOUND_SESSION_ID",
            Self::MegolmUnknownMessageIndex => "MEGOLM_UNKNOWN_MESSAGE_INDEX",
            Self::MegolmKeyWithheld => "MEGOLM_KEY_WITHHELD",
            Self::MegolmKeyWithheldForUnverifiedDevice => {
                "MEGOLM_KEY_WITHHELD_FOR_UNVERIFIED_DEVICE"
            }
            Self::HistoricalMessageNoKeyBackup => "HISTORICAL_MESSAGE_NO_KEY_BACKUP",
            Self::HistoricalMessageBackupUnconfigured => "HISTORICAL_MESSAGE_BACKUP_UNCONFIGURED",
            Self::HistoricalMessageWorkingBackup => "HISTORICAL_MESSAGE_WORKING_BACKUP",
            Self::HistoricalMessageUserNotJoined => "HISTORICAL_MESSAGE_USER_NOT_JOINED",
            Self::SenderIdentityPreviouslyVerified => "SENDER_IDENTITY_PREVIOUSLY_VERIFIED",
            Self::UnsignedSenderDevice => "UNSIGNED_SENDER_DEVICE",
            Self::UnknownSenderDevice => "UNKNOWN_SENDER_DEVICE",
            Self::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for DecryptionFailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Information about an event that couldn't be decrypted, shown in place of
/// the event content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnableToDecryptInfo {
    /// The megolm session id of the room key the event was encrypted with,
    /// if the encrypted content could be parsed.
    pub session_id: Option<String>,

    /// The classified reason of the failure.
    pub code: DecryptionFailureCode,

    /// A human readable reason, fit for display.
    pub reason: String,
}

/// Information about the keys that were used to decrypt an event, and the
/// identity of the sender as claimed by those keys.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionInfo {
    /// The user that sent the event.
    pub sender: OwnedUserId,

    /// The device that sent the event, if known.
    pub sender_device: Option<OwnedDeviceId>,

    /// The Curve25519 key of the device that created the room key.
    pub sender_curve25519_key: String,

    /// The Ed25519 key the sender device claims to own.
    pub claimed_ed25519_key: Option<String>,

    /// Curve25519 keys of the devices the room key was forwarded through,
    /// oldest first.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,

    /// The megolm session id.
    pub session_id: Option<String>,
}

/// A successfully decrypted room event.
#[derive(Clone, Debug)]
pub struct DecryptedRoomEvent {
    /// The decrypted payload, the event `type` and `content` of the original
    /// plaintext event.
    pub event: JsonValue,

    /// Which keys were used to decrypt the event.
    pub encryption_info: EncryptionInfo,
}
