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

//! Requests the crypto layer needs to send out to the homeserver.

use std::{collections::BTreeMap, time::Duration};

use ruma::{
    OwnedDeviceId, OwnedRoomId, OwnedTransactionId, OwnedUserId, TransactionId, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// The target device of a to-device message, either a single device or all
/// devices of a user.
pub const ALL_DEVICES: &str = "*";

/// Customized version of the `/sendToDevice` request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToDeviceRequest {
    /// Type of event being sent to each device.
    pub event_type: String,

    /// A request identifier unique to the access token used to send the
    /// request.
    pub txn_id: OwnedTransactionId,

    /// A map of users to devices to a content for a message event to be sent
    /// to the user's device. Individual message events can be sent to
    /// devices, the device id `*` targets all devices of a user.
    pub messages: BTreeMap<OwnedUserId, BTreeMap<String, JsonValue>>,
}

impl ToDeviceRequest {
    /// Create a new to-device request sending a single message.
    ///
    /// A `recipient_device` of `None` sends the message to all devices of the
    /// recipient.
    pub fn new(
        recipient: &UserId,
        recipient_device: Option<&str>,
        event_type: &str,
        content: JsonValue,
    ) -> Self {
        let device = recipient_device.unwrap_or(ALL_DEVICES).to_owned();
        let messages =
            BTreeMap::from([(recipient.to_owned(), BTreeMap::from([(device, content)]))]);

        Self { event_type: event_type.to_owned(), txn_id: TransactionId::new(), messages }
    }

    /// The number of messages this request sends out.
    pub fn message_count(&self) -> usize {
        self.messages.values().map(|d| d.len()).sum()
    }

    /// The JSON body of the request.
    pub fn body(&self) -> JsonValue {
        serde_json::json!({ "messages": self.messages })
    }
}

/// A `/keys/query` request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysQueryRequest {
    /// The users, and optionally the devices of the users, to download device
    /// keys for. An empty device list means all devices.
    pub device_keys: BTreeMap<OwnedUserId, Vec<OwnedDeviceId>>,

    /// How long the server should wait for remote servers.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_ms")]
    pub timeout: Option<Duration>,
}

/// A `/keys/claim` request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysClaimRequest {
    /// The one-time keys to claim, user id to device id to key algorithm.
    pub one_time_keys: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, String>>,

    /// How long the server should wait for remote servers.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_ms")]
    pub timeout: Option<Duration>,
}

/// A `PUT /room_keys/keys` request, uploading room keys to the key backup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeysBackupRequest {
    /// The backup version the keys belong to.
    pub version: String,

    /// The room keys, `{ room_id: { "sessions": { session_id: .. } } }`.
    pub rooms: BTreeMap<OwnedRoomId, JsonValue>,
}

/// A message event that needs to be sent into a room, used for in-room
/// verification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoomMessageRequest {
    /// The room to send the event to.
    pub room_id: OwnedRoomId,

    /// The transaction id of the event.
    pub txn_id: OwnedTransactionId,

    /// The type of the event.
    pub event_type: String,

    /// The content of the event.
    pub content: JsonValue,
}

/// Enum over the different outgoing requests the crypto backend can produce.
#[derive(Clone, Debug, PartialEq)]
pub enum OutgoingRequests {
    /// The `/keys/upload` request, uploading device and one-time keys.
    KeysUpload(JsonValue),
    /// The `/keys/query` request, fetching the device keys of users.
    KeysQuery(KeysQueryRequest),
    /// The `/keys/claim` request, claiming one-time keys to establish Olm
    /// sessions.
    KeysClaim(KeysClaimRequest),
    /// The `/keys/signatures/upload` request.
    SignatureUpload(JsonValue),
    /// Room keys that should be uploaded to the server-side key backup.
    KeysBackup(KeysBackupRequest),
    /// A to-device message.
    ToDeviceRequest(ToDeviceRequest),
    /// A room message, for in-room verification.
    RoomMessage(RoomMessageRequest),
}

impl OutgoingRequests {
    /// The kind of the request, handed back to the backend once a response
    /// arrives.
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::KeysUpload(_) => RequestKind::KeysUpload,
            Self::KeysQuery(_) => RequestKind::KeysQuery,
            Self::KeysClaim(_) => RequestKind::KeysClaim,
            Self::SignatureUpload(_) => RequestKind::SignatureUpload,
            Self::KeysBackup(_) => RequestKind::KeysBackup,
            Self::ToDeviceRequest(_) => RequestKind::ToDevice,
            Self::RoomMessage(_) => RequestKind::RoomMessage,
        }
    }
}

/// The kind of an [`OutgoingRequests`] value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// See [`OutgoingRequests::KeysUpload`].
    KeysUpload,
    /// See [`OutgoingRequests::KeysQuery`].
    KeysQuery,
    /// See [`OutgoingRequests::KeysClaim`].
    KeysClaim,
    /// See [`OutgoingRequests::SignatureUpload`].
    SignatureUpload,
    /// See [`OutgoingRequests::KeysBackup`].
    KeysBackup,
    /// See [`OutgoingRequests::ToDeviceRequest`].
    ToDevice,
    /// See [`OutgoingRequests::RoomMessage`].
    RoomMessage,
}

/// Outgoing request type, holds the unique id of the request and the actual
/// request.
#[derive(Clone, Debug, PartialEq)]
pub struct OutgoingRequest {
    /// The unique id of a request, needs to be passed when receiving a
    /// response.
    pub request_id: OwnedTransactionId,
    /// The underlying request.
    pub request: OutgoingRequests,
}

impl From<ToDeviceRequest> for OutgoingRequest {
    fn from(request: ToDeviceRequest) -> Self {
        Self {
            request_id: request.txn_id.clone(),
            request: OutgoingRequests::ToDeviceRequest(request),
        }
    }
}

/// Requests of the verification state machines.
///
/// These aren't tracked by the crypto backend, so their responses don't need
/// to be marked as sent.
#[derive(Clone, Debug, PartialEq)]
pub enum OutgoingVerificationRequest {
    /// The to-device verification request variant.
    ToDevice(ToDeviceRequest),
    /// The in-room verification request variant.
    InRoom(RoomMessageRequest),
}

mod opt_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => {
                s.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
            }
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use matrix_client_test::ALICE;
    use serde_json::json;
    use similar_asserts::assert_eq;

    use super::{KeysQueryRequest, ToDeviceRequest};

    #[test]
    fn test_to_device_request_targets_all_devices_by_default() {
        let request = ToDeviceRequest::new(&ALICE, None, "m.dummy", json!({}));

        assert_eq!(request.message_count(), 1);
        assert_eq!(request.body(), json!({ "messages": { "@alice:server.name": { "*": {} } } }));
    }

    #[test]
    fn test_keys_query_timeout_serialization() {
        let mut request = KeysQueryRequest::default();
        request.device_keys.insert(ALICE.to_owned(), Vec::new());
        request.timeout = Some(Duration::from_secs(10));

        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({ "device_keys": { "@alice:server.name": [] }, "timeout": 10000 })
        );
    }
}
