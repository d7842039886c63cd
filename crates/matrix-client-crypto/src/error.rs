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

use matrix_client_common::deserialized_responses::{DecryptionFailureCode, UnableToDecryptInfo};
use ruma::{EventEncryptionAlgorithm, OwnedTransactionId};
use thiserror::Error;

use crate::{encryption_settings::RoomEncryptionSettings, http_client::HttpError};

/// Error type describing a failure of the crypto backend.
#[derive(Error, Debug)]
pub enum CryptoBackendError {
    /// The crypto store of the backend failed.
    #[error("the crypto store failed: {0}")]
    Store(String),

    /// A response or payload handed to the backend couldn't be processed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// The backend doesn't know about the request that was marked as sent.
    #[error("the request {0} isn't known to the crypto backend")]
    UnknownRequest(OwnedTransactionId),

    /// Any other failure of the backend.
    #[error("the crypto backend failed: {0}")]
    Other(String),
}

/// Error returned by a crypto backend when it fails to decrypt a room event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("can't decrypt the event ({code}): {message}")]
pub struct DecryptionError {
    /// The classified reason of the failure.
    pub code: DecryptionFailureCode,

    /// Details about the failure, shown to the user in place of the content.
    pub message: String,

    /// The megolm session the event was encrypted with, if it could be
    /// determined.
    pub session_id: Option<String>,
}

impl DecryptionError {
    /// Create a new decryption error.
    pub fn new(code: DecryptionFailureCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), session_id: None }
    }

    /// Attach the session id of the room key the event was encrypted with.
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Convert the error into the placeholder data stored on the event.
    pub fn into_unable_to_decrypt_info(self) -> UnableToDecryptInfo {
        UnableToDecryptInfo { session_id: self.session_id, code: self.code, reason: self.message }
    }
}

/// Error type for sending out the outgoing requests of the crypto backend.
#[derive(Error, Debug)]
pub enum OutgoingRequestError {
    /// The homeserver couldn't be reached or returned an error.
    #[error(transparent)]
    Http(#[from] HttpError),

    /// The backend failed to process the response.
    #[error(transparent)]
    Backend(#[from] CryptoBackendError),

    /// The request was handed to a processor which doesn't know how to send
    /// it.
    #[error("unexpected request kind, expected a {expected} request")]
    UnexpectedRequest {
        /// The kind of request that was expected.
        expected: &'static str,
    },

    /// The processor has been stopped.
    #[error("the request processor has been stopped")]
    Stopped,
}

/// Error type for the encryption of room events.
#[derive(Error, Debug)]
pub enum RoomEncryptorError {
    /// The room uses an algorithm we don't support, encryption will never
    /// succeed.
    #[error("can't encrypt in the room, the algorithm {0} isn't supported")]
    UnsupportedAlgorithm(EventEncryptionAlgorithm),

    /// An `m.room.encryption` event tried to change the encryption settings of
    /// a room.
    #[error("the encryption settings of a room can't be changed once set")]
    SettingsChanged {
        /// The settings the room encryptor was created with.
        current: Box<RoomEncryptionSettings>,
        /// The settings that were rejected.
        rejected: Box<RoomEncryptionSettings>,
    },

    /// Sending out a request failed, the next attempt to encrypt will retry.
    #[error(transparent)]
    OutgoingRequest(#[from] OutgoingRequestError),

    /// The crypto backend failed.
    #[error(transparent)]
    Backend(#[from] CryptoBackendError),
}

impl From<HttpError> for RoomEncryptorError {
    fn from(value: HttpError) -> Self {
        Self::OutgoingRequest(value.into())
    }
}
