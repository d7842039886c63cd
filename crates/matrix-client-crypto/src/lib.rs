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

#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations)]

mod backend;
pub mod backups;
mod encryption_settings;
mod error;
mod http_client;
mod key_claim;
mod outgoing;
pub mod requests;
mod room_encryptor;
pub mod verification;

#[cfg(any(test, feature = "testing"))]
#[allow(missing_docs)]
pub mod testing;

pub use backend::{BackupKeys, CryptoBackend, IdentityKeys, RoomKeyImportResult};
pub use encryption_settings::{EncryptionSettings, RoomEncryptionSettings};
pub use error::{
    CryptoBackendError, DecryptionError, OutgoingRequestError, RoomEncryptorError,
};
pub use http_client::{ClientPrefix, HttpClient, HttpError, MatrixError, RequestOptions};
pub use key_claim::KeyClaimManager;
pub use matrix_client_common::deserialized_responses::{
    DecryptedRoomEvent, DecryptionFailureCode, EncryptionInfo, UnableToDecryptInfo,
};
pub use outgoing::{OutgoingRequestProcessor, OutgoingRequestsManager};
pub use room_encryptor::{EncryptedEvent, EncryptionTargets, RoomEncryptor};

#[cfg(test)]
#[ctor::ctor]
fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .init();
}
