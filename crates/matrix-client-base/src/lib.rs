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

mod config;
mod error;
pub mod event;
pub mod read_receipts;
pub mod relations;
mod room;
pub mod timeline;

#[cfg(feature = "e2e-encryption")]
pub use matrix_client_crypto as crypto;
pub use ruma;

pub use self::{
    config::{DuplicateStrategy, PendingEventOrdering, RoomConfig},
    error::{Error, Result},
    event::{EventStatus, MatrixEvent, TimelineEventItemId},
    room::{
        EventOrdering, NotificationCountType, Room, RoomMember, RoomState, RoomSummary,
        RoomUpdate, Thread, UnreadNotificationsCount,
    },
};
#[cfg(feature = "e2e-encryption")]
pub use self::room::MissingRoomKeyHandler;

#[cfg(test)]
#[ctor::ctor]
fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .init();
}
