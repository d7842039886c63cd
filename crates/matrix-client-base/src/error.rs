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

use ruma::OwnedTransactionId;
use thiserror::Error;

use crate::event::EventStatus;

/// Result type of the base crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Internal representation of errors.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    /// The send status of an event can't change from `from` to `to`.
    #[error("An event can't move from the {from:?} status to the {to:?} status")]
    InvalidTransition {
        /// The current status, `None` for remote events.
        from: Option<EventStatus>,
        /// The requested status.
        to: EventStatus,
    },

    /// A pending event was added with a transaction id that's already in use.
    #[error("The transaction id {0} is already used by another pending event")]
    DuplicateTransactionId(OwnedTransactionId),

    /// A pending event must be added in the `sending` state.
    #[error("A pending event needs to be in the sending state, it was in the {0:?} state")]
    EventNotSending(Option<EventStatus>),

    /// The strategy to handle duplicate events isn't known.
    #[error("Unknown duplicate strategy `{0}`, expected `replace` or `ignore`")]
    InvalidDuplicateStrategy(String),

    /// The pending event ordering isn't known.
    #[error("Unknown pending event ordering `{0}`, expected `chronological` or `detached`")]
    InvalidPendingEventOrdering(String),

    /// Live events were added while the live timeline of a set had a forward
    /// pagination token or a forward neighbour.
    ///
    /// The live timeline needs to be reset after a gap in the sync.
    #[error("The live timeline has a forward pagination token or a forward neighbour")]
    LiveTimelineNotLive,

    /// No pending event uses the transaction id.
    #[error("There is no pending event with the transaction id {0}")]
    NotALocalEcho(OwnedTransactionId),

    /// An event was marked as sent without an event id.
    #[error("An event can only be marked as sent with an event id")]
    MissingEventId,

    /// The timeline doesn't exist in the timeline set.
    #[error("The timeline doesn't exist in this timeline set")]
    UnknownTimeline,

    /// Additional timelines require the timeline support of the room config.
    #[error("Timeline support is disabled for this room")]
    TimelineSupportDisabled,

    /// The state of a timeline can only be initialised while it's empty.
    #[error("The state of a timeline can't be initialised once it contains events")]
    TimelineNotEmpty,

    /// An event needs to be a JSON object.
    #[error("The event isn't a JSON object")]
    NotAnObject,

    /// The event misses a field, or the field has an invalid value.
    #[error("The event has an invalid or missing `{0}` field")]
    InvalidEvent(&'static str),

    /// Serialization or deserialization of an event failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// The crypto backend failed.
    #[cfg(feature = "e2e-encryption")]
    #[error(transparent)]
    Crypto(#[from] matrix_client_crypto::CryptoBackendError),
}
