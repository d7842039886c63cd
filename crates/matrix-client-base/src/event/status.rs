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

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The send status of an event we're sending.
///
/// Remote events don't have a status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// The event is being encrypted.
    Encrypting,
    /// The event is being sent to the server.
    Sending,
    /// The event is waiting in a queue to be sent.
    Queued,
    /// The server accepted the event.
    Sent,
    /// Sending or encrypting the event failed.
    NotSent,
    /// The event was cancelled before it was sent.
    Cancelled,
}

impl EventStatus {
    /// All the statuses.
    pub const ALL: [EventStatus; 6] = [
        Self::Encrypting,
        Self::Sending,
        Self::Queued,
        Self::Sent,
        Self::NotSent,
        Self::Cancelled,
    ];

    /// The statuses this one can move to.
    pub fn allowed_transitions(self) -> &'static [EventStatus] {
        match self {
            Self::Encrypting => &[Self::Sending, Self::NotSent],
            Self::Sending => &[Self::Encrypting, Self::Queued, Self::NotSent, Self::Sent],
            Self::Queued => &[Self::Sending, Self::Cancelled],
            Self::NotSent => &[Self::Sending, Self::Queued, Self::Cancelled],
            Self::Sent | Self::Cancelled => &[],
        }
    }

    /// Can an event move from this status to `new`.
    pub fn can_transition_to(self, new: EventStatus) -> bool {
        self.allowed_transitions().contains(&new)
    }

    /// Is this a status the event can't leave anymore.
    pub fn is_terminal(self) -> bool {
        self.allowed_transitions().is_empty()
    }

    /// Check the move from `current` to `new`.
    ///
    /// Events without a status never move into one.
    pub fn transition(current: Option<EventStatus>, new: EventStatus) -> Result<EventStatus> {
        match current {
            Some(status) if status.can_transition_to(new) => Ok(new),
            _ => Err(Error::InvalidTransition { from: current, to: new }),
        }
    }

    /// The string representation of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Encrypting => "encrypting",
            Self::Sending => "sending",
            Self::Queued => "queued",
            Self::Sent => "sent",
            Self::NotSent => "not_sent",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
