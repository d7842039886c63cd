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

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Where the events we're sending show up before the server confirms them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingEventOrdering {
    /// Pending events are added to the live timelines right away.
    #[default]
    Chronological,
    /// Pending events are kept in a separate list until their remote echo
    /// arrives.
    Detached,
}

impl PendingEventOrdering {
    /// The string representation of the ordering.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chronological => "chronological",
            Self::Detached => "detached",
        }
    }
}

impl FromStr for PendingEventOrdering {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chronological" => Ok(Self::Chronological),
            "detached" => Ok(Self::Detached),
            _ => Err(Error::InvalidPendingEventOrdering(s.to_owned())),
        }
    }
}

impl fmt::Display for PendingEventOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do with a live event that's already part of the timeline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateStrategy {
    /// Replace the known event with the new copy.
    Replace,
    /// Keep the known event.
    #[default]
    Ignore,
}

impl FromStr for DuplicateStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "replace" => Ok(Self::Replace),
            "ignore" => Ok(Self::Ignore),
            _ => Err(Error::InvalidDuplicateStrategy(s.to_owned())),
        }
    }
}

/// Configuration of a [`Room`](crate::Room).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    /// Where pending events are kept.
    pub pending_event_ordering: PendingEventOrdering,

    /// Allow more than the live timeline in a timeline set, and keep old
    /// timelines around when the live timeline gets reset with a forward
    /// pagination token.
    pub timeline_support: bool,

    /// Keep threaded events in the timelines of their threads.
    pub thread_support: bool,
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_let;

    use super::{DuplicateStrategy, PendingEventOrdering, RoomConfig};
    use crate::Error;

    #[test]
    fn test_pending_event_ordering_parsing() {
        assert_eq!(
            "detached".parse::<PendingEventOrdering>().unwrap(),
            PendingEventOrdering::Detached
        );
        assert_eq!(
            "chronological".parse::<PendingEventOrdering>().unwrap(),
            PendingEventOrdering::Chronological
        );

        let result = "Detached".parse::<PendingEventOrdering>();
        assert_let!(Err(Error::InvalidPendingEventOrdering(value)) = result);
        assert_eq!(value, "Detached");
    }

    #[test]
    fn test_duplicate_strategy_parsing() {
        assert_eq!("replace".parse::<DuplicateStrategy>().unwrap(), DuplicateStrategy::Replace);
        assert_eq!("ignore".parse::<DuplicateStrategy>().unwrap(), DuplicateStrategy::Ignore);
        assert_let!(Err(Error::InvalidDuplicateStrategy(_)) = "drop".parse::<DuplicateStrategy>());
    }

    #[test]
    fn test_config_deserialization_defaults() {
        let config: RoomConfig =
            serde_json::from_str(r#"{ "pending_event_ordering": "detached" }"#).unwrap();

        assert_eq!(config.pending_event_ordering, PendingEventOrdering::Detached);
        assert!(!config.timeline_support);
        assert!(!config.thread_support);
    }
}
