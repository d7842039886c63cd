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

use ruma::OwnedUserId;
use serde::{Deserialize, Serialize};

use crate::event::MatrixEvent;

/// A room event filter, in the shape of the `RoomEventFilter` of the client
/// server API.
///
/// Event types may end with a `*` to match any type sharing the prefix. Lists
/// that are `None` don't restrict anything, the `not_` lists take precedence.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub types: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub not_types: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub senders: Option<Vec<OwnedUserId>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub not_senders: Vec<OwnedUserId>,
    /// Only events with (`true`) or without (`false`) a `url` in their
    /// content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contains_url: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rel_types: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub not_rel_types: Vec<String>,
}

fn type_matches(pattern: &str, event_type: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => event_type.starts_with(prefix),
        None => pattern == event_type,
    }
}

impl EventFilter {
    /// A filter letting through only the given event types.
    pub fn with_types(types: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self { types: Some(types.into_iter().map(Into::into).collect()), ..Default::default() }
    }

    /// Does the event pass the filter.
    pub fn matches(&self, event: &MatrixEvent) -> bool {
        let event_type = event.event_type();
        if self.not_types.iter().any(|p| type_matches(p, event_type)) {
            return false;
        }
        if let Some(types) = &self.types {
            if !types.iter().any(|p| type_matches(p, event_type)) {
                return false;
            }
        }

        let sender = event.sender();
        if let Some(sender) = &sender {
            if self.not_senders.contains(sender) {
                return false;
            }
        }
        if let Some(senders) = &self.senders {
            if !sender.is_some_and(|s| senders.contains(&s)) {
                return false;
            }
        }

        if let Some(contains_url) = self.contains_url {
            let has_url = event.content().get("url").is_some_and(|url| url.is_string());
            if has_url != contains_url {
                return false;
            }
        }

        let rel_type = event.relation().map(|r| r.rel_type);
        if let Some(rel_type) = &rel_type {
            if self.not_rel_types.contains(rel_type) {
                return false;
            }
        }
        if let Some(rel_types) = &self.rel_types {
            if !rel_type.is_some_and(|r| rel_types.contains(&r)) {
                return false;
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use matrix_client_test::{EventFactory, ALICE, BOB};
    use ruma::event_id;
    use serde_json::json;

    use super::EventFilter;
    use crate::event::MatrixEvent;

    fn event(json: serde_json::Value) -> MatrixEvent {
        MatrixEvent::new(json).unwrap()
    }

    #[test]
    fn test_type_wildcards() {
        let f = EventFactory::new().sender(*ALICE);
        let filter = EventFilter { types: Some(vec!["m.room.*".to_owned()]), ..Default::default() };

        assert!(filter.matches(&event(f.text_msg("hi").into())));
        assert!(!filter.matches(&event(f.reaction(event_id!("$a:localhost"), "👍").into())));

        let filter =
            EventFilter { not_types: vec!["m.room.message".to_owned()], ..Default::default() };
        assert!(!filter.matches(&event(f.text_msg("hi").into())));
        assert!(filter.matches(&event(f.room_name("Name").into())));
    }

    #[test]
    fn test_senders_and_urls() {
        let f = EventFactory::new();
        let filter = EventFilter {
            senders: Some(vec![(*ALICE).to_owned()]),
            contains_url: Some(true),
            ..Default::default()
        };

        let image = f.event("m.room.message", json!({ "msgtype": "m.image", "url": "mxc://a/b" }));
        assert!(filter.matches(&event(image.clone().sender(*ALICE).into())));
        assert!(!filter.matches(&event(image.sender(*BOB).into())));
        assert!(!filter.matches(&event(f.text_msg("no url").sender(*ALICE).into())));
    }

    #[test]
    fn test_relation_types() {
        let f = EventFactory::new().sender(*ALICE);
        let target = event_id!("$target:localhost");
        let filter: EventFilter = serde_json::from_value(json!({
            "not_rel_types": ["m.replace"],
        }))
        .unwrap();

        assert!(filter.matches(&event(f.reaction(target, "👍").into())));
        assert!(!filter.matches(&event(f.edit(target, "fixed").into())));
        assert!(filter.matches(&event(f.text_msg("plain").into())));

        let threads =
            EventFilter { rel_types: Some(vec!["m.thread".to_owned()]), ..Default::default() };
        assert!(threads.matches(&event(f.thread_reply(target, "in thread").into())));
        assert!(!threads.matches(&event(f.text_msg("plain").into())));
    }
}
