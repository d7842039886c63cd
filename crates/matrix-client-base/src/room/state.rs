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

use std::collections::{BTreeMap, HashMap};

use ruma::{
    events::room::{history_visibility::HistoryVisibility, member::MembershipState},
    EventId, OwnedUserId, UserId,
};
use serde_json::Value as JsonValue;
use tracing::trace;

use crate::event::{AnyEventContent, MatrixEvent};

/// A member of a room, as seen by one [`RoomState`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoomMember {
    /// The user id of the member.
    pub user_id: OwnedUserId,
    /// The membership of the member.
    pub membership: MembershipState,
    /// The display name the member set.
    pub display_name: Option<String>,
    /// The name to show, disambiguated with the user id when another member
    /// uses the same display name.
    pub name: String,
    /// Who sent the membership event, the inviter of invited members.
    pub event_sender: Option<OwnedUserId>,
}

/// The state of a room at one point of a timeline.
#[derive(Clone, Debug, Default)]
pub struct RoomState {
    events: BTreeMap<(String, String), MatrixEvent>,
}

impl RoomState {
    /// Create an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a state event.
    ///
    /// Walking forward the event becomes the current state, walking backward
    /// its previous content does.
    pub fn apply(&mut self, event: &MatrixEvent, forward: bool) {
        let Some(state_key) = event.state_key() else {
            return;
        };

        let key = (event.event_type().to_owned(), state_key.to_owned());
        trace!(
            event_type = key.0.as_str(),
            state_key = key.1.as_str(),
            forward,
            "Applying a state event"
        );

        if forward {
            self.events.insert(key, event.clone());
            return;
        }

        let prev_content = event.prev_content();
        if prev_content.as_object().is_some_and(|c| c.is_empty()) {
            self.events.remove(&key);
        } else {
            let mut raw = event.to_json();
            raw["content"] = prev_content.clone();
            if let Ok(prev) = MatrixEvent::new(raw) {
                self.events.insert(key, prev);
            }
        }
    }

    /// Redact the copy of a state event this state holds.
    pub(crate) fn redact(&mut self, event_id: &EventId, redaction: &MatrixEvent) -> bool {
        let mut redacted = false;
        for event in self.events.values_mut() {
            if event.event_id().as_deref() == Some(event_id) {
                event.make_redacted(redaction);
                redacted = true;
            }
        }
        redacted
    }

    /// The state event of the given type and state key.
    pub fn get(&self, event_type: &str, state_key: &str) -> Option<&MatrixEvent> {
        self.events.get(&(event_type.to_owned(), state_key.to_owned()))
    }

    /// The content of the state event of the given type and state key.
    pub fn content(&self, event_type: &str, state_key: &str) -> Option<&JsonValue> {
        self.get(event_type, state_key).map(MatrixEvent::content)
    }

    /// All state events of a type, keyed by their state key.
    pub fn events_of_type<'a>(
        &'a self,
        event_type: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a MatrixEvent)> + 'a {
        self.events
            .iter()
            .filter(move |((t, _), _)| t == event_type)
            .map(|((_, state_key), event)| (state_key.as_str(), event))
    }

    /// The explicit name of the room.
    pub fn name(&self) -> Option<String> {
        self.content("m.room.name", "")?
            .get("name")
            .and_then(JsonValue::as_str)
            .filter(|name| !name.is_empty())
            .map(ToOwned::to_owned)
    }

    /// The canonical alias of the room.
    pub fn canonical_alias(&self) -> Option<String> {
        match self.get("m.room.canonical_alias", "")?.typed_content() {
            AnyEventContent::CanonicalAlias(content) => content.alias.map(|a| a.to_string()),
            _ => None,
        }
    }

    /// The alternative aliases of the room, followed by the legacy
    /// `m.room.aliases` of every server.
    pub fn alt_aliases(&self) -> Vec<String> {
        let mut aliases = match self.get("m.room.canonical_alias", "").map(|e| e.typed_content()) {
            Some(AnyEventContent::CanonicalAlias(content)) => {
                content.alt_aliases.iter().map(ToString::to_string).collect()
            }
            _ => Vec::new(),
        };

        for (_, event) in self.events_of_type("m.room.aliases") {
            if let AnyEventContent::Aliases(legacy) = event.typed_content() {
                aliases.extend(legacy);
            }
        }

        aliases
    }

    /// The history visibility, `shared` if the room doesn't set one.
    pub fn history_visibility(&self) -> HistoryVisibility {
        match self.get("m.room.history_visibility", "").map(|e| e.typed_content()) {
            Some(AnyEventContent::HistoryVisibility(content)) => content.history_visibility,
            _ => HistoryVisibility::Shared,
        }
    }

    /// The content of the `m.room.encryption` event.
    pub fn encryption(&self) -> Option<&JsonValue> {
        self.content("m.room.encryption", "").filter(|c| c.get("algorithm").is_some())
    }

    /// Is encryption enabled in the room.
    pub fn is_encrypted(&self) -> bool {
        self.encryption().is_some()
    }

    /// The membership of a user.
    pub fn membership(&self, user_id: &UserId) -> Option<MembershipState> {
        let event = self.get("m.room.member", user_id.as_str())?;
        member_content(event).map(|(membership, _)| membership)
    }

    /// All members of the room, whatever their membership, sorted by user id.
    pub fn members(&self) -> Vec<RoomMember> {
        let raw: Vec<_> = self
            .events_of_type("m.room.member")
            .filter_map(|(state_key, event)| {
                let user_id = UserId::parse(state_key).ok()?;
                let (membership, display_name) = member_content(event)?;
                Some((user_id, membership, display_name, event.sender()))
            })
            .collect();

        // Display names of joined and invited members, to detect the ones
        // that need disambiguation.
        let mut name_counts: HashMap<&str, usize> = HashMap::new();
        for (_, membership, display_name, _) in &raw {
            if let (Some(name), MembershipState::Join | MembershipState::Invite) =
                (display_name, membership)
            {
                *name_counts.entry(name.as_str()).or_default() += 1;
            }
        }

        raw.iter()
            .map(|(user_id, membership, display_name, sender)| {
                let name = match display_name {
                    Some(name) if name_counts.get(name.as_str()).copied().unwrap_or(0) > 1 => {
                        format!("{name} ({user_id})")
                    }
                    Some(name) if !name.trim().is_empty() => name.clone(),
                    _ => user_id.to_string(),
                };

                RoomMember {
                    user_id: user_id.clone(),
                    membership: membership.clone(),
                    display_name: display_name.clone(),
                    name,
                    event_sender: sender.clone(),
                }
            })
            .collect()
    }

    /// A single member of the room.
    pub fn member(&self, user_id: &UserId) -> Option<RoomMember> {
        self.members().into_iter().find(|m| *m.user_id == *user_id)
    }

    /// The users with the given membership.
    pub fn users_with_membership(&self, membership: &MembershipState) -> Vec<OwnedUserId> {
        self.members()
            .into_iter()
            .filter(|m| &m.membership == membership)
            .map(|m| m.user_id)
            .collect()
    }
}

fn member_content(event: &MatrixEvent) -> Option<(MembershipState, Option<String>)> {
    match event.typed_content() {
        AnyEventContent::Member(content) => Some((content.membership, content.displayname)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use matrix_client_test::{EventFactory, ALICE, BOB, CAROL};
    use ruma::events::room::{history_visibility::HistoryVisibility, member::MembershipState};
    use serde_json::json;

    use super::RoomState;
    use crate::event::MatrixEvent;

    fn event(builder: matrix_client_test::EventBuilder) -> MatrixEvent {
        MatrixEvent::new(builder.into()).unwrap()
    }

    #[test]
    fn test_display_names_are_disambiguated() {
        let f = EventFactory::new();
        let mut state = RoomState::new();

        state.apply(&event(f.membership(*ALICE, "join", Some("Sam"))), true);
        state.apply(&event(f.membership(*BOB, "join", Some("Sam"))), true);
        state.apply(&event(f.membership(*CAROL, "leave", Some("Carol"))), true);

        let alice = state.member(*ALICE).unwrap();
        assert_eq!(alice.name, "Sam (@alice:server.name)");
        assert_eq!(state.member(*CAROL).unwrap().name, "Carol");
        assert_eq!(state.membership(*CAROL), Some(MembershipState::Leave));
        assert_eq!(state.users_with_membership(&MembershipState::Join).len(), 2);
    }

    #[test]
    fn test_walking_backward_restores_the_previous_state() {
        let f = EventFactory::new();
        let mut state = RoomState::new();

        let rename = event(f.room_name("New").prev_content(json!({ "name": "Old" })));
        state.apply(&rename, true);
        assert_eq!(state.name().as_deref(), Some("New"));

        state.apply(&rename, false);
        assert_eq!(state.name().as_deref(), Some("Old"));

        let first_name = event(f.room_name("First"));
        state.apply(&first_name, false);
        assert_eq!(state.name(), None);
    }

    #[test]
    fn test_aliases_and_visibility() {
        let f = EventFactory::new();
        let mut state = RoomState::new();
        assert_eq!(state.history_visibility(), HistoryVisibility::Shared);
        assert!(!state.is_encrypted());

        state.apply(&event(f.canonical_alias(None, &["#alt:localhost"])), true);
        state.apply(&event(f.history_visibility("joined")), true);
        state.apply(&event(f.room_encryption()), true);

        assert_eq!(state.canonical_alias(), None);
        assert_eq!(state.alt_aliases(), ["#alt:localhost"]);
        assert_eq!(state.history_visibility(), HistoryVisibility::Joined);
        assert!(state.is_encrypted());
    }
}
