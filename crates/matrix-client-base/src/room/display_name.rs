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

use ruma::{events::room::member::MembershipState, OwnedUserId, UserId};
use serde::{Deserialize, Serialize};

use super::{RoomMember, RoomState};

/// How many members are used to name a room without a name.
const MAX_HEROES: usize = 5;

/// The `summary` of a room, as sent by sync.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSummary {
    /// The members the server picked to name the room.
    #[serde(rename = "m.heroes", default)]
    pub heroes: Vec<OwnedUserId>,
    /// The number of joined members.
    #[serde(rename = "m.joined_member_count", default)]
    pub joined_member_count: Option<u64>,
    /// The number of invited members.
    #[serde(rename = "m.invited_member_count", default)]
    pub invited_member_count: Option<u64>,
}

fn join_names(names: &[String], count: usize) -> Option<String> {
    match (names, count) {
        ([], _) | (_, 0) => None,
        ([name, ..], 1) => Some(name.clone()),
        ([first, second, ..], 2) => Some(format!("{first} and {second}")),
        ([first], 2) => Some(format!("{first} and 1 other")),
        ([first, ..], count) => Some(format!("{first} and {} others", count - 1)),
    }
}

fn is_joined_or_invited(member: &RoomMember) -> bool {
    matches!(member.membership, MembershipState::Join | MembershipState::Invite)
}

/// Compute the name of a room.
///
/// In order: the name of the room, its canonical alias, its first alternative
/// alias, the inviter when we're invited, the other members, and finally
/// "Empty room", mentioning the members who left if there are any.
pub(crate) fn calculate_room_name(
    state: &RoomState,
    own_user_id: &UserId,
    summary: &RoomSummary,
) -> String {
    if let Some(name) = state.name().filter(|name| !name.trim().is_empty()) {
        return name.trim().to_owned();
    }

    if let Some(alias) = state.canonical_alias() {
        return alias;
    }

    if let Some(alias) = state.alt_aliases().into_iter().next() {
        return alias;
    }

    let members = state.members();
    let name_of = |user_id: &UserId| {
        members
            .iter()
            .find(|member| *member.user_id == *user_id)
            .map_or_else(|| user_id.to_string(), |member| member.name.clone())
    };

    if state.membership(own_user_id) == Some(MembershipState::Invite) {
        let inviter = state.member(own_user_id).and_then(|member| member.event_sender);
        if let Some(inviter) = inviter.filter(|inviter| **inviter != *own_user_id) {
            return name_of(&inviter);
        }
    }

    let others: Vec<&RoomMember> = members
        .iter()
        .filter(|member| *member.user_id != *own_user_id && is_joined_or_invited(member))
        .collect();

    let names: Vec<String> = if summary.heroes.is_empty() {
        others.iter().take(MAX_HEROES).map(|member| member.name.clone()).collect()
    } else {
        summary
            .heroes
            .iter()
            .filter(|hero| ***hero != *own_user_id)
            .take(MAX_HEROES)
            .map(|hero| name_of(hero))
            .collect()
    };

    let other_count = match (summary.joined_member_count, summary.invited_member_count) {
        (None, None) => others.len(),
        (joined, invited) => {
            let total = joined.unwrap_or_default() + invited.unwrap_or_default();
            usize::try_from(total.saturating_sub(1)).unwrap_or(usize::MAX)
        }
    };

    if let Some(name) = join_names(&names, other_count) {
        return name;
    }

    let left: Vec<String> = members
        .iter()
        .filter(|member| {
            *member.user_id != *own_user_id
                && matches!(member.membership, MembershipState::Leave | MembershipState::Ban)
        })
        .take(MAX_HEROES)
        .map(|member| member.name.clone())
        .collect();

    match join_names(&left, left.len()) {
        Some(names) => format!("Empty room (was {names})"),
        None => "Empty room".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use matrix_client_test::{EventFactory, ALICE, BOB, CAROL};
    use ruma::{user_id, UserId};

    use super::{calculate_room_name, RoomSummary};
    use crate::{event::MatrixEvent, room::RoomState};

    fn own_user() -> &'static UserId {
        user_id!("@me:localhost")
    }

    fn state(events: Vec<serde_json::Value>) -> RoomState {
        let mut state = RoomState::new();
        for event in events {
            state.apply(&MatrixEvent::new(event).unwrap(), true);
        }
        state
    }

    #[test]
    fn test_two_members_are_joined_with_and() {
        let f = EventFactory::new();
        let state = state(vec![
            f.membership(own_user(), "join", Some("Me")).into(),
            f.membership(*ALICE, "join", Some("Alice")).into(),
            f.membership(*BOB, "join", Some("Bob")).into(),
        ]);

        let name = calculate_room_name(&state, own_user(), &RoomSummary::default());
        assert_eq!(name, "Alice and Bob");
    }

    #[test]
    fn test_explicit_names_come_first() {
        let f = EventFactory::new();
        let mut events: Vec<serde_json::Value> = vec![
            f.membership(*ALICE, "join", Some("Alice")).into(),
            f.canonical_alias(None, &["#alt:localhost"]).into(),
        ];
        let summary = RoomSummary::default();

        let name = calculate_room_name(&state(events.clone()), own_user(), &summary);
        assert_eq!(name, "#alt:localhost");

        events.push(f.canonical_alias(Some("#main:localhost"), &[]).into());
        let name = calculate_room_name(&state(events.clone()), own_user(), &summary);
        assert_eq!(name, "#main:localhost");

        events.push(f.room_name("  The room ").into());
        assert_eq!(calculate_room_name(&state(events), own_user(), &summary), "The room");
    }

    #[test]
    fn test_many_members_are_counted() {
        let f = EventFactory::new();
        let state = state(vec![
            f.membership(*ALICE, "join", Some("Alice")).into(),
            f.membership(*BOB, "invite", Some("Bob")).into(),
            f.membership(*CAROL, "join", None).into(),
        ]);

        assert_eq!(
            calculate_room_name(&state, own_user(), &RoomSummary::default()),
            "Alice and 2 others"
        );

        let summary = RoomSummary {
            heroes: vec![CAROL.to_owned()],
            joined_member_count: Some(2),
            invited_member_count: Some(0),
        };
        assert_eq!(calculate_room_name(&state, own_user(), &summary), CAROL.as_str());
    }

    #[test]
    fn test_a_single_remaining_member_is_singular() {
        let f = EventFactory::new();
        let state = state(vec![f.membership(*ALICE, "join", Some("Alice")).into()]);
        let summary = RoomSummary {
            heroes: vec![ALICE.to_owned()],
            joined_member_count: Some(3),
            invited_member_count: None,
        };

        assert_eq!(calculate_room_name(&state, own_user(), &summary), "Alice and 1 other");
    }

    #[test]
    fn test_invites_are_named_after_the_inviter() {
        let f = EventFactory::new();
        let state = state(vec![
            f.membership(*ALICE, "join", Some("Alice")).into(),
            f.membership(own_user(), "invite", None).sender(*ALICE).into(),
        ]);

        assert_eq!(calculate_room_name(&state, own_user(), &RoomSummary::default()), "Alice");
    }

    #[test]
    fn test_empty_rooms_mention_former_members() {
        let f = EventFactory::new();
        let summary = RoomSummary::default();

        assert_eq!(calculate_room_name(&RoomState::new(), own_user(), &summary), "Empty room");

        let state = state(vec![
            f.membership(own_user(), "join", None).into(),
            f.membership(*ALICE, "leave", Some("Alice")).into(),
        ]);
        assert_eq!(calculate_room_name(&state, own_user(), &summary), "Empty room (was Alice)");
    }
}
