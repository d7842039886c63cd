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

use ruma::events::{
    reaction::ReactionEventContent,
    receipt::ReceiptEventContent,
    room::{
        canonical_alias::RoomCanonicalAliasEventContent, create::RoomCreateEventContent,
        encrypted::RoomEncryptedEventContent, encryption::RoomEncryptionEventContent,
        history_visibility::RoomHistoryVisibilityEventContent, member::RoomMemberEventContent,
        message::RoomMessageEventContent, name::RoomNameEventContent,
        redaction::RoomRedactionEventContent,
        third_party_invite::RoomThirdPartyInviteEventContent,
    },
    tag::TagEventContent,
    typing::TypingEventContent,
};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};
use tracing::debug;

/// The content of an event, parsed according to its type.
///
/// Types we don't know about, and content that doesn't match the shape of
/// its type, end up as [`AnyEventContent::Custom`].
#[derive(Clone, Debug)]
#[allow(clippy::large_enum_variant)]
pub enum AnyEventContent {
    /// `m.room.message`
    Message(RoomMessageEventContent),
    /// `m.room.encrypted`
    Encrypted(RoomEncryptedEventContent),
    /// `m.room.member`
    Member(RoomMemberEventContent),
    /// `m.room.name`
    Name(RoomNameEventContent),
    /// `m.room.canonical_alias`
    CanonicalAlias(RoomCanonicalAliasEventContent),
    /// The legacy `m.room.aliases`.
    Aliases(Vec<String>),
    /// `m.room.encryption`
    Encryption(RoomEncryptionEventContent),
    /// `m.room.history_visibility`
    HistoryVisibility(RoomHistoryVisibilityEventContent),
    /// `m.room.redaction`
    Redaction(RoomRedactionEventContent),
    /// `m.reaction`
    Reaction(ReactionEventContent),
    /// `m.receipt`
    Receipt(ReceiptEventContent),
    /// `m.typing`
    Typing(TypingEventContent),
    /// `m.tag`
    Tag(TagEventContent),
    /// `m.room.create`
    Create(RoomCreateEventContent),
    /// `m.room.third_party_invite`
    ThirdPartyInvite(RoomThirdPartyInviteEventContent),
    /// Anything else.
    Custom {
        /// The type of the event.
        event_type: String,
        /// The raw content.
        content: Map<String, JsonValue>,
    },
}

impl AnyEventContent {
    /// Parse the content of an event of the given type.
    pub fn parse(event_type: &str, content: &JsonValue) -> Self {
        fn typed<T: DeserializeOwned>(
            event_type: &str,
            content: &JsonValue,
            wrap: impl FnOnce(T) -> AnyEventContent,
        ) -> AnyEventContent {
            match serde_json::from_value(content.clone()) {
                Ok(content) => wrap(content),
                Err(e) => {
                    debug!(event_type, "Event content doesn't match its type: {e}");
                    AnyEventContent::custom(event_type, content)
                }
            }
        }

        match event_type {
            "m.room.message" => typed(event_type, content, Self::Message),
            "m.room.encrypted" => typed(event_type, content, Self::Encrypted),
            "m.room.member" => typed(event_type, content, Self::Member),
            "m.room.name" => typed(event_type, content, Self::Name),
            "m.room.canonical_alias" => typed(event_type, content, Self::CanonicalAlias),
            "m.room.aliases" => match content.get("aliases").and_then(JsonValue::as_array) {
                Some(aliases) => Self::Aliases(
                    aliases.iter().filter_map(JsonValue::as_str).map(ToOwned::to_owned).collect(),
                ),
                None => Self::custom(event_type, content),
            },
            "m.room.encryption" => typed(event_type, content, Self::Encryption),
            "m.room.history_visibility" => typed(event_type, content, Self::HistoryVisibility),
            "m.room.redaction" => typed(event_type, content, Self::Redaction),
            "m.reaction" => typed(event_type, content, Self::Reaction),
            "m.receipt" => typed(event_type, content, Self::Receipt),
            "m.typing" => typed(event_type, content, Self::Typing),
            "m.tag" => typed(event_type, content, Self::Tag),
            "m.room.create" => typed(event_type, content, Self::Create),
            "m.room.third_party_invite" => typed(event_type, content, Self::ThirdPartyInvite),
            _ => Self::custom(event_type, content),
        }
    }

    fn custom(event_type: &str, content: &JsonValue) -> Self {
        Self::Custom {
            event_type: event_type.to_owned(),
            content: content.as_object().cloned().unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_let;
    use ruma::events::room::member::MembershipState;
    use serde_json::json;

    use super::AnyEventContent;

    #[test]
    fn test_known_types_are_parsed() {
        let content = AnyEventContent::parse("m.room.member", &json!({ "membership": "invite" }));
        assert_let!(AnyEventContent::Member(member) = content);
        assert_eq!(member.membership, MembershipState::Invite);

        let content = AnyEventContent::parse(
            "m.room.aliases",
            &json!({ "aliases": ["#a:localhost", "#b:localhost"] }),
        );
        assert_let!(AnyEventContent::Aliases(aliases) = content);
        assert_eq!(aliases, ["#a:localhost", "#b:localhost"]);
    }

    #[test]
    fn test_unknown_and_malformed_content_is_custom() {
        let content = AnyEventContent::parse("org.example.custom", &json!({ "answer": 42 }));
        assert_let!(AnyEventContent::Custom { event_type, content } = content);
        assert_eq!(event_type, "org.example.custom");
        assert_eq!(content["answer"], 42);

        let content = AnyEventContent::parse("m.room.member", &json!({ "membership": 3 }));
        assert_let!(AnyEventContent::Custom { .. } = content);
    }
}
