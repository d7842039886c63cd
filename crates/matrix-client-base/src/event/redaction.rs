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

//! The keys an event keeps once it's redacted.

use serde_json::{Map, Value as JsonValue};

/// Top-level keys that survive a redaction.
const ALLOWED_KEYS: &[&str] = &[
    "event_id",
    "type",
    "room_id",
    "user_id",
    "sender",
    "state_key",
    "prev_state",
    "content",
    "unsigned",
    "origin_server_ts",
];

/// Content keys that survive a redaction, for the event types that keep any.
fn allowed_content_keys(event_type: &str) -> &'static [&'static str] {
    match event_type {
        "m.room.member" => &["membership"],
        "m.room.create" => &["creator"],
        "m.room.join_rules" => &["join_rule"],
        "m.room.power_levels" => &[
            "ban",
            "events",
            "events_default",
            "kick",
            "redact",
            "state_default",
            "users",
            "users_default",
        ],
        "m.room.aliases" => &["aliases"],
        _ => &[],
    }
}

/// Strip an event down to the keys a redaction keeps and stamp it with the
/// redaction.
pub(super) fn redact(event: &mut Map<String, JsonValue>, redaction: &JsonValue) {
    event.retain(|key, _| ALLOWED_KEYS.contains(&key.as_str()));

    let event_type = event.get("type").and_then(JsonValue::as_str).unwrap_or_default().to_owned();
    let allowed = allowed_content_keys(&event_type);

    match event.get_mut("content").and_then(JsonValue::as_object_mut) {
        Some(content) => content.retain(|key, _| allowed.contains(&key.as_str())),
        None => {
            event.insert("content".to_owned(), JsonValue::Object(Map::new()));
        }
    }

    let unsigned = event.entry("unsigned").or_insert_with(|| JsonValue::Object(Map::new()));
    if !unsigned.is_object() {
        *unsigned = JsonValue::Object(Map::new());
    }
    if let Some(unsigned) = unsigned.as_object_mut() {
        unsigned.insert("redacted_because".to_owned(), redaction.clone());
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use similar_asserts::assert_eq;

    use super::redact;

    #[test]
    fn test_member_event_keeps_membership() {
        let redaction = json!({ "type": "m.room.redaction", "event_id": "$redaction" });
        let mut event = json!({
            "type": "m.room.member",
            "event_id": "$member",
            "state_key": "@alice:server.name",
            "sender": "@alice:server.name",
            "hashes": { "sha256": "abc" },
            "content": {
                "membership": "join",
                "displayname": "Alice",
                "avatar_url": "mxc://localhost/alice",
            },
        });

        redact(event.as_object_mut().unwrap(), &redaction);

        assert_eq!(
            event,
            json!({
                "type": "m.room.member",
                "event_id": "$member",
                "state_key": "@alice:server.name",
                "sender": "@alice:server.name",
                "content": { "membership": "join" },
                "unsigned": { "redacted_because": redaction },
            })
        );
    }

    #[test]
    fn test_power_levels_keep_their_levels() {
        let mut event = matrix_client_test::test_json::POWER_LEVELS.clone();
        redact(event.as_object_mut().unwrap(), &json!({ "event_id": "$redaction" }));

        let content = event["content"].as_object().unwrap();
        assert!(content.contains_key("ban"));
        assert!(content.contains_key("users"));
        assert!(!content.contains_key("invite"));
        assert!(!content.contains_key("notifications"));
        assert_eq!(event["unsigned"]["age"], 703_422);
    }

    #[test]
    fn test_message_loses_its_content() {
        let mut event = json!({
            "type": "m.room.message",
            "event_id": "$message",
            "content": { "body": "secret", "msgtype": "m.text" },
        });

        redact(event.as_object_mut().unwrap(), &json!({ "event_id": "$redaction" }));
        assert_eq!(event["content"], json!({}));
    }
}
