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

//! Builders for raw event JSON, in the shape a homeserver sends it.

use std::sync::atomic::{AtomicU64, Ordering};

use ruma::{EventId, OwnedRoomId, OwnedUserId, RoomId, TransactionId, UserId};
use serde_json::{json, Map, Value as JsonValue};

/// A builder for a single event, obtained through an [`EventFactory`].
#[derive(Clone, Debug)]
pub struct EventBuilder {
    json: Map<String, JsonValue>,
}

impl EventBuilder {
    fn new(event_type: &str, content: JsonValue) -> Self {
        let mut json = Map::new();
        json.insert("type".to_owned(), event_type.into());
        json.insert("content".to_owned(), content);
        Self { json }
    }

    fn set(mut self, key: &str, value: impl Into<JsonValue>) -> Self {
        self.json.insert(key.to_owned(), value.into());
        self
    }

    fn unsigned_mut(&mut self) -> &mut Map<String, JsonValue> {
        let unsigned =
            self.json.entry("unsigned").or_insert_with(|| JsonValue::Object(Map::new()));
        if !unsigned.is_object() {
            *unsigned = JsonValue::Object(Map::new());
        }
        unsigned.as_object_mut().expect("unsigned was just made an object")
    }

    pub fn sender(self, sender: &UserId) -> Self {
        self.set("sender", sender.as_str())
    }

    pub fn room(self, room_id: &RoomId) -> Self {
        self.set("room_id", room_id.as_str())
    }

    pub fn event_id(self, event_id: &EventId) -> Self {
        self.set("event_id", event_id.as_str())
    }

    /// Build a local echo, which doesn't have an event id yet.
    pub fn no_event_id(mut self) -> Self {
        self.json.remove("event_id");
        self
    }

    pub fn server_ts(self, ts: u64) -> Self {
        self.set("origin_server_ts", ts)
    }

    pub fn state_key(self, state_key: &str) -> Self {
        self.set("state_key", state_key)
    }

    pub fn prev_content(mut self, prev_content: JsonValue) -> Self {
        self.unsigned_mut().insert("prev_content".to_owned(), prev_content);
        self
    }

    pub fn unsigned_transaction_id(mut self, txn_id: &TransactionId) -> Self {
        self.unsigned_mut().insert("transaction_id".to_owned(), txn_id.as_str().into());
        self
    }

    /// Add a server-side aggregation of a relation to the event.
    pub fn bundled_relation(mut self, rel_type: &str, relation: JsonValue) -> Self {
        let unsigned = self.unsigned_mut();
        let relations = unsigned
            .entry("m.relations")
            .or_insert_with(|| JsonValue::Object(Map::new()));
        if let Some(relations) = relations.as_object_mut() {
            relations.insert(rel_type.to_owned(), relation);
        }
        self
    }

    /// Set a field of the content.
    pub fn content_field(mut self, key: &str, value: impl Into<JsonValue>) -> Self {
        if let Some(content) = self.json.get_mut("content").and_then(JsonValue::as_object_mut) {
            content.insert(key.to_owned(), value.into());
        }
        self
    }

    pub fn into_json(self) -> JsonValue {
        JsonValue::Object(self.json)
    }
}

impl From<EventBuilder> for JsonValue {
    fn from(builder: EventBuilder) -> Self {
        builder.into_json()
    }
}

/// A factory for events of one room.
///
/// Every event gets a unique event id and a timestamp later than the ones of
/// the events built before it.
#[derive(Debug, Default)]
pub struct EventFactory {
    room: Option<OwnedRoomId>,
    sender: Option<OwnedUserId>,
    next_ts: AtomicU64,
    next_id: AtomicU64,
}

impl EventFactory {
    pub fn new() -> Self {
        Self { next_ts: AtomicU64::new(1_000), ..Default::default() }
    }

    /// Set the room of all the events this factory builds.
    pub fn room(mut self, room_id: &RoomId) -> Self {
        self.room = Some(room_id.to_owned());
        self
    }

    /// Set the default sender of the events this factory builds.
    pub fn sender(mut self, sender: &UserId) -> Self {
        self.sender = Some(sender.to_owned());
        self
    }

    /// Build an event of any type.
    pub fn event(&self, event_type: &str, content: JsonValue) -> EventBuilder {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let ts = self.next_ts.fetch_add(1_000, Ordering::SeqCst);

        let mut builder = EventBuilder::new(event_type, content)
            .set("event_id", format!("$event{id}:localhost"))
            .server_ts(ts);

        if let Some(room) = &self.room {
            builder = builder.room(room);
        }
        if let Some(sender) = &self.sender {
            builder = builder.sender(sender);
        }

        builder
    }

    fn state(&self, event_type: &str, state_key: &str, content: JsonValue) -> EventBuilder {
        self.event(event_type, content).state_key(state_key)
    }

    pub fn text_msg(&self, body: &str) -> EventBuilder {
        self.event("m.room.message", json!({ "msgtype": "m.text", "body": body }))
    }

    /// A `m.room.member` event of `user` with the `join` membership, sent by
    /// `user`.
    pub fn member(&self, user: &UserId) -> EventBuilder {
        self.state("m.room.member", user.as_str(), json!({ "membership": "join" })).sender(user)
    }

    /// A `m.room.member` event of `user` with an explicit membership and
    /// display name.
    pub fn membership(
        &self,
        user: &UserId,
        membership: &str,
        display_name: Option<&str>,
    ) -> EventBuilder {
        let mut content = json!({ "membership": membership });
        if let Some(name) = display_name {
            content["displayname"] = name.into();
        }
        self.state("m.room.member", user.as_str(), content).sender(user)
    }

    pub fn room_name(&self, name: &str) -> EventBuilder {
        self.state("m.room.name", "", json!({ "name": name }))
    }

    pub fn canonical_alias(&self, alias: Option<&str>, alt_aliases: &[&str]) -> EventBuilder {
        let mut content = json!({ "alt_aliases": alt_aliases });
        if let Some(alias) = alias {
            content["alias"] = alias.into();
        }
        self.state("m.room.canonical_alias", "", content)
    }

    pub fn room_encryption(&self) -> EventBuilder {
        self.state(
            "m.room.encryption",
            "",
            json!({
                "algorithm": "m.megolm.v1.aes-sha2",
                "rotation_period_ms": 604_800_000,
                "rotation_period_msgs": 100,
            }),
        )
    }

    pub fn history_visibility(&self, visibility: &str) -> EventBuilder {
        self.state("m.room.history_visibility", "", json!({ "history_visibility": visibility }))
    }

    pub fn redaction(&self, redacts: &EventId) -> EventBuilder {
        self.event("m.room.redaction", json!({ "redacts": redacts }))
            .set("redacts", redacts.as_str())
    }

    pub fn reaction(&self, target: &EventId, key: &str) -> EventBuilder {
        self.event(
            "m.reaction",
            json!({
                "m.relates_to": {
                    "rel_type": "m.annotation",
                    "event_id": target,
                    "key": key,
                }
            }),
        )
    }

    /// An edit of `target`, replacing its body with `new_body`.
    pub fn edit(&self, target: &EventId, new_body: &str) -> EventBuilder {
        self.event(
            "m.room.message",
            json!({
                "msgtype": "m.text",
                "body": format!("* {new_body}"),
                "m.new_content": { "msgtype": "m.text", "body": new_body },
                "m.relates_to": { "rel_type": "m.replace", "event_id": target },
            }),
        )
    }

    pub fn thread_reply(&self, root: &EventId, body: &str) -> EventBuilder {
        self.event(
            "m.room.message",
            json!({
                "msgtype": "m.text",
                "body": body,
                "m.relates_to": { "rel_type": "m.thread", "event_id": root },
            }),
        )
    }

    /// A `m.room.encrypted` event whose `plaintext` field is what a fake
    /// crypto backend hands out once it knows the `session_id`.
    pub fn encrypted(&self, session_id: &str, plaintext: JsonValue) -> EventBuilder {
        self.event(
            "m.room.encrypted",
            json!({
                "algorithm": "m.megolm.v1.aes-sha2",
                "ciphertext": "AwgAEnACgAkLmt6qF84IK++J7UDH2Za1YVchHyprqTqsg",
                "sender_key": "sender_curve_key",
                "session_id": session_id,
                "device_id": "SENDERDEVICE",
                "plaintext": plaintext,
            }),
        )
    }

    /// A `m.receipt` EDU for a single receipt.
    pub fn receipt(
        &self,
        event_id: &EventId,
        receipt_type: &str,
        user: &UserId,
        ts: u64,
    ) -> EventBuilder {
        let builder = EventBuilder::new("m.receipt", json!({}));
        builder.content_field(
            event_id.as_str(),
            json!({ receipt_type: { user.as_str(): { "ts": ts } } }),
        )
    }

    pub fn typing(&self, users: &[&UserId]) -> EventBuilder {
        EventBuilder::new("m.typing", json!({ "user_ids": users }))
    }

    pub fn tag(&self, tag: &str, order: f64) -> EventBuilder {
        EventBuilder::new("m.tag", json!({ "tags": { tag: { "order": order } } }))
    }
}
