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

//! The event model: a raw event as the server sent it, plus the state the
//! client attaches to it.

mod arena;
mod content;
mod redaction;
mod status;

use std::fmt;

use matrix_client_common::deserialized_responses::{
    DecryptedRoomEvent, EncryptionInfo, UnableToDecryptInfo,
};
use once_cell::sync::Lazy;
use ruma::{
    push::Action, EventId, OwnedEventId, OwnedRoomId, OwnedTransactionId, OwnedUserId,
    TransactionId,
};
use serde_json::{json, Map, Value as JsonValue};
use tracing::warn;

pub use self::{
    arena::{EventArena, EventKey},
    content::AnyEventContent,
    status::EventStatus,
};
use crate::error::{Error, Result};

/// How an event is identified in a timeline.
///
/// Local echoes are identified by their transaction id until the server
/// assigns an event id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimelineEventItemId {
    /// The event id assigned by the server.
    EventId(OwnedEventId),
    /// The transaction id of a local echo.
    TransactionId(OwnedTransactionId),
}

impl fmt::Display for TimelineEventItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EventId(event_id) => event_id.fmt(f),
            Self::TransactionId(txn_id) => txn_id.fmt(f),
        }
    }
}

impl From<OwnedEventId> for TimelineEventItemId {
    fn from(event_id: OwnedEventId) -> Self {
        Self::EventId(event_id)
    }
}

impl From<&EventId> for TimelineEventItemId {
    fn from(event_id: &EventId) -> Self {
        Self::EventId(event_id.to_owned())
    }
}

impl From<OwnedTransactionId> for TimelineEventItemId {
    fn from(txn_id: OwnedTransactionId) -> Self {
        Self::TransactionId(txn_id)
    }
}

/// The `m.relates_to` field of an event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Relation {
    /// The type of the relation, `m.annotation`, `m.replace`, `m.reference`,
    /// `m.thread` or a custom one.
    pub rel_type: String,
    /// The event this event relates to.
    pub event_id: OwnedEventId,
    /// The key of an annotation.
    pub key: Option<String>,
}

/// A room event.
///
/// Wraps the event as the server sent it. Decryption installs the cleartext
/// next to that wire form, the wire form itself only changes on redaction and
/// when a local echo is replaced by its remote echo.
#[derive(Clone, Debug)]
pub struct MatrixEvent {
    raw: Map<String, JsonValue>,
    clear_event: Option<JsonValue>,
    encryption_info: Option<EncryptionInfo>,
    sender_curve25519_key: Option<String>,
    claimed_ed25519_key: Option<String>,
    decryption_failure: Option<UnableToDecryptInfo>,
    status: Option<EventStatus>,
    txn_id: Option<OwnedTransactionId>,
    push_actions: Option<Vec<Action>>,
    locally_redacted_by: Option<TimelineEventItemId>,
    replacing_event: Option<JsonValue>,
}

static EMPTY_OBJECT: Lazy<JsonValue> = Lazy::new(|| JsonValue::Object(Map::new()));

fn get_str<'a>(object: &'a Map<String, JsonValue>, key: &str) -> Option<&'a str> {
    object.get(key).and_then(JsonValue::as_str)
}

fn parse_id<T: serde::de::DeserializeOwned>(value: Option<&JsonValue>) -> Option<T> {
    value.and_then(|v| serde_json::from_value(v.clone()).ok())
}

impl MatrixEvent {
    /// Wrap a raw event, it needs to be a JSON object.
    pub fn new(raw: JsonValue) -> Result<Self> {
        let JsonValue::Object(raw) = raw else {
            return Err(Error::NotAnObject);
        };

        Ok(Self {
            raw,
            clear_event: None,
            encryption_info: None,
            sender_curve25519_key: None,
            claimed_ed25519_key: None,
            decryption_failure: None,
            status: None,
            txn_id: None,
            push_actions: None,
            locally_redacted_by: None,
            replacing_event: None,
        })
    }

    /// Create an event we're about to send.
    ///
    /// The event starts in the [`EventStatus::Sending`] status and doesn't
    /// have an event id.
    pub fn new_local(raw: JsonValue) -> Result<Self> {
        let mut event = Self::new(raw)?;
        event.raw.remove("event_id");
        event.status = Some(EventStatus::Sending);
        Ok(event)
    }

    /// The raw event in its wire form.
    pub fn raw(&self) -> &Map<String, JsonValue> {
        &self.raw
    }

    /// The wire form as a JSON value.
    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(self.raw.clone())
    }

    /// The event id, `None` for local echoes the server didn't confirm yet.
    pub fn event_id(&self) -> Option<OwnedEventId> {
        parse_id(self.raw.get("event_id"))
    }

    /// The transaction id of a local echo.
    pub fn txn_id(&self) -> Option<&TransactionId> {
        self.txn_id.as_deref()
    }

    pub(crate) fn set_txn_id(&mut self, txn_id: OwnedTransactionId) {
        self.txn_id = Some(txn_id);
    }

    /// The id this event is known by in timelines.
    ///
    /// The event id if there is one, the transaction id of local echoes
    /// otherwise.
    pub fn item_id(&self) -> Option<TimelineEventItemId> {
        self.event_id()
            .map(TimelineEventItemId::EventId)
            .or_else(|| self.txn_id.clone().map(TimelineEventItemId::TransactionId))
    }

    /// The transaction id the server echoes back in the unsigned data of our
    /// own events.
    pub fn unsigned_transaction_id(&self) -> Option<OwnedTransactionId> {
        let unsigned = self.raw.get("unsigned")?.as_object()?;
        get_str(unsigned, "transaction_id").map(Into::into)
    }

    /// The sender, reading the legacy `user_id` field as a fallback.
    pub fn sender(&self) -> Option<OwnedUserId> {
        parse_id(self.raw.get("sender").or_else(|| self.raw.get("user_id")))
    }

    /// The room the event belongs to.
    pub fn room_id(&self) -> Option<OwnedRoomId> {
        parse_id(self.raw.get("room_id"))
    }

    /// The type of the event.
    ///
    /// The type of the cleartext for decrypted events.
    pub fn event_type(&self) -> &str {
        self.clear_event
            .as_ref()
            .and_then(|clear| clear.get("type"))
            .and_then(JsonValue::as_str)
            .unwrap_or_else(|| self.wire_type())
    }

    /// The type of the event as it was sent over the wire.
    pub fn wire_type(&self) -> &str {
        get_str(&self.raw, "type").unwrap_or_default()
    }

    /// The timestamp of the event in milliseconds, reading the legacy `ts`
    /// field as a fallback.
    pub fn ts(&self) -> Option<u64> {
        self.raw.get("origin_server_ts").or_else(|| self.raw.get("ts")).and_then(JsonValue::as_u64)
    }

    /// How old the event was when the server sent it to us, in milliseconds.
    pub fn age(&self) -> Option<u64> {
        self.raw
            .get("unsigned")
            .and_then(|u| u.get("age"))
            .or_else(|| self.raw.get("age"))
            .and_then(JsonValue::as_u64)
    }

    /// The state key, `None` for non-state events.
    pub fn state_key(&self) -> Option<&str> {
        get_str(&self.raw, "state_key")
    }

    /// Is this a state event.
    pub fn is_state(&self) -> bool {
        self.raw.contains_key("state_key")
    }

    /// The content of the event.
    ///
    /// The cleartext content of decrypted events, the wire content otherwise,
    /// an empty object if the event has no content.
    pub fn content(&self) -> &JsonValue {
        let content = self
            .clear_event
            .as_ref()
            .and_then(|clear| clear.get("content"))
            .or_else(|| self.raw.get("content"));

        match content {
            Some(content) if content.is_object() => content,
            _ => &EMPTY_OBJECT,
        }
    }

    /// The content as it was sent over the wire.
    pub fn wire_content(&self) -> &JsonValue {
        match self.raw.get("content") {
            Some(content) if content.is_object() => content,
            _ => &EMPTY_OBJECT,
        }
    }

    /// The content parsed according to the event type.
    pub fn typed_content(&self) -> AnyEventContent {
        AnyEventContent::parse(self.event_type(), self.content())
    }

    /// The content the state had before this event.
    pub fn prev_content(&self) -> &JsonValue {
        self.raw
            .get("unsigned")
            .and_then(|u| u.get("prev_content"))
            .or_else(|| self.raw.get("prev_content"))
            .filter(|c| c.is_object())
            .unwrap_or(&EMPTY_OBJECT)
    }

    /// The content of a state event seen in one direction of the timeline.
    ///
    /// Walking forward the event sets its content, walking backward it
    /// restores the previous content.
    pub fn directional_content(&self, forward_looking: bool) -> &JsonValue {
        if forward_looking {
            self.content()
        } else {
            self.prev_content()
        }
    }

    /// The event id a redaction redacts.
    pub fn redacts(&self) -> Option<OwnedEventId> {
        parse_id(self.raw.get("redacts")).or_else(|| parse_id(self.content().get("redacts")))
    }

    /// Is this a redaction.
    pub fn is_redaction(&self) -> bool {
        self.event_type() == "m.room.redaction"
    }

    /// The relation of the event.
    ///
    /// Read from the wire content, since `m.relates_to` stays unencrypted.
    pub fn relation(&self) -> Option<Relation> {
        let relates_to = self
            .wire_content()
            .get("m.relates_to")
            .or_else(|| self.content().get("m.relates_to"))?
            .as_object()?;

        let rel_type = get_str(relates_to, "rel_type")?.to_owned();
        let event_id = parse_id(relates_to.get("event_id"))?;
        let key = get_str(relates_to, "key").map(ToOwned::to_owned);

        Some(Relation { rel_type, event_id, key })
    }

    /// The root of the thread this event replies in, `None` for events that
    /// aren't a thread reply.
    pub fn thread_root_id(&self) -> Option<OwnedEventId> {
        self.relation().filter(|r| r.rel_type == "m.thread").map(|r| r.event_id)
    }

    /// The aggregation of a relation the server bundled with this event.
    pub fn server_aggregated_relation(&self, rel_type: &str) -> Option<&JsonValue> {
        self.raw.get("unsigned")?.get("m.relations")?.get(rel_type)
    }

    /// The send status, `None` for remote events.
    pub fn status(&self) -> Option<EventStatus> {
        self.status
    }

    /// Move the send status, validating the move.
    pub fn set_status(&mut self, status: EventStatus) -> Result<()> {
        self.status = Some(EventStatus::transition(self.status, status)?);
        Ok(())
    }

    /// Does the event wait to be sent.
    pub fn is_sending(&self) -> bool {
        matches!(
            self.status,
            Some(EventStatus::Sending | EventStatus::Encrypting | EventStatus::Queued)
        )
    }

    /// Give a local echo the event id the server assigned.
    pub fn replace_local_event_id(&mut self, event_id: &EventId) {
        self.raw.insert("event_id".to_owned(), event_id.as_str().into());
    }

    /// The push actions of the event for our user.
    pub fn push_actions(&self) -> Option<&[Action]> {
        self.push_actions.as_deref()
    }

    /// Set the push actions of the event for our user.
    pub fn set_push_actions(&mut self, actions: Option<Vec<Action>>) {
        self.push_actions = actions;
    }

    /// Turn a local event into an encrypted one.
    ///
    /// The cleartext is kept so the event can still be shown, the operation
    /// can't be undone.
    pub fn make_encrypted(
        &mut self,
        event_type: &str,
        cipher_content: JsonValue,
        sender_curve25519_key: &str,
        claimed_ed25519_key: &str,
    ) {
        let clear = json!({
            "type": self.wire_type(),
            "content": self.wire_content(),
        });

        self.raw.insert("type".to_owned(), event_type.into());
        self.raw.insert("content".to_owned(), cipher_content);
        self.clear_event = Some(clear);
        self.sender_curve25519_key = Some(sender_curve25519_key.to_owned());
        self.claimed_ed25519_key = Some(claimed_ed25519_key.to_owned());
    }

    /// Is the event encrypted on the wire.
    pub fn is_encrypted(&self) -> bool {
        self.wire_type() == "m.room.encrypted"
    }

    /// Is the event encrypted and without cleartext so far.
    pub fn should_attempt_decryption(&self) -> bool {
        self.is_encrypted() && self.clear_event.is_none() && !self.is_redacted()
    }

    /// The cleartext `type` and `content` of the event, if it was encrypted.
    pub fn clear_event(&self) -> Option<&JsonValue> {
        self.clear_event.as_ref()
    }

    /// The megolm session id the event was encrypted with.
    pub fn session_id(&self) -> Option<&str> {
        self.wire_content().get("session_id").and_then(JsonValue::as_str)
    }

    /// Install the result of a successful decryption.
    pub fn set_clear_data(&mut self, decrypted: DecryptedRoomEvent) {
        let DecryptedRoomEvent { event, encryption_info } = decrypted;

        self.clear_event = Some(json!({
            "type": event.get("type").cloned().unwrap_or(JsonValue::Null),
            "content": event.get("content").cloned().unwrap_or_else(|| json!({})),
        }));
        self.sender_curve25519_key = Some(encryption_info.sender_curve25519_key.clone());
        self.claimed_ed25519_key = encryption_info.claimed_ed25519_key.clone();
        self.encryption_info = Some(encryption_info);
        self.decryption_failure = None;
    }

    /// Mark the event as one we can't decrypt.
    pub fn set_decryption_failure(&mut self, info: UnableToDecryptInfo) {
        self.clear_event = None;
        self.encryption_info = None;
        self.decryption_failure = Some(info);
    }

    /// Why the event couldn't be decrypted.
    pub fn decryption_failure(&self) -> Option<&UnableToDecryptInfo> {
        self.decryption_failure.as_ref()
    }

    /// Was the event decrypted successfully.
    pub fn encryption_info(&self) -> Option<&EncryptionInfo> {
        self.encryption_info.as_ref()
    }

    /// The Curve25519 key of the device that sent the event.
    pub fn sender_curve25519_key(&self) -> Option<&str> {
        self.sender_curve25519_key.as_deref()
    }

    /// The Ed25519 key the sender device claims to own.
    pub fn claimed_ed25519_key(&self) -> Option<&str> {
        self.claimed_ed25519_key.as_deref()
    }

    /// The chain of devices the room key of this event was forwarded
    /// through.
    pub fn forwarding_curve25519_key_chain(&self) -> &[String] {
        self.encryption_info
            .as_ref()
            .map(|info| info.forwarding_curve25519_key_chain.as_slice())
            .unwrap_or_default()
    }

    /// Redact the event.
    ///
    /// Applying the same redaction twice leaves the event as the first
    /// application did.
    pub fn make_redacted(&mut self, redaction: &MatrixEvent) {
        let redaction = redaction.to_json();
        redaction::redact(&mut self.raw, &redaction);

        if let Some(clear) = &mut self.clear_event {
            clear["content"] = json!({});
        }
        self.replacing_event = None;
        self.locally_redacted_by = None;
    }

    /// Is the event redacted.
    pub fn is_redacted(&self) -> bool {
        self.redacted_because().is_some()
    }

    /// The redaction that redacted this event.
    pub fn redacted_because(&self) -> Option<&JsonValue> {
        self.raw.get("unsigned")?.get("redacted_because")
    }

    /// Mark the event as redacted by a redaction we're still sending.
    pub fn mark_locally_redacted(&mut self, redaction: TimelineEventItemId) {
        self.locally_redacted_by = Some(redaction);
    }

    /// Forget about a local redaction that was cancelled.
    pub fn unmark_locally_redacted(&mut self) -> Option<TimelineEventItemId> {
        self.locally_redacted_by.take()
    }

    /// The local redaction of this event.
    pub fn locally_redacted_by(&self) -> Option<&TimelineEventItemId> {
        self.locally_redacted_by.as_ref()
    }

    /// Show the event with the content of an edit.
    pub fn make_replaced(&mut self, replacement: Option<&MatrixEvent>) {
        self.replacing_event = replacement.map(MatrixEvent::to_json);
    }

    /// The edit this event is shown with.
    pub fn replacing_event(&self) -> Option<&JsonValue> {
        self.replacing_event.as_ref()
    }

    /// The content to show, the `m.new_content` of the latest edit if there
    /// is one.
    pub fn display_content(&self) -> &JsonValue {
        if self.is_redacted() {
            return self.content();
        }

        self.replacing_event
            .as_ref()
            .and_then(|edit| edit.get("content"))
            .and_then(|content| content.get("m.new_content"))
            .filter(|c| c.is_object())
            .unwrap_or_else(|| self.content())
    }

    /// Replace the wire data of a local echo with its remote echo.
    ///
    /// Cleartext and local redactions are kept, the send status is cleared.
    pub fn handle_remote_echo(&mut self, remote: &MatrixEvent) {
        if remote.clear_event.is_some() {
            self.clear_event = remote.clear_event.clone();
            self.encryption_info = remote.encryption_info.clone();
        }

        if remote.event_id().is_none() {
            warn!("Received a remote echo without an event id");
        }

        self.raw = remote.raw.clone();
        self.status = None;
    }

    /// Replace an event with a newer copy of itself, keeping the decryption.
    pub(crate) fn replace_with(&mut self, other: MatrixEvent) {
        let clear_event = self.clear_event.take();
        let encryption_info = self.encryption_info.take();
        *self = MatrixEvent {
            clear_event: other.clear_event.or(clear_event),
            encryption_info: other.encryption_info.or(encryption_info),
            ..other
        };
    }
}
