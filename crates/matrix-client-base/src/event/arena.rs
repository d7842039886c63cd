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

use std::collections::HashMap;

use ruma::{EventId, OwnedEventId, OwnedTransactionId, TransactionId};

use super::{MatrixEvent, TimelineEventItemId};

/// The handle of an event in an [`EventArena`].
///
/// Handles stay valid for the lifetime of the arena, the event id of the
/// event behind a handle may change when a local echo is confirmed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventKey(usize);

/// The events of a room.
///
/// Timelines, receipts and relations refer to events through [`EventKey`]s,
/// so an event that shows up in more than one timeline set is a single
/// instance.
#[derive(Debug, Default)]
pub struct EventArena {
    events: Vec<Option<MatrixEvent>>,
    by_event_id: HashMap<OwnedEventId, EventKey>,
    by_txn_id: HashMap<OwnedTransactionId, EventKey>,
}

impl EventArena {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an event, indexing it by its ids.
    pub fn insert(&mut self, event: MatrixEvent) -> EventKey {
        let key = EventKey(self.events.len());

        if let Some(event_id) = event.event_id() {
            self.by_event_id.insert(event_id, key);
        }
        if let Some(txn_id) = event.txn_id() {
            self.by_txn_id.insert(txn_id.to_owned(), key);
        }

        self.events.push(Some(event));
        key
    }

    /// Drop an event.
    pub fn remove(&mut self, key: EventKey) -> Option<MatrixEvent> {
        let event = self.events.get_mut(key.0)?.take()?;

        if let Some(event_id) = event.event_id() {
            if self.by_event_id.get(&event_id) == Some(&key) {
                self.by_event_id.remove(&event_id);
            }
        }
        if let Some(txn_id) = event.txn_id() {
            if self.by_txn_id.get(txn_id) == Some(&key) {
                self.by_txn_id.remove(txn_id);
            }
        }

        Some(event)
    }

    pub fn get(&self, key: EventKey) -> Option<&MatrixEvent> {
        self.events.get(key.0)?.as_ref()
    }

    pub fn get_mut(&mut self, key: EventKey) -> Option<&mut MatrixEvent> {
        self.events.get_mut(key.0)?.as_mut()
    }

    /// The handle of the event with the given event id.
    pub fn key_by_event_id(&self, event_id: &EventId) -> Option<EventKey> {
        self.by_event_id.get(event_id).copied()
    }

    /// The handle of the local echo with the given transaction id.
    pub fn key_by_txn_id(&self, txn_id: &TransactionId) -> Option<EventKey> {
        self.by_txn_id.get(txn_id).copied()
    }

    /// The handle of an event by any of its ids.
    pub fn key_by_item_id(&self, id: &TimelineEventItemId) -> Option<EventKey> {
        match id {
            TimelineEventItemId::EventId(event_id) => self.key_by_event_id(event_id),
            TimelineEventItemId::TransactionId(txn_id) => self.key_by_txn_id(txn_id),
        }
    }

    /// Look up an event by its event id.
    pub fn by_event_id(&self, event_id: &EventId) -> Option<&MatrixEvent> {
        self.get(self.key_by_event_id(event_id)?)
    }

    /// Index the event behind `key` under its current ids.
    ///
    /// Needs to be called after the event id or transaction id of the event
    /// changed.
    pub fn reindex(&mut self, key: EventKey) {
        let Some(event) = self.get(key) else {
            return;
        };
        let event_id = event.event_id();
        let txn_id = event.txn_id().map(ToOwned::to_owned);

        if let Some(event_id) = event_id {
            self.by_event_id.retain(|_, k| *k != key);
            self.by_event_id.insert(event_id, key);
        }
        if let Some(txn_id) = txn_id {
            self.by_txn_id.retain(|_, k| *k != key);
            self.by_txn_id.insert(txn_id, key);
        }
    }

    /// Iterate over all live events.
    pub fn iter(&self) -> impl Iterator<Item = (EventKey, &MatrixEvent)> {
        self.events.iter().enumerate().filter_map(|(i, e)| Some((EventKey(i), e.as_ref()?)))
    }

    /// The number of events in the arena.
    pub fn len(&self) -> usize {
        self.events.iter().filter(|e| e.is_some()).count()
    }

    /// Is the arena empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use matrix_client_test::{EventFactory, ALICE};
    use ruma::{event_id, OwnedTransactionId};

    use super::EventArena;
    use crate::event::{MatrixEvent, TimelineEventItemId};

    #[test]
    fn test_local_echo_keeps_its_key_when_confirmed() {
        let f = EventFactory::new().sender(*ALICE);
        let mut arena = EventArena::new();

        let txn_id: OwnedTransactionId = "t1".into();
        let mut event = MatrixEvent::new_local(f.text_msg("hi").into()).unwrap();
        event.set_txn_id(txn_id.clone());
        let key = arena.insert(event);

        assert_eq!(
            arena.key_by_item_id(&TimelineEventItemId::TransactionId(txn_id.clone())),
            Some(key)
        );

        let event_id = event_id!("$confirmed:localhost");
        arena.get_mut(key).unwrap().replace_local_event_id(event_id);
        arena.reindex(key);

        assert_eq!(arena.key_by_event_id(event_id), Some(key));
        assert_eq!(arena.key_by_txn_id(&txn_id), Some(key));

        let removed = arena.remove(key).unwrap();
        assert_eq!(removed.event_id().as_deref(), Some(event_id));
        assert!(arena.key_by_event_id(event_id).is_none());
        assert!(arena.is_empty());
    }
}
