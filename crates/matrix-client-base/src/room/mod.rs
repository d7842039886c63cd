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

//! Rooms: the timelines of a room and everything that's attached to them.

mod display_name;
#[cfg(feature = "e2e-encryption")]
mod encryption;
mod ordering;
mod state;
mod thread;

use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap},
    iter,
};

use ruma::{
    events::{receipt::ReceiptType, room::member::MembershipState, tag::TagInfo},
    EventId, MilliSecondsSinceUnixEpoch, OwnedEventId, OwnedRoomId, OwnedTransactionId,
    OwnedUserId, RoomId, TransactionId, UInt, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;
use tracing::{debug, instrument, trace, warn};

#[cfg(feature = "e2e-encryption")]
pub use self::encryption::MissingRoomKeyHandler;
pub use self::{
    display_name::RoomSummary,
    ordering::EventOrdering,
    state::{RoomMember, RoomState},
    thread::Thread,
};
use crate::{
    config::{DuplicateStrategy, PendingEventOrdering, RoomConfig},
    error::{Error, Result},
    event::{EventArena, EventKey, EventStatus, MatrixEvent, TimelineEventItemId},
    read_receipts::{EventReceipt, ReceiptTracker},
    relations::{Relations, RelationsContainer, REPLACE},
    timeline::{Direction, EventFilter, EventTimeline, EventTimelineSet, TimelineId},
};

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// A change in a room, see [`Room::subscribe_updates`].
#[derive(Clone, Debug, PartialEq)]
pub enum RoomUpdate {
    /// An event was added to the timelines.
    Timeline {
        /// The event.
        event: TimelineEventItemId,
    },
    /// An event got redacted, or a redaction of it is being sent.
    Redaction {
        /// The redacted event.
        redacted: OwnedEventId,
        /// The redaction.
        redaction: Option<TimelineEventItemId>,
    },
    /// The local redaction of an event was cancelled.
    RedactionCancelled {
        /// The event that isn't redacted anymore.
        redacted: OwnedEventId,
    },
    /// The send status of a local echo changed.
    ///
    /// The status is `None` once the remote echo was received.
    LocalEcho {
        /// The transaction id of the local echo.
        txn_id: OwnedTransactionId,
        /// The new status.
        status: Option<EventStatus>,
        /// The event id, once the server assigned one.
        event_id: Option<OwnedEventId>,
    },
    /// The relations of an event changed.
    Relations {
        /// The event the relations target.
        target: OwnedEventId,
    },
    /// An event was decrypted, or failed to decrypt.
    #[cfg(feature = "e2e-encryption")]
    Decrypted {
        /// The event.
        event: TimelineEventItemId,
        /// Whether the event could be decrypted.
        success: bool,
    },
    /// Read receipts changed.
    Receipts,
    /// The computed name of the room changed.
    Name(String),
    /// The users typing in the room changed.
    Typing(Vec<OwnedUserId>),
    /// The tags of the room changed.
    Tags,
    /// Room account data was added.
    AccountData {
        /// The type of the account data.
        event_type: String,
    },
    /// The notification counts changed.
    NotificationCounts,
    /// The live timeline was reset.
    TimelineReset,
}

/// The kinds of unread notifications counted for a room.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NotificationCountType {
    /// Every notification.
    Total,
    /// Highlights only.
    Highlight,
}

/// The unread notifications of a room.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadNotificationsCount {
    /// The number of unread highlights.
    pub highlight_count: u64,
    /// The number of unread notifications.
    pub notification_count: u64,
}

/// A room.
///
/// Events are owned by the room in an [`EventArena`]. The unfiltered timeline
/// set, the filtered ones and the threads all refer to the same instance of
/// an event.
#[derive(Debug)]
pub struct Room {
    room_id: OwnedRoomId,
    own_user_id: OwnedUserId,
    config: RoomConfig,
    arena: EventArena,
    timeline_set: EventTimelineSet,
    filtered_sets: Vec<EventTimelineSet>,
    /// Local echoes waiting to be sent, in [`PendingEventOrdering::Detached`]
    /// mode.
    pending: Vec<EventKey>,
    txn_map: HashMap<OwnedTransactionId, EventKey>,
    tags: BTreeMap<String, TagInfo>,
    account_data: BTreeMap<String, MatrixEvent>,
    notification_counts: UnreadNotificationsCount,
    typing_users: Vec<OwnedUserId>,
    summary: RoomSummary,
    receipts: ReceiptTracker,
    relations: RelationsContainer,
    threads: BTreeMap<OwnedEventId, Thread>,
    name: String,
    updates: broadcast::Sender<RoomUpdate>,
}

impl Room {
    /// Create an empty room.
    pub fn new(room_id: &RoomId, own_user_id: &UserId, config: RoomConfig) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let timeline_set = EventTimelineSet::new(room_id, None, config.timeline_support);
        let summary = RoomSummary::default();
        let name = display_name::calculate_room_name(
            timeline_set.live_timeline().state(Direction::Forward),
            own_user_id,
            &summary,
        );

        Self {
            room_id: room_id.to_owned(),
            own_user_id: own_user_id.to_owned(),
            config,
            arena: EventArena::new(),
            timeline_set,
            filtered_sets: Vec::new(),
            pending: Vec::new(),
            txn_map: HashMap::new(),
            tags: BTreeMap::new(),
            account_data: BTreeMap::new(),
            notification_counts: UnreadNotificationsCount::default(),
            typing_users: Vec::new(),
            summary,
            receipts: ReceiptTracker::new(),
            relations: RelationsContainer::new(),
            threads: BTreeMap::new(),
            name,
            updates,
        }
    }

    /// The id of the room.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// The user we're logged in as.
    pub fn own_user_id(&self) -> &UserId {
        &self.own_user_id
    }

    /// The configuration of the room.
    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    /// The computed name of the room.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The events of the room.
    pub fn arena(&self) -> &EventArena {
        &self.arena
    }

    /// The unfiltered timeline set.
    pub fn timeline_set(&self) -> &EventTimelineSet {
        &self.timeline_set
    }

    /// The timeline sets created with [`Room::add_timeline_set`].
    pub fn filtered_timeline_sets(&self) -> &[EventTimelineSet] {
        &self.filtered_sets
    }

    /// The live timeline of the unfiltered timeline set.
    pub fn live_timeline(&self) -> &EventTimeline {
        self.timeline_set.live_timeline()
    }

    /// The events of the live timeline, oldest first.
    pub fn live_events(&self) -> impl Iterator<Item = &MatrixEvent> {
        self.timeline_set.live_timeline().resolve(&self.arena)
    }

    /// The local echoes kept out of the timelines, in
    /// [`PendingEventOrdering::Detached`] mode.
    pub fn pending_events(&self) -> impl Iterator<Item = &MatrixEvent> {
        self.pending.iter().filter_map(|key| self.arena.get(*key))
    }

    /// Get notified about changes in the room.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<RoomUpdate> {
        self.updates.subscribe()
    }

    fn emit(&self, update: RoomUpdate) {
        // Nobody listening is fine.
        let _ = self.updates.send(update);
    }

    /// The comparator for the events of this room.
    pub fn ordering(&self) -> EventOrdering<'_> {
        EventOrdering::new(&self.arena, &self.timeline_set, &self.threads)
    }

    /// Compare two events of the room, see [`EventOrdering`].
    pub fn compare_event_ordering(&self, a: &EventId, b: &EventId) -> Option<Ordering> {
        self.ordering().compare(a, b)
    }

    fn all_sets(&self) -> impl Iterator<Item = &EventTimelineSet> {
        iter::once(&self.timeline_set)
            .chain(&self.filtered_sets)
            .chain(self.threads.values().map(Thread::timeline_set))
    }

    fn ensure_live(&self) -> Result<()> {
        let not_live = self.all_sets().any(|set| {
            let live = set.live_timeline();
            live.pagination_token(Direction::Forward).is_some()
                || live.neighbour(Direction::Forward).is_some()
        });

        if not_live {
            Err(Error::LiveTimelineNotLive)
        } else {
            Ok(())
        }
    }

    fn is_in_timeline(&self, key: EventKey) -> bool {
        self.timeline_set.contains(key) || self.threads.values().any(|t| t.contains(key))
    }

    /// Find an event of the room by id.
    pub fn find_event_by_id(&self, event_id: &EventId) -> Option<&MatrixEvent> {
        let key = self.arena.key_by_event_id(event_id)?;
        let known = self.is_in_timeline(key) || self.pending.contains(&key);
        known.then(|| self.arena.get(key)).flatten()
    }

    /// Find a local echo by its transaction id.
    pub fn find_event_by_txn_id(&self, txn_id: &TransactionId) -> Option<&MatrixEvent> {
        self.arena.get(*self.txn_map.get(txn_id)?)
    }

    /// The threads of the room.
    pub fn threads(&self) -> impl Iterator<Item = &Thread> {
        self.threads.values()
    }

    /// The thread with the given root.
    pub fn thread(&self, root: &EventId) -> Option<&Thread> {
        self.threads.get(root)
    }

    /// The state at the end of the live timeline.
    pub fn current_state(&self) -> &RoomState {
        self.timeline_set.live_timeline().state(Direction::Forward)
    }

    /// The members in the current state, sorted by user id.
    pub fn members(&self) -> Vec<RoomMember> {
        self.current_state().members()
    }

    /// A member in the current state.
    pub fn member(&self, user_id: &UserId) -> Option<RoomMember> {
        self.current_state().member(user_id)
    }

    /// The membership of our own user.
    pub fn my_membership(&self) -> Option<MembershipState> {
        self.current_state().membership(&self.own_user_id)
    }

    /// The summary the server sent for the room.
    pub fn summary(&self) -> &RoomSummary {
        &self.summary
    }

    /// Update the summary the server sent for the room.
    pub fn set_summary(&mut self, summary: RoomSummary) {
        self.summary = summary;
        self.recalculate_name();
    }

    fn recalculate_name(&mut self) {
        let name = display_name::calculate_room_name(
            self.current_state(),
            &self.own_user_id,
            &self.summary,
        );

        if name != self.name {
            debug!(room_id = %self.room_id, %name, "The room name changed");
            self.name = name.clone();
            self.emit(RoomUpdate::Name(name));
        }
    }

    /// Add events received from sync.
    ///
    /// Typing notifications, receipts and room account data are routed to
    /// their handlers, every other event is added at the end of the live
    /// timelines.
    #[instrument(skip_all, fields(room_id = %self.room_id, count = events.len()))]
    pub fn add_live_events(
        &mut self,
        events: Vec<MatrixEvent>,
        duplicate_strategy: DuplicateStrategy,
    ) -> Result<()> {
        self.ensure_live()?;

        for event in events {
            let event_type = event.event_type().to_owned();
            match event_type.as_str() {
                "m.typing" => self.handle_typing(&event),
                "m.receipt" => self.add_receipt(&event, false),
                "m.tag" | "m.fully_read" => self.add_account_data(event),
                _ => self.add_live_event(event, duplicate_strategy)?,
            }
        }

        Ok(())
    }

    fn add_live_event(
        &mut self,
        event: MatrixEvent,
        duplicate_strategy: DuplicateStrategy,
    ) -> Result<()> {
        if event.is_redaction() {
            self.apply_redaction(&event);
        }

        if let Some(local) = self.find_local_echo(&event) {
            return self.handle_remote_echo(event, local);
        }

        let existing = event.event_id().and_then(|id| self.arena.key_by_event_id(&id));
        let Some(existing) = existing else {
            let key = self.arena.insert(event);
            self.insert_live(key)?;
            self.after_insert(key);
            return Ok(());
        };

        let known = self.is_in_timeline(existing);
        if known && duplicate_strategy == DuplicateStrategy::Ignore {
            trace!(event_id = ?event.event_id(), "Ignoring a duplicate event");
            return Ok(());
        }

        if let Some(stored) = self.arena.get_mut(existing) {
            stored.replace_with(event);
        }
        self.arena.reindex(existing);

        if known {
            if let Some(event) = self.arena.get(existing).and_then(MatrixEvent::item_id) {
                self.emit(RoomUpdate::Timeline { event });
            }
        } else {
            self.insert_live(existing)?;
            self.after_insert(existing);
        }

        Ok(())
    }

    /// The local echo a remote event is the remote echo of.
    fn find_local_echo(&self, event: &MatrixEvent) -> Option<EventKey> {
        let is_local = |key: &EventKey| self.arena.get(*key).is_some_and(|e| e.status().is_some());

        if let Some(txn_id) = event.unsigned_transaction_id() {
            if let Some(key) = self.txn_map.get(&txn_id).copied().filter(is_local) {
                return Some(key);
            }
        }

        let event_id = event.event_id()?;
        self.arena.key_by_event_id(&event_id).filter(is_local)
    }

    /// Add an event to the live timelines, or to its thread.
    fn insert_live(&mut self, key: EventKey) -> Result<()> {
        let Some(event) = self.arena.get(key) else {
            return Ok(());
        };

        if self.config.thread_support {
            if let Some(root) = self.thread_root_for(event) {
                let thread = self.threads.entry(root.clone()).or_insert_with(|| {
                    Thread::new(&self.room_id, root, self.config.timeline_support)
                });
                thread.timeline_set_mut().add_live_event(&self.arena, key)?;
                return Ok(());
            }
        }

        for set in iter::once(&mut self.timeline_set).chain(&mut self.filtered_sets) {
            set.add_live_event(&self.arena, key)?;
        }

        Ok(())
    }

    /// The thread an event belongs to: the thread it replies in, or the
    /// thread of the event it relates to.
    fn thread_root_for(&self, event: &MatrixEvent) -> Option<OwnedEventId> {
        if let Some(root) = event.thread_root_id() {
            return Some(root);
        }

        let relation = event.relation()?;
        let target = self.arena.key_by_event_id(&relation.event_id)?;
        self.threads.values().find(|t| t.contains(target)).map(|t| t.root_id().to_owned())
    }

    fn after_insert(&mut self, key: EventKey) {
        self.aggregate(key);
        self.synthesize_implicit_receipt(key);

        let Some(event) = self.arena.get(key) else { return };
        let is_state = event.is_state();
        let item_id = event.item_id();

        if is_state {
            self.recalculate_name();
        }
        if let Some(event) = item_id {
            self.emit(RoomUpdate::Timeline { event });
        }
    }

    fn aggregate(&mut self, key: EventKey) {
        if let Some(target) = self.relations.aggregate_child_event(&self.arena, key) {
            self.refresh_relations_of(&target);
        }

        self.relations.aggregate_parent_event(&self.arena, key);
        if let Some(event_id) = self.arena.get(key).and_then(MatrixEvent::event_id) {
            if self.relations.all_relations_for_event(&event_id).next().is_some() {
                self.refresh_relations_of(&event_id);
            }
        }
    }

    /// Show the target with its latest edit, and notify about the change.
    fn refresh_relations_of(&mut self, target_id: &EventId) {
        let Some(target) = self.arena.key_by_event_id(target_id) else {
            self.emit(RoomUpdate::Relations { target: target_id.to_owned() });
            return;
        };

        let event_type = self.arena.get(target).map(|e| e.event_type().to_owned());
        let replacement = event_type
            .and_then(|t| self.relations.get_child_events_for_event(target_id, REPLACE, &t))
            .and_then(|relations| relations.last_replacement(&self.arena))
            .and_then(|key| self.arena.get(key))
            .cloned();

        if let Some(event) = self.arena.get_mut(target) {
            if !event.is_redacted() {
                event.make_replaced(replacement.as_ref());
            }
        }

        self.emit(RoomUpdate::Relations { target: target_id.to_owned() });
    }

    fn synthesize_implicit_receipt(&mut self, key: EventKey) {
        let Some(event) = self.arena.get(key) else { return };

        // A redaction doesn't mean its sender read the redacted event.
        if event.is_redaction() {
            return;
        }

        let (Some(sender), Some(event_id)) = (event.sender(), event.event_id()) else {
            return;
        };
        let ts = event.ts().and_then(UInt::new).map(MilliSecondsSinceUnixEpoch);

        let ordering = EventOrdering::new(&self.arena, &self.timeline_set, &self.threads);
        let changed = self.receipts.synthesize_receipt(
            &sender,
            &event_id,
            ReceiptType::Read,
            ts,
            |a, b| ordering.compare(a, b),
        );

        if changed {
            self.emit(RoomUpdate::Receipts);
        }
    }

    fn apply_redaction(&mut self, redaction: &MatrixEvent) {
        let Some(target_id) = redaction.redacts() else {
            warn!(room_id = %self.room_id, "Redaction without a target, ignoring");
            return;
        };
        let Some(target) = self.arena.key_by_event_id(&target_id) else {
            debug!(%target_id, "Redaction of an unknown event");
            return;
        };

        if let Some(parent) = self.relations.remove_child_event(target) {
            self.refresh_relations_of(&parent);
        }

        let Some(event) = self.arena.get_mut(target) else { return };
        event.make_redacted(redaction);
        let is_state = event.is_state();

        debug!(%target_id, "Redacted an event");
        self.emit(RoomUpdate::Redaction {
            redacted: target_id.clone(),
            redaction: redaction.item_id(),
        });

        if is_state {
            for set in iter::once(&mut self.timeline_set).chain(&mut self.filtered_sets) {
                set.redact_state(&target_id, redaction);
            }
            self.recalculate_name();
        }
    }

    /// Replace a local echo with its remote echo.
    ///
    /// The local echo keeps its place and its cleartext, it's removed from
    /// the pending list and every index now knows it by its event id.
    fn handle_remote_echo(&mut self, remote: MatrixEvent, local: EventKey) -> Result<()> {
        let Some(event) = self.arena.get_mut(local) else { return Ok(()) };
        let txn_id = event.txn_id().map(ToOwned::to_owned);
        event.handle_remote_echo(&remote);
        let event_id = event.event_id();
        self.arena.reindex(local);

        self.pending.retain(|key| *key != local);
        if !self.is_in_timeline(local) {
            self.insert_live(local)?;
        }

        self.aggregate(local);
        self.synthesize_implicit_receipt(local);

        trace!(?txn_id, ?event_id, "Handled the remote echo of a local event");
        if let Some(txn_id) = txn_id {
            self.emit(RoomUpdate::LocalEcho { txn_id, status: None, event_id });
        }

        Ok(())
    }

    /// Add a local echo of an event we're sending.
    ///
    /// The event needs to be in the [`EventStatus::Sending`] state. In
    /// [`PendingEventOrdering::Detached`] mode it's kept out of the
    /// timelines, and can't be sent while an earlier event failed to send.
    #[instrument(skip(self, event), fields(room_id = %self.room_id))]
    pub fn add_pending_event(
        &mut self,
        mut event: MatrixEvent,
        txn_id: OwnedTransactionId,
    ) -> Result<EventKey> {
        if event.status() != Some(EventStatus::Sending) {
            return Err(Error::EventNotSending(event.status()));
        }
        if self.txn_map.contains_key(&txn_id) {
            return Err(Error::DuplicateTransactionId(txn_id));
        }

        event.set_txn_id(txn_id.clone());

        let key = match self.config.pending_event_ordering {
            PendingEventOrdering::Detached => {
                let earlier_failed = self
                    .pending_events()
                    .any(|pending| pending.status() == Some(EventStatus::NotSent));
                if earlier_failed {
                    debug!("An earlier event failed to send, blocking the new one");
                    event.set_status(EventStatus::NotSent)?;
                }

                let key = self.arena.insert(event);
                self.pending.push(key);
                key
            }
            PendingEventOrdering::Chronological => {
                self.ensure_live()?;
                let key = self.arena.insert(event);
                self.insert_live(key)?;
                key
            }
        };

        self.txn_map.insert(txn_id.clone(), key);

        let redacted =
            self.arena.get(key).filter(|e| e.is_redaction()).and_then(MatrixEvent::redacts);
        if let Some(redacted) = redacted {
            self.mark_locally_redacted(&redacted, &txn_id);
        } else {
            self.aggregate(key);
        }

        let status = self.arena.get(key).and_then(MatrixEvent::status);
        self.emit(RoomUpdate::LocalEcho { txn_id, status, event_id: None });

        Ok(key)
    }

    fn mark_locally_redacted(&mut self, target_id: &EventId, txn_id: &TransactionId) {
        let Some(target) = self.arena.key_by_event_id(target_id) else { return };

        if let Some(event) = self.arena.get_mut(target) {
            event.mark_locally_redacted(TimelineEventItemId::TransactionId(txn_id.to_owned()));
        }
        if let Some(parent) = self.relations.remove_child_event(target) {
            self.refresh_relations_of(&parent);
        }

        self.emit(RoomUpdate::Redaction {
            redacted: target_id.to_owned(),
            redaction: Some(TimelineEventItemId::TransactionId(txn_id.to_owned())),
        });
    }

    /// Move a local echo to a new send status.
    ///
    /// Illegal moves fail without touching the event. Moving to `Sent`
    /// requires the event id the server assigned. Moving to `Cancelled`
    /// removes the event from the room.
    #[instrument(skip(self), fields(room_id = %self.room_id))]
    pub fn update_pending_event(
        &mut self,
        txn_id: &TransactionId,
        new_status: EventStatus,
        new_event_id: Option<OwnedEventId>,
    ) -> Result<()> {
        let key = *self
            .txn_map
            .get(txn_id)
            .ok_or_else(|| Error::NotALocalEcho(txn_id.to_owned()))?;
        let current = self.arena.get(key).and_then(MatrixEvent::status);

        if current.is_none() && new_status == EventStatus::Sent {
            trace!("The remote echo was already received");
            return Ok(());
        }

        EventStatus::transition(current, new_status)?;

        match new_status {
            EventStatus::Sent => {
                let event_id = new_event_id.ok_or(Error::MissingEventId)?;

                let remote = self.arena.key_by_event_id(&event_id).filter(|k| *k != key);
                if let Some(remote) = remote {
                    self.reconcile_with_remote(key, remote, txn_id);
                    return Ok(());
                }

                if let Some(event) = self.arena.get_mut(key) {
                    event.set_status(EventStatus::Sent)?;
                    event.replace_local_event_id(&event_id);
                }
                self.arena.reindex(key);
                self.aggregate(key);

                self.emit(RoomUpdate::LocalEcho {
                    txn_id: txn_id.to_owned(),
                    status: Some(EventStatus::Sent),
                    event_id: Some(event_id),
                });
            }
            EventStatus::Cancelled => {
                if let Some(event) = self.arena.get_mut(key) {
                    event.set_status(EventStatus::Cancelled)?;
                }
                self.detach(key);
                self.revert_local_redaction(key, txn_id);

                self.txn_map.remove(txn_id);
                self.arena.remove(key);

                self.emit(RoomUpdate::LocalEcho {
                    txn_id: txn_id.to_owned(),
                    status: Some(EventStatus::Cancelled),
                    event_id: None,
                });
            }
            status => {
                if let Some(event) = self.arena.get_mut(key) {
                    event.set_status(status)?;
                }

                self.emit(RoomUpdate::LocalEcho {
                    txn_id: txn_id.to_owned(),
                    status: Some(status),
                    event_id: None,
                });
            }
        }

        Ok(())
    }

    /// Drop a local echo whose remote echo arrived without a transaction id.
    fn reconcile_with_remote(&mut self, local: EventKey, remote: EventKey, txn_id: &TransactionId) {
        debug!("The remote echo arrived before the event was marked as sent");

        self.detach(local);
        self.arena.remove(local);

        if let Some(event) = self.arena.get_mut(remote) {
            event.set_txn_id(txn_id.to_owned());
        }
        self.arena.reindex(remote);
        self.txn_map.insert(txn_id.to_owned(), remote);

        let event_id = self.arena.get(remote).and_then(MatrixEvent::event_id);
        self.emit(RoomUpdate::LocalEcho { txn_id: txn_id.to_owned(), status: None, event_id });
    }

    /// Take an event out of the pending list, every timeline and the
    /// relations.
    fn detach(&mut self, key: EventKey) {
        self.pending.retain(|k| *k != key);

        for set in iter::once(&mut self.timeline_set).chain(&mut self.filtered_sets) {
            set.remove_event(key);
        }
        for thread in self.threads.values_mut() {
            thread.timeline_set_mut().remove_event(key);
        }

        if let Some(parent) = self.relations.remove_child_event(key) {
            self.refresh_relations_of(&parent);
        }
    }

    fn revert_local_redaction(&mut self, redaction: EventKey, txn_id: &TransactionId) {
        let Some(target_id) =
            self.arena.get(redaction).filter(|e| e.is_redaction()).and_then(MatrixEvent::redacts)
        else {
            return;
        };
        let Some(target) = self.arena.key_by_event_id(&target_id) else { return };

        let Some(event) = self.arena.get_mut(target) else { return };
        let marked_by_us = matches!(
            event.locally_redacted_by(),
            Some(TimelineEventItemId::TransactionId(t)) if **t == *txn_id
        );
        if !marked_by_us {
            return;
        }

        event.unmark_locally_redacted();
        self.aggregate(target);
        self.emit(RoomUpdate::RedactionCancelled { redacted: target_id });
    }

    /// Start a new live timeline in every timeline set, the ones of the threads
    /// included, after a gap in sync.
    ///
    /// See [`EventTimelineSet::reset_live_timeline`].
    pub fn reset_live_timeline(
        &mut self,
        backward_token: Option<String>,
        forward_token: Option<String>,
    ) {
        let sets = iter::once(&mut self.timeline_set)
            .chain(&mut self.filtered_sets)
            .chain(self.threads.values_mut().map(Thread::timeline_set_mut));
        for set in sets {
            set.reset_live_timeline(backward_token.clone(), forward_token.clone());
        }
        self.emit(RoomUpdate::TimelineReset);
    }

    /// Add a historical timeline to the unfiltered timeline set.
    pub fn add_timeline(&mut self) -> Result<TimelineId> {
        self.timeline_set.add_timeline()
    }

    /// Add events to one end of a timeline of the unfiltered set, for example
    /// events obtained by paginating.
    pub fn add_events_to_timeline(
        &mut self,
        events: Vec<MatrixEvent>,
        to_start: bool,
        timeline: TimelineId,
        pagination_token: Option<String>,
    ) -> Result<()> {
        if self.timeline_set.timeline(timeline).is_none() {
            return Err(Error::UnknownTimeline);
        }

        let mut keys = Vec::with_capacity(events.len());
        let mut new_keys = Vec::new();
        for event in events {
            match event.event_id().and_then(|id| self.arena.key_by_event_id(&id)) {
                Some(key) => keys.push(key),
                None => {
                    let key = self.arena.insert(event);
                    keys.push(key);
                    new_keys.push(key);
                }
            }
        }

        self.timeline_set.add_events_to_timeline(
            &self.arena,
            &keys,
            to_start,
            timeline,
            pagination_token,
        )?;

        for key in new_keys {
            self.aggregate(key);
        }

        Ok(())
    }

    /// Add a filtered timeline set, filled with the matching events of the
    /// live timeline. Returns its index in
    /// [`Room::filtered_timeline_sets`].
    pub fn add_timeline_set(&mut self, filter: EventFilter) -> Result<usize> {
        let mut set =
            EventTimelineSet::new(&self.room_id, Some(filter), self.config.timeline_support);

        let live = self.timeline_set.live_timeline();
        set.live_timeline_mut().reset_state(live.state(Direction::Backward).clone());
        set.live_timeline_mut().set_pagination_token(
            live.pagination_token(Direction::Backward).map(ToOwned::to_owned),
            Direction::Backward,
        );
        for key in live.events() {
            set.add_live_event(&self.arena, *key)?;
        }

        self.filtered_sets.push(set);
        Ok(self.filtered_sets.len() - 1)
    }

    /// The relations of an event, for one relation type and event type.
    pub fn relations_for_event(
        &self,
        event_id: &EventId,
        rel_type: &str,
        event_type: &str,
    ) -> Option<&Relations> {
        self.relations.get_child_events_for_event(event_id, rel_type, event_type)
    }

    /// Add the receipts of a `m.receipt` event.
    ///
    /// Synthetic receipts are the ones we inferred locally.
    pub fn add_receipt(&mut self, event: &MatrixEvent, synthetic: bool) {
        let ordering = EventOrdering::new(&self.arena, &self.timeline_set, &self.threads);
        let changed =
            self.receipts.add_receipt(event.content(), synthetic, |a, b| ordering.compare(a, b));

        if changed {
            self.emit(RoomUpdate::Receipts);
        }
    }

    /// The receipts of the room.
    pub fn receipts(&self) -> &ReceiptTracker {
        &self.receipts
    }

    /// The receipts pointing at an event.
    pub fn receipts_for_event(&self, event_id: &EventId) -> &[EventReceipt] {
        self.receipts.receipts_for_event(event_id)
    }

    /// The users whose read receipt points at an event.
    pub fn users_read_up_to(&self, event_id: &EventId) -> Vec<OwnedUserId> {
        self.receipts.users_read_up_to(event_id)
    }

    /// The event up to which a user has read.
    pub fn event_read_up_to(
        &self,
        user_id: &UserId,
        ignore_synthesized: bool,
    ) -> Option<OwnedEventId> {
        let ordering = self.ordering();
        self.receipts.event_read_up_to(user_id, ignore_synthesized, |a, b| ordering.compare(a, b))
    }

    /// Has a user read an event.
    ///
    /// True if their read receipt points at it, if they sent the latest
    /// event of the live timeline, or if their read receipt points at an
    /// event after it in the live timeline.
    pub fn has_user_read_event(&self, user_id: &UserId, event_id: &EventId) -> bool {
        let read_up_to = self.event_read_up_to(user_id, false);
        if read_up_to.as_deref() == Some(event_id) {
            return true;
        }

        let events: Vec<&MatrixEvent> = self.live_events().collect();
        if events.last().and_then(|e| e.sender()).is_some_and(|sender| *sender == *user_id) {
            return true;
        }

        for event in events.iter().rev() {
            let id = event.event_id();
            if id.as_deref() == Some(event_id) {
                return false;
            }
            if id.is_some() && id == read_up_to {
                return true;
            }
        }

        false
    }

    fn handle_typing(&mut self, event: &MatrixEvent) {
        let user_ids = event.content().get("user_ids").cloned().unwrap_or_default();
        match serde_json::from_value::<Vec<OwnedUserId>>(user_ids) {
            Ok(user_ids) => {
                self.typing_users = user_ids.clone();
                self.emit(RoomUpdate::Typing(user_ids));
            }
            Err(error) => warn!(room_id = %self.room_id, %error, "Malformed typing notification"),
        }
    }

    /// The users currently typing.
    pub fn typing_users(&self) -> &[OwnedUserId] {
        &self.typing_users
    }

    /// Add room account data, `m.tag` updates the tags of the room.
    pub fn add_account_data(&mut self, event: MatrixEvent) {
        let event_type = event.event_type().to_owned();

        if event_type == "m.tag" {
            let tags = event.content().get("tags").cloned().unwrap_or_default();
            match serde_json::from_value::<BTreeMap<String, TagInfo>>(tags) {
                Ok(tags) => {
                    self.tags = tags;
                    self.emit(RoomUpdate::Tags);
                }
                Err(error) => warn!(room_id = %self.room_id, %error, "Malformed room tags"),
            }
        }

        self.account_data.insert(event_type.clone(), event);
        self.emit(RoomUpdate::AccountData { event_type });
    }

    /// The room account data of the given type.
    pub fn account_data(&self, event_type: &str) -> Option<&MatrixEvent> {
        self.account_data.get(event_type)
    }

    /// The tags of the room.
    pub fn tags(&self) -> &BTreeMap<String, TagInfo> {
        &self.tags
    }

    /// The event of the `m.fully_read` marker.
    pub fn fully_read_event(&self) -> Option<OwnedEventId> {
        let event_id = self.account_data("m.fully_read")?.content().get("event_id")?;
        serde_json::from_value(event_id.clone()).ok()
    }

    /// Set an unread notification count, as sent by the server.
    pub fn set_unread_notification_count(&mut self, kind: NotificationCountType, count: u64) {
        match kind {
            NotificationCountType::Total => self.notification_counts.notification_count = count,
            NotificationCountType::Highlight => self.notification_counts.highlight_count = count,
        }
        self.emit(RoomUpdate::NotificationCounts);
    }

    /// An unread notification count.
    pub fn unread_notification_count(&self, kind: NotificationCountType) -> u64 {
        match kind {
            NotificationCountType::Total => self.notification_counts.notification_count,
            NotificationCountType::Highlight => self.notification_counts.highlight_count,
        }
    }

    /// Both unread notification counts.
    pub fn unread_notifications(&self) -> UnreadNotificationsCount {
        self.notification_counts
    }
}
