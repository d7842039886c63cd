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

use std::{cmp::Ordering, collections::HashMap};

use indexmap::IndexMap;
use ruma::{EventId, OwnedRoomId, RoomId};
use tracing::{debug, trace, warn};

use super::{Direction, EventFilter, EventTimeline, TimelineId};
use crate::{
    error::{Error, Result},
    event::{EventArena, EventKey, MatrixEvent, TimelineEventItemId},
};

/// Where an event lives in a timeline set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventPosition {
    /// The timeline holding the event.
    pub timeline: TimelineId,
    /// The absolute index of the event in that timeline.
    pub index: i64,
}

/// The timelines of a room, as seen through an optional filter.
///
/// The set always has exactly one live timeline, the one receiving events
/// from sync. Historical timelines are reachable through the neighbour links
/// of the timelines. Events are indexed by their [`EventKey`], so renaming an
/// event in the [`EventArena`] is enough to rename it in every set.
#[derive(Debug)]
pub struct EventTimelineSet {
    room_id: OwnedRoomId,
    live: EventTimeline,
    historical: IndexMap<TimelineId, EventTimeline>,
    next_timeline_id: u64,
    filter: Option<EventFilter>,
    index: HashMap<EventKey, EventPosition>,
    timeline_support: bool,
}

impl EventTimelineSet {
    /// Create a set with an empty live timeline.
    pub fn new(room_id: &RoomId, filter: Option<EventFilter>, timeline_support: bool) -> Self {
        Self {
            room_id: room_id.to_owned(),
            live: EventTimeline::new(TimelineId(0)),
            historical: IndexMap::new(),
            next_timeline_id: 1,
            filter,
            index: HashMap::new(),
            timeline_support,
        }
    }

    /// The room this set belongs to.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// The filter of the set, `None` for the unfiltered set.
    pub fn filter(&self) -> Option<&EventFilter> {
        self.filter.as_ref()
    }

    /// Would the filter of this set let the event in.
    pub fn accepts(&self, event: &MatrixEvent) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter.matches(event))
    }

    /// The timeline new events from sync are appended to.
    pub fn live_timeline(&self) -> &EventTimeline {
        &self.live
    }

    /// Mutable access to the live timeline.
    pub fn live_timeline_mut(&mut self) -> &mut EventTimeline {
        &mut self.live
    }

    /// Get a timeline of the set.
    pub fn timeline(&self, id: TimelineId) -> Option<&EventTimeline> {
        if id == self.live.id() {
            Some(&self.live)
        } else {
            self.historical.get(&id)
        }
    }

    fn timeline_mut(&mut self, id: TimelineId) -> Option<&mut EventTimeline> {
        if id == self.live.id() {
            Some(&mut self.live)
        } else {
            self.historical.get_mut(&id)
        }
    }

    /// All the timelines of the set, historical timelines first in the order
    /// they were created.
    pub fn timelines(&self) -> impl Iterator<Item = &EventTimeline> {
        self.historical.values().chain(std::iter::once(&self.live))
    }

    /// Redact a state event in the state of every timeline.
    pub(crate) fn redact_state(&mut self, event_id: &EventId, redaction: &MatrixEvent) {
        for timeline in self.historical.values_mut().chain(std::iter::once(&mut self.live)) {
            timeline.redact_state(event_id, redaction);
        }
    }

    /// The events of a timeline, oldest first.
    pub fn events(&self, timeline: TimelineId) -> Option<impl Iterator<Item = EventKey> + '_> {
        self.timeline(timeline).map(|t| t.events().iter().copied())
    }

    /// Add an empty historical timeline.
    pub fn add_timeline(&mut self) -> Result<TimelineId> {
        if !self.timeline_support {
            return Err(Error::TimelineSupportDisabled);
        }

        let id = self.allocate_timeline_id();
        self.historical.insert(id, EventTimeline::new(id));
        debug!(room_id = %self.room_id, timeline = %id, "Added a timeline");

        Ok(id)
    }

    fn allocate_timeline_id(&mut self) -> TimelineId {
        let id = TimelineId(self.next_timeline_id);
        self.next_timeline_id += 1;
        id
    }

    /// The timeline holding an event.
    pub fn timeline_for_event(&self, key: EventKey) -> Option<TimelineId> {
        self.index.get(&key).map(|position| position.timeline)
    }

    /// The position of an event.
    pub fn position(&self, key: EventKey) -> Option<EventPosition> {
        self.index.get(&key).copied()
    }

    /// Is the event part of this set.
    pub fn contains(&self, key: EventKey) -> bool {
        self.index.contains_key(&key)
    }

    /// Find an event of this set by its id.
    pub fn find_event_by_id<'a>(
        &self,
        arena: &'a EventArena,
        id: &TimelineEventItemId,
    ) -> Option<&'a MatrixEvent> {
        let key = arena.key_by_item_id(id)?;
        self.contains(key).then(|| arena.get(key)).flatten()
    }

    fn insert(&mut self, key: EventKey, event: &MatrixEvent, timeline: TimelineId, at_start: bool) {
        if let Some(t) = self.timeline_mut(timeline) {
            let index = t.insert(key, event, at_start);
            self.index.insert(key, EventPosition { timeline, index });
        }
    }

    /// Add events to one end of a timeline.
    ///
    /// Events going to the start are given newest first. When one of the
    /// events is already known in another timeline, the two timelines get
    /// joined and the remaining events go to the timeline that was met. The
    /// pagination token is set on the timeline the insertion ended on.
    pub fn add_events_to_timeline(
        &mut self,
        arena: &EventArena,
        keys: &[EventKey],
        to_start: bool,
        timeline: TimelineId,
        pagination_token: Option<String>,
    ) -> Result<()> {
        if self.timeline(timeline).is_none() {
            return Err(Error::UnknownTimeline);
        }

        let (direction, inverse) = if to_start {
            (Direction::Backward, Direction::Forward)
        } else {
            (Direction::Forward, Direction::Backward)
        };

        let mut current = timeline;
        let mut did_update = false;
        let mut last_event_was_new = false;

        for &key in keys {
            let Some(event) = arena.get(key) else {
                warn!(room_id = %self.room_id, "Tried to add an event missing from the arena");
                continue;
            };

            let Some(existing) = self.timeline_for_event(key) else {
                if self.accepts(event) {
                    self.insert(key, event, current, to_start);
                    did_update = true;
                }
                last_event_was_new = true;
                continue;
            };

            last_event_was_new = false;
            if existing == current {
                trace!("Event already in the timeline, skipping");
                continue;
            }

            let neighbour = self.timeline(current).and_then(|t| t.neighbour(direction));
            match neighbour {
                Some(neighbour) if neighbour == existing => {
                    trace!("Reached the neighbouring timeline");
                }
                Some(_) => {
                    warn!(
                        room_id = %self.room_id,
                        timeline = %current,
                        "Event is in another timeline than the neighbour of the timeline"
                    );
                }
                None => {
                    debug!(
                        room_id = %self.room_id,
                        timeline = %current,
                        other = %existing,
                        "Joining two timelines"
                    );
                    if let Some(t) = self.timeline_mut(current) {
                        t.set_neighbour(Some(existing), direction);
                    }
                    if let Some(t) = self.timeline_mut(existing) {
                        t.set_neighbour(Some(current), inverse);
                    }
                    did_update = true;
                }
            }

            current = existing;
        }

        if last_event_was_new || !did_update {
            if direction == Direction::Forward && current == self.live.id() {
                warn!(
                    room_id = %self.room_id,
                    "Refusing to set a forward pagination token on the live timeline"
                );
            } else if let Some(t) = self.timeline_mut(current) {
                t.set_pagination_token(pagination_token, direction);
            }
        }

        Ok(())
    }

    /// Add an event at the end of the live timeline.
    ///
    /// Returns `false` if the filter rejected the event or it's already part
    /// of the set.
    pub fn add_live_event(&mut self, arena: &EventArena, key: EventKey) -> Result<bool> {
        if self.live.pagination_token(Direction::Forward).is_some()
            || self.live.neighbour(Direction::Forward).is_some()
        {
            return Err(Error::LiveTimelineNotLive);
        }

        let Some(event) = arena.get(key) else {
            return Ok(false);
        };

        if !self.accepts(event) || self.contains(key) {
            return Ok(false);
        }

        let live = self.live.id();
        self.insert(key, event, live, false);
        Ok(true)
    }

    /// Place the remote echo of a local event that isn't part of the set yet
    /// at the end of the live timeline.
    pub fn handle_remote_echo(&mut self, arena: &EventArena, key: EventKey) -> Result<bool> {
        if self.contains(key) {
            return Ok(false);
        }
        self.add_live_event(arena, key)
    }

    /// Remove an event from the set.
    pub fn remove_event(&mut self, key: EventKey) -> Option<EventPosition> {
        let position = self.index.remove(&key)?;
        let timeline = self.timeline_mut(position.timeline)?;
        timeline.remove(key);

        let updated: Vec<_> = timeline
            .events()
            .iter()
            .enumerate()
            .map(|(i, k)| (*k, i as i64 - timeline.base_index()))
            .collect();
        for (k, index) in updated {
            self.index.insert(k, EventPosition { timeline: position.timeline, index });
        }

        Some(position)
    }

    /// Start a new live timeline after a gap in sync.
    ///
    /// The new timeline starts with the state at the end of the old one.
    /// Without a forward token the old timelines can't be linked to anything
    /// anymore, so every timeline of the set is dropped. The same happens
    /// when the set doesn't support multiple timelines.
    pub fn reset_live_timeline(
        &mut self,
        backward_token: Option<String>,
        forward_token: Option<String>,
    ) {
        let id = self.allocate_timeline_id();
        let mut timeline = self.live.fork(id);
        timeline.set_pagination_token(backward_token, Direction::Backward);

        let mut old = std::mem::replace(&mut self.live, timeline);

        match forward_token {
            Some(token) if self.timeline_support => {
                old.set_pagination_token(Some(token), Direction::Forward);
                self.historical.insert(old.id(), old);
            }
            _ => {
                debug!(
                    room_id = %self.room_id,
                    dropped = self.historical.len() + 1,
                    "Discarding every timeline of the set"
                );
                self.historical.clear();
                self.index.clear();
            }
        }
    }

    /// Compare the position of two events.
    ///
    /// `None` unless both events are in the same timeline.
    pub fn compare_event_ordering(&self, a: EventKey, b: EventKey) -> Option<Ordering> {
        let a = self.position(a)?;
        let b = self.position(b)?;
        (a.timeline == b.timeline).then(|| a.index.cmp(&b.index))
    }
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use assert_matches2::assert_let;
    use matrix_client_test::{EventFactory, ALICE, DEFAULT_TEST_ROOM_ID};
    use proptest::prelude::*;

    use super::EventTimelineSet;
    use crate::{
        event::{EventArena, EventKey, MatrixEvent},
        timeline::{Direction, EventFilter},
        Error,
    };

    fn messages(arena: &mut EventArena, count: usize) -> Vec<EventKey> {
        let f = EventFactory::new().sender(*ALICE);
        (0..count)
            .map(|i| arena.insert(MatrixEvent::new(f.text_msg(&format!("{i}")).into()).unwrap()))
            .collect()
    }

    #[test]
    fn test_live_events_are_indexed() {
        let mut arena = EventArena::new();
        let keys = messages(&mut arena, 2);
        let mut set = EventTimelineSet::new(*DEFAULT_TEST_ROOM_ID, None, false);

        assert!(set.add_live_event(&arena, keys[0]).unwrap());
        assert!(set.add_live_event(&arena, keys[1]).unwrap());
        assert!(!set.add_live_event(&arena, keys[1]).unwrap());

        let live = set.live_timeline().id();
        assert_eq!(set.timeline_for_event(keys[1]), Some(live));
        assert_eq!(set.position(keys[1]).unwrap().index, 1);
        assert_eq!(set.compare_event_ordering(keys[0], keys[1]), Some(Ordering::Less));

        let id = arena.get(keys[0]).unwrap().item_id().unwrap();
        assert!(set.find_event_by_id(&arena, &id).is_some());
    }

    #[test]
    fn test_filtered_set_skips_events() {
        let mut arena = EventArena::new();
        let keys = messages(&mut arena, 1);
        let filter = EventFilter::with_types(["m.room.name"]);
        let mut set = EventTimelineSet::new(*DEFAULT_TEST_ROOM_ID, Some(filter), false);

        assert!(!set.add_live_event(&arena, keys[0]).unwrap());
        assert!(set.live_timeline().is_empty());
    }

    #[test]
    fn test_live_timeline_with_forward_token_is_an_error() {
        let mut arena = EventArena::new();
        let keys = messages(&mut arena, 1);
        let mut set = EventTimelineSet::new(*DEFAULT_TEST_ROOM_ID, None, true);

        set.live_timeline_mut().set_pagination_token(Some("f".to_owned()), Direction::Forward);
        assert_let!(Err(Error::LiveTimelineNotLive) = set.add_live_event(&arena, keys[0]));
    }

    #[test]
    fn test_forward_token_is_never_set_on_the_live_timeline() {
        let mut arena = EventArena::new();
        let keys = messages(&mut arena, 1);
        let mut set = EventTimelineSet::new(*DEFAULT_TEST_ROOM_ID, None, false);
        let live = set.live_timeline().id();

        set.add_events_to_timeline(&arena, &keys, false, live, Some("f".to_owned())).unwrap();
        assert_eq!(set.live_timeline().pagination_token(Direction::Forward), None);
        assert_eq!(set.live_timeline().len(), 1);
    }

    #[test]
    fn test_backfill_sets_the_backward_token() {
        let mut arena = EventArena::new();
        let keys = messages(&mut arena, 3);
        let mut set = EventTimelineSet::new(*DEFAULT_TEST_ROOM_ID, None, false);
        let live = set.live_timeline().id();

        set.add_live_event(&arena, keys[2]).unwrap();
        set.add_events_to_timeline(&arena, &[keys[1], keys[0]], true, live, Some("b".to_owned()))
            .unwrap();

        let order: Vec<_> = set.events(live).unwrap().collect();
        assert_eq!(order, keys);
        assert_eq!(set.live_timeline().pagination_token(Direction::Backward), Some("b"));
        assert_eq!(set.position(keys[0]).unwrap().index, -2);
    }

    #[test]
    fn test_meeting_a_known_event_joins_timelines() {
        let mut arena = EventArena::new();
        let keys = messages(&mut arena, 4);
        let mut set = EventTimelineSet::new(*DEFAULT_TEST_ROOM_ID, None, true);
        let live = set.live_timeline().id();

        set.add_live_event(&arena, keys[2]).unwrap();
        set.add_live_event(&arena, keys[3]).unwrap();

        let historical = set.add_timeline().unwrap();
        set.add_events_to_timeline(&arena, &keys[..3], false, historical, Some("f".to_owned()))
            .unwrap();

        let old = set.timeline(historical).unwrap();
        assert_eq!(old.len(), 2);
        assert_eq!(old.neighbour(Direction::Forward), Some(live));
        assert_eq!(set.live_timeline().neighbour(Direction::Backward), Some(historical));
        assert_eq!(old.pagination_token(Direction::Forward), None);
        assert_eq!(set.compare_event_ordering(keys[0], keys[3]), None);
    }

    #[test]
    fn test_add_timeline_needs_timeline_support() {
        let mut set = EventTimelineSet::new(*DEFAULT_TEST_ROOM_ID, None, false);
        assert_let!(Err(Error::TimelineSupportDisabled) = set.add_timeline());
    }

    #[test]
    fn test_reset_without_forward_token_discards_every_timeline() {
        let mut arena = EventArena::new();
        let keys = messages(&mut arena, 3);
        let mut set = EventTimelineSet::new(*DEFAULT_TEST_ROOM_ID, None, true);

        let first = set.add_timeline().unwrap();
        let second = set.add_timeline().unwrap();
        set.add_events_to_timeline(&arena, &keys[..1], false, first, None).unwrap();
        set.add_events_to_timeline(&arena, &keys[1..2], false, second, None).unwrap();
        set.add_live_event(&arena, keys[2]).unwrap();

        let live = set.live_timeline().id();
        let chain = [(first, second), (second, live)];
        for (older, newer) in chain {
            set.timeline_mut(older).unwrap().set_neighbour(Some(newer), Direction::Forward);
            set.timeline_mut(newer).unwrap().set_neighbour(Some(older), Direction::Backward);
        }
        assert_eq!(set.timelines().count(), 3);

        set.reset_live_timeline(Some("token".to_owned()), None);

        assert_eq!(set.timelines().count(), 1);
        assert_ne!(set.live_timeline().id(), live);
        assert_eq!(set.live_timeline().neighbour(Direction::Backward), None);
        assert!(set.live_timeline().is_empty());
        assert_eq!(set.live_timeline().pagination_token(Direction::Backward), Some("token"));
        assert!(keys.iter().all(|key| set.timeline_for_event(*key).is_none()));
    }

    #[test]
    fn test_reset_with_forward_token_keeps_the_old_timeline() {
        let mut arena = EventArena::new();
        let keys = messages(&mut arena, 1);
        let mut set = EventTimelineSet::new(*DEFAULT_TEST_ROOM_ID, None, true);
        set.add_live_event(&arena, keys[0]).unwrap();
        let old_live = set.live_timeline().id();

        set.reset_live_timeline(Some("back".to_owned()), Some("forward".to_owned()));

        assert_eq!(set.timelines().count(), 2);
        let old = set.timeline(old_live).unwrap();
        assert_eq!(old.pagination_token(Direction::Forward), Some("forward"));
        assert_eq!(set.timeline_for_event(keys[0]), Some(old_live));
        assert!(!set.add_live_event(&arena, keys[0]).unwrap());
    }

    #[test]
    fn test_removal_keeps_positions_consistent() {
        let mut arena = EventArena::new();
        let keys = messages(&mut arena, 3);
        let mut set = EventTimelineSet::new(*DEFAULT_TEST_ROOM_ID, None, false);
        for key in &keys {
            set.add_live_event(&arena, *key).unwrap();
        }

        assert_eq!(set.remove_event(keys[1]).unwrap().index, 1);
        assert_eq!(set.position(keys[2]).unwrap().index, 1);
        assert_eq!(set.remove_event(keys[1]), None);
    }

    proptest! {
        #[test]
        fn test_ordering_within_a_timeline_is_total(
            to_start in prop::collection::vec(any::<bool>(), 2..12)
        ) {
            let mut arena = EventArena::new();
            let keys = messages(&mut arena, to_start.len());
            let mut set = EventTimelineSet::new(*DEFAULT_TEST_ROOM_ID, None, false);
            let live = set.live_timeline().id();

            for (key, at_start) in keys.iter().zip(&to_start) {
                set.add_events_to_timeline(&arena, &[*key], *at_start, live, None).unwrap();
            }

            for a in &keys {
                for b in &keys {
                    let ab = set.compare_event_ordering(*a, *b);
                    let ba = set.compare_event_ordering(*b, *a);
                    prop_assert!(ab.is_some());
                    prop_assert_eq!(ab.map(Ordering::reverse), ba);
                    prop_assert_eq!(ab == Some(Ordering::Equal), a == b);
                }
            }
        }
    }
}
