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

//! Timelines: ordered, linked segments of the events of a room.

mod filter;
mod set;

use std::{collections::VecDeque, fmt};

use ruma::EventId;

pub use self::{
    filter::EventFilter,
    set::{EventPosition, EventTimelineSet},
};
use crate::{
    error::{Error, Result},
    event::{EventArena, EventKey, MatrixEvent},
    room::RoomState,
};

/// The id of a timeline, unique within its timeline set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimelineId(u64);

impl fmt::Display for TimelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timeline-{}", self.0)
    }
}

/// A direction in a timeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Towards older events.
    Backward,
    /// Towards newer events.
    Forward,
}

/// A contiguous segment of the events of a room.
///
/// Events are kept in the order the server reported them. The absolute
/// index of an event doesn't change when older events are prepended, the
/// index of the first event is `-base_index`.
#[derive(Clone, Debug)]
pub struct EventTimeline {
    id: TimelineId,
    events: VecDeque<EventKey>,
    base_index: i64,
    start_state: RoomState,
    end_state: RoomState,
    backward_token: Option<String>,
    forward_token: Option<String>,
    previous: Option<TimelineId>,
    next: Option<TimelineId>,
}

impl EventTimeline {
    pub(crate) fn new(id: TimelineId) -> Self {
        Self {
            id,
            events: VecDeque::new(),
            base_index: 0,
            start_state: RoomState::new(),
            end_state: RoomState::new(),
            backward_token: None,
            forward_token: None,
            previous: None,
            next: None,
        }
    }

    /// A new, empty timeline starting at the end of this one.
    pub(crate) fn fork(&self, id: TimelineId) -> Self {
        let mut timeline = Self::new(id);
        timeline.start_state = self.end_state.clone();
        timeline.end_state = self.end_state.clone();
        timeline
    }

    /// The identifier of this timeline inside its set.
    pub fn id(&self) -> TimelineId {
        self.id
    }

    /// Set the state at both ends of an empty timeline.
    pub fn initialise_state(&mut self, state_events: &[MatrixEvent]) -> Result<()> {
        if !self.events.is_empty() {
            return Err(Error::TimelineNotEmpty);
        }

        for event in state_events {
            self.start_state.apply(event, true);
            self.end_state.apply(event, true);
        }

        Ok(())
    }

    /// Start an empty timeline at the given state.
    pub(crate) fn reset_state(&mut self, state: RoomState) {
        self.end_state = state.clone();
        self.start_state = state;
    }

    pub(crate) fn redact_state(&mut self, event_id: &EventId, redaction: &MatrixEvent) {
        self.start_state.redact(event_id, redaction);
        self.end_state.redact(event_id, redaction);
    }

    /// The events of the timeline, oldest first.
    pub fn events(&self) -> &VecDeque<EventKey> {
        &self.events
    }

    /// The number of events in this timeline.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether this timeline holds no events.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// The absolute index of the first event.
    pub fn base_index(&self) -> i64 {
        self.base_index
    }

    /// The state at one end of the timeline.
    pub fn state(&self, direction: Direction) -> &RoomState {
        match direction {
            Direction::Backward => &self.start_state,
            Direction::Forward => &self.end_state,
        }
    }

    /// The token to paginate further in the given direction.
    pub fn pagination_token(&self, direction: Direction) -> Option<&str> {
        match direction {
            Direction::Backward => self.backward_token.as_deref(),
            Direction::Forward => self.forward_token.as_deref(),
        }
    }

    pub(crate) fn set_pagination_token(&mut self, token: Option<String>, direction: Direction) {
        match direction {
            Direction::Backward => self.backward_token = token,
            Direction::Forward => self.forward_token = token,
        }
    }

    /// The timeline joined to this one in the given direction.
    pub fn neighbour(&self, direction: Direction) -> Option<TimelineId> {
        match direction {
            Direction::Backward => self.previous,
            Direction::Forward => self.next,
        }
    }

    pub(crate) fn set_neighbour(&mut self, neighbour: Option<TimelineId>, direction: Direction) {
        match direction {
            Direction::Backward => self.previous = neighbour,
            Direction::Forward => self.next = neighbour,
        }
    }

    /// Add an event at one end, returning its absolute index.
    ///
    /// State events update the state at that end.
    pub(crate) fn insert(&mut self, key: EventKey, event: &MatrixEvent, at_start: bool) -> i64 {
        if at_start {
            self.start_state.apply(event, false);
            self.events.push_front(key);
            self.base_index += 1;
            -self.base_index
        } else {
            self.end_state.apply(event, true);
            self.events.push_back(key);
            self.events.len() as i64 - 1 - self.base_index
        }
    }

    /// Remove an event, returning its former absolute index.
    pub(crate) fn remove(&mut self, key: EventKey) -> Option<i64> {
        let position = self.events.iter().position(|k| *k == key)?;
        self.events.remove(position);

        let index = position as i64 - self.base_index;
        if index < 0 {
            // Keep the indexes of the newer events stable.
            self.base_index -= 1;
        }

        Some(index)
    }

    /// The absolute index of an event.
    pub fn index_of(&self, key: EventKey) -> Option<i64> {
        self.events.iter().position(|k| *k == key).map(|p| p as i64 - self.base_index)
    }

    /// The events of this timeline, resolved through the arena.
    pub fn resolve<'a>(
        &'a self,
        arena: &'a EventArena,
    ) -> impl Iterator<Item = &'a MatrixEvent> + 'a {
        self.events.iter().filter_map(|key| arena.get(*key))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_let;
    use matrix_client_test::{EventFactory, ALICE};

    use super::{Direction, EventTimeline, TimelineId};
    use crate::{
        event::{EventArena, MatrixEvent},
        Error,
    };

    #[test]
    fn test_absolute_indexes_survive_prepends() {
        let f = EventFactory::new().sender(*ALICE);
        let mut arena = EventArena::new();
        let mut timeline = EventTimeline::new(TimelineId(0));

        let events: Vec<_> = (0..3)
            .map(|i| {
                let event = MatrixEvent::new(f.text_msg(&format!("{i}")).into()).unwrap();
                (arena.insert(event.clone()), event)
            })
            .collect();

        assert_eq!(timeline.insert(events[1].0, &events[1].1, false), 0);
        assert_eq!(timeline.insert(events[2].0, &events[2].1, false), 1);
        assert_eq!(timeline.insert(events[0].0, &events[0].1, true), -1);

        assert_eq!(timeline.index_of(events[1].0), Some(0));
        assert_eq!(timeline.index_of(events[0].0), Some(-1));
        assert_eq!(timeline.base_index(), 1);

        let bodies: Vec<_> = timeline
            .resolve(&arena)
            .map(|e| e.content()["body"].as_str().unwrap().to_owned())
            .collect();
        assert_eq!(bodies, ["0", "1", "2"]);

        assert_eq!(timeline.remove(events[0].0), Some(-1));
        assert_eq!(timeline.index_of(events[2].0), Some(1));
    }

    #[test]
    fn test_state_can_only_be_initialised_while_empty() {
        let f = EventFactory::new();
        let mut timeline = EventTimeline::new(TimelineId(0));
        let member = MatrixEvent::new(f.member(*ALICE).into()).unwrap();

        timeline.initialise_state(std::slice::from_ref(&member)).unwrap();
        assert!(timeline.state(Direction::Backward).member(*ALICE).is_some());
        assert!(timeline.state(Direction::Forward).member(*ALICE).is_some());

        let mut arena = EventArena::new();
        let key = arena.insert(member.clone());
        timeline.insert(key, &member, false);
        assert_let!(Err(Error::TimelineNotEmpty) = timeline.initialise_state(&[member]));
    }

    #[test]
    fn test_fork_starts_at_the_end_state() {
        let f = EventFactory::new();
        let mut timeline = EventTimeline::new(TimelineId(0));
        let mut arena = EventArena::new();

        let name = MatrixEvent::new(f.room_name("Room").into()).unwrap();
        let key = arena.insert(name.clone());
        timeline.insert(key, &name, false);
        timeline.set_pagination_token(Some("back".to_owned()), Direction::Backward);

        let fork = timeline.fork(TimelineId(1));
        assert!(fork.is_empty());
        assert_eq!(fork.state(Direction::Backward).name().as_deref(), Some("Room"));
        assert_eq!(fork.pagination_token(Direction::Backward), None);
        assert!(timeline.state(Direction::Backward).name().is_none());
    }
}
