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

use ruma::{EventId, OwnedEventId, RoomId};

use crate::{
    event::{EventArena, EventKey, MatrixEvent},
    timeline::EventTimelineSet,
};

/// A thread of a room.
///
/// The replies and the relations targeting them live in their own timeline
/// set, the root stays in the main timeline of the room.
#[derive(Debug)]
pub struct Thread {
    root: OwnedEventId,
    timeline_set: EventTimelineSet,
}

impl Thread {
    pub(crate) fn new(room_id: &RoomId, root: OwnedEventId, timeline_support: bool) -> Self {
        Self { root, timeline_set: EventTimelineSet::new(room_id, None, timeline_support) }
    }

    /// The id of the root event.
    pub fn root_id(&self) -> &EventId {
        &self.root
    }

    pub fn timeline_set(&self) -> &EventTimelineSet {
        &self.timeline_set
    }

    pub(crate) fn timeline_set_mut(&mut self) -> &mut EventTimelineSet {
        &mut self.timeline_set
    }

    pub fn contains(&self, key: EventKey) -> bool {
        self.timeline_set.contains(key)
    }

    /// The number of replies in the live timeline of the thread.
    pub fn reply_count(&self, arena: &EventArena) -> usize {
        self.timeline_set
            .live_timeline()
            .resolve(arena)
            .filter(|event| event.thread_root_id().as_deref() == Some(&*self.root))
            .count()
    }

    /// The latest reply of the thread.
    pub fn last_reply<'a>(&self, arena: &'a EventArena) -> Option<&'a MatrixEvent> {
        let events = self.timeline_set.live_timeline().events();
        events
            .iter()
            .rev()
            .filter_map(|key| arena.get(*key))
            .find(|event| event.thread_root_id().as_deref() == Some(&*self.root))
    }
}
