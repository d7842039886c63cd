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

//! Ordering events of a room.
//!
//! Events of the same timeline are ordered by their position. An event of the
//! live timeline is newer than any event of a historical one. Past that, the
//! timestamp of the events is all we have, which isn't reliable: events
//! received through backfill may carry any timestamp. Events that aren't part
//! of the timeline set can't be ordered at all.

use std::{cmp::Ordering, collections::BTreeMap};

use ruma::{EventId, OwnedEventId};

use super::Thread;
use crate::{
    event::{EventArena, EventKey},
    timeline::EventTimelineSet,
};

/// Compares events of a room, see the [module docs](self).
#[derive(Clone, Copy, Debug)]
pub struct EventOrdering<'a> {
    arena: &'a EventArena,
    timeline_set: &'a EventTimelineSet,
    threads: &'a BTreeMap<OwnedEventId, Thread>,
}

impl<'a> EventOrdering<'a> {
    pub(crate) fn new(
        arena: &'a EventArena,
        timeline_set: &'a EventTimelineSet,
        threads: &'a BTreeMap<OwnedEventId, Thread>,
    ) -> Self {
        Self { arena, timeline_set, threads }
    }

    /// Compare two events by id.
    ///
    /// `None` if one of the events is unknown or they can't be ordered.
    pub fn compare(&self, a: &EventId, b: &EventId) -> Option<Ordering> {
        let a = self.arena.key_by_event_id(a)?;
        let b = self.arena.key_by_event_id(b)?;
        self.compare_keys(a, b)
    }

    /// Compare two events of the arena.
    pub fn compare_keys(&self, a: EventKey, b: EventKey) -> Option<Ordering> {
        if a == b {
            return Some(Ordering::Equal);
        }

        let thread_a = self.thread_of(a);
        let thread_b = self.thread_of(b);

        match (thread_a, thread_b) {
            (Some(ta), Some(tb)) if ta.root_id() == tb.root_id() => {
                self.compare_in(ta.timeline_set(), a, b)
            }
            (None, None) => self.compare_in(self.timeline_set, a, b),
            _ => {
                // Events of different threads are ordered like their roots.
                let root_a = self.main_timeline_key(a, thread_a)?;
                let root_b = self.main_timeline_key(b, thread_b)?;

                if root_a == root_b {
                    // One of the events is the root of the thread of the other.
                    let ordering =
                        if thread_a.is_none() { Ordering::Less } else { Ordering::Greater };
                    return Some(ordering);
                }

                self.compare_in(self.timeline_set, root_a, root_b)
            }
        }
    }

    fn thread_of(&self, key: EventKey) -> Option<&'a Thread> {
        let root = self.arena.get(key)?.thread_root_id();
        match root.and_then(|root| self.threads.get(&root)) {
            Some(thread) if thread.contains(key) => Some(thread),
            _ => self.threads.values().find(|thread| thread.contains(key)),
        }
    }

    fn main_timeline_key(&self, key: EventKey, thread: Option<&Thread>) -> Option<EventKey> {
        match thread {
            Some(thread) => self.arena.key_by_event_id(thread.root_id()),
            None => Some(key),
        }
    }

    fn compare_in(&self, set: &EventTimelineSet, a: EventKey, b: EventKey) -> Option<Ordering> {
        if let Some(ordering) = set.compare_event_ordering(a, b) {
            return Some(ordering);
        }

        let live = set.live_timeline().id();
        let a_is_live = set.timeline_for_event(a)? == live;
        let b_is_live = set.timeline_for_event(b)? == live;

        match (a_is_live, b_is_live) {
            (true, false) => Some(Ordering::Greater),
            (false, true) => Some(Ordering::Less),
            _ => {
                let a = self.arena.get(a)?.ts()?;
                let b = self.arena.get(b)?.ts()?;
                Some(a.cmp(&b))
            }
        }
    }
}
