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

//! Aggregation of the events relating to other events: annotations
//! (reactions), replacements (edits), references and thread replies.

use std::collections::{BTreeSet, HashMap};

use ruma::{EventId, OwnedEventId, OwnedUserId};
use tracing::{debug, trace, warn};

use crate::event::{EventArena, EventKey, MatrixEvent};

/// The relation type of annotations.
pub const ANNOTATION: &str = "m.annotation";
/// The relation type of replacements.
pub const REPLACE: &str = "m.replace";

/// The events relating to one target event with one relation type and event
/// type.
#[derive(Clone, Debug)]
pub struct Relations {
    rel_type: String,
    event_type: String,
    target: Option<EventKey>,
    events: Vec<EventKey>,
    /// Annotation key => annotations, biggest groups first.
    annotations_by_key: Vec<(String, Vec<EventKey>)>,
    annotations_by_sender: HashMap<OwnedUserId, Vec<EventKey>>,
}

impl Relations {
    /// Create an empty collection for one relation type and event type.
    pub fn new(rel_type: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            rel_type: rel_type.into(),
            event_type: event_type.into(),
            target: None,
            events: Vec::new(),
            annotations_by_key: Vec::new(),
            annotations_by_sender: HashMap::new(),
        }
    }

    /// The relation type, e.g. `m.annotation`.
    pub fn rel_type(&self) -> &str {
        &self.rel_type
    }

    /// The event type of the relating events.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// The event the relations point at, once it's known.
    pub fn target(&self) -> Option<EventKey> {
        self.target
    }

    pub(crate) fn set_target(&mut self, target: EventKey) {
        self.target = Some(target);
    }

    /// The relating events, in the order they were added.
    pub fn events(&self) -> &[EventKey] {
        &self.events
    }

    /// The number of relating events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether no events relate to the target yet.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Annotations grouped by key, sorted by descending group size. Groups of
    /// the same size keep their relative order.
    pub fn sorted_annotations_by_key(&self) -> &[(String, Vec<EventKey>)] {
        &self.annotations_by_key
    }

    /// The annotations a user sent.
    pub fn annotations_by_sender(&self) -> &HashMap<OwnedUserId, Vec<EventKey>> {
        &self.annotations_by_sender
    }

    /// Add a relating event.
    ///
    /// Events whose relation doesn't match this container are dropped.
    /// Returns whether the event was added.
    pub fn add_event(&mut self, key: EventKey, event: &MatrixEvent) -> bool {
        if self.events.contains(&key) {
            trace!("Relation already aggregated");
            return false;
        }

        let Some(relation) = event.relation() else {
            warn!(event_id = ?event.event_id(), "Event isn't a relation, ignoring");
            return false;
        };

        if relation.rel_type != self.rel_type || event.event_type() != self.event_type {
            warn!(
                event_id = ?event.event_id(),
                rel_type = %relation.rel_type,
                event_type = event.event_type(),
                expected_rel_type = %self.rel_type,
                expected_event_type = %self.event_type,
                "Event relation doesn't match the relations container, ignoring"
            );
            return false;
        }

        if self.rel_type == ANNOTATION {
            let Some(annotation_key) = relation.key else {
                warn!(event_id = ?event.event_id(), "Annotation without a key, ignoring");
                return false;
            };
            self.add_annotation(key, annotation_key, event.sender());
        }

        self.events.push(key);
        true
    }

    fn add_annotation(&mut self, key: EventKey, annotation: String, sender: Option<OwnedUserId>) {
        match self.annotations_by_key.iter_mut().find(|(k, _)| *k == annotation) {
            Some((_, group)) => group.push(key),
            None => self.annotations_by_key.push((annotation, vec![key])),
        }
        self.sort_annotations();

        if let Some(sender) = sender {
            self.annotations_by_sender.entry(sender).or_default().push(key);
        }
    }

    fn sort_annotations(&mut self) {
        // `sort_by` is stable, equally big groups keep their order.
        self.annotations_by_key.sort_by(|(_, a), (_, b)| b.len().cmp(&a.len()));
    }

    /// Remove a relating event, for example because it got redacted.
    ///
    /// Doesn't look at the content of the event, which a redaction strips.
    pub fn remove_event(&mut self, key: EventKey) -> bool {
        let Some(position) = self.events.iter().position(|k| *k == key) else {
            return false;
        };
        self.events.remove(position);

        if self.rel_type == ANNOTATION {
            for (_, group) in &mut self.annotations_by_key {
                group.retain(|k| *k != key);
            }
            self.annotations_by_key.retain(|(_, group)| !group.is_empty());
            self.sort_annotations();

            for annotations in self.annotations_by_sender.values_mut() {
                annotations.retain(|k| *k != key);
            }
            self.annotations_by_sender.retain(|_, annotations| !annotations.is_empty());
        }

        true
    }

    /// The edit the target should be shown with.
    ///
    /// Only edits from the sender of the target count, and the server may
    /// have told us about an edit it bundled with the target: edits older
    /// than it can't be the latest one, and of the edits with the same
    /// timestamp only the bundled one can. The newest remaining edit wins,
    /// the later one on equal timestamps.
    pub fn last_replacement(&self, arena: &EventArena) -> Option<EventKey> {
        if self.rel_type != REPLACE {
            return None;
        }

        let target = arena.get(self.target?)?;
        let target_sender = target.sender()?;

        let bundled = target.server_aggregated_relation(REPLACE);
        let bundled_ts = bundled.and_then(|r| r.get("origin_server_ts")).and_then(|ts| ts.as_u64());
        let bundled_id = bundled.and_then(|r| r.get("event_id")).and_then(|id| id.as_str());

        let mut last: Option<(EventKey, u64)> = None;

        for &key in &self.events {
            let Some(event) = arena.get(key) else { continue };
            if event.is_redacted() || event.sender().as_ref() != Some(&target_sender) {
                continue;
            }

            let ts = event.ts().unwrap_or_default();
            if let Some(min_ts) = bundled_ts {
                let is_bundled = event.event_id().is_some_and(|id| Some(id.as_str()) == bundled_id);
                if ts < min_ts || (ts == min_ts && !is_bundled) {
                    continue;
                }
            }

            if last.is_some_and(|(_, last_ts)| last_ts > ts) {
                continue;
            }
            last = Some((key, ts));
        }

        last.map(|(key, _)| key)
    }
}

/// Where an aggregated child lives.
#[derive(Clone, Debug)]
struct ChildLocation {
    target: OwnedEventId,
    rel_type: String,
    event_type: String,
}

/// All the relations of a room.
#[derive(Clone, Debug, Default)]
pub struct RelationsContainer {
    relations: HashMap<OwnedEventId, HashMap<(String, String), Relations>>,
    children: HashMap<EventKey, ChildLocation>,
    /// Encrypted children waiting for their decryption.
    deferred: BTreeSet<EventKey>,
}

impl RelationsContainer {
    /// Create an empty container.
    pub fn new() -> Self {
        Self::default()
    }

    /// The relations of a target event, for one relation type and event
    /// type.
    pub fn get_child_events_for_event(
        &self,
        event_id: &EventId,
        rel_type: &str,
        event_type: &str,
    ) -> Option<&Relations> {
        self.relations.get(event_id)?.get(&(rel_type.to_owned(), event_type.to_owned()))
    }

    /// Every relations container of a target event.
    pub fn all_relations_for_event(&self, event_id: &EventId) -> impl Iterator<Item = &Relations> {
        self.relations.get(event_id).into_iter().flat_map(|relations| relations.values())
    }

    /// Aggregate an event that relates to another one.
    ///
    /// Encrypted events are deferred until they're decrypted, the relation
    /// type alone isn't enough to know which container they belong to.
    /// Returns the target if the event was aggregated.
    pub fn aggregate_child_event(
        &mut self,
        arena: &EventArena,
        key: EventKey,
    ) -> Option<OwnedEventId> {
        let event = arena.get(key)?;
        let relation = event.relation()?;

        if event.should_attempt_decryption() {
            trace!(
                event_id = ?event.event_id(),
                "Deferring the aggregation of an encrypted relation"
            );
            self.deferred.insert(key);
            return None;
        }
        self.deferred.remove(&key);

        if self.children.contains_key(&key) {
            return None;
        }

        let event_type = event.event_type().to_owned();
        let rel_type = relation.rel_type;
        let target = relation.event_id;

        let target_key = arena.key_by_event_id(&target);
        let relations = self
            .relations
            .entry(target.clone())
            .or_default()
            .entry((rel_type.clone(), event_type.clone()))
            .or_insert_with(|| {
                let mut relations = Relations::new(rel_type.clone(), event_type.clone());
                if let Some(target_key) = target_key {
                    relations.set_target(target_key);
                }
                relations
            });

        if !relations.add_event(key, event) {
            return None;
        }

        debug!(%target, %rel_type, "Aggregated a relation");
        self.children.insert(key, ChildLocation { target: target.clone(), rel_type, event_type });

        Some(target)
    }

    /// Remember the target of the relations of an event, once it arrives.
    pub fn aggregate_parent_event(&mut self, arena: &EventArena, key: EventKey) {
        let Some(event_id) = arena.get(key).and_then(MatrixEvent::event_id) else { return };
        if let Some(relations) = self.relations.get_mut(&event_id) {
            for relations in relations.values_mut() {
                relations.set_target(key);
            }
        }
    }

    /// Remove an aggregated event, returning the target it related to.
    pub fn remove_child_event(&mut self, key: EventKey) -> Option<OwnedEventId> {
        self.deferred.remove(&key);
        let location = self.children.remove(&key)?;

        if let Some(relations) = self.relations.get_mut(&location.target) {
            let kind = (location.rel_type, location.event_type);
            if let Some(container) = relations.get_mut(&kind) {
                container.remove_event(key);
            }
        }

        Some(location.target)
    }

    /// The target and relation type of an aggregated event.
    pub fn child_relation(&self, key: EventKey) -> Option<(&EventId, &str)> {
        self.children
            .get(&key)
            .map(|location| (location.target.as_ref(), location.rel_type.as_str()))
    }

    /// Is the encrypted event waiting for its decryption to be aggregated.
    pub fn is_deferred(&self, key: EventKey) -> bool {
        self.deferred.contains(&key)
    }
}
