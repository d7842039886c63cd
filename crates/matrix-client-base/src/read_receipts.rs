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

//! Read receipts of a room.
//!
//! Receipts sent by the server and receipts we infer locally, for example when
//! a user sends a message, are tracked side by side. A synthesized receipt is
//! only kept as long as it's ahead of the real one.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap},
};

use ruma::{
    events::receipt::{Receipt, ReceiptType},
    EventId, MilliSecondsSinceUnixEpoch, OwnedEventId, OwnedUserId, UserId,
};
use serde_json::{json, Value as JsonValue};
use tracing::{instrument, trace, warn};

/// A receipt of a user, along with the event it points to.
#[derive(Clone, Debug)]
pub struct ReceiptEntry {
    /// The event the receipt points to.
    pub event_id: OwnedEventId,
    /// The receipt data, its timestamp and thread.
    pub receipt: Receipt,
}

/// A receipt attached to an event, as returned by
/// [`ReceiptTracker::receipts_for_event`].
#[derive(Clone, Debug)]
pub struct EventReceipt {
    /// The user who sent the receipt.
    pub user_id: OwnedUserId,
    /// Public or private read receipt.
    pub receipt_type: ReceiptType,
    /// The receipt data, with timestamp and thread.
    pub receipt: Receipt,
}

#[derive(Clone, Debug, Default)]
struct ReceiptPair {
    real: Option<ReceiptEntry>,
    synthetic: Option<ReceiptEntry>,
}

impl ReceiptPair {
    /// The combined view: the synthesized receipt if there is one, the real
    /// one otherwise.
    fn preferred(&self) -> Option<&ReceiptEntry> {
        self.synthetic.as_ref().or(self.real.as_ref())
    }
}

/// The read receipts of a room.
#[derive(Clone, Debug, Default)]
pub struct ReceiptTracker {
    receipts: HashMap<ReceiptType, BTreeMap<OwnedUserId, ReceiptPair>>,
    /// Event ID => receipts pointing at it, in the combined view.
    by_event: HashMap<OwnedEventId, Vec<EventReceipt>>,
}

fn ts_of(receipt: &Receipt) -> Option<u64> {
    receipt.ts.map(|ts| ts.get().into())
}

impl ReceiptTracker {
    /// Create a tracker with no receipts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the receipts of a `m.receipt` event content.
    ///
    /// The content maps event IDs to receipt types to user IDs to receipts.
    /// Malformed entries are skipped. A receipt only replaces the current one
    /// of the same user and type if `compare` doesn't know it to be older.
    ///
    /// Returns whether any receipt changed.
    #[instrument(skip(self, content, compare))]
    pub fn add_receipt(
        &mut self,
        content: &JsonValue,
        synthetic: bool,
        compare: impl Fn(&EventId, &EventId) -> Option<Ordering>,
    ) -> bool {
        let Some(content) = content.as_object() else {
            warn!("Receipt content isn't an object, ignoring");
            return false;
        };

        let mut changed = false;

        for (event_id, receipt_types) in content {
            let Ok(event_id) = EventId::parse(event_id) else {
                warn!(%event_id, "Receipt for an invalid event ID, ignoring");
                continue;
            };
            let Some(receipt_types) = receipt_types.as_object() else {
                warn!(%event_id, "Malformed receipt, ignoring");
                continue;
            };

            for (receipt_type, users) in receipt_types {
                let receipt_type = ReceiptType::from(receipt_type.as_str());
                let Some(users) = users.as_object() else {
                    warn!(%event_id, %receipt_type, "Malformed receipt, ignoring");
                    continue;
                };

                for (user_id, receipt) in users {
                    let Ok(user_id) = UserId::parse(user_id) else {
                        warn!(%event_id, %user_id, "Receipt of an invalid user ID, ignoring");
                        continue;
                    };
                    let receipt = match serde_json::from_value::<Receipt>(receipt.clone()) {
                        Ok(receipt) => receipt,
                        Err(error) => {
                            warn!(%event_id, %user_id, %error, "Malformed receipt, ignoring");
                            continue;
                        }
                    };

                    let entry = ReceiptEntry { event_id: event_id.clone(), receipt };
                    changed |=
                        self.insert(receipt_type.clone(), user_id, entry, synthetic, &compare);
                }
            }
        }

        if changed {
            self.rebuild_cache();
        }

        changed
    }

    fn insert(
        &mut self,
        receipt_type: ReceiptType,
        user_id: OwnedUserId,
        entry: ReceiptEntry,
        synthetic: bool,
        compare: &impl Fn(&EventId, &EventId) -> Option<Ordering>,
    ) -> bool {
        let pair = self.receipts.entry(receipt_type).or_default().entry(user_id).or_default();

        let existing = if synthetic { pair.preferred() } else { pair.real.as_ref() };

        if let Some(existing) = existing {
            if compare(&existing.event_id, &entry.event_id) == Some(Ordering::Greater) {
                trace!(
                    existing = %existing.event_id,
                    new = %entry.event_id,
                    "The existing receipt is more recent, ignoring the new one"
                );
                return false;
            }
        }

        let (real, synthetic) = if synthetic {
            (pair.real.take(), Some(entry))
        } else {
            (Some(entry), pair.synthetic.take())
        };

        // A synthesized receipt is only useful while the real one lags behind.
        let synthetic = match (&real, synthetic) {
            (Some(real), Some(synthetic)) => {
                match compare(&real.event_id, &synthetic.event_id) {
                    Some(Ordering::Less) | None => Some(synthetic),
                    Some(_) => None,
                }
            }
            (_, synthetic) => synthetic,
        };

        *pair = ReceiptPair { real, synthetic };
        true
    }

    fn rebuild_cache(&mut self) {
        let mut by_event: HashMap<OwnedEventId, Vec<EventReceipt>> = HashMap::new();

        for (receipt_type, users) in &self.receipts {
            for (user_id, pair) in users {
                let Some(entry) = pair.preferred() else { continue };
                by_event.entry(entry.event_id.clone()).or_default().push(EventReceipt {
                    user_id: user_id.clone(),
                    receipt_type: receipt_type.clone(),
                    receipt: entry.receipt.clone(),
                });
            }
        }

        self.by_event = by_event;
    }

    /// Record a receipt we inferred locally.
    pub fn synthesize_receipt(
        &mut self,
        user_id: &UserId,
        event_id: &EventId,
        receipt_type: ReceiptType,
        ts: Option<MilliSecondsSinceUnixEpoch>,
        compare: impl Fn(&EventId, &EventId) -> Option<Ordering>,
    ) -> bool {
        let mut receipt = json!({});
        if let Some(ts) = ts {
            receipt["ts"] = u64::from(ts.get()).into();
        }

        let content = json!({
            event_id.as_str(): {
                receipt_type.to_string(): {
                    user_id.as_str(): receipt,
                },
            },
        });

        self.add_receipt(&content, true, compare)
    }

    /// The receipt of a user, from the combined view unless
    /// `ignore_synthesized` is set.
    pub fn receipt(
        &self,
        user_id: &UserId,
        receipt_type: &ReceiptType,
        ignore_synthesized: bool,
    ) -> Option<&ReceiptEntry> {
        let pair = self.receipts.get(receipt_type)?.get(user_id)?;
        if ignore_synthesized {
            pair.real.as_ref()
        } else {
            pair.preferred()
        }
    }

    /// The event up to which the user has read, considering both their public
    /// and private read receipts.
    ///
    /// The private receipt wins when the two can't be ordered.
    pub fn event_read_up_to(
        &self,
        user_id: &UserId,
        ignore_synthesized: bool,
        compare: impl Fn(&EventId, &EventId) -> Option<Ordering>,
    ) -> Option<OwnedEventId> {
        let public = self.receipt(user_id, &ReceiptType::Read, ignore_synthesized);
        let private = self.receipt(user_id, &ReceiptType::ReadPrivate, ignore_synthesized);

        let (public, private) = match (public, private) {
            (Some(public), Some(private)) => (public, private),
            (public, private) => return private.or(public).map(|r| r.event_id.clone()),
        };

        let ordering = compare(&public.event_id, &private.event_id)
            .filter(|o| o.is_ne())
            .or_else(|| {
                let (a, b) = (ts_of(&public.receipt)?, ts_of(&private.receipt)?);
                Some(a.cmp(&b)).filter(|o| o.is_ne())
            });

        match ordering {
            Some(Ordering::Greater) => Some(public.event_id.clone()),
            _ => Some(private.event_id.clone()),
        }
    }

    /// The receipts pointing at an event.
    pub fn receipts_for_event(&self, event_id: &EventId) -> &[EventReceipt] {
        self.by_event.get(event_id).map(Vec::as_slice).unwrap_or_default()
    }

    /// The users whose read receipt points at an event.
    pub fn users_read_up_to(&self, event_id: &EventId) -> Vec<OwnedUserId> {
        let mut users: Vec<_> = self
            .receipts_for_event(event_id)
            .iter()
            .filter(|r| matches!(r.receipt_type, ReceiptType::Read | ReceiptType::ReadPrivate))
            .map(|r| r.user_id.clone())
            .collect();
        users.sort();
        users.dedup();
        users
    }
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use matrix_client_test::{ALICE, BOB};
    use ruma::{events::receipt::ReceiptType, owned_event_id, EventId, OwnedEventId};
    use serde_json::json;

    use super::ReceiptTracker;

    /// Orders events by their position in `events`, unknown events can't be
    /// ordered.
    fn by_position(
        events: &[OwnedEventId],
    ) -> impl Fn(&EventId, &EventId) -> Option<Ordering> + '_ {
        move |a, b| {
            let a = events.iter().position(|e| e == a)?;
            let b = events.iter().position(|e| e == b)?;
            Some(a.cmp(&b))
        }
    }

    fn event_ids(count: usize) -> Vec<OwnedEventId> {
        (0..count).map(|i| format!("$e{i}:localhost").try_into().unwrap()).collect()
    }

    fn read_receipt(event_id: &EventId, user: &str, ts: u64) -> serde_json::Value {
        json!({ event_id.as_str(): { "m.read": { user: { "ts": ts } } } })
    }

    #[test]
    fn test_receipts_only_move_forward() {
        let events = event_ids(4);
        let mut tracker = ReceiptTracker::new();
        let compare = by_position(&events);

        for (i, event_id) in events.iter().enumerate() {
            let receipt = read_receipt(event_id, ALICE.as_str(), i as u64);
            assert!(tracker.add_receipt(&receipt, false, &compare));
            assert_eq!(tracker.event_read_up_to(*ALICE, false, &compare).as_ref(), Some(event_id));
        }

        let stale = read_receipt(&events[1], ALICE.as_str(), 10);
        assert!(!tracker.add_receipt(&stale, false, &compare));
        assert_eq!(tracker.event_read_up_to(*ALICE, false, &compare), Some(events[3].clone()));
        assert_eq!(tracker.users_read_up_to(&events[3]), vec![ALICE.to_owned()]);
        assert!(tracker.receipts_for_event(&events[1]).is_empty());
    }

    #[test]
    fn test_receipts_that_cant_be_ordered_are_accepted() {
        let known = vec![owned_event_id!("$known:localhost")];
        let unknown = owned_event_id!("$unknown:localhost");
        let mut tracker = ReceiptTracker::new();
        let compare = by_position(&known);

        tracker.add_receipt(&read_receipt(&known[0], ALICE.as_str(), 1), false, &compare);
        assert!(tracker.add_receipt(&read_receipt(&unknown, ALICE.as_str(), 2), false, &compare));
        assert_eq!(tracker.receipt(*ALICE, &ReceiptType::Read, false).unwrap().event_id, unknown);
    }

    #[test]
    fn test_synthesized_receipt_is_dropped_once_the_real_one_catches_up() {
        let events = event_ids(3);
        let mut tracker = ReceiptTracker::new();
        let compare = by_position(&events);

        tracker.add_receipt(&read_receipt(&events[0], BOB.as_str(), 1), false, &compare);
        tracker.synthesize_receipt(*BOB, &events[1], ReceiptType::Read, None, &compare);

        assert_eq!(tracker.receipt(*BOB, &ReceiptType::Read, false).unwrap().event_id, events[1]);
        assert_eq!(tracker.receipt(*BOB, &ReceiptType::Read, true).unwrap().event_id, events[0]);
        assert_eq!(tracker.users_read_up_to(&events[1]), vec![BOB.to_owned()]);

        tracker.add_receipt(&read_receipt(&events[2], BOB.as_str(), 3), false, &compare);
        assert_eq!(tracker.receipt(*BOB, &ReceiptType::Read, false).unwrap().event_id, events[2]);
        assert!(tracker.users_read_up_to(&events[1]).is_empty());
    }

    #[test]
    fn test_private_receipt_wins_when_unordered() {
        let public = owned_event_id!("$public:localhost");
        let private = owned_event_id!("$private:localhost");
        let mut tracker = ReceiptTracker::new();
        let unordered = |_: &EventId, _: &EventId| None;

        tracker.add_receipt(&read_receipt(&public, ALICE.as_str(), 5), false, unordered);
        tracker.add_receipt(
            &json!({ private.as_str(): { "m.read.private": { ALICE.as_str(): { "ts": 5 } } } }),
            false,
            unordered,
        );
        assert_eq!(tracker.event_read_up_to(*ALICE, false, unordered), Some(private.clone()));

        // A newer public receipt wins by timestamp.
        tracker.add_receipt(&read_receipt(&public, ALICE.as_str(), 9), false, unordered);
        assert_eq!(tracker.event_read_up_to(*ALICE, false, unordered), Some(public));
    }

    #[test]
    fn test_malformed_entries_are_skipped() {
        let mut tracker = ReceiptTracker::new();
        let content = json!({
            "not an event id": { "m.read": { ALICE.as_str(): { "ts": 1 } } },
            "$good:localhost": {
                "m.read": {
                    "not a user id": { "ts": 1 },
                    BOB.as_str(): { "ts": 1 },
                },
                "m.read.private": "nope",
            },
        });

        assert!(tracker.add_receipt(&content, false, |_: &EventId, _: &EventId| None));
        let receipts = tracker.receipts_for_event(ruma::event_id!("$good:localhost"));
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].user_id, *BOB);
        assert!(!tracker.add_receipt(&json!([]), false, |_: &EventId, _: &EventId| None));
    }
}
