/*!
# slots

a channel carries 2 unbounded streams of messages (one per direction). Each
stream is mapped onto a sequence of network keys: the _slots_. The slot `n`
of a stream lives at the key `{base_key}-slot-{n}` and holds exactly one
message.

The sender allocates the slots in order with [`SlotRange::allocate_slot`]
and the receiver polls a small window of slots after the last one it has
seen (see [`SlotRange::slots_to_fetch`]).

Slots are never removed from a [`SlotRange`], they only go through their
states:

```text
unused ──▶ used ──▶ expired
  │
  └──(3 failures)──▶ failed
```
*/

use chrono::{DateTime, Duration, Utc};
use dropmail_lib::MessageId;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, sync::RwLock};

/// time a slot's data is expected to survive in the network
pub fn slot_ttl() -> Duration {
    Duration::days(7)
}

/// failures before a slot is given up
pub const MAX_RETRIES: u32 = 3;

/// number of slots polled ahead of the last used slot
pub const POLL_AHEAD: u64 = 5;

/// network key of the slot `number` of the range starting at `base_key`
pub fn slot_key(base_key: &str, number: u64) -> String {
    format!("{}-slot-{}", base_key, number)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    Receive,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send => "send".fmt(f),
            Self::Receive => "receive".fmt(f),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    Unused,
    Used,
    Expired,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub number: u64,
    pub state: SlotState,
    pub key: String,
    #[serde(default)]
    pub message_id: Option<MessageId>,
    #[serde(default)]
    pub used_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Slot {
    fn new(base_key: &str, number: u64, now: DateTime<Utc>) -> Self {
        Self {
            number,
            state: SlotState::Unused,
            key: slot_key(base_key, number),
            message_id: None,
            used_at: None,
            expires_at: now + slot_ttl(),
            retries: 0,
            last_error: None,
        }
    }

    /// true once `now` is strictly after the slot's expiry
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotStats {
    pub unused: usize,
    pub used: usize,
    pub expired: usize,
    pub failed: usize,
    pub next_slot: u64,
    pub last_used: Option<u64>,
}

impl SlotStats {
    pub fn total(&self) -> usize {
        self.unused + self.used + self.expired + self.failed
    }

    pub(crate) fn add(&mut self, other: &SlotStats) {
        self.unused += other.unused;
        self.used += other.used;
        self.expired += other.expired;
        self.failed += other.failed;
    }
}

/// persisted form of a [`SlotRange`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRangeSnapshot {
    pub base_key: String,
    pub direction: Direction,
    pub next_slot: u64,
    pub last_used: Option<u64>,
    pub slots: Vec<Slot>,
}

#[derive(Debug)]
struct SlotRangeState {
    next_slot: u64,
    last_used: Option<u64>,
    slots: BTreeMap<u64, Slot>,
}

/// the slots of one direction of one channel
#[derive(Debug)]
pub struct SlotRange {
    base_key: String,
    direction: Direction,
    state: RwLock<SlotRangeState>,
}

impl SlotRange {
    pub fn new(base_key: impl Into<String>, direction: Direction) -> Self {
        Self {
            base_key: base_key.into(),
            direction,
            state: RwLock::new(SlotRangeState {
                next_slot: 0,
                last_used: None,
                slots: BTreeMap::new(),
            }),
        }
    }

    pub fn base_key(&self) -> &str {
        &self.base_key
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn slot_key(&self, number: u64) -> String {
        slot_key(&self.base_key, number)
    }

    pub fn get(&self, number: u64) -> Option<Slot> {
        self.state
            .read()
            .expect("the lock should always be valid")
            .slots
            .get(&number)
            .cloned()
    }

    pub fn next_slot(&self) -> u64 {
        self.state
            .read()
            .expect("the lock should always be valid")
            .next_slot
    }

    pub fn last_used(&self) -> Option<u64> {
        self.state
            .read()
            .expect("the lock should always be valid")
            .last_used
    }

    pub fn allocate_slot(&self) -> Slot {
        self.allocate_slot_at(Utc::now())
    }

    /// take the next slot number of the range
    ///
    /// numbers are never given twice, even if the slot is later marked as
    /// failed.
    pub fn allocate_slot_at(&self, now: DateTime<Utc>) -> Slot {
        let mut state = self.state.write().expect("the lock should always be valid");

        let number = state.next_slot;
        state.next_slot += 1;

        let slot = Slot::new(&self.base_key, number, now);
        state.slots.insert(number, slot.clone());
        slot
    }

    pub fn mark_used(&self, number: u64, message_id: Option<MessageId>) -> Slot {
        self.mark_used_at(number, message_id, Utc::now())
    }

    /// record the slot as holding a message
    ///
    /// on the receiving side the slot may not be known yet, it is created.
    /// Marking an already used slot again does not change it.
    pub fn mark_used_at(
        &self,
        number: u64,
        message_id: Option<MessageId>,
        now: DateTime<Utc>,
    ) -> Slot {
        let mut state = self.state.write().expect("the lock should always be valid");

        let base_key = &self.base_key;
        let slot = state
            .slots
            .entry(number)
            .or_insert_with(|| Slot::new(base_key, number, now));

        if slot.state != SlotState::Used {
            slot.state = SlotState::Used;
            slot.message_id = message_id;
            slot.used_at = Some(now);
            slot.expires_at = now + slot_ttl();
            slot.last_error = None;
        }
        let slot = slot.clone();

        state.last_used = Some(state.last_used.map_or(number, |last| last.max(number)));
        if state.next_slot <= number {
            state.next_slot = number + 1;
        }

        slot
    }

    /// record a failure on the slot, returns the new state of the slot
    ///
    /// a used slot is left untouched.
    pub fn mark_failed(&self, number: u64, error: impl fmt::Display) -> SlotState {
        let mut state = self.state.write().expect("the lock should always be valid");

        let base_key = &self.base_key;
        let slot = state
            .slots
            .entry(number)
            .or_insert_with(|| Slot::new(base_key, number, Utc::now()));

        if slot.state == SlotState::Used {
            return slot.state;
        }

        slot.retries += 1;
        slot.last_error = Some(error.to_string());
        if slot.retries >= MAX_RETRIES {
            slot.state = SlotState::Failed;
        }

        slot.state
    }

    /// the slot numbers to poll on the receiving side
    ///
    /// a window of [`POLL_AHEAD`] numbers after the last used slot (from
    /// `0` if nothing was received yet), minus the slots already used or
    /// given up.
    pub fn slots_to_fetch(&self) -> Vec<u64> {
        let state = self.state.read().expect("the lock should always be valid");

        let start = state.last_used.map_or(0, |last| last + 1);

        (start..start + POLL_AHEAD)
            .filter(|number| {
                !matches!(
                    state.slots.get(number).map(|slot| slot.state),
                    Some(SlotState::Used) | Some(SlotState::Failed)
                )
            })
            .collect()
    }

    pub fn clean_expired(&self) -> usize {
        self.clean_expired_at(Utc::now())
    }

    /// flag the slots past their expiry, returns how many were flagged
    pub fn clean_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.state.write().expect("the lock should always be valid");

        let mut count = 0;
        for slot in state.slots.values_mut() {
            let live = matches!(slot.state, SlotState::Unused | SlotState::Used);
            if live && slot.is_expired_at(now) {
                slot.state = SlotState::Expired;
                count += 1;
            }
        }

        count
    }

    pub fn stats(&self) -> SlotStats {
        let state = self.state.read().expect("the lock should always be valid");

        let mut stats = SlotStats {
            next_slot: state.next_slot,
            last_used: state.last_used,
            ..SlotStats::default()
        };
        for slot in state.slots.values() {
            match slot.state {
                SlotState::Unused => stats.unused += 1,
                SlotState::Used => stats.used += 1,
                SlotState::Expired => stats.expired += 1,
                SlotState::Failed => stats.failed += 1,
            }
        }

        stats
    }

    pub fn snapshot(&self) -> SlotRangeSnapshot {
        let state = self.state.read().expect("the lock should always be valid");

        SlotRangeSnapshot {
            base_key: self.base_key.clone(),
            direction: self.direction,
            next_slot: state.next_slot,
            last_used: state.last_used,
            slots: state.slots.values().cloned().collect(),
        }
    }

    pub fn from_snapshot(snapshot: SlotRangeSnapshot) -> Self {
        let slots = snapshot
            .slots
            .into_iter()
            .map(|slot| (slot.number, slot))
            .collect();

        Self {
            base_key: snapshot.base_key,
            direction: snapshot.direction,
            state: RwLock::new(SlotRangeState {
                next_slot: snapshot.next_slot,
                last_used: snapshot.last_used,
                slots,
            }),
        }
    }
}
