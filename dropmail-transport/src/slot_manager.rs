use crate::{
    error::TransportError,
    slot::{Direction, Slot, SlotRange, SlotRangeSnapshot, SlotState, SlotStats},
};
use dropmail_lib::{ChannelId, MessageId};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Arc, RwLock},
};

#[derive(Debug)]
struct ChannelSlots {
    send: Arc<SlotRange>,
    receive: Arc<SlotRange>,
}

impl ChannelSlots {
    fn range(&self, direction: Direction) -> &Arc<SlotRange> {
        match direction {
            Direction::Send => &self.send,
            Direction::Receive => &self.receive,
        }
    }
}

/// persisted form of all the slot ranges of a [`SlotManager`]
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotsSnapshot {
    pub channels: BTreeMap<ChannelId, ChannelSlotsSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSlotsSnapshot {
    pub send: SlotRangeSnapshot,
    pub receive: SlotRangeSnapshot,
}

/// the slot ranges of all the channels
///
/// the manager only guards the map of channels, each [`SlotRange`] has
/// its own lock.
#[derive(Debug, Default)]
pub struct SlotManager {
    channels: RwLock<HashMap<ChannelId, ChannelSlots>>,
}

impl SlotManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// create the pair of slot ranges of a channel
    ///
    /// if the channel already has its ranges they are kept as they are.
    pub fn init_channel(
        &self,
        channel: ChannelId,
        send_base_key: impl Into<String>,
        receive_base_key: impl Into<String>,
    ) {
        let mut channels = self
            .channels
            .write()
            .expect("the lock should always be valid");

        channels.entry(channel).or_insert_with(|| ChannelSlots {
            send: Arc::new(SlotRange::new(send_base_key, Direction::Send)),
            receive: Arc::new(SlotRange::new(receive_base_key, Direction::Receive)),
        });
    }

    pub fn contains(&self, channel: &ChannelId) -> bool {
        self.channels
            .read()
            .expect("the lock should always be valid")
            .contains_key(channel)
    }

    pub fn range(
        &self,
        channel: &ChannelId,
        direction: Direction,
    ) -> Result<Arc<SlotRange>, TransportError> {
        self.channels
            .read()
            .expect("the lock should always be valid")
            .get(channel)
            .map(|slots| Arc::clone(slots.range(direction)))
            .ok_or(TransportError::SlotRangeNotFound {
                channel: *channel,
                direction,
            })
    }

    pub fn send_range(&self, channel: &ChannelId) -> Result<Arc<SlotRange>, TransportError> {
        self.range(channel, Direction::Send)
    }

    pub fn receive_range(&self, channel: &ChannelId) -> Result<Arc<SlotRange>, TransportError> {
        self.range(channel, Direction::Receive)
    }

    pub fn allocate_send_slot(&self, channel: &ChannelId) -> Result<Slot, TransportError> {
        Ok(self.send_range(channel)?.allocate_slot())
    }

    pub fn mark_used(
        &self,
        channel: &ChannelId,
        direction: Direction,
        number: u64,
        message_id: Option<MessageId>,
    ) -> Result<Slot, TransportError> {
        Ok(self.range(channel, direction)?.mark_used(number, message_id))
    }

    pub fn mark_failed(
        &self,
        channel: &ChannelId,
        direction: Direction,
        number: u64,
        error: impl fmt::Display,
    ) -> Result<SlotState, TransportError> {
        Ok(self.range(channel, direction)?.mark_failed(number, error))
    }

    /// the channels with receive slots to poll, with the slot numbers
    pub fn pending_receives(&self) -> Vec<(ChannelId, Arc<SlotRange>, Vec<u64>)> {
        let channels = self
            .channels
            .read()
            .expect("the lock should always be valid");

        channels
            .iter()
            .filter_map(|(id, slots)| {
                let numbers = slots.receive.slots_to_fetch();
                if numbers.is_empty() {
                    None
                } else {
                    Some((*id, Arc::clone(&slots.receive), numbers))
                }
            })
            .collect()
    }

    /// flag the expired slots of every range, returns how many were flagged
    pub fn clean_expired(&self) -> usize {
        self.ranges()
            .iter()
            .map(|range| range.clean_expired())
            .sum()
    }

    pub fn remove_channel(&self, channel: &ChannelId) -> bool {
        self.channels
            .write()
            .expect("the lock should always be valid")
            .remove(channel)
            .is_some()
    }

    pub fn stats(&self) -> SlotStats {
        let mut stats = SlotStats::default();
        for range in self.ranges() {
            stats.add(&range.stats());
        }
        stats
    }

    /// number of slots allocated for sending, all channels together
    pub fn send_slot_count(&self) -> u64 {
        self.channels
            .read()
            .expect("the lock should always be valid")
            .values()
            .map(|slots| slots.send.next_slot())
            .sum()
    }

    pub fn snapshot(&self) -> SlotsSnapshot {
        let channels = self
            .channels
            .read()
            .expect("the lock should always be valid");

        SlotsSnapshot {
            channels: channels
                .iter()
                .map(|(id, slots)| {
                    let snapshot = ChannelSlotsSnapshot {
                        send: slots.send.snapshot(),
                        receive: slots.receive.snapshot(),
                    };
                    (*id, snapshot)
                })
                .collect(),
        }
    }

    /// replace the ranges of the channels present in the snapshot
    pub fn restore(&self, snapshot: SlotsSnapshot) {
        let mut channels = self
            .channels
            .write()
            .expect("the lock should always be valid");

        for (id, slots) in snapshot.channels {
            channels.insert(
                id,
                ChannelSlots {
                    send: Arc::new(SlotRange::from_snapshot(slots.send)),
                    receive: Arc::new(SlotRange::from_snapshot(slots.receive)),
                },
            );
        }
    }

    fn ranges(&self) -> Vec<Arc<SlotRange>> {
        self.channels
            .read()
            .expect("the lock should always be valid")
            .values()
            .flat_map(|slots| vec![Arc::clone(&slots.send), Arc::clone(&slots.receive)])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn unknown_channel() {
        let manager = SlotManager::new();
        let channel = ChannelId::generate(OsRng);

        assert!(matches!(
            manager.allocate_send_slot(&channel),
            Err(TransportError::SlotRangeNotFound {
                direction: Direction::Send,
                ..
            })
        ));
    }

    #[test]
    fn init_is_idempotent() {
        let manager = SlotManager::new();
        let channel = ChannelId::generate(OsRng);

        manager.init_channel(channel, "send", "receive");
        manager.allocate_send_slot(&channel).unwrap();
        manager.init_channel(channel, "other", "other");

        let range = manager.send_range(&channel).unwrap();
        assert_eq!(range.base_key(), "send");
        assert_eq!(range.next_slot(), 1);
    }

    #[test]
    fn send_slot_count() {
        let manager = SlotManager::new();
        let first = ChannelId::generate(OsRng);
        let second = ChannelId::generate(OsRng);
        manager.init_channel(first, "first-send", "first-receive");
        manager.init_channel(second, "second-send", "second-receive");

        manager.allocate_send_slot(&first).unwrap();
        manager.allocate_send_slot(&first).unwrap();
        manager.allocate_send_slot(&second).unwrap();
        // received slots are not counted
        manager
            .mark_used(&second, Direction::Receive, 7, None)
            .unwrap();

        assert_eq!(manager.send_slot_count(), 3);
    }

    #[test]
    fn pending_receives() {
        let manager = SlotManager::new();
        let channel = ChannelId::generate(OsRng);
        manager.init_channel(channel, "send", "receive");

        let pending = manager.pending_receives();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].0, channel);
        assert_eq!(pending[0].1.base_key(), "receive");
        assert_eq!(pending[0].2, vec![0, 1, 2, 3, 4]);

        assert!(manager.remove_channel(&channel));
        assert!(manager.pending_receives().is_empty());
        assert!(!manager.remove_channel(&channel));
    }

    #[test]
    fn snapshot_json_restore() {
        let manager = SlotManager::new();
        let channel = ChannelId::generate(OsRng);
        manager.init_channel(channel, "send", "receive");
        let slot = manager.allocate_send_slot(&channel).unwrap();
        manager
            .mark_used(&channel, Direction::Send, slot.number, None)
            .unwrap();
        manager
            .mark_failed(&channel, Direction::Receive, 0, "fetch failed")
            .unwrap();

        let json = serde_json::to_vec(&manager.snapshot()).unwrap();
        let snapshot: SlotsSnapshot = serde_json::from_slice(&json).unwrap();

        let restored = SlotManager::new();
        restored.restore(snapshot);

        assert_eq!(restored.snapshot(), manager.snapshot());
        let stats = restored.stats();
        assert_eq!(stats.used, 1);
        assert_eq!(stats.unused, 1);
    }
}
