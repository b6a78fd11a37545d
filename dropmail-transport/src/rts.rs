/*!
# Ready-To-Send handshake

a channel is proposed by dropping an RTS at the recipient's RTS key. The
RTS carries a freshly generated [`ChannelKey`] wrapped for the recipient
and an [`RtsPayload`] describing the channel, encrypted with that key.

The [`RtsManager`] keeps the book of the RTS on both sides:

* the **outgoing** requests, until the peer confirms the channel by using
  it (`pending → accepted`) or until they give up:

  ```text
  pending ──▶ accepted
     │ ──────▶ rejected
     │ ──────▶ expired (24h)
     └───────▶ failed  (5 attempts)
  ```

* the **incoming** payloads, until they are accepted or rejected.

States are terminal once they have left `pending`.
*/

use crate::error::TransportError;
use chrono::{DateTime, Duration, Utc};
use dropmail_lib::{ChannelId, ChannelKey, Version};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, RwLock},
};

/// attempts before an outgoing RTS is given up
pub const MAX_RETRIES: u32 = 5;

/// lifetime of an outgoing RTS
pub fn rts_ttl() -> Duration {
    Duration::hours(24)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RtsState {
    Pending,
    Accepted,
    Rejected,
    Expired,
    Failed,
}

impl RtsState {
    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }
}

impl fmt::Display for RtsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => "pending".fmt(f),
            Self::Accepted => "accepted".fmt(f),
            Self::Rejected => "rejected".fmt(f),
            Self::Expired => "expired".fmt(f),
            Self::Failed => "failed".fmt(f),
        }
    }
}

/// an outgoing channel request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtsRequest {
    pub channel_id: ChannelId,
    pub recipient_identity: String,
    pub recipient_rts_key: String,
    pub sender_mailsite_uri: String,
    pub sender_identity: String,
    pub channel_key: ChannelKey,
    pub initiator_slot: u64,
    pub responder_slot: u64,
    pub state: RtsState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// insert attempts, successful or not
    pub retries: u32,
    pub last_error: Option<String>,
}

impl RtsRequest {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn payload(&self, now: DateTime<Utc>) -> RtsPayload {
        RtsPayload {
            version: Version::CURRENT,
            sender_mailsite_uri: self.sender_mailsite_uri.clone(),
            sender_identity: self.sender_identity.clone(),
            recipient_identity: self.recipient_identity.clone(),
            initiator_slot: self.initiator_slot,
            responder_slot: self.responder_slot,
            channel_id: self.channel_id,
            timestamp: now,
        }
    }
}

/// content of an RTS drop, JSON encoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtsPayload {
    pub version: Version,
    pub sender_mailsite_uri: String,
    pub sender_identity: String,
    pub recipient_identity: String,
    pub initiator_slot: u64,
    pub responder_slot: u64,
    pub channel_id: ChannelId,
    pub timestamp: DateTime<Utc>,
}

/// an RTS received and decoded, waiting to be accepted or rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingRts {
    pub payload: RtsPayload,
    pub channel_key: ChannelKey,
    pub received_at: DateTime<Utc>,
}

/// a channel accepted on the responder side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEstablished {
    pub channel_id: ChannelId,
    pub remote_identity: String,
    pub remote_mailsite_uri: String,
    pub channel_key: ChannelKey,
    pub initiator_slot: u64,
    pub responder_slot: u64,
}

pub type RtsReceivedCallback = Arc<dyn Fn(&IncomingRts) + Send + Sync>;
pub type ChannelEstablishedCallback = Arc<dyn Fn(&ChannelEstablished) + Send + Sync>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RtsStats {
    pub pending: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub expired: usize,
    pub failed: usize,
    pub incoming: usize,
}

#[derive(Default)]
struct Requests {
    outgoing: HashMap<ChannelId, RtsRequest>,
    incoming: HashMap<ChannelId, IncomingRts>,
    /// incoming channels already accepted or rejected, with the time they were
    handled: HashMap<ChannelId, DateTime<Utc>>,
}

#[derive(Default)]
pub struct RtsManager {
    requests: RwLock<Requests>,
    on_rts_received: RwLock<Option<RtsReceivedCallback>>,
    on_channel_established: RwLock<Option<ChannelEstablishedCallback>>,
}

impl RtsManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_on_rts_received(&self, callback: RtsReceivedCallback) {
        *self
            .on_rts_received
            .write()
            .expect("the lock should always be valid") = Some(callback);
    }

    pub fn set_on_channel_established(&self, callback: ChannelEstablishedCallback) {
        *self
            .on_channel_established
            .write()
            .expect("the lock should always be valid") = Some(callback);
    }

    /// record a new channel request with a fresh channel key
    pub fn create_rts(
        &self,
        recipient_identity: impl Into<String>,
        recipient_rts_key: impl Into<String>,
        sender_mailsite_uri: impl Into<String>,
        sender_identity: impl Into<String>,
    ) -> RtsRequest {
        let now = Utc::now();
        let request = RtsRequest {
            channel_id: ChannelId::generate(OsRng),
            recipient_identity: recipient_identity.into(),
            recipient_rts_key: recipient_rts_key.into(),
            sender_mailsite_uri: sender_mailsite_uri.into(),
            sender_identity: sender_identity.into(),
            channel_key: ChannelKey::generate(OsRng),
            initiator_slot: 0,
            responder_slot: 0,
            state: RtsState::Pending,
            created_at: now,
            expires_at: now + rts_ttl(),
            retries: 0,
            last_error: None,
        };

        self.requests
            .write()
            .expect("the lock should always be valid")
            .outgoing
            .insert(request.channel_id, request.clone());

        tracing::debug!(channel = %request.channel_id, recipient = %request.recipient_identity, "RTS created");

        request
    }

    pub fn get(&self, channel: &ChannelId) -> Option<RtsRequest> {
        self.requests
            .read()
            .expect("the lock should always be valid")
            .outgoing
            .get(channel)
            .cloned()
    }

    pub fn get_pending_rts(&self) -> Vec<RtsRequest> {
        self.get_pending_rts_at(Utc::now())
    }

    /// the outgoing requests still pending and not expired
    pub fn get_pending_rts_at(&self, now: DateTime<Utc>) -> Vec<RtsRequest> {
        self.requests
            .read()
            .expect("the lock should always be valid")
            .outgoing
            .values()
            .filter(|request| request.state == RtsState::Pending && !request.is_expired_at(now))
            .cloned()
            .collect()
    }

    /// record a successful insert of the RTS
    ///
    /// the request stays pending, the retry counter is used as a counter
    /// of the drops made.
    pub fn mark_sent(&self, channel: &ChannelId) -> Result<RtsRequest, TransportError> {
        self.update(channel, |request| {
            if request.state == RtsState::Pending {
                request.retries += 1;
                request.last_error = None;
            }
        })
    }

    /// record a failed attempt, returns the new state of the request
    pub fn mark_failed(
        &self,
        channel: &ChannelId,
        error: impl fmt::Display,
    ) -> Result<RtsState, TransportError> {
        let request = self.update(channel, |request| {
            if request.state == RtsState::Pending {
                request.retries += 1;
                request.last_error = Some(error.to_string());
                if request.retries >= MAX_RETRIES {
                    request.state = RtsState::Failed;
                }
            }
        })?;

        if request.state == RtsState::Failed {
            tracing::warn!(channel = %channel, retries = request.retries, "giving up on the RTS");
        }

        Ok(request.state)
    }

    /// returns `true` if the request was pending and is now accepted
    pub fn mark_accepted(&self, channel: &ChannelId) -> Result<bool, TransportError> {
        self.transition(channel, RtsState::Accepted)
    }

    /// returns `true` if the request was pending and is now rejected
    pub fn mark_rejected(&self, channel: &ChannelId) -> Result<bool, TransportError> {
        self.transition(channel, RtsState::Rejected)
    }

    pub fn clean_expired(&self) -> usize {
        self.clean_expired_at(Utc::now())
    }

    /// move the expired pending requests to `expired`
    ///
    /// incoming payloads older than the RTS lifetime are dropped. Handled
    /// channels are forgotten after twice that lifetime: by then any RTS
    /// drop of theirs is stale and refused on its timestamp.
    pub fn clean_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut requests = self
            .requests
            .write()
            .expect("the lock should always be valid");

        let mut count = 0;
        for request in requests.outgoing.values_mut() {
            if request.state == RtsState::Pending && request.is_expired_at(now) {
                request.state = RtsState::Expired;
                count += 1;
            }
        }

        requests
            .incoming
            .retain(|_, incoming| now <= incoming.received_at + rts_ttl());
        requests
            .handled
            .retain(|_, handled_at| now <= *handled_at + rts_ttl() + rts_ttl());

        count
    }

    /// store a decoded incoming RTS
    ///
    /// returns `false` (and does nothing) if the channel is already known:
    /// the initiator keeps dropping the same RTS until the channel is used.
    /// Payloads older than the RTS lifetime are refused too.
    pub fn process_incoming_rts(&self, payload: RtsPayload, channel_key: ChannelKey) -> bool {
        self.process_incoming_rts_at(payload, channel_key, Utc::now())
    }

    pub fn process_incoming_rts_at(
        &self,
        payload: RtsPayload,
        channel_key: ChannelKey,
        now: DateTime<Utc>,
    ) -> bool {
        let channel = payload.channel_id;
        if payload.timestamp + rts_ttl() < now {
            tracing::debug!(%channel, timestamp = %payload.timestamp, "stale RTS ignored");
            return false;
        }

        let incoming = IncomingRts {
            payload,
            channel_key,
            received_at: now,
        };

        {
            let mut requests = self
                .requests
                .write()
                .expect("the lock should always be valid");

            if requests.handled.contains_key(&channel)
                || requests.incoming.contains_key(&channel)
                || requests.outgoing.contains_key(&channel)
            {
                return false;
            }

            requests.incoming.insert(channel, incoming.clone());
        }

        tracing::info!(%channel, sender = %incoming.payload.sender_identity, "RTS received");

        let callback = self
            .on_rts_received
            .read()
            .expect("the lock should always be valid")
            .clone();
        if let Some(callback) = callback {
            callback(&incoming);
        }

        true
    }

    pub fn incoming_rts(&self) -> Vec<IncomingRts> {
        self.requests
            .read()
            .expect("the lock should always be valid")
            .incoming
            .values()
            .cloned()
            .collect()
    }

    /// accept the stored incoming RTS of the channel
    ///
    /// the channel key is the one recovered when the RTS was decoded.
    pub fn accept_rts(&self, channel: &ChannelId) -> Result<ChannelEstablished, TransportError> {
        let incoming = self.take_incoming(channel)?;

        let established = ChannelEstablished {
            channel_id: *channel,
            remote_identity: incoming.payload.sender_identity,
            remote_mailsite_uri: incoming.payload.sender_mailsite_uri,
            channel_key: incoming.channel_key,
            initiator_slot: incoming.payload.initiator_slot,
            responder_slot: incoming.payload.responder_slot,
        };

        let callback = self
            .on_channel_established
            .read()
            .expect("the lock should always be valid")
            .clone();
        if let Some(callback) = callback {
            callback(&established);
        }

        Ok(established)
    }

    pub fn reject_rts(&self, channel: &ChannelId) -> Result<(), TransportError> {
        self.take_incoming(channel)?;
        tracing::info!(%channel, "RTS rejected");
        Ok(())
    }

    /// prevent any later RTS for this channel to be processed
    pub fn mark_handled(&self, channel: ChannelId) {
        self.requests
            .write()
            .expect("the lock should always be valid")
            .handled
            .insert(channel, Utc::now());
    }

    pub fn stats(&self) -> RtsStats {
        let requests = self
            .requests
            .read()
            .expect("the lock should always be valid");

        let mut stats = RtsStats {
            incoming: requests.incoming.len(),
            ..RtsStats::default()
        };
        for request in requests.outgoing.values() {
            match request.state {
                RtsState::Pending => stats.pending += 1,
                RtsState::Accepted => stats.accepted += 1,
                RtsState::Rejected => stats.rejected += 1,
                RtsState::Expired => stats.expired += 1,
                RtsState::Failed => stats.failed += 1,
            }
        }
        stats
    }

    fn take_incoming(&self, channel: &ChannelId) -> Result<IncomingRts, TransportError> {
        let mut requests = self
            .requests
            .write()
            .expect("the lock should always be valid");

        let incoming = requests
            .incoming
            .remove(channel)
            .ok_or(TransportError::RtsNotFound(*channel))?;
        requests.handled.insert(*channel, Utc::now());

        Ok(incoming)
    }

    fn transition(&self, channel: &ChannelId, target: RtsState) -> Result<bool, TransportError> {
        let mut changed = false;
        self.update(channel, |request| {
            if request.state == RtsState::Pending {
                request.state = target;
                changed = true;
            }
        })?;

        if changed {
            tracing::info!(%channel, state = %target, "RTS completed");
        }
        Ok(changed)
    }

    fn update<F>(&self, channel: &ChannelId, f: F) -> Result<RtsRequest, TransportError>
    where
        F: FnOnce(&mut RtsRequest),
    {
        let mut requests = self
            .requests
            .write()
            .expect("the lock should always be valid");

        let request = requests
            .outgoing
            .get_mut(channel)
            .ok_or(TransportError::RtsNotFound(*channel))?;
        f(request);

        Ok(request.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn create(manager: &RtsManager) -> RtsRequest {
        manager.create_rts("bob", "KSK@bob-rts", "USK@alice/mailsite", "alice")
    }

    fn incoming_payload() -> (RtsPayload, ChannelKey) {
        let payload = RtsPayload {
            version: Version::CURRENT,
            sender_mailsite_uri: "USK@alice/mailsite".to_owned(),
            sender_identity: "alice".to_owned(),
            recipient_identity: "bob".to_owned(),
            initiator_slot: 0,
            responder_slot: 0,
            channel_id: ChannelId::generate(OsRng),
            timestamp: Utc::now(),
        };
        (payload, ChannelKey::generate(OsRng))
    }

    #[test]
    fn create_pending() {
        let manager = RtsManager::new();
        let request = create(&manager);

        assert_eq!(request.state, RtsState::Pending);
        assert_eq!(request.initiator_slot, 0);
        assert_eq!(request.responder_slot, 0);
        assert_eq!(request.expires_at - request.created_at, rts_ttl());
        assert_eq!(manager.get_pending_rts(), vec![request]);
    }

    #[test]
    fn five_failures_give_up() {
        let manager = RtsManager::new();
        let request = create(&manager);

        for _ in 0..MAX_RETRIES - 1 {
            assert_eq!(
                manager.mark_failed(&request.channel_id, "insert failed").unwrap(),
                RtsState::Pending
            );
        }
        assert_eq!(
            manager.mark_failed(&request.channel_id, "insert failed").unwrap(),
            RtsState::Failed
        );

        assert!(manager.get_pending_rts().is_empty());
        assert_eq!(manager.stats().failed, 1);
    }

    #[test]
    fn sent_stays_pending() {
        let manager = RtsManager::new();
        let request = create(&manager);

        let request = manager.mark_sent(&request.channel_id).unwrap();
        assert_eq!(request.state, RtsState::Pending);
        assert_eq!(request.retries, 1);
    }

    #[test]
    fn expired_pending_is_reclassified() {
        let manager = RtsManager::new();
        let request = create(&manager);

        assert_eq!(manager.clean_expired_at(request.created_at + Duration::hours(23)), 0);
        assert!(manager
            .get_pending_rts_at(request.expires_at + Duration::seconds(1))
            .is_empty());

        assert_eq!(manager.clean_expired_at(request.expires_at + Duration::seconds(1)), 1);
        assert_eq!(manager.get(&request.channel_id).unwrap().state, RtsState::Expired);
    }

    #[test]
    fn terminal_states_never_revert() {
        let manager = RtsManager::new();
        let request = create(&manager);

        assert!(manager.mark_accepted(&request.channel_id).unwrap());
        assert!(!manager.mark_rejected(&request.channel_id).unwrap());
        manager.mark_failed(&request.channel_id, "late").unwrap();
        manager.clean_expired_at(request.expires_at + Duration::days(1));

        let request = manager.get(&request.channel_id).unwrap();
        assert_eq!(request.state, RtsState::Accepted);
        assert_eq!(request.retries, 0);
    }

    #[test]
    fn unknown_request() {
        let manager = RtsManager::new();
        let channel = ChannelId::generate(OsRng);

        assert!(matches!(
            manager.mark_sent(&channel),
            Err(TransportError::RtsNotFound(id)) if id == channel
        ));
    }

    #[test]
    fn incoming_accept() {
        let manager = RtsManager::new();
        let established = Arc::new(Mutex::new(Vec::new()));
        let received = Arc::new(Mutex::new(0));
        {
            let established = Arc::clone(&established);
            manager.set_on_channel_established(Arc::new(move |e: &ChannelEstablished| {
                established.lock().unwrap().push(e.clone())
            }));
            let received = Arc::clone(&received);
            manager.set_on_rts_received(Arc::new(move |_: &IncomingRts| {
                *received.lock().unwrap() += 1
            }));
        }

        let (payload, key) = incoming_payload();
        let channel = payload.channel_id;

        assert!(manager.process_incoming_rts(payload.clone(), key.clone()));
        // the initiator drops the same RTS again
        assert!(!manager.process_incoming_rts(payload.clone(), key.clone()));
        assert_eq!(*received.lock().unwrap(), 1);

        let result = manager.accept_rts(&channel).unwrap();
        assert_eq!(result.remote_identity, "alice");
        assert_eq!(result.channel_key, key);
        assert_eq!(established.lock().unwrap().as_slice(), &[result]);

        // handled: not stored again and cannot be accepted twice
        assert!(!manager.process_incoming_rts(payload, key));
        assert!(manager.accept_rts(&channel).is_err());
    }

    #[test]
    fn incoming_reject() {
        let manager = RtsManager::new();
        let (payload, key) = incoming_payload();
        let channel = payload.channel_id;

        manager.process_incoming_rts(payload, key);
        assert_eq!(manager.stats().incoming, 1);

        manager.reject_rts(&channel).unwrap();
        assert_eq!(manager.stats().incoming, 0);
        assert!(matches!(
            manager.accept_rts(&channel),
            Err(TransportError::RtsNotFound(_))
        ));
    }

    #[test]
    fn handled_channels_are_forgotten() {
        let manager = RtsManager::new();
        let (payload, key) = incoming_payload();
        let channel = payload.channel_id;
        let now = payload.timestamp;

        assert!(manager.process_incoming_rts_at(payload.clone(), key.clone(), now));
        manager.reject_rts(&channel).unwrap();

        manager.clean_expired_at(now + Duration::hours(25));
        assert!(!manager.process_incoming_rts_at(payload.clone(), key.clone(), now));

        let later = now + Duration::days(3);
        manager.clean_expired_at(later);
        assert!(manager.requests.read().unwrap().handled.is_empty());

        // the old drop is still on the network but too old to be taken again
        assert!(!manager.process_incoming_rts_at(payload, key, later));
        assert_eq!(manager.stats().incoming, 0);
    }
}
