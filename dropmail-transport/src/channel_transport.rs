use crate::{
    channel::{Channel, TransportMessage, MAX_MESSAGE_SIZE},
    error::TransportError,
};
use chrono::Utc;
use dropmail_lib::{ChannelId, EncryptedMessage, MessageCrypto, MessageId, RsaPublicKey};
use indexmap::IndexMap;
use rand::rngs::OsRng;
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, RwLock},
};

pub type MessageCallback = Arc<dyn Fn(&TransportMessage) + Send + Sync>;

/// encoding and decoding of the messages of one channel
///
/// keeps the messages queued for sending, in order, until their insert
/// in the network succeeded.
pub struct ChannelTransport {
    channel: RwLock<Channel>,
    crypto: MessageCrypto,
    remote_public_key: RsaPublicKey,
    queue: Mutex<IndexMap<MessageId, TransportMessage>>,
    on_sent: RwLock<Option<MessageCallback>>,
    on_received: RwLock<Option<MessageCallback>>,
}

impl ChannelTransport {
    pub fn new(channel: Channel, crypto: MessageCrypto, remote_public_key: RsaPublicKey) -> Self {
        Self {
            channel: RwLock::new(channel),
            crypto,
            remote_public_key,
            queue: Mutex::new(IndexMap::new()),
            on_sent: RwLock::new(None),
            on_received: RwLock::new(None),
        }
    }

    pub fn set_on_message_sent(&self, callback: MessageCallback) {
        *self.on_sent.write().expect("the lock should always be valid") = Some(callback);
    }

    pub fn set_on_message_received(&self, callback: MessageCallback) {
        *self
            .on_received
            .write()
            .expect("the lock should always be valid") = Some(callback);
    }

    pub fn channel(&self) -> Channel {
        self.channel
            .read()
            .expect("the lock should always be valid")
            .clone()
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel
            .read()
            .expect("the lock should always be valid")
            .id
    }

    pub fn remote_public_key(&self) -> &RsaPublicKey {
        &self.remote_public_key
    }

    pub fn update_channel<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Channel) -> R,
    {
        let mut channel = self
            .channel
            .write()
            .expect("the lock should always be valid");
        f(&mut channel)
    }

    pub fn queued(&self) -> Vec<TransportMessage> {
        self.queue
            .lock()
            .expect("the lock should always be valid")
            .values()
            .cloned()
            .collect()
    }

    pub fn queue_len(&self) -> usize {
        self.queue
            .lock()
            .expect("the lock should always be valid")
            .len()
    }

    /// build a new message and append it to the outbound queue
    pub fn queue_message(
        &self,
        subject: impl Into<String>,
        body: Vec<u8>,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        headers: BTreeMap<String, String>,
    ) -> Result<TransportMessage, TransportError> {
        let channel = self.channel();
        if !channel.can_send() {
            return Err(TransportError::ChannelNotWritable {
                channel: channel.id,
                state: channel.state,
            });
        }

        let message = TransportMessage {
            id: MessageId::new(OsRng, &body),
            channel_id: channel.id,
            sender: sender.into(),
            recipient: recipient.into(),
            subject: subject.into(),
            body,
            headers,
            timestamp: Utc::now(),
            slot: None,
        };

        self.queue
            .lock()
            .expect("the lock should always be valid")
            .insert(message.id, message.clone());

        Ok(message)
    }

    /// encrypt a message for the remote
    ///
    /// with the channel key once the channel is established, with the
    /// remote's public key before that.
    pub fn encrypt_message(
        &self,
        message: &TransportMessage,
    ) -> Result<EncryptedMessage, TransportError> {
        let bytes = serde_json::to_vec(message)?;
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(TransportError::MessageTooLarge {
                size: bytes.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let (established, channel_key) = {
            let channel = self.channel.read().expect("the lock should always be valid");
            (channel.established, channel.channel_key.clone())
        };

        let encrypted = if established {
            self.crypto.encrypt_with_channel_key(&bytes, &channel_key)?
        } else {
            self.crypto
                .encrypt_message(&bytes, &self.remote_public_key)?
        };

        Ok(encrypted)
    }

    /// decrypt a message of the remote, the signature is always checked
    pub fn decrypt_message(&self, message: &EncryptedMessage) -> Result<Vec<u8>, TransportError> {
        let plaintext = if message.is_symmetric() {
            let channel_key = self
                .channel
                .read()
                .expect("the lock should always be valid")
                .channel_key
                .clone();
            self.crypto.decrypt_with_channel_key(
                message,
                &channel_key,
                Some(&self.remote_public_key),
            )?
        } else {
            self.crypto
                .decrypt_message(message, Some(&self.remote_public_key))?
        };

        Ok(plaintext)
    }

    /// remove the message from the queue once it is in the network
    pub fn mark_message_sent(&self, id: &MessageId, slot: u64) -> Option<TransportMessage> {
        let mut message = self
            .queue
            .lock()
            .expect("the lock should always be valid")
            .shift_remove(id)?;
        message.slot = Some(slot);

        self.update_channel(|channel| {
            channel.send_slot = channel.send_slot.max(slot + 1);
            channel.touch(Utc::now());
        });

        let callback = self
            .on_sent
            .read()
            .expect("the lock should always be valid")
            .clone();
        if let Some(callback) = callback {
            callback(&message);
        }

        Some(message)
    }

    /// remove the message from the queue without sending it
    pub fn drop_message(&self, id: &MessageId) -> Option<TransportMessage> {
        self.queue
            .lock()
            .expect("the lock should always be valid")
            .shift_remove(id)
    }

    /// decrypt and decode a message received in the given slot
    ///
    /// the first message decrypted with the channel key proves the remote
    /// holds it: the channel becomes established.
    pub fn process_received_message(
        &self,
        message: &EncryptedMessage,
        slot: u64,
    ) -> Result<TransportMessage, TransportError> {
        let plaintext = self.decrypt_message(message)?;
        let mut received: TransportMessage = serde_json::from_slice(&plaintext)?;

        let channel_id = self.channel_id();
        if received.channel_id != channel_id {
            return Err(TransportError::ChannelMismatch {
                expected: channel_id,
                found: received.channel_id,
            });
        }
        received.slot = Some(slot);

        self.update_channel(|channel| {
            if message.is_symmetric() && !channel.established {
                tracing::info!(channel = %channel.id, "channel established");
                channel.established = true;
            }
            channel.receive_slot = channel.receive_slot.max(slot + 1);
            channel.touch(Utc::now());
        });

        let callback = self
            .on_received
            .read()
            .expect("the lock should always be valid")
            .clone();
        if let Some(callback) = callback {
            callback(&received);
        }

        Ok(received)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::ChannelState,
        test_utils::{alice, bob},
    };
    use dropmail_lib::ChannelKey;

    fn pair() -> (ChannelTransport, ChannelTransport) {
        let now = Utc::now();
        let id = ChannelId::generate(OsRng);
        let key = ChannelKey::generate(OsRng);

        let alice_crypto = alice();
        let bob_crypto = bob();

        let initiator = ChannelTransport::new(
            Channel::new_initiator(id, "bob", key.clone(), now),
            alice_crypto.clone(),
            bob_crypto.public_key().clone(),
        );
        let responder = ChannelTransport::new(
            Channel::new_responder(id, "alice", key, now),
            bob_crypto,
            alice_crypto.public_key().clone(),
        );

        (initiator, responder)
    }

    #[test]
    fn bootstrap_then_symmetric() {
        let (alice, bob) = pair();

        // the initiator is not established: RSA hybrid
        let message = alice
            .queue_message("hello", b"hi bob".to_vec(), "alice", "bob", BTreeMap::new())
            .unwrap();
        let encrypted = alice.encrypt_message(&message).unwrap();
        assert!(!encrypted.is_symmetric());

        let received = bob.process_received_message(&encrypted, 0).unwrap();
        assert_eq!(received.body, b"hi bob");
        assert_eq!(received.slot, Some(0));

        // the responder is: channel key
        let reply = bob
            .queue_message("re: hello", b"hi alice".to_vec(), "bob", "alice", BTreeMap::new())
            .unwrap();
        let encrypted = bob.encrypt_message(&reply).unwrap();
        assert!(encrypted.is_symmetric());

        assert!(!alice.channel().established);
        let received = alice.process_received_message(&encrypted, 0).unwrap();
        assert_eq!(received.subject, "re: hello");
        assert!(alice.channel().established);
    }

    #[test]
    fn queue_order_and_sent() {
        let (alice, _bob) = pair();
        let sent = Arc::new(Mutex::new(Vec::new()));
        {
            let sent = Arc::clone(&sent);
            alice.set_on_message_sent(Arc::new(move |message: &TransportMessage| {
                sent.lock().unwrap().push(message.clone())
            }));
        }

        let first = alice
            .queue_message("1", vec![1], "alice", "bob", BTreeMap::new())
            .unwrap();
        let second = alice
            .queue_message("2", vec![2], "alice", "bob", BTreeMap::new())
            .unwrap();
        assert_eq!(
            alice.queued().iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![first.id, second.id]
        );

        let message = alice.mark_message_sent(&first.id, 7).unwrap();
        assert_eq!(message.slot, Some(7));
        assert_eq!(alice.queue_len(), 1);
        assert_eq!(alice.channel().send_slot, 8);
        assert_eq!(sent.lock().unwrap().len(), 1);

        assert!(alice.mark_message_sent(&first.id, 8).is_none());
        assert!(alice.drop_message(&second.id).is_some());
        assert_eq!(alice.queue_len(), 0);
    }

    #[test]
    fn too_large() {
        let (alice, _bob) = pair();

        let message = alice
            .queue_message("big", vec![0; MAX_MESSAGE_SIZE], "alice", "bob", BTreeMap::new())
            .unwrap();

        assert!(matches!(
            alice.encrypt_message(&message),
            Err(TransportError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn read_only_cannot_send() {
        let (alice, _bob) = pair();
        alice.update_channel(|channel| channel.state = ChannelState::ReadOnly);

        assert!(matches!(
            alice.queue_message("x", vec![], "alice", "bob", BTreeMap::new()),
            Err(TransportError::ChannelNotWritable {
                state: ChannelState::ReadOnly,
                ..
            })
        ));
    }

    #[test]
    fn message_of_another_channel() {
        let (_alice, bob) = pair();
        let (carol, _) = pair();

        let message = carol
            .queue_message("x", vec![], "alice", "bob", BTreeMap::new())
            .unwrap();
        // encrypted by alice's identity, for bob, but on another channel
        let encrypted = carol.encrypt_message(&message).unwrap();

        assert!(matches!(
            bob.process_received_message(&encrypted, 0),
            Err(TransportError::ChannelMismatch { .. })
        ));
    }
}
