use crate::{
    channel::{Channel, ChannelState, TransportMessage},
    channel_transport::{ChannelTransport, MessageCallback},
    config::Config,
    error::TransportError,
    interface::{Fetch, Insert, Network, PublicKeyDirectory},
    mailsite::{Mailsite, MailsiteFetcher, MailsitePublisher},
    rts::{ChannelEstablishedCallback, RtsManager, RtsPayload, RtsReceivedCallback},
    rts_codec::RtsEncoder,
    rts_fetcher::{RtsFetcher, RtsHandler},
    rts_sender::RtsSender,
    slot::Direction,
    slot_manager::SlotManager,
    slot_poller::{PollReport, SlotHandler, SlotPoller},
    worker::{Worker, Workers},
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dropmail_lib::{
    crypto::public_key_to_pem, ChannelId, ChannelKey, EncryptedMessage, MessageCrypto, MessageId,
    RsaPublicKey,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, RwLock},
};

/// the local identity the transport runs for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub identity: String,
    pub nickname: String,
    pub mailsite_uri: String,
    pub rts_key: String,
}

/// entry point of the transport
///
/// owns the channels and all the managers, and runs the background
/// workers (see [`TransportManager::start`]).
pub struct TransportManager {
    config: Config,
    account: Account,
    crypto: MessageCrypto,

    inserter: Arc<dyn Insert>,
    fetcher: Arc<dyn Fetch>,
    directory: Arc<dyn PublicKeyDirectory>,

    rts: Arc<RtsManager>,
    slots: Arc<SlotManager>,
    mailsite: Arc<Mailsite>,
    mailsites: MailsiteFetcher,
    rts_sender: Arc<RtsSender>,

    transports: RwLock<HashMap<ChannelId, Arc<ChannelTransport>>>,
    on_message_sent: RwLock<Option<MessageCallback>>,
    on_message_received: RwLock<Option<MessageCallback>>,
}

impl TransportManager {
    pub fn new<N>(
        config: Config,
        account: Account,
        crypto: MessageCrypto,
        network: Arc<N>,
    ) -> Result<Self, TransportError>
    where
        N: Network + 'static,
    {
        let inserter = Arc::clone(&network) as Arc<dyn Insert>;
        let fetcher = Arc::clone(&network) as Arc<dyn Fetch>;
        let directory = network as Arc<dyn PublicKeyDirectory>;

        let rts = Arc::new(RtsManager::new());
        let slots = Arc::new(SlotManager::new());

        let mailsite = Arc::new(Mailsite::new(
            account.mailsite_uri.clone(),
            account.identity.clone(),
            account.nickname.clone(),
            account.rts_key.clone(),
            public_key_to_pem(crypto.public_key())?,
            config.slot_key_prefix.clone(),
            Arc::clone(&inserter),
        ));
        let mailsites = MailsiteFetcher::new(Arc::clone(&fetcher), config.mailsite_cache_size);
        let rts_sender = Arc::new(RtsSender::new(
            Arc::clone(&rts),
            RtsEncoder::new(crypto.clone()),
            Arc::clone(&directory),
            Arc::clone(&inserter),
        ));

        Ok(Self {
            config,
            account,
            crypto,
            inserter,
            fetcher,
            directory,
            rts,
            slots,
            mailsite,
            mailsites,
            rts_sender,
            transports: RwLock::new(HashMap::new()),
            on_message_sent: RwLock::new(None),
            on_message_received: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn rts(&self) -> &Arc<RtsManager> {
        &self.rts
    }

    pub fn slots(&self) -> &Arc<SlotManager> {
        &self.slots
    }

    pub fn mailsite(&self) -> &Arc<Mailsite> {
        &self.mailsite
    }

    pub fn mailsites(&self) -> &MailsiteFetcher {
        &self.mailsites
    }

    pub fn set_on_message_sent(&self, callback: MessageCallback) {
        for transport in self.transports() {
            transport.set_on_message_sent(Arc::clone(&callback));
        }
        *self
            .on_message_sent
            .write()
            .expect("the lock should always be valid") = Some(callback);
    }

    pub fn set_on_message_received(&self, callback: MessageCallback) {
        for transport in self.transports() {
            transport.set_on_message_received(Arc::clone(&callback));
        }
        *self
            .on_message_received
            .write()
            .expect("the lock should always be valid") = Some(callback);
    }

    pub fn set_on_rts_received(&self, callback: RtsReceivedCallback) {
        self.rts.set_on_rts_received(callback)
    }

    pub fn set_on_channel_established(&self, callback: ChannelEstablishedCallback) {
        self.rts.set_on_channel_established(callback)
    }

    /// propose a new channel to `recipient_identity`
    ///
    /// the RTS is only recorded here, it is dropped by the RTS sender (or
    /// right away with [`send_rts_now`]). The channel can be used to send
    /// messages immediately: they are readable by the recipient once it
    /// has accepted the RTS.
    ///
    /// [`send_rts_now`]: Self::send_rts_now
    pub async fn initiate_channel(
        &self,
        recipient_identity: &str,
        recipient_rts_key: &str,
        sender_mailsite_uri: &str,
        sender_identity: &str,
    ) -> Result<ChannelId, TransportError> {
        let remote_public_key = self
            .directory
            .public_key_of(recipient_identity)
            .await
            .map_err(TransportError::Network)?;

        let request = self.rts.create_rts(
            recipient_identity,
            recipient_rts_key,
            sender_mailsite_uri,
            sender_identity,
        );

        let channel = Channel::new_initiator(
            request.channel_id,
            recipient_identity,
            request.channel_key,
            Utc::now(),
        );
        self.open_channel(channel, sender_identity, remote_public_key);

        tracing::info!(channel = %request.channel_id, recipient = %recipient_identity, "channel initiated");

        Ok(request.channel_id)
    }

    /// same as [`initiate_channel`] but the recipient is found from its
    /// mailsite
    ///
    /// [`initiate_channel`]: Self::initiate_channel
    pub async fn initiate_channel_via_mailsite(
        &self,
        mailsite_uri: &str,
    ) -> Result<ChannelId, TransportError> {
        let mailsite = self.mailsites.fetch(mailsite_uri).await?;

        let channel = self
            .initiate_channel(
                &mailsite.identity,
                &mailsite.rts_key,
                &self.account.mailsite_uri,
                &self.account.identity,
            )
            .await?;

        if let Some(transport) = self.transport(&channel) {
            transport.update_channel(|channel| {
                channel.remote_nickname = Some(mailsite.nickname.clone());
                channel.remote_mailsite_uri = Some(mailsite_uri.to_owned());
            });
        }

        Ok(channel)
    }

    /// accept an incoming RTS and open the channel on our side
    pub async fn accept_channel(&self, channel: &ChannelId) -> Result<ChannelId, TransportError> {
        if self.transport(channel).is_some() {
            return Ok(*channel);
        }

        let incoming = self
            .rts
            .incoming_rts()
            .into_iter()
            .find(|incoming| incoming.payload.channel_id == *channel)
            .ok_or(TransportError::RtsNotFound(*channel))?;

        let remote_public_key = self
            .directory
            .public_key_of(&incoming.payload.sender_identity)
            .await
            .map_err(TransportError::Network)?;

        let established = self.rts.accept_rts(channel)?;

        let mut new_channel = Channel::new_responder(
            established.channel_id,
            established.remote_identity,
            established.channel_key,
            Utc::now(),
        );
        new_channel.remote_mailsite_uri = Some(established.remote_mailsite_uri);
        new_channel.send_slot = established.responder_slot;
        new_channel.receive_slot = established.initiator_slot;

        let remote = new_channel.remote_identity.clone();
        let local = self.account.identity.clone();
        self.open_channel(new_channel, &local, remote_public_key);

        tracing::info!(%channel, %remote, "channel accepted");

        Ok(*channel)
    }

    pub fn reject_channel(&self, channel: &ChannelId) -> Result<(), TransportError> {
        self.rts.reject_rts(channel)
    }

    /// queue, encrypt and insert a message in the next send slot
    ///
    /// On error the message is removed from the queue and nothing is
    /// recorded as sent. A slot allocated for a failed insert is not used
    /// again.
    pub async fn send_message(
        &self,
        channel: &ChannelId,
        subject: &str,
        body: Vec<u8>,
        sender: &str,
        recipient: &str,
    ) -> Result<TransportMessage, TransportError> {
        self.send_message_with_headers(channel, subject, body, sender, recipient, BTreeMap::new())
            .await
    }

    pub async fn send_message_with_headers(
        &self,
        channel: &ChannelId,
        subject: &str,
        body: Vec<u8>,
        sender: &str,
        recipient: &str,
        headers: BTreeMap<String, String>,
    ) -> Result<TransportMessage, TransportError> {
        let transport = self.get_transport(channel)?;
        let message = transport.queue_message(subject, body, sender, recipient, headers)?;

        let prepared = transport
            .encrypt_message(&message)
            .and_then(|encrypted| Ok((encrypted, self.slots.allocate_send_slot(channel)?)));
        let (encrypted, slot) = match prepared {
            Ok(prepared) => prepared,
            Err(error) => {
                transport.drop_message(&message.id);
                return Err(error);
            }
        };

        let data = Bytes::from(encrypted.serialize());
        if let Err(error) = self.inserter.insert(&slot.key, data).await {
            transport.drop_message(&message.id);
            let error = TransportError::Network(error);
            self.slots
                .mark_failed(channel, Direction::Send, slot.number, error.report())?;
            tracing::warn!(%channel, slot = slot.number, reason = %error.report(), "cannot insert the message");
            return Err(error);
        }

        self.slots
            .mark_used(channel, Direction::Send, slot.number, Some(message.id))?;
        let sent = transport
            .mark_message_sent(&message.id, slot.number)
            .unwrap_or(message);
        self.refresh_slot_hint();

        tracing::debug!(%channel, slot = slot.number, message = %sent.id, "message sent");

        Ok(sent)
    }

    /// decrypt the data found in a receive slot of the channel
    ///
    /// the slot is only marked as used if the message could be decrypted
    /// and decoded.
    pub fn process_incoming_data(
        &self,
        channel: &ChannelId,
        slot: u64,
        data: &[u8],
    ) -> Result<TransportMessage, TransportError> {
        let transport = self.get_transport(channel)?;

        let encrypted = EncryptedMessage::deserialize(data)?;
        let message = transport.process_received_message(&encrypted, slot)?;

        self.slots
            .mark_used(channel, Direction::Receive, slot, Some(message.id))?;

        if transport.channel().initiator {
            // the peer could only write in the channel if it accepted our RTS
            match self.rts.mark_accepted(channel) {
                Ok(_) | Err(TransportError::RtsNotFound(_)) => (),
                Err(error) => return Err(error),
            }
        }

        tracing::debug!(%channel, slot, message = %message.id, "message received");

        Ok(message)
    }

    /// forget the channel, its transport and its slots
    pub fn close_channel(&self, channel: &ChannelId) -> Result<Channel, TransportError> {
        let transport = self
            .transports
            .write()
            .expect("the lock should always be valid")
            .remove(channel)
            .ok_or(TransportError::ChannelNotFound(*channel))?;
        self.slots.remove_channel(channel);

        tracing::info!(%channel, "channel closed");

        Ok(transport.channel())
    }

    /// move the channels down their lifecycle, returns the changes
    pub fn expire_channels(&self) -> Vec<(ChannelId, ChannelState)> {
        let now = Utc::now();

        self.transports()
            .into_iter()
            .filter_map(|transport| {
                let state = transport.update_channel(|channel| channel.refresh_state(now))?;
                let channel = transport.channel_id();
                tracing::info!(%channel, %state, "channel expired");
                Some((channel, state))
            })
            .collect()
    }

    pub fn channel(&self, channel: &ChannelId) -> Option<Channel> {
        self.transport(channel).map(|transport| transport.channel())
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.transports()
            .iter()
            .map(|transport| transport.channel())
            .collect()
    }

    /// reopen a channel loaded from the persistent storage
    ///
    /// the slot ranges are expected to be restored separately in the
    /// [`SlotManager`], they are created empty if they were not.
    pub async fn restore_channel(&self, channel: Channel) -> Result<(), TransportError> {
        let remote_public_key = self
            .directory
            .public_key_of(&channel.remote_identity)
            .await
            .map_err(TransportError::Network)?;

        if !channel.initiator {
            self.rts.mark_handled(channel.id);
        }

        let local = self.account.identity.clone();
        self.open_channel(channel, &local, remote_public_key);
        self.refresh_slot_hint();

        Ok(())
    }

    pub fn queued_messages(
        &self,
        channel: &ChannelId,
    ) -> Result<Vec<TransportMessage>, TransportError> {
        Ok(self.get_transport(channel)?.queued())
    }

    pub async fn publish_mailsite(&self) -> Result<(), TransportError> {
        self.mailsite.publish().await.map(|_| ())
    }

    pub async fn send_rts_now(&self, channel: &ChannelId) -> Result<(), TransportError> {
        self.rts_sender.send_rts_now(channel).await
    }

    pub async fn fetch_rts_now(self: &Arc<Self>) -> Result<Option<ChannelId>, TransportError> {
        self.rts_fetcher().fetch_now().await
    }

    pub async fn poll_slots_now(self: &Arc<Self>) -> PollReport {
        self.slot_poller().poll_once().await
    }

    /// start the background workers
    ///
    /// the workers hold a reference to the manager until they are stopped.
    pub fn start(self: &Arc<Self>) -> Workers {
        let mut workers = Workers::default();

        workers.push(Worker::spawn(
            Arc::new(MailsitePublisher::new(Arc::clone(&self.mailsite))),
            self.config.mailsite_publish_interval,
        ));
        workers.push(Worker::spawn(
            Arc::new(self.slot_poller()),
            self.config.slot_poll_interval,
        ));
        workers.push(Worker::spawn(
            Arc::clone(&self.rts_sender),
            self.config.rts_send_interval,
        ));
        workers.push(Worker::spawn(
            Arc::new(self.rts_fetcher()),
            self.config.rts_fetch_interval,
        ));

        tracing::info!(identity = %self.account.identity, "transport started");

        workers
    }

    fn refresh_slot_hint(&self) {
        self.mailsite
            .set_slot_hint(self.config.slot_key_prefix.clone(), self.slots.send_slot_count());
    }

    fn rts_fetcher(self: &Arc<Self>) -> RtsFetcher {
        RtsFetcher::new(
            self.account.identity.clone(),
            self.account.rts_key.clone(),
            RtsEncoder::new(self.crypto.clone()),
            Arc::clone(&self.fetcher),
            Arc::clone(self) as Arc<dyn RtsHandler>,
        )
    }

    fn slot_poller(self: &Arc<Self>) -> SlotPoller {
        SlotPoller::new(
            Arc::clone(&self.slots),
            Arc::clone(&self.fetcher),
            Arc::clone(self) as Arc<dyn SlotHandler>,
        )
    }

    fn open_channel(&self, channel: Channel, local_identity: &str, remote_public_key: RsaPublicKey) {
        let id = channel.id;
        let prefix = &self.config.slot_key_prefix;

        self.slots.init_channel(
            id,
            channel.send_base_key(prefix, local_identity),
            channel.receive_base_key(prefix, local_identity),
        );

        let transport = ChannelTransport::new(channel, self.crypto.clone(), remote_public_key);
        if let Some(callback) = self
            .on_message_sent
            .read()
            .expect("the lock should always be valid")
            .as_ref()
        {
            transport.set_on_message_sent(Arc::clone(callback));
        }
        if let Some(callback) = self
            .on_message_received
            .read()
            .expect("the lock should always be valid")
            .as_ref()
        {
            transport.set_on_message_received(Arc::clone(callback));
        }

        self.transports
            .write()
            .expect("the lock should always be valid")
            .insert(id, Arc::new(transport));
    }

    fn transport(&self, channel: &ChannelId) -> Option<Arc<ChannelTransport>> {
        self.transports
            .read()
            .expect("the lock should always be valid")
            .get(channel)
            .cloned()
    }

    fn get_transport(&self, channel: &ChannelId) -> Result<Arc<ChannelTransport>, TransportError> {
        self.transport(channel)
            .ok_or(TransportError::ChannelNotFound(*channel))
    }

    fn transports(&self) -> Vec<Arc<ChannelTransport>> {
        self.transports
            .read()
            .expect("the lock should always be valid")
            .values()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SlotHandler for TransportManager {
    async fn handle_slot_data(
        &self,
        channel: ChannelId,
        slot: u64,
        data: Bytes,
    ) -> Result<MessageId, TransportError> {
        self.process_incoming_data(&channel, slot, &data)
            .map(|message| message.id)
    }

    fn refresh_channels(&self) -> usize {
        self.expire_channels().len()
    }
}

#[async_trait]
impl RtsHandler for TransportManager {
    async fn handle_rts(
        &self,
        payload: RtsPayload,
        channel_key: ChannelKey,
    ) -> Result<(), TransportError> {
        let channel = payload.channel_id;
        self.rts.process_incoming_rts(payload, channel_key);

        if self.config.manual_accept {
            return Ok(());
        }

        // also retries the RTS whose acceptance failed on a previous poll
        let waiting = self
            .rts
            .incoming_rts()
            .iter()
            .any(|incoming| incoming.payload.channel_id == channel);
        if waiting {
            self.accept_channel(&channel).await?;
        }

        Ok(())
    }
}
