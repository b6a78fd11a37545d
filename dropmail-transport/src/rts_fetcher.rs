use crate::{
    error::TransportError,
    interface::RtsKeyFetcher,
    rts::RtsPayload,
    rts_codec::RtsEncoder,
    worker::Job,
};
use async_trait::async_trait;
use dropmail_lib::{ChannelId, ChannelKey, RtsMessage};
use std::sync::Arc;

/// consumer of the RTS found at our RTS key
#[async_trait]
pub trait RtsHandler: Send + Sync {
    async fn handle_rts(
        &self,
        payload: RtsPayload,
        channel_key: ChannelKey,
    ) -> Result<(), TransportError>;
}

/// checks our own RTS key for channel requests
pub struct RtsFetcher {
    identity: String,
    rts_key: String,
    encoder: RtsEncoder,
    fetcher: Arc<RtsKeyFetcher>,
    handler: Arc<dyn RtsHandler>,
}

impl RtsFetcher {
    pub fn new(
        identity: impl Into<String>,
        rts_key: impl Into<String>,
        encoder: RtsEncoder,
        fetcher: Arc<RtsKeyFetcher>,
        handler: Arc<dyn RtsHandler>,
    ) -> Self {
        Self {
            identity: identity.into(),
            rts_key: rts_key.into(),
            encoder,
            fetcher,
            handler,
        }
    }

    /// fetch and process the RTS currently at our RTS key, if any
    pub async fn fetch_now(&self) -> Result<Option<ChannelId>, TransportError> {
        let (payload, channel_key) = match self.fetch_rts().await? {
            Some(rts) => rts,
            None => return Ok(None),
        };

        let channel = payload.channel_id;
        self.handler.handle_rts(payload, channel_key).await?;

        Ok(Some(channel))
    }

    /// fetch and decode the RTS currently at our RTS key
    ///
    /// The RTS is decoded **without** checking the signature: the sender's
    /// identity is only learnt from the decrypted payload, so its key is
    /// not known at this point. Anyone knowing our RTS key and public key
    /// can propose a channel in someone else's name.
    async fn fetch_rts(&self) -> Result<Option<(RtsPayload, ChannelKey)>, TransportError> {
        let data = match self
            .fetcher
            .fetch(&self.rts_key)
            .await
            .map_err(TransportError::Network)?
        {
            Some(data) => data,
            None => return Ok(None),
        };

        let message = RtsMessage::deserialize(&data)?;
        let (payload, channel_key) = self.encoder.decode_rts(&message, None)?;

        if payload.recipient_identity != self.identity {
            return Err(TransportError::RtsMisaddressed {
                recipient: payload.recipient_identity,
                identity: self.identity.clone(),
            });
        }

        Ok(Some((payload, channel_key)))
    }
}

#[async_trait]
impl Job for RtsFetcher {
    fn name(&self) -> &'static str {
        "rts-fetcher"
    }

    async fn run_once(&self) {
        let (payload, channel_key) = match self.fetch_rts().await {
            Ok(Some(rts)) => rts,
            Ok(None) => {
                tracing::trace!("no RTS");
                return;
            }
            Err(error) if error.is_network() => {
                tracing::warn!(reason = %error.report(), "cannot fetch the RTS key");
                return;
            }
            Err(error) => {
                tracing::warn!(reason = %error.report(), "skipping malformed RTS");
                return;
            }
        };

        let channel = payload.channel_id;
        match self.handler.handle_rts(payload, channel_key).await {
            Ok(()) => tracing::debug!(%channel, "RTS fetched"),
            Err(error) => {
                tracing::warn!(%channel, reason = %error.report(), "cannot handle the RTS")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memory::MemoryNetwork,
        rts::RtsManager,
        test_utils::{alice, bob},
    };
    use chrono::Utc;
    use dropmail_lib::Version;
    use rand::rngs::OsRng;

    struct Store(Arc<RtsManager>);

    #[async_trait]
    impl RtsHandler for Store {
        async fn handle_rts(
            &self,
            payload: RtsPayload,
            channel_key: ChannelKey,
        ) -> Result<(), TransportError> {
            self.0.process_incoming_rts(payload, channel_key);
            Ok(())
        }
    }

    fn setup() -> (Arc<MemoryNetwork>, Arc<RtsManager>, RtsFetcher) {
        let network = Arc::new(MemoryNetwork::new());
        let rts = Arc::new(RtsManager::new());
        let fetcher = RtsFetcher::new(
            "bob",
            "KSK@bob-rts",
            RtsEncoder::new(bob()),
            Arc::clone(&network) as Arc<RtsKeyFetcher>,
            Arc::new(Store(Arc::clone(&rts))),
        );
        (network, rts, fetcher)
    }

    fn drop_rts(network: &MemoryNetwork, recipient: &str) -> ChannelId {
        let payload = RtsPayload {
            version: Version::CURRENT,
            sender_mailsite_uri: "USK@alice/mailsite".to_owned(),
            sender_identity: "alice".to_owned(),
            recipient_identity: recipient.to_owned(),
            initiator_slot: 0,
            responder_slot: 0,
            channel_id: ChannelId::generate(OsRng),
            timestamp: Utc::now(),
        };
        let message = RtsEncoder::new(alice())
            .encode_rts(&payload, &ChannelKey::generate(OsRng), bob().public_key())
            .unwrap();
        network.put("KSK@bob-rts", message.serialize());
        payload.channel_id
    }

    #[tokio::test]
    async fn nothing_yet() {
        let (_network, _rts, fetcher) = setup();
        assert_eq!(fetcher.fetch_now().await.unwrap(), None);
    }

    #[tokio::test]
    async fn rts_is_handed_once() {
        let (network, rts, fetcher) = setup();
        let channel = drop_rts(&network, "bob");

        assert_eq!(fetcher.fetch_now().await.unwrap(), Some(channel));
        // still there on the next poll, but already known
        assert_eq!(fetcher.fetch_now().await.unwrap(), Some(channel));

        assert_eq!(rts.incoming_rts().len(), 1);
    }

    #[tokio::test]
    async fn misaddressed() {
        let (network, rts, fetcher) = setup();
        drop_rts(&network, "carol");

        assert!(matches!(
            fetcher.fetch_now().await,
            Err(TransportError::RtsMisaddressed { .. })
        ));
        assert!(rts.incoming_rts().is_empty());
    }

    struct Unreachable(std::sync::Mutex<usize>);

    #[async_trait]
    impl RtsHandler for Unreachable {
        async fn handle_rts(&self, _: RtsPayload, _: ChannelKey) -> Result<(), TransportError> {
            *self.0.lock().unwrap() += 1;
            Err(TransportError::Network(anyhow::anyhow!("cannot insert the RTS reply")))
        }
    }

    #[tokio::test]
    async fn handler_failure_is_not_a_fetch_failure() {
        let network = Arc::new(MemoryNetwork::new());
        let handler = Arc::new(Unreachable(std::sync::Mutex::new(0)));
        let fetcher = RtsFetcher::new(
            "bob",
            "KSK@bob-rts",
            RtsEncoder::new(bob()),
            Arc::clone(&network) as Arc<RtsKeyFetcher>,
            Arc::clone(&handler) as Arc<dyn RtsHandler>,
        );
        let channel = drop_rts(&network, "bob");

        // the RTS key was read and decoded fine
        let (payload, _) = fetcher.fetch_rts().await.unwrap().unwrap();
        assert_eq!(payload.channel_id, channel);

        // the error comes from the handler, after the fetch
        assert!(fetcher.fetch_now().await.unwrap_err().is_network());
        assert_eq!(*handler.0.lock().unwrap(), 1);

        fetcher.run_once().await;
        assert_eq!(*handler.0.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn garbage_is_skipped() {
        let (network, rts, fetcher) = setup();
        network.put("KSK@bob-rts", &b"not an RTS"[..]);

        assert!(matches!(
            fetcher.fetch_now().await,
            Err(TransportError::Decode(_))
        ));

        // the worker iteration logs and carries on
        fetcher.run_once().await;
        assert!(rts.incoming_rts().is_empty());
    }
}
