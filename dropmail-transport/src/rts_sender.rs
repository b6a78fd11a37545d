use crate::{
    error::TransportError,
    interface::{PublicKeyDirectory, RtsInserter},
    rts::{RtsManager, RtsRequest, RtsState},
    rts_codec::RtsEncoder,
    worker::Job,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dropmail_lib::ChannelId;
use std::sync::Arc;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SendReport {
    pub sent: usize,
    pub failed: usize,
}

/// drops the pending RTS at their recipient's RTS key
pub struct RtsSender {
    rts: Arc<RtsManager>,
    encoder: RtsEncoder,
    directory: Arc<dyn PublicKeyDirectory>,
    inserter: Arc<RtsInserter>,
}

impl RtsSender {
    pub fn new(
        rts: Arc<RtsManager>,
        encoder: RtsEncoder,
        directory: Arc<dyn PublicKeyDirectory>,
        inserter: Arc<RtsInserter>,
    ) -> Self {
        Self {
            rts,
            encoder,
            directory,
            inserter,
        }
    }

    /// send every pending, non expired, RTS once
    pub async fn send_pending(&self) -> SendReport {
        let mut report = SendReport::default();

        for request in self.rts.get_pending_rts() {
            match self.send_request(&request).await {
                Ok(()) => report.sent += 1,
                Err(_) => report.failed += 1,
            }
        }

        report
    }

    /// send the RTS of the channel now instead of waiting for the next
    /// iteration of the worker
    pub async fn send_rts_now(&self, channel: &ChannelId) -> Result<(), TransportError> {
        let request = self
            .rts
            .get(channel)
            .filter(|request| request.state == RtsState::Pending)
            .ok_or(TransportError::RtsNotFound(*channel))?;

        self.send_request(&request).await
    }

    /// one attempt, recorded in the [`RtsManager`] whatever the outcome
    async fn send_request(&self, request: &RtsRequest) -> Result<(), TransportError> {
        let channel = request.channel_id;

        match self.send_one(request).await {
            Ok(()) => {
                self.rts.mark_sent(&channel)?;
                tracing::info!(%channel, recipient = %request.recipient_identity, "RTS sent");
                Ok(())
            }
            Err(error) => {
                let state = self.rts.mark_failed(&channel, error.report())?;
                tracing::warn!(
                    %channel,
                    recipient = %request.recipient_identity,
                    reason = %error.report(),
                    %state,
                    "cannot send the RTS"
                );
                Err(error)
            }
        }
    }

    async fn send_one(&self, request: &RtsRequest) -> Result<(), TransportError> {
        let recipient = self
            .directory
            .public_key_of(&request.recipient_identity)
            .await
            .map_err(TransportError::Network)?;

        let message =
            self.encoder
                .encode_rts(&request.payload(Utc::now()), &request.channel_key, &recipient)?;

        self.inserter
            .insert(&request.recipient_rts_key, Bytes::from(message.serialize()))
            .await
            .map_err(TransportError::Network)
    }
}

#[async_trait]
impl Job for RtsSender {
    fn name(&self) -> &'static str {
        "rts-sender"
    }

    async fn run_once(&self) {
        let expired = self.rts.clean_expired();
        let report = self.send_pending().await;
        tracing::debug!(?report, expired, "RTS sent");
    }
}
