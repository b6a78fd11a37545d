use crate::{
    error::TransportError,
    interface::SlotFetcher,
    slot::SlotState,
    slot_manager::SlotManager,
    worker::Job,
};
use async_trait::async_trait;
use bytes::Bytes;
use dropmail_lib::{ChannelId, MessageId};
use std::sync::Arc;

/// consumer of the data found in the receive slots
#[async_trait]
pub trait SlotHandler: Send + Sync {
    async fn handle_slot_data(
        &self,
        channel: ChannelId,
        slot: u64,
        data: Bytes,
    ) -> Result<MessageId, TransportError>;

    /// called at the start of every polling pass, returns the number of
    /// channels that moved down their lifecycle
    fn refresh_channels(&self) -> usize {
        0
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollReport {
    pub polled: usize,
    pub received: usize,
    pub failed: usize,
    pub expired: usize,
    pub channels_expired: usize,
}

/// polls the receive slots of all the channels
pub struct SlotPoller {
    slots: Arc<SlotManager>,
    fetcher: Arc<SlotFetcher>,
    handler: Arc<dyn SlotHandler>,
}

impl SlotPoller {
    pub fn new(
        slots: Arc<SlotManager>,
        fetcher: Arc<SlotFetcher>,
        handler: Arc<dyn SlotHandler>,
    ) -> Self {
        Self {
            slots,
            fetcher,
            handler,
        }
    }

    /// one polling pass over every channel with pending receive slots
    ///
    /// the handler first gets to expire its channels. A slot with no data yet is left as it is. Errors are recorded on
    /// the slot they concern and never interrupt the pass.
    pub async fn poll_once(&self) -> PollReport {
        let mut report = PollReport {
            channels_expired: self.handler.refresh_channels(),
            ..PollReport::default()
        };

        for (channel, range, numbers) in self.slots.pending_receives() {
            for number in numbers {
                let key = range.slot_key(number);
                report.polled += 1;

                let data = match self.fetcher.fetch(&key).await {
                    Ok(Some(data)) => data,
                    Ok(None) => continue,
                    Err(error) => {
                        let state = range.mark_failed(number, format!("{:#}", error));
                        tracing::warn!(
                            %channel,
                            slot = number,
                            reason = %error,
                            ?state,
                            "cannot fetch the slot"
                        );
                        report.failed += 1;
                        continue;
                    }
                };

                match self.handler.handle_slot_data(channel, number, data).await {
                    Ok(message_id) => {
                        range.mark_used(number, Some(message_id));
                        tracing::debug!(%channel, slot = number, %message_id, "slot received");
                        report.received += 1;
                    }
                    Err(error) => {
                        let state = range.mark_failed(number, &error);
                        if state == SlotState::Failed {
                            tracing::error!(
                                %channel,
                                slot = number,
                                reason = %error,
                                "giving up on the slot"
                            );
                        } else {
                            tracing::warn!(
                                %channel,
                                slot = number,
                                reason = %error,
                                "cannot process the slot's data"
                            );
                        }
                        report.failed += 1;
                    }
                }
            }
        }

        report.expired = self.slots.clean_expired();
        report
    }
}

#[async_trait]
impl Job for SlotPoller {
    fn name(&self) -> &'static str {
        "slot-poller"
    }

    async fn run_once(&self) {
        let report = self.poll_once().await;
        tracing::debug!(?report, "slots polled");
    }
}
