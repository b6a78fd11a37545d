mod channels;
mod config;
mod slots;

pub use self::{
    channels::Channels,
    config::{Config, Mode},
    slots::Slots,
};
use anyhow::{Context as _, Result};
use async_trait::async_trait;
use dropmail_transport::{Job, TransportManager};
use std::sync::Arc;

/// persistent state of the node
///
/// the channels and slot ranges of the transport, and the trees of the
/// local node (see [`crate::node`]).
#[derive(Clone)]
pub struct Storage {
    db: sled::Db,
    channels: Channels,
    slots: Slots,
}

impl Storage {
    pub fn new(config: Config) -> Result<Self> {
        let sled_config = sled::Config::new()
            .path(&config.path)
            .mode(config.mode.into());

        let sled_config = if let Some(value) = config.compression_factor {
            sled_config.use_compression(true).compression_factor(value)
        } else {
            sled_config.use_compression(false)
        };

        let db = sled_config.open().with_context(|| {
            format!(
                "Cannot open persistent storage file: {}",
                config.path.display()
            )
        })?;

        Self::with_db(db)
    }

    pub(crate) fn with_db(db: sled::Db) -> Result<Self> {
        let channels =
            Channels::new(&db).context("Cannot open persistent backend storage for channels")?;
        let slots = Slots::new(&db).context("Cannot open persistent backend storage for slots")?;

        Ok(Self {
            db,
            channels,
            slots,
        })
    }

    pub fn db(&self) -> &sled::Db {
        &self.db
    }

    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    pub fn slots(&self) -> &Slots {
        &self.slots
    }

    /// save the channels and slot ranges of the transport
    pub fn save(&self, transport: &TransportManager) -> Result<()> {
        let channels = transport.channels();
        self.channels.replace_all(&channels)?;
        self.slots.put(&transport.slots().snapshot())?;

        self.db
            .flush()
            .context("Cannot flush the persistent storage")?;

        tracing::debug!(channels = channels.len(), "transport state saved");
        Ok(())
    }

    /// reload the saved channels and slot ranges in the transport
    ///
    /// a channel that cannot be reopened (unknown remote public key) is
    /// logged and left in the storage.
    pub async fn restore(&self, transport: &TransportManager) -> Result<usize> {
        let channels = self.channels.all()?;

        if let Some(mut snapshot) = self.slots.get()? {
            snapshot
                .channels
                .retain(|id, _| channels.iter().any(|channel| &channel.id == id));
            transport.slots().restore(snapshot);
        }

        let mut restored = 0;
        for channel in channels {
            let id = channel.id;
            match transport.restore_channel(channel).await {
                Ok(()) => restored += 1,
                Err(error) => {
                    tracing::error!(channel = %id, reason = %error.report(), "cannot restore channel")
                }
            }
        }

        tracing::info!(channels = restored, "transport state restored");
        Ok(restored)
    }
}

/// periodically saves the transport state
pub struct Persister {
    storage: Storage,
    transport: Arc<TransportManager>,
}

impl Persister {
    pub fn new(storage: Storage, transport: Arc<TransportManager>) -> Self {
        Self { storage, transport }
    }
}

#[async_trait]
impl Job for Persister {
    fn name(&self) -> &'static str {
        "storage-persister"
    }

    async fn run_once(&self) {
        if let Err(error) = self.storage.save(&self.transport) {
            tracing::error!(reason = ?error, "cannot save the transport state");
        }
    }
}
