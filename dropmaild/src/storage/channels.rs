use anyhow::{Context as _, Result};
use dropmail_lib::ChannelId;
use dropmail_transport::Channel;
use std::collections::HashSet;

/// one JSON document per channel, keyed by the channel id
#[derive(Clone)]
pub struct Channels {
    channels: sled::Tree,
}

impl Channels {
    pub(crate) fn new(db: &sled::Db) -> Result<Self> {
        let channels = db
            .open_tree("channels")
            .context("Cannot open the channels sled tree")?;
        Ok(Self { channels })
    }

    pub fn get(&self, id: &ChannelId) -> Result<Option<Channel>> {
        if let Some(document) = self.channels.get(id.to_string())? {
            let channel = serde_json::from_slice(&document)
                .with_context(|| format!("Invalid channel document {}", id))?;
            Ok(Some(channel))
        } else {
            Ok(None)
        }
    }

    /// all the stored channels
    ///
    /// the documents that cannot be decoded are logged and skipped
    pub fn all(&self) -> Result<Vec<Channel>> {
        let mut channels = Vec::new();

        for entry in self.channels.iter() {
            let (key, document) = entry?;
            match serde_json::from_slice::<Channel>(&document) {
                Ok(channel) => channels.push(channel),
                Err(error) => {
                    tracing::warn!(
                        key = %String::from_utf8_lossy(&key),
                        reason = %error,
                        "skipping invalid channel document"
                    );
                }
            }
        }

        Ok(channels)
    }

    /// store the given channels and delete the ones no longer present
    pub fn replace_all(&self, channels: &[Channel]) -> Result<()> {
        let keep: HashSet<String> = channels.iter().map(|c| c.id.to_string()).collect();

        let mut batch = sled::Batch::default();
        for entry in self.channels.iter().keys() {
            let key = entry?;
            if !keep.contains(String::from_utf8_lossy(&key).as_ref()) {
                batch.remove(key);
            }
        }
        for channel in channels {
            batch.insert(channel.id.to_string().as_bytes(), serde_json::to_vec(channel)?);
        }

        self.channels
            .apply_batch(batch)
            .context("cannot save the channels persistently")
    }
}
