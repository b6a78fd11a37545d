use anyhow::{Context as _, Result};
use dropmail_transport::SlotsSnapshot;

const SNAPSHOT: &str = "snapshot";

/// the slot ranges of all the channels, in a single JSON document
#[derive(Clone)]
pub struct Slots {
    slots: sled::Tree,
}

impl Slots {
    pub(crate) fn new(db: &sled::Db) -> Result<Self> {
        let slots = db
            .open_tree("slots")
            .context("Cannot open the slots sled tree")?;
        Ok(Self { slots })
    }

    pub fn put(&self, snapshot: &SlotsSnapshot) -> Result<()> {
        let document = serde_json::to_vec(snapshot).context("Cannot encode the slots")?;
        self.slots
            .insert(SNAPSHOT, document)
            .context("cannot save the slots persistently")?;
        Ok(())
    }

    pub fn get(&self) -> Result<Option<SlotsSnapshot>> {
        if let Some(document) = self.slots.get(SNAPSHOT)? {
            let snapshot =
                serde_json::from_slice(&document).context("Invalid slots document")?;
            Ok(Some(snapshot))
        } else {
            Ok(None)
        }
    }
}
