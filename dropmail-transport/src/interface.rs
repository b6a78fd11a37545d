//! capabilities of the content addressed network
//!
//! the transport never talks to a network node directly, it is given
//! objects implementing these traits. The names used by the rest of the
//! crate ([`MailsiteInserter`], [`SlotFetcher`], ...) are only aliases
//! documenting which capability a component consumes.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use dropmail_lib::RsaPublicKey;

/// insert data at a given key of the network
#[async_trait]
pub trait Insert: Send + Sync {
    async fn insert(&self, key: &str, data: Bytes) -> Result<()>;
}

/// fetch the data stored at a given key of the network
///
/// returns `Ok(None)` if nothing has been inserted at that key (yet). This
/// is the normal outcome of polling a slot the peer has not used yet and
/// is not an error.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, key: &str) -> Result<Option<Bytes>>;
}

/// directory of the public keys of the identities
#[async_trait]
pub trait PublicKeyDirectory: Send + Sync {
    async fn public_key_of(&self, identity: &str) -> Result<RsaPublicKey>;
}

/// everything the transport needs from a network node
pub trait Network: Insert + Fetch + PublicKeyDirectory {}

impl<T> Network for T where T: Insert + Fetch + PublicKeyDirectory + ?Sized {}

pub type MailsiteInserter = dyn Insert;
pub type MailsiteDataFetcher = dyn Fetch;
pub type SlotFetcher = dyn Fetch;
pub type RtsInserter = dyn Insert;
pub type RtsKeyFetcher = dyn Fetch;
pub type FcpInterface = dyn Network;
