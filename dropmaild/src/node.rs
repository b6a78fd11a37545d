/*!
local node

a single process stand in for the content addressed network: the data
inserted by the transport and the public keys of the known identities are
kept in the sled database of the daemon. Two identities served by the
same node can exchange messages; reaching other nodes is the business of
a real network client implementing the same traits.
*/

use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dropmail_lib::{
    crypto::{public_key_from_pem, public_key_to_pem},
    RsaPublicKey,
};
use dropmail_transport::{Fetch, Insert, PublicKeyDirectory};
use std::{collections::BTreeMap, path::PathBuf};

#[derive(Clone)]
pub struct LocalNode {
    data: sled::Tree,
    directory: sled::Tree,
}

impl LocalNode {
    pub fn new(db: &sled::Db) -> Result<Self> {
        let data = db
            .open_tree("node::data")
            .context("Cannot open the node data sled tree")?;
        let directory = db
            .open_tree("node::directory")
            .context("Cannot open the node directory sled tree")?;

        Ok(Self { data, directory })
    }

    pub fn register_identity(&self, identity: &str, public_key: &RsaPublicKey) -> Result<()> {
        let pem = public_key_to_pem(public_key)
            .with_context(|| format!("Cannot encode the public key of {}", identity))?;
        self.directory
            .insert(identity, pem.as_bytes())
            .with_context(|| format!("Cannot register identity {}", identity))?;

        tracing::debug!(%identity, "identity registered");
        Ok(())
    }

    /// register the identities listed in the configuration
    ///
    /// maps the identity to the path of its public key PEM file
    pub fn register_peers(&self, peers: &BTreeMap<String, PathBuf>) -> Result<()> {
        for (identity, path) in peers {
            let pem = std::fs::read_to_string(path).with_context(|| {
                format!("Cannot read the public key of {}: {}", identity, path.display())
            })?;
            let public_key = public_key_from_pem(&pem)
                .with_context(|| format!("Invalid public key for {}", identity))?;
            self.register_identity(identity, &public_key)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Insert for LocalNode {
    async fn insert(&self, key: &str, data: Bytes) -> Result<()> {
        self.data
            .insert(key, data.as_ref())
            .with_context(|| format!("Cannot insert at {}", key))?;
        Ok(())
    }
}

#[async_trait]
impl Fetch for LocalNode {
    async fn fetch(&self, key: &str) -> Result<Option<Bytes>> {
        let data = self
            .data
            .get(key)
            .with_context(|| format!("Cannot fetch {}", key))?;
        Ok(data.map(|data| Bytes::copy_from_slice(&data)))
    }
}

#[async_trait]
impl PublicKeyDirectory for LocalNode {
    async fn public_key_of(&self, identity: &str) -> Result<RsaPublicKey> {
        let pem = self
            .directory
            .get(identity)?
            .ok_or_else(|| anyhow!("unknown identity {}", identity))?;
        let pem = std::str::from_utf8(&pem)
            .with_context(|| format!("Invalid public key stored for {}", identity))?;

        public_key_from_pem(pem).with_context(|| format!("Invalid public key stored for {}", identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dropmail_lib::MessageCrypto;
    use rand::rngs::OsRng;

    fn node() -> LocalNode {
        let db = sled::Config::new().temporary(true).open().unwrap();
        LocalNode::new(&db).unwrap()
    }

    #[tokio::test]
    async fn insert_fetch() {
        let node = node();

        assert!(node.fetch("KSK@nothing").await.unwrap().is_none());

        node.insert("KSK@something", Bytes::from_static(b"data"))
            .await
            .unwrap();
        assert_eq!(
            node.fetch("KSK@something").await.unwrap(),
            Some(Bytes::from_static(b"data"))
        );
    }

    #[tokio::test]
    async fn directory() {
        let node = node();
        let crypto = MessageCrypto::generate(&mut OsRng).unwrap();

        assert!(node.public_key_of("alice").await.is_err());

        node.register_identity("alice", crypto.public_key()).unwrap();
        assert_eq!(
            &node.public_key_of("alice").await.unwrap(),
            crypto.public_key()
        );
    }
}
