use crate::interface::{Fetch, Insert, PublicKeyDirectory};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dropmail_lib::RsaPublicKey;
use std::{
    collections::{HashMap, HashSet},
    sync::RwLock,
};

/// in memory network
///
/// a shared key/value map and identity directory. Used to run 2
/// transports against each other in the same process (tests, local
/// experiments). Inserting at a key that already holds data replaces it.
///
/// Failures can be injected per key with [`fail_inserts_at`] and
/// [`fail_fetches_at`].
///
/// [`fail_inserts_at`]: MemoryNetwork::fail_inserts_at
/// [`fail_fetches_at`]: MemoryNetwork::fail_fetches_at
#[derive(Default)]
pub struct MemoryNetwork {
    store: RwLock<HashMap<String, Bytes>>,
    directory: RwLock<HashMap<String, RsaPublicKey>>,
    failing_inserts: RwLock<HashSet<String>>,
    failing_fetches: RwLock<HashSet<String>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_identity(&self, identity: impl Into<String>, public_key: RsaPublicKey) {
        self.directory
            .write()
            .expect("the lock should always be valid")
            .insert(identity.into(), public_key);
    }

    /// bypass the failure injection and write directly in the store
    pub fn put(&self, key: impl Into<String>, data: impl Into<Bytes>) {
        self.store
            .write()
            .expect("the lock should always be valid")
            .insert(key.into(), data.into());
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.store
            .read()
            .expect("the lock should always be valid")
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.store
            .read()
            .expect("the lock should always be valid")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fail_inserts_at(&self, key: impl Into<String>) {
        self.failing_inserts
            .write()
            .expect("the lock should always be valid")
            .insert(key.into());
    }

    pub fn fail_fetches_at(&self, key: impl Into<String>) {
        self.failing_fetches
            .write()
            .expect("the lock should always be valid")
            .insert(key.into());
    }

    /// remove any failure injected at the given key
    pub fn heal(&self, key: &str) {
        self.failing_inserts
            .write()
            .expect("the lock should always be valid")
            .remove(key);
        self.failing_fetches
            .write()
            .expect("the lock should always be valid")
            .remove(key);
    }
}

#[async_trait]
impl Insert for MemoryNetwork {
    async fn insert(&self, key: &str, data: Bytes) -> Result<()> {
        let failing = self
            .failing_inserts
            .read()
            .expect("the lock should always be valid")
            .contains(key);
        if failing {
            bail!("insert rejected at {}", key)
        }

        self.put(key, data);
        Ok(())
    }
}

#[async_trait]
impl Fetch for MemoryNetwork {
    async fn fetch(&self, key: &str) -> Result<Option<Bytes>> {
        let failing = self
            .failing_fetches
            .read()
            .expect("the lock should always be valid")
            .contains(key);
        if failing {
            bail!("fetch rejected at {}", key)
        }

        Ok(self.get(key))
    }
}

#[async_trait]
impl PublicKeyDirectory for MemoryNetwork {
    async fn public_key_of(&self, identity: &str) -> Result<RsaPublicKey> {
        self.directory
            .read()
            .expect("the lock should always be valid")
            .get(identity)
            .cloned()
            .ok_or_else(|| anyhow!("unknown identity {}", identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_fetch() {
        let network = MemoryNetwork::new();

        assert!(network.fetch("key").await.unwrap().is_none());

        network.insert("key", Bytes::from_static(b"data")).await.unwrap();
        assert_eq!(
            network.fetch("key").await.unwrap(),
            Some(Bytes::from_static(b"data"))
        );
    }

    #[tokio::test]
    async fn injected_failures() {
        let network = MemoryNetwork::new();
        network.fail_inserts_at("key");
        network.fail_fetches_at("key");

        assert!(network.insert("key", Bytes::new()).await.is_err());
        assert!(network.fetch("key").await.is_err());

        network.heal("key");
        assert!(network.insert("key", Bytes::new()).await.is_ok());
        assert!(network.fetch("key").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unknown_identity() {
        let network = MemoryNetwork::new();
        assert!(network.public_key_of("nobody").await.is_err());
    }
}
