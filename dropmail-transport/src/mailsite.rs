/*!
# mailsite

the mailsite is the public record an identity publishes so others can
reach it: its public key, its RTS key and a hint of its slot key space. It
is a JSON document inserted at the mailsite URI of the account.
*/

use crate::{
    error::TransportError,
    interface::{MailsiteDataFetcher, MailsiteInserter},
    worker::Job,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use dropmail_lib::{crypto::public_key_from_pem, RsaPublicKey, Version};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// age after which a mailsite is republished (or refetched)
pub fn mailsite_refresh() -> Duration {
    Duration::hours(6)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailsiteData {
    pub version: Version,
    pub identity: String,
    pub nickname: String,
    pub rts_key: String,
    /// SPKI PEM encoded RSA public key
    pub public_key: String,
    /// key space the slot ranges of the identity's channels are derived in
    pub slot_base_key: String,
    /// number of slots the identity has allocated for sending so far
    pub next_slot: u64,
    pub updated_at: DateTime<Utc>,
}

impl MailsiteData {
    pub fn public_key(&self) -> Result<RsaPublicKey, TransportError> {
        Ok(public_key_from_pem(&self.public_key)?)
    }
}

#[derive(Debug)]
struct Publication {
    edition: u64,
    last_update: Option<DateTime<Utc>>,
    slot_base_key: String,
    next_slot: u64,
}

/// our own mailsite
pub struct Mailsite {
    uri: String,
    identity: String,
    nickname: String,
    rts_key: String,
    public_key: String,
    inserter: Arc<MailsiteInserter>,
    publication: Mutex<Publication>,
}

impl Mailsite {
    pub fn new(
        uri: impl Into<String>,
        identity: impl Into<String>,
        nickname: impl Into<String>,
        rts_key: impl Into<String>,
        public_key_pem: impl Into<String>,
        slot_base_key: impl Into<String>,
        inserter: Arc<MailsiteInserter>,
    ) -> Self {
        Self {
            uri: uri.into(),
            identity: identity.into(),
            nickname: nickname.into(),
            rts_key: rts_key.into(),
            public_key: public_key_pem.into(),
            inserter,
            publication: Mutex::new(Publication {
                edition: 0,
                last_update: None,
                slot_base_key: slot_base_key.into(),
                next_slot: 0,
            }),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// number of successful publications
    pub fn edition(&self) -> u64 {
        self.publication
            .lock()
            .expect("the lock should always be valid")
            .edition
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.publication
            .lock()
            .expect("the lock should always be valid")
            .last_update
    }

    /// update the slot hint, published on the next publication
    pub fn set_slot_hint(&self, slot_base_key: impl Into<String>, next_slot: u64) {
        let mut publication = self
            .publication
            .lock()
            .expect("the lock should always be valid");
        publication.slot_base_key = slot_base_key.into();
        publication.next_slot = next_slot;
    }

    pub fn needs_update(&self) -> bool {
        self.needs_update_at(Utc::now())
    }

    pub fn needs_update_at(&self, now: DateTime<Utc>) -> bool {
        self.last_update()
            .map_or(true, |last_update| now - last_update > mailsite_refresh())
    }

    pub fn data(&self, now: DateTime<Utc>) -> MailsiteData {
        let publication = self
            .publication
            .lock()
            .expect("the lock should always be valid");

        MailsiteData {
            version: Version::CURRENT,
            identity: self.identity.clone(),
            nickname: self.nickname.clone(),
            rts_key: self.rts_key.clone(),
            public_key: self.public_key.clone(),
            slot_base_key: publication.slot_base_key.clone(),
            next_slot: publication.next_slot,
            updated_at: now,
        }
    }

    /// insert the current mailsite at our mailsite URI
    pub async fn publish(&self) -> Result<MailsiteData, TransportError> {
        let now = Utc::now();
        let data = self.data(now);
        let json = serde_json::to_vec(&data)?;

        self.inserter
            .insert(&self.uri, Bytes::from(json))
            .await
            .map_err(TransportError::Network)?;

        let mut publication = self
            .publication
            .lock()
            .expect("the lock should always be valid");
        publication.edition += 1;
        publication.last_update = Some(now);

        tracing::info!(uri = %self.uri, edition = publication.edition, "mailsite published");

        Ok(data)
    }
}

/// republishes our mailsite when it is stale
pub struct MailsitePublisher {
    mailsite: Arc<Mailsite>,
}

impl MailsitePublisher {
    pub fn new(mailsite: Arc<Mailsite>) -> Self {
        Self { mailsite }
    }
}

#[async_trait]
impl Job for MailsitePublisher {
    fn name(&self) -> &'static str {
        "mailsite-publisher"
    }

    async fn run_once(&self) {
        if !self.mailsite.needs_update() {
            return;
        }

        if let Err(error) = self.mailsite.publish().await {
            tracing::warn!(uri = %self.mailsite.uri(), reason = %error.report(), "cannot publish the mailsite");
        }
    }
}

/// fetches the mailsites of the other identities
///
/// keeps the recently fetched mailsites in a bounded cache.
pub struct MailsiteFetcher {
    fetcher: Arc<MailsiteDataFetcher>,
    cache: Mutex<LruCache<String, (DateTime<Utc>, MailsiteData)>>,
}

impl MailsiteFetcher {
    pub fn new(fetcher: Arc<MailsiteDataFetcher>, cache_size: usize) -> Self {
        Self {
            fetcher,
            cache: Mutex::new(LruCache::new(cache_size.max(1))),
        }
    }

    pub async fn fetch(&self, uri: &str) -> Result<MailsiteData, TransportError> {
        self.fetch_at(uri, Utc::now()).await
    }

    pub async fn fetch_at(
        &self,
        uri: &str,
        now: DateTime<Utc>,
    ) -> Result<MailsiteData, TransportError> {
        if let Some(data) = self.cached(uri, now) {
            return Ok(data);
        }

        let bytes = self
            .fetcher
            .fetch(uri)
            .await
            .map_err(TransportError::Network)?
            .ok_or_else(|| TransportError::NotFound {
                key: uri.to_owned(),
            })?;

        let data: MailsiteData = serde_json::from_slice(&bytes)?;
        if !data.version.is_supported() {
            return Err(TransportError::UnsupportedVersion(data.version));
        }
        data.public_key()?;

        self.cache
            .lock()
            .expect("the lock should always be valid")
            .put(uri.to_owned(), (now, data.clone()));

        tracing::debug!(%uri, identity = %data.identity, "mailsite fetched");

        Ok(data)
    }

    pub fn invalidate_cache(&self, uri: &str) {
        self.cache
            .lock()
            .expect("the lock should always be valid")
            .pop(&uri.to_owned());
    }

    pub fn clear_cache(&self) {
        self.cache
            .lock()
            .expect("the lock should always be valid")
            .clear();
    }

    fn cached(&self, uri: &str, now: DateTime<Utc>) -> Option<MailsiteData> {
        let mut cache = self.cache.lock().expect("the lock should always be valid");

        match cache.get(&uri.to_owned()) {
            Some((fetched_at, data)) if now - *fetched_at <= mailsite_refresh() => {
                Some(data.clone())
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{memory::MemoryNetwork, test_utils::alice};
    use dropmail_lib::crypto::public_key_to_pem;

    fn mailsite(network: &Arc<MemoryNetwork>) -> Mailsite {
        let pem = public_key_to_pem(alice().public_key()).unwrap();
        Mailsite::new(
            "USK@alice/mailsite",
            "alice",
            "Alice",
            "KSK@alice-rts",
            pem,
            "KSK@dropmail-alice",
            Arc::clone(network) as Arc<MailsiteInserter>,
        )
    }

    #[test]
    fn needs_update() {
        let network = Arc::new(MemoryNetwork::new());
        let mailsite = mailsite(&network);
        assert!(mailsite.needs_update());

        let now = Utc::now();
        mailsite
            .publication
            .lock()
            .unwrap()
            .last_update = Some(now);

        assert!(!mailsite.needs_update_at(now + Duration::hours(5)));
        assert!(mailsite.needs_update_at(now + Duration::hours(6) + Duration::seconds(1)));
    }

    #[tokio::test]
    async fn publish_and_fetch() {
        let network = Arc::new(MemoryNetwork::new());
        let mailsite = mailsite(&network);

        let published = mailsite.publish().await.unwrap();
        assert_eq!(mailsite.edition(), 1);
        assert!(!mailsite.needs_update());

        let json: serde_json::Value =
            serde_json::from_slice(&network.get("USK@alice/mailsite").unwrap()).unwrap();
        assert_eq!(json["version"], 1);

        let fetcher = MailsiteFetcher::new(Arc::clone(&network) as Arc<MailsiteDataFetcher>, 8);
        let fetched = fetcher.fetch("USK@alice/mailsite").await.unwrap();
        assert_eq!(fetched, published);
        assert_eq!(&fetched.public_key().unwrap(), alice().public_key());
    }

    #[tokio::test]
    async fn failed_publish_keeps_the_edition() {
        let network = Arc::new(MemoryNetwork::new());
        network.fail_inserts_at("USK@alice/mailsite");
        let mailsite = mailsite(&network);

        assert!(mailsite.publish().await.unwrap_err().is_network());
        assert_eq!(mailsite.edition(), 0);
        assert!(mailsite.needs_update());
    }

    #[tokio::test]
    async fn cache() {
        let network = Arc::new(MemoryNetwork::new());
        let mailsite = mailsite(&network);
        mailsite.publish().await.unwrap();

        let fetcher = MailsiteFetcher::new(Arc::clone(&network) as Arc<MailsiteDataFetcher>, 8);
        let now = Utc::now();
        let first = fetcher.fetch_at("USK@alice/mailsite", now).await.unwrap();

        // a newer edition is not seen while the cached copy is fresh
        mailsite.set_slot_hint("KSK@dropmail-alice", 12);
        mailsite.publish().await.unwrap();
        let cached = fetcher
            .fetch_at("USK@alice/mailsite", now + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(cached, first);

        let stale = fetcher
            .fetch_at("USK@alice/mailsite", now + Duration::hours(7))
            .await
            .unwrap();
        assert_eq!(stale.next_slot, 12);

        mailsite.set_slot_hint("KSK@dropmail-alice", 13);
        mailsite.publish().await.unwrap();
        fetcher.invalidate_cache("USK@alice/mailsite");
        let refreshed = fetcher
            .fetch_at("USK@alice/mailsite", now + Duration::hours(7))
            .await
            .unwrap();
        assert_eq!(refreshed.next_slot, 13);
    }

    #[tokio::test]
    async fn missing_and_invalid() {
        let network = Arc::new(MemoryNetwork::new());
        let fetcher = MailsiteFetcher::new(Arc::clone(&network) as Arc<MailsiteDataFetcher>, 8);

        assert!(matches!(
            fetcher.fetch("USK@nobody/mailsite").await,
            Err(TransportError::NotFound { .. })
        ));

        network.put("USK@bad/mailsite", &b"{\"version\":1}"[..]);
        assert!(matches!(
            fetcher.fetch("USK@bad/mailsite").await,
            Err(TransportError::Json(_))
        ));

        let mailsite = mailsite(&network);
        let mut data = mailsite.data(Utc::now());
        data.version = Version::from_u8(2);
        network.put("USK@future/mailsite", serde_json::to_vec(&data).unwrap());
        assert!(matches!(
            fetcher.fetch("USK@future/mailsite").await,
            Err(TransportError::UnsupportedVersion(_))
        ));
    }
}
