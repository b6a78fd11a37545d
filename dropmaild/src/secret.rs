use anyhow::{Context as _, Result};
use dropmail_lib::{crypto::public_key_fingerprint, MessageCrypto, RsaPrivateKey};
use dropmail_transport::Account;
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey as _, EncodePrivateKey as _, LineEnding};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use structopt::StructOpt;

/// the identity of the node: its RSA key and the names it is reachable at
#[derive(Clone)]
pub struct Secret {
    crypto: MessageCrypto,
    account: Account,
}

#[derive(Debug, PartialEq, Eq, Hash, Clone, Serialize, Deserialize, StructOpt)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// path to the PKCS#8 PEM file of the private key
    ///
    /// a new key is generated and saved there if the file does not exist
    #[structopt(
        long = "private-key",
        default_value = "dropmail.pem",
        env = "DROPMAILD_PRIVATE_KEY"
    )]
    #[serde(default = "default_private_key")]
    pub private_key: PathBuf,

    /// the public identity of the node
    ///
    /// defaults to the fingerprint of the public key
    #[structopt(long = "identity")]
    #[serde(default)]
    pub identity: Option<String>,

    #[structopt(long = "nickname", default_value = "dropmail")]
    #[serde(default = "default_nickname")]
    pub nickname: String,

    /// the network key other identities drop their channel requests at
    ///
    /// defaults to `KSK@dropmail-rts-<identity>`
    #[structopt(long = "rts-key")]
    #[serde(default)]
    pub rts_key: Option<String>,

    /// the network key the mailsite is published at
    ///
    /// defaults to `USK@<identity>/dropmail`
    #[structopt(long = "mailsite-uri")]
    #[serde(default)]
    pub mailsite_uri: Option<String>,
}

impl Secret {
    pub fn new(config: Config) -> Result<Self> {
        let private_key = load_or_generate(&config.private_key)?;
        let crypto = MessageCrypto::new(private_key);

        let identity = config
            .identity
            .unwrap_or_else(|| public_key_fingerprint(crypto.public_key()));
        let rts_key = config
            .rts_key
            .unwrap_or_else(|| format!("KSK@dropmail-rts-{}", identity));
        let mailsite_uri = config
            .mailsite_uri
            .unwrap_or_else(|| format!("USK@{}/dropmail", identity));

        tracing::info!(%identity, %mailsite_uri, "secret loaded");

        Ok(Self {
            crypto,
            account: Account {
                identity,
                nickname: config.nickname,
                mailsite_uri,
                rts_key,
            },
        })
    }

    pub fn crypto(&self) -> &MessageCrypto {
        &self.crypto
    }

    pub fn account(&self) -> &Account {
        &self.account
    }
}

fn load_or_generate(path: &Path) -> Result<RsaPrivateKey> {
    if path.exists() {
        let pem = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot open the private key file {}", path.display()))?;
        return RsaPrivateKey::from_pkcs8_pem(&pem)
            .with_context(|| format!("Cannot parse the private key file {}", path.display()));
    }

    tracing::warn!(path = %path.display(), "no private key found, generating a new one");

    let crypto = MessageCrypto::generate(&mut OsRng).context("Cannot generate a private key")?;
    let pem = crypto
        .private_key()
        .to_pkcs8_pem(LineEnding::LF)
        .context("Cannot encode the private key")?;
    std::fs::write(path, pem.as_bytes())
        .with_context(|| format!("Cannot save the private key in {}", path.display()))?;

    Ok(crypto.private_key().clone())
}

fn default_private_key() -> PathBuf {
    PathBuf::from("dropmail.pem")
}

fn default_nickname() -> String {
    "dropmail".to_owned()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            private_key: default_private_key(),
            identity: None,
            nickname: default_nickname(),
            rts_key: None,
            mailsite_uri: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore as _;

    fn temp_key_path() -> PathBuf {
        std::env::temp_dir().join(format!("dropmaild-{:016x}.pem", OsRng.next_u64()))
    }

    #[test]
    fn generate_then_load() {
        let path = temp_key_path();
        let config = Config {
            private_key: path.clone(),
            ..Config::default()
        };

        let generated = Secret::new(config.clone()).unwrap();
        assert!(path.exists());

        let loaded = Secret::new(config).unwrap();
        assert_eq!(generated.crypto().public_key(), loaded.crypto().public_key());
        assert_eq!(generated.account(), loaded.account());

        let identity = &loaded.account().identity;
        assert_eq!(identity, &public_key_fingerprint(loaded.crypto().public_key()));
        assert_eq!(loaded.account().rts_key, format!("KSK@dropmail-rts-{}", identity));

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn invalid_key_file() {
        let path = temp_key_path();
        std::fs::write(&path, "not a key").unwrap();

        let config = Config {
            private_key: path.clone(),
            ..Config::default()
        };
        assert!(Secret::new(config).is_err());

        std::fs::remove_file(path).unwrap();
    }
}
