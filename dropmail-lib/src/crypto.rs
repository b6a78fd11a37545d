/*!
# hybrid message cryptography

every payload exchanged between 2 identities goes through one of the 2
following constructions:

1. **hybrid**: a fresh AES-256 session key and IV are generated, the
   plaintext is AES-256-CBC encrypted (PKCS#7 padding), the session key is
   wrapped with RSA-OAEP(SHA-256) for the recipient and the ciphertext is
   signed with RSA-PSS(SHA-256) by the sender. See
   [`MessageCrypto::encrypt_message`].
2. **channel**: once both sides share a [`ChannelKey`] the body is
   AES-256-CBC encrypted with it and signed the same way. See
   [`MessageCrypto::encrypt_with_channel_key`].

In both cases the signature is checked *before* anything is decrypted
whenever the sender's public key is known.
*/

use crate::EncryptedMessage;
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut as _, BlockEncryptMut as _, KeyIvInit as _};
use rand::rngs::OsRng;
use rand_core::{CryptoRng, RngCore};
use rsa::{
    pkcs8::{DecodePublicKey as _, EncodePublicKey as _, LineEnding},
    Oaep, Pss, RsaPrivateKey, RsaPublicKey,
};
use sha2::{Digest as _, Sha256};
use std::{fmt, sync::Arc};
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// size in bytes of the RSA keys generated for new identities
pub const RSA_KEY_BITS: usize = 2048;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid padding, the ciphertext is corrupted or the key is wrong")]
    InvalidPadding,

    #[error("Signature does not match the sender's public key")]
    SignatureMismatch,

    #[error("Invalid key length: expected {expected} bytes, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Invalid IV length: expected {expected} bytes, got {got}")]
    InvalidIvLength { expected: usize, got: usize },

    #[error("RSA operation failed")]
    Rsa(#[from] rsa::Error),

    #[error("Invalid PEM encoded public key")]
    InvalidPublicKey(#[from] rsa::pkcs8::spki::Error),
}

/// AES-256 key and IV
///
/// used as the session key of the hybrid encryption and as the
/// negotiated secret of an established channel (proposed by the
/// initiator in the RTS).
#[derive(Clone, PartialEq, Eq)]
pub struct ChannelKey {
    key: [u8; Self::KEY_SIZE],
    iv: [u8; Self::IV_SIZE],
}

impl ChannelKey {
    pub const KEY_SIZE: usize = 32;
    pub const IV_SIZE: usize = 16;
    pub const SIZE: usize = Self::KEY_SIZE + Self::IV_SIZE;

    pub fn generate<RNG>(mut rng: RNG) -> Self
    where
        RNG: RngCore + CryptoRng,
    {
        let mut key = Self {
            key: [0; Self::KEY_SIZE],
            iv: [0; Self::IV_SIZE],
        };

        rng.fill_bytes(&mut key.key);
        rng.fill_bytes(&mut key.iv);

        key
    }

    pub fn from_slices(key: &[u8], iv: &[u8]) -> Result<Self, CryptoError> {
        let mut channel_key = Self {
            key: [0; Self::KEY_SIZE],
            iv: [0; Self::IV_SIZE],
        };

        check_key_length(key)?;
        check_iv_length(iv)?;

        channel_key.key.copy_from_slice(key);
        channel_key.iv.copy_from_slice(iv);

        Ok(channel_key)
    }

    /// parse the `key ‖ iv` concatenation
    pub fn from_concatenated(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != Self::SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: Self::SIZE,
                got: bytes.len(),
            });
        }

        Self::from_slices(&bytes[..Self::KEY_SIZE], &bytes[Self::KEY_SIZE..])
    }

    /// `key ‖ iv`
    pub fn to_concatenated(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::SIZE);
        bytes.extend_from_slice(&self.key);
        bytes.extend_from_slice(&self.iv);
        bytes
    }

    pub fn key(&self) -> &[u8; Self::KEY_SIZE] {
        &self.key
    }

    pub fn iv(&self) -> &[u8; Self::IV_SIZE] {
        &self.iv
    }

    /// AES-256-CBC encrypt with the key and IV
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        aes_encrypt(&self.key, &self.iv, plaintext)
    }

    /// AES-256-CBC decrypt with the key and IV
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        aes_decrypt(&self.key, &self.iv, ciphertext)
    }
}

impl fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelKey").finish_non_exhaustive()
    }
}

fn check_key_length(key: &[u8]) -> Result<(), CryptoError> {
    if key.len() != ChannelKey::KEY_SIZE {
        Err(CryptoError::InvalidKeyLength {
            expected: ChannelKey::KEY_SIZE,
            got: key.len(),
        })
    } else {
        Ok(())
    }
}

fn check_iv_length(iv: &[u8]) -> Result<(), CryptoError> {
    if iv.len() != ChannelKey::IV_SIZE {
        Err(CryptoError::InvalidIvLength {
            expected: ChannelKey::IV_SIZE,
            got: iv.len(),
        })
    } else {
        Ok(())
    }
}

fn aes_encrypt(key: &[u8; 32], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    Aes256CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

fn aes_decrypt(key: &[u8; 32], iv: &[u8; 16], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    Aes256CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::InvalidPadding)
}

/// the cryptographic operations of one identity
///
/// holds the identity's RSA private key. The object is cheap to clone.
#[derive(Clone)]
pub struct MessageCrypto {
    private_key: Arc<RsaPrivateKey>,
    public_key: RsaPublicKey,
}

impl MessageCrypto {
    pub fn new(private_key: RsaPrivateKey) -> Self {
        let public_key = private_key.to_public_key();
        Self {
            private_key: Arc::new(private_key),
            public_key,
        }
    }

    /// generate a new identity key
    ///
    /// this is slow, RSA key generation may take a couple of seconds
    pub fn generate<RNG>(rng: &mut RNG) -> Result<Self, CryptoError>
    where
        RNG: RngCore + CryptoRng,
    {
        let private_key = RsaPrivateKey::new(rng, RSA_KEY_BITS)?;
        Ok(Self::new(private_key))
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    /// RSA-PSS(SHA-256) signature of the given data
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let digest = Sha256::digest(data);
        let signature =
            self.private_key
                .sign_with_rng(&mut OsRng, Pss::new::<Sha256>(), digest.as_slice())?;
        Ok(signature)
    }

    /// RSA-OAEP(SHA-256) unwrap of a key wrapped for us
    pub fn unwrap_key(&self, wrapped: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self.private_key.decrypt(Oaep::new::<Sha256>(), wrapped)?;
        Ok(key)
    }

    /// hybrid encryption of the `plaintext` for the `recipient`
    pub fn encrypt_message(
        &self,
        plaintext: &[u8],
        recipient: &RsaPublicKey,
    ) -> Result<EncryptedMessage, CryptoError> {
        let session = ChannelKey::generate(OsRng);

        let encrypted_body = session.encrypt(plaintext);
        let encrypted_session_key = wrap_key(recipient, session.key())?;
        let signature = self.sign(&encrypted_body)?;

        Ok(EncryptedMessage::new(
            encrypted_session_key,
            session.iv().to_vec(),
            encrypted_body,
            signature,
        ))
    }

    /// reverse of [`encrypt_message`]
    ///
    /// The signature is only verified if the `sender`'s public key is
    /// given. Without it the plaintext is returned unauthenticated, this is
    /// what happens on first contact when the sender is not known yet.
    ///
    /// [`encrypt_message`]: Self::encrypt_message
    pub fn decrypt_message(
        &self,
        message: &EncryptedMessage,
        sender: Option<&RsaPublicKey>,
    ) -> Result<Vec<u8>, CryptoError> {
        if let Some(sender) = sender {
            verify(sender, message.encrypted_body(), message.signature())?;
        }

        check_iv_length(message.iv())?;
        let key = self.unwrap_key(message.encrypted_session_key())?;
        let session = ChannelKey::from_slices(&key, message.iv())?;

        session.decrypt(message.encrypted_body())
    }

    /// encrypt the `plaintext` with an established channel key
    ///
    /// the IV of the channel key is not reused: a fresh IV is generated
    /// and carried in the message. The session key field is left empty.
    ///
    /// On the wire this differs from encrypting with the negotiated key
    /// and IV pair: the receiver must decrypt with the IV of the message
    /// (see [`decrypt_with_channel_key`]). A peer decrypting with the IV
    /// of the RTS gets a corrupted first block. The negotiated IV travels
    /// in the RTS and is stored with the channel, it plays no part here.
    ///
    /// [`decrypt_with_channel_key`]: Self::decrypt_with_channel_key
    pub fn encrypt_with_channel_key(
        &self,
        plaintext: &[u8],
        channel_key: &ChannelKey,
    ) -> Result<EncryptedMessage, CryptoError> {
        let mut iv = [0; ChannelKey::IV_SIZE];
        OsRng.fill_bytes(&mut iv);

        let encrypted_body = aes_encrypt(channel_key.key(), &iv, plaintext);
        let signature = self.sign(&encrypted_body)?;

        Ok(EncryptedMessage::new(
            Vec::new(),
            iv.to_vec(),
            encrypted_body,
            signature,
        ))
    }

    /// reverse of [`encrypt_with_channel_key`]
    ///
    /// [`encrypt_with_channel_key`]: Self::encrypt_with_channel_key
    pub fn decrypt_with_channel_key(
        &self,
        message: &EncryptedMessage,
        channel_key: &ChannelKey,
        sender: Option<&RsaPublicKey>,
    ) -> Result<Vec<u8>, CryptoError> {
        if let Some(sender) = sender {
            verify(sender, message.encrypted_body(), message.signature())?;
        }

        let key = ChannelKey::from_slices(channel_key.key(), message.iv())?;
        key.decrypt(message.encrypted_body())
    }
}

impl fmt::Debug for MessageCrypto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageCrypto")
            .field("public_key", &public_key_fingerprint(&self.public_key))
            .finish()
    }
}

/// RSA-OAEP(SHA-256) wrap of `key` for the owner of `public_key`
pub fn wrap_key(public_key: &RsaPublicKey, key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let wrapped = public_key.encrypt(&mut OsRng, Oaep::new::<Sha256>(), key)?;
    Ok(wrapped)
}

/// verify a RSA-PSS(SHA-256) signature
pub fn verify(public_key: &RsaPublicKey, data: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let digest = Sha256::digest(data);
    public_key
        .verify(Pss::new::<Sha256>(), digest.as_slice(), signature)
        .map_err(|_| CryptoError::SignatureMismatch)
}

/// PEM (SPKI) encoding of the public key, as published in the mailsite
pub fn public_key_to_pem(public_key: &RsaPublicKey) -> Result<String, CryptoError> {
    public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(CryptoError::InvalidPublicKey)
}

pub fn public_key_from_pem(pem: &str) -> Result<RsaPublicKey, CryptoError> {
    RsaPublicKey::from_public_key_pem(pem).map_err(CryptoError::InvalidPublicKey)
}

/// short hex fingerprint of a public key, useful for logging
pub fn public_key_fingerprint(public_key: &RsaPublicKey) -> String {
    match public_key.to_public_key_der() {
        Ok(der) => hex::encode(&Sha256::digest(der.as_bytes())[..8]),
        Err(_) => String::from("<invalid>"),
    }
}
