use dropmail_lib::MessageCrypto;
use rand::rngs::OsRng;
use std::sync::OnceLock;

/// RSA key generation is slow, the tests share a couple of identities
pub(crate) fn alice() -> MessageCrypto {
    static KEY: OnceLock<MessageCrypto> = OnceLock::new();
    KEY.get_or_init(|| MessageCrypto::generate(&mut OsRng).unwrap())
        .clone()
}

pub(crate) fn bob() -> MessageCrypto {
    static KEY: OnceLock<MessageCrypto> = OnceLock::new();
    KEY.get_or_init(|| MessageCrypto::generate(&mut OsRng).unwrap())
        .clone()
}
