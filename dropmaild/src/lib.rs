mod config;
pub mod node;
pub mod secret;
pub mod storage;

pub use self::config::Config;
