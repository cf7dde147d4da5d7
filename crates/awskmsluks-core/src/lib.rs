//! Core building blocks for awskmsluks.
//!
//! Key records, the authority/archive/tool contracts, the local key cache, and
//! the service that drives format and unlock live here. AWS and cryptsetup
//! integrations are provided by sibling crates.

pub mod arn;
pub mod authority;
pub mod build_info;
pub mod config;
pub mod device;
pub mod error;
pub mod host;
pub mod key;
pub mod logging;
pub mod service;
pub mod store;

pub use arn::KeyArn;
pub use authority::{KeyAuthority, SecretPair, PASSPHRASE_BYTE_SIZE};
pub use build_info::BuildInfo;
pub use config::{KmsLuksConfig, DEFAULT_CONFIG_PATH};
pub use device::{mapping_name, LuksTool};
pub use error::{KmsLuksError, KmsLuksResult};
pub use key::{DataKey, EncryptionContext, KeyRecord, Passphrase};
pub use service::{FormatReport, KmsLuksService, UnlockOutcome};
pub use store::{KeyArchive, KeyCache};
