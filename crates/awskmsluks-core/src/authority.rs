//! Contract for the remote key-wrapping authority.
//!
//! The concrete KMS client lives in `awskmsluks-aws`; the core only needs to
//! ask for a fresh data key and to unwrap one it stored earlier.

use crate::key::{EncryptionContext, Passphrase};
use std::error::Error;

/// Number of random bytes requested for each data key.
pub const PASSPHRASE_BYTE_SIZE: usize = 1024;

/// Freshly generated data key in both forms.
///
/// Both values are base64 text: `plaintext` is the LUKS passphrase and
/// `wrapped` is the ciphertext blob that is safe to persist.
#[derive(Debug)]
pub struct SecretPair {
    pub plaintext: Passphrase,
    pub wrapped: String,
}

/// Remote authority that wraps and unwraps data keys under a master key.
///
/// Implementations must bind `context` as additional authenticated data so an
/// unwrap with any differing field is refused. Calls are attempted once.
pub trait KeyAuthority {
    type Error: Error + Send + Sync + 'static;

    /// Generate a new random data key of [`PASSPHRASE_BYTE_SIZE`] bytes under `key_arn`.
    fn generate_data_key(
        &self,
        key_arn: &str,
        context: &EncryptionContext,
    ) -> Result<SecretPair, Self::Error>;

    /// Unwrap `wrapped` under `key_arn`, supplying the same `context` used at generation.
    fn decrypt_data_key(
        &self,
        wrapped: &str,
        context: &EncryptionContext,
        key_arn: &str,
    ) -> Result<Passphrase, Self::Error>;
}
