//! `KeyAuthority` backed by AWS KMS.

use crate::session::AwsSession;
use aws_sdk_kms::config::{Builder as KmsConfigBuilder, Region};
use aws_sdk_kms::error::DisplayErrorContext;
use aws_sdk_kms::primitives::Blob;
use aws_sdk_kms::Client as KmsClient;
use awskmsluks_core::error::{KmsLuksError, KmsLuksResult};
use awskmsluks_core::{EncryptionContext, KeyArn, KeyAuthority, Passphrase, SecretPair, PASSPHRASE_BYTE_SIZE};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use log::debug;
use zeroize::Zeroizing;

/// Generates and unwraps data keys with `GenerateDataKey` / `Decrypt`.
///
/// Each call targets the region embedded in the key ARN, whatever the default
/// region of the session is.
#[derive(Clone)]
pub struct KmsAuthority {
    session: AwsSession,
}

impl KmsAuthority {
    pub fn new(session: AwsSession) -> Self {
        Self { session }
    }

    fn client_for(&self, key_arn: &str) -> KmsLuksResult<KmsClient> {
        let arn = KeyArn::parse(key_arn)?;
        let config = KmsConfigBuilder::from(self.session.sdk_config())
            .region(Region::new(arn.region))
            .build();
        Ok(KmsClient::from_conf(config))
    }
}

impl KeyAuthority for KmsAuthority {
    type Error = KmsLuksError;

    fn generate_data_key(
        &self,
        key_arn: &str,
        context: &EncryptionContext,
    ) -> KmsLuksResult<SecretPair> {
        let client = self.client_for(key_arn)?;
        debug!("requesting {PASSPHRASE_BYTE_SIZE}-byte data key from {key_arn}");

        let output = self
            .session
            .block_on(
                client
                    .generate_data_key()
                    .key_id(key_arn)
                    .number_of_bytes(PASSPHRASE_BYTE_SIZE as i32)
                    .set_encryption_context(Some(context.to_map()))
                    .send(),
            )
            .map_err(|err| {
                KmsLuksError::Authority(format!(
                    "GenerateDataKey under {key_arn} failed: {}",
                    DisplayErrorContext(&err)
                ))
            })?;

        let plaintext = output
            .plaintext()
            .ok_or_else(|| KmsLuksError::Authority("GenerateDataKey returned no plaintext".into()))?;
        let wrapped = output.ciphertext_blob().ok_or_else(|| {
            KmsLuksError::Authority("GenerateDataKey returned no ciphertext".into())
        })?;

        Ok(SecretPair {
            plaintext: encode_secret(plaintext.as_ref()),
            wrapped: STANDARD.encode(wrapped),
        })
    }

    fn decrypt_data_key(
        &self,
        wrapped: &str,
        context: &EncryptionContext,
        key_arn: &str,
    ) -> KmsLuksResult<Passphrase> {
        let ciphertext = decode_wrapped(wrapped)?;
        let client = self.client_for(key_arn)?;

        let output = self
            .session
            .block_on(
                client
                    .decrypt()
                    .key_id(key_arn)
                    .ciphertext_blob(Blob::new(ciphertext))
                    .set_encryption_context(Some(context.to_map()))
                    .send(),
            )
            .map_err(|err| {
                KmsLuksError::Authority(format!(
                    "Decrypt under {key_arn} failed: {}",
                    DisplayErrorContext(&err)
                ))
            })?;

        let plaintext = output
            .plaintext()
            .ok_or_else(|| KmsLuksError::Authority("Decrypt returned no plaintext".into()))?;
        Ok(encode_secret(plaintext.as_ref()))
    }
}

/// Passphrase text for raw key bytes: standard base64, padded.
fn encode_secret(raw: &[u8]) -> Passphrase {
    let encoded = Zeroizing::new(STANDARD.encode(raw));
    Passphrase::new(encoded.as_str())
}

fn decode_wrapped(wrapped: &str) -> KmsLuksResult<Vec<u8>> {
    STANDARD.decode(wrapped.trim()).map_err(|err| {
        KmsLuksError::Authority(format!("cannot base64 decode encrypted key: {err}"))
    })
}
