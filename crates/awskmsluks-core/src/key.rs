//! Key records: the wrapped data key plus the context it is bound to.
//!
//! A record is the only thing persisted per device. The plaintext passphrase
//! is carried in memory between unwrap and use and is never serialized.

use crate::arn::KeyArn;
use crate::authority::KeyAuthority;
use crate::error::{KmsLuksError, KmsLuksResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use uuid::Uuid;
use zeroize::Zeroizing;

/// In-memory passphrase whose backing buffer is zeroed on drop.
pub struct Passphrase(Zeroizing<String>);

impl Passphrase {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for Passphrase {
    fn default() -> Self {
        Self::new(String::new())
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("Passphrase(<empty>)")
        } else {
            f.write_str("Passphrase(<redacted>)")
        }
    }
}

/// Additional authenticated data bound to every wrap/unwrap call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionContext {
    #[serde(rename = "FQDN")]
    pub fqdn: String,
    #[serde(rename = "Production")]
    pub production: bool,
    #[serde(rename = "UUID")]
    pub uuid: String,
}

impl EncryptionContext {
    pub fn new(fqdn: impl Into<String>, uuid: impl Into<String>, production: bool) -> Self {
        Self {
            fqdn: fqdn.into(),
            production,
            uuid: uuid.into(),
        }
    }

    /// Render the context as the string map handed to the authority.
    pub fn to_map(&self) -> HashMap<String, String> {
        HashMap::from([
            ("fqdn".to_string(), self.fqdn.clone()),
            ("production".to_string(), self.production.to_string()),
            ("uuid".to_string(), self.uuid.clone()),
        ])
    }
}

/// Wrapped data key and, transiently, its plaintext form.
#[derive(Debug, Serialize, Deserialize)]
pub struct DataKey {
    #[serde(skip)]
    pub plain: Passphrase,
    #[serde(rename = "Encrypted")]
    pub encrypted: String,
    #[serde(rename = "Created")]
    pub created: DateTime<Utc>,
}

/// Everything needed to unlock one device, as stored on disk and in the archive.
#[derive(Debug, Serialize, Deserialize)]
pub struct KeyRecord {
    #[serde(rename = "EncryptionContext")]
    pub encryption_context: EncryptionContext,
    #[serde(rename = "CMKARN")]
    pub cmk_arn: String,
    #[serde(rename = "DataKey")]
    pub data_key: DataKey,
}

impl KeyRecord {
    /// Ask `authority` for a new data key bound to a freshly generated device UUID.
    ///
    /// # Errors
    /// Returns `KmsLuksError::InvalidArn` before any remote call when `cmk_arn`
    /// is malformed, and `KmsLuksError::Authority` when the call is rejected.
    pub fn generate<A>(
        authority: &A,
        cmk_arn: &str,
        fqdn: &str,
        production: bool,
    ) -> KmsLuksResult<Self>
    where
        A: KeyAuthority<Error = KmsLuksError>,
    {
        KeyArn::parse(cmk_arn)?;
        let cmk_arn = cmk_arn.trim();
        let context = EncryptionContext::new(fqdn, Uuid::new_v4().to_string(), production);
        let pair = authority.generate_data_key(cmk_arn, &context)?;
        if pair.wrapped.is_empty() {
            return Err(KmsLuksError::Authority(
                "authority returned an empty ciphertext blob".into(),
            ));
        }

        Ok(Self {
            encryption_context: context,
            cmk_arn: cmk_arn.to_string(),
            data_key: DataKey {
                plain: pair.plaintext,
                encrypted: pair.wrapped,
                created: Utc::now(),
            },
        })
    }

    pub fn uuid(&self) -> &str {
        &self.encryption_context.uuid
    }

    pub fn fqdn(&self) -> &str {
        &self.encryption_context.fqdn
    }

    /// Archive object key and cache-relative path: `{FQDN}/{UUID}.json`.
    pub fn object_key(&self) -> String {
        format!("{}/{}.json", self.fqdn(), self.uuid())
    }

    /// True once the plaintext passphrase is held in memory.
    pub fn is_unwrapped(&self) -> bool {
        !self.data_key.plain.is_empty()
    }

    /// A record can unlock a device only with a ciphertext and a usable key reference.
    pub fn is_complete(&self) -> bool {
        !self.data_key.encrypted.is_empty() && KeyArn::parse(&self.cmk_arn).is_ok()
    }

    pub fn passphrase(&self) -> Option<&Passphrase> {
        self.is_unwrapped().then_some(&self.data_key.plain)
    }

    /// Move the plaintext out of the record, leaving it redacted.
    pub fn take_passphrase(&mut self) -> Option<Passphrase> {
        if !self.is_unwrapped() {
            return None;
        }
        Some(std::mem::take(&mut self.data_key.plain))
    }

    /// Unwrap the data key in place through `authority`.
    pub fn decrypt<A>(&mut self, authority: &A) -> KmsLuksResult<()>
    where
        A: KeyAuthority<Error = KmsLuksError>,
    {
        KeyArn::parse(&self.cmk_arn)?;
        if self.data_key.encrypted.is_empty() {
            return Err(KmsLuksError::Authority(format!(
                "key {} has no encrypted data key",
                self.uuid()
            )));
        }

        let plain = authority.decrypt_data_key(
            &self.data_key.encrypted,
            &self.encryption_context,
            self.cmk_arn.trim(),
        )?;
        self.data_key.plain = plain;
        Ok(())
    }

    /// Serialize without the plaintext, as pretty JSON with stable field order.
    pub fn to_redacted_json(&self) -> KmsLuksResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parse a stored record; `origin` is only used for error reporting.
    pub fn from_json(origin: &Path, bytes: &[u8]) -> KmsLuksResult<Self> {
        let record: KeyRecord =
            serde_json::from_slice(bytes).map_err(|err| KmsLuksError::KeyParse {
                path: origin.to_path_buf(),
                reason: err.to_string(),
            })?;

        if record.encryption_context.uuid.trim().is_empty() {
            return Err(KmsLuksError::KeyParse {
                path: origin.to_path_buf(),
                reason: "EncryptionContext.UUID is empty".into(),
            });
        }

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn unwrapped_record() -> KeyRecord {
        KeyRecord {
            encryption_context: EncryptionContext::new("host1", "abc-123", false),
            cmk_arn: "arn:aws:kms:us-east-1:111122223333:key/abcd".into(),
            data_key: DataKey {
                plain: Passphrase::new("c2VjcmV0"),
                encrypted: "Q0lQSEVS".into(),
                created: Utc::now(),
            },
        }
    }

    #[test]
    fn serialization_never_includes_plaintext() {
        let record = unwrapped_record();
        assert!(record.is_unwrapped());

        let json = String::from_utf8(record.to_redacted_json().unwrap()).unwrap();
        assert!(!json.contains("Plain"));
        assert!(!json.contains("c2VjcmV0"));
        assert!(json.contains("\"Encrypted\": \"Q0lQSEVS\""));
        assert!(record.is_unwrapped(), "serializing must not consume the passphrase");
    }

    #[test]
    fn serialized_shape_matches_store_format() {
        let record = unwrapped_record();
        let value: serde_json::Value =
            serde_json::from_slice(&record.to_redacted_json().unwrap()).unwrap();

        assert_eq!(value["EncryptionContext"]["FQDN"], "host1");
        assert_eq!(value["EncryptionContext"]["Production"], false);
        assert_eq!(value["EncryptionContext"]["UUID"], "abc-123");
        assert_eq!(value["CMKARN"], "arn:aws:kms:us-east-1:111122223333:key/abcd");
        assert!(value["DataKey"]["Created"].as_str().unwrap().ends_with('Z'));
        assert!(value["DataKey"].get("Plain").is_none());
    }

    #[test]
    fn stored_plain_field_is_ignored_on_load() {
        let payload = br#"{
  "EncryptionContext": {"FQDN": "host1", "Production": true, "UUID": "abc-123"},
  "CMKARN": "arn:aws:kms:us-east-1:111122223333:key/abcd",
  "DataKey": {"Plain": "leaked", "Encrypted": "Qw==", "Created": "2024-01-02T03:04:05Z"}
}"#;
        let record = KeyRecord::from_json(Path::new("abc-123.json"), payload).unwrap();
        assert!(!record.is_unwrapped());
        assert!(record.is_complete());
        assert_eq!(record.object_key(), "host1/abc-123.json");
    }

    #[test]
    fn from_json_reports_origin_on_parse_failure() {
        let err = KeyRecord::from_json(Path::new("/keys/host1/bad.json"), b"{not json").unwrap_err();
        match err {
            KmsLuksError::KeyParse { path, .. } => {
                assert_eq!(path, PathBuf::from("/keys/host1/bad.json"))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn take_passphrase_leaves_record_redacted() {
        let mut record = unwrapped_record();
        let pass = record.take_passphrase().unwrap();
        assert_eq!(pass.as_str(), "c2VjcmV0");
        assert!(!record.is_unwrapped());
        assert!(record.take_passphrase().is_none());
    }

    #[test]
    fn context_map_uses_lowercase_keys() {
        let map = EncryptionContext::new("host1", "abc-123", true).to_map();
        assert_eq!(map["fqdn"], "host1");
        assert_eq!(map["production"], "true");
        assert_eq!(map["uuid"], "abc-123");
    }

    #[derive(Default)]
    struct RecordingAuthority {
        key_ids: std::sync::Mutex<Vec<String>>,
    }

    impl KeyAuthority for RecordingAuthority {
        type Error = KmsLuksError;

        fn generate_data_key(
            &self,
            key_arn: &str,
            _context: &EncryptionContext,
        ) -> KmsLuksResult<crate::authority::SecretPair> {
            self.key_ids.lock().unwrap().push(key_arn.to_string());
            Ok(crate::authority::SecretPair {
                plaintext: Passphrase::new("UA=="),
                wrapped: "Qw==".into(),
            })
        }

        fn decrypt_data_key(
            &self,
            _wrapped: &str,
            _context: &EncryptionContext,
            key_arn: &str,
        ) -> KmsLuksResult<Passphrase> {
            self.key_ids.lock().unwrap().push(key_arn.to_string());
            Ok(Passphrase::new("UA=="))
        }
    }

    #[test]
    fn surrounding_whitespace_never_reaches_the_authority() {
        let arn = "arn:aws:kms:us-east-1:111122223333:key/abcd";
        let authority = RecordingAuthority::default();

        let mut record =
            KeyRecord::generate(&authority, &format!("  {arn}\n"), "host1", false).unwrap();
        assert_eq!(record.cmk_arn, arn);

        record.take_passphrase();
        record.cmk_arn = format!(" {arn} ");
        record.decrypt(&authority).unwrap();

        assert_eq!(*authority.key_ids.lock().unwrap(), vec![arn, arn]);
    }

    #[test]
    fn debug_output_redacts_passphrase() {
        let rendered = format!("{:?}", unwrapped_record());
        assert!(!rendered.contains("c2VjcmV0"));
        assert!(rendered.contains("<redacted>"));
    }
}
