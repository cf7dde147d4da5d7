//! Error taxonomy shared by every awskmsluks crate.

use std::path::PathBuf;
use thiserror::Error;

pub type KmsLuksResult<T> = Result<T, KmsLuksError>;

#[derive(Debug, Error)]
pub enum KmsLuksError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid CMK ARN `{arn}`: {reason}")]
    InvalidArn { arn: String, reason: String },

    #[error("key authority call failed: {0}")]
    Authority(String),

    #[error("key store error: {0}")]
    Store(String),

    #[error("no key for this host in the local store ({})", path.display())]
    KeyNotFound { path: PathBuf },

    #[error("error parsing device's key from local store ({}): {reason}", path.display())]
    KeyParse { path: PathBuf, reason: String },

    #[error("format failed for {}: {reason}", device.display())]
    Format { device: PathBuf, reason: String },

    #[error(
        "{} was formatted but its UUID could not be set: {reason}. Update the volume's UUID manually with:\ncryptsetup luksUUID {} --uuid {uuid}",
        device.display(),
        device.display()
    )]
    UuidBinding {
        device: PathBuf,
        uuid: String,
        reason: String,
    },

    #[error("unlock failed for {uuid}: {reason}")]
    Unlock { uuid: String, reason: String },

    #[error("cryptsetup error: {0}")]
    Tool(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl KmsLuksError {
    /// Wrap any failure from the unlock path so bulk reports can name the record.
    pub fn unlock(uuid: &str, err: impl std::fmt::Display) -> Self {
        KmsLuksError::Unlock {
            uuid: uuid.to_string(),
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_binding_error_carries_remediation() {
        let err = KmsLuksError::UuidBinding {
            device: PathBuf::from("/dev/sdb1"),
            uuid: "abc-123".into(),
            reason: "exit code 1".into(),
        };
        let message = err.to_string();
        assert!(message.contains("cryptsetup luksUUID /dev/sdb1 --uuid abc-123"));
    }
}
