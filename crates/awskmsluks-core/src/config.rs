//! Configuration model loaded from `/etc/awskmsluks/config.json`.

use crate::arn::KeyArn;
use crate::error::{KmsLuksError, KmsLuksResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/awskmsluks/config.json";
pub const DEFAULT_KEY_STORE: &str = "/etc/awskmsluks/keys";

/// Runtime configuration for every awskmsluks action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KmsLuksConfig {
    /// ARN of the KMS customer master key that wraps every data key.
    #[serde(rename = "CMKARN")]
    pub cmk_arn: String,

    #[serde(rename = "Production", default)]
    pub production: bool,

    /// Bucket receiving archived key records, optionally `bucket/prefix`.
    #[serde(rename = "KeyArchiveBucket")]
    pub key_archive_bucket: String,

    #[serde(rename = "KeyStore", default = "default_key_store")]
    pub key_store: String,

    #[serde(rename = "CryptsetupPath", default)]
    pub cryptsetup_path: Option<String>,

    #[serde(rename = "TimeoutSecs", default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(skip)]
    pub path: PathBuf,
}

fn default_key_store() -> String {
    DEFAULT_KEY_STORE.to_string()
}

fn default_timeout_secs() -> u64 {
    120
}

impl KmsLuksConfig {
    pub fn default_path() -> &'static Path {
        Path::new(DEFAULT_CONFIG_PATH)
    }

    /// Read and parse a config file, rejecting it when required fields are unusable.
    pub fn load<P: AsRef<Path>>(path: P) -> KmsLuksResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|err| {
            KmsLuksError::Config(format!(
                "cannot read config file ({}): {err}",
                path.display()
            ))
        })?;
        let mut cfg: Self = serde_json::from_str(&contents).map_err(|err| {
            KmsLuksError::Config(format!(
                "configuration file ({}) could not be parsed: {err}",
                path.display()
            ))
        })?;
        cfg.path = path.to_path_buf();

        let issues = cfg.validate();
        if !issues.is_empty() {
            return Err(KmsLuksError::Config(format!(
                "configuration file ({}) is invalid: {}",
                path.display(),
                issues.join("; ")
            )));
        }

        Ok(cfg)
    }

    /// Return human-readable problems with the loaded values.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.cmk_arn.trim().is_empty() {
            issues.push("CMKARN must be set".to_string());
        } else if let Err(err) = KeyArn::parse(&self.cmk_arn) {
            issues.push(err.to_string());
        }

        let bucket = self.key_archive_bucket.trim();
        if bucket.is_empty() || bucket.starts_with('/') {
            issues.push("KeyArchiveBucket must name an S3 bucket".to_string());
        }

        if self.key_store.trim().is_empty() {
            issues.push("KeyStore must not be empty".to_string());
        }

        if let Some(path) = &self.cryptsetup_path {
            if path.trim().is_empty() {
                issues.push("CryptsetupPath must not be empty when set".to_string());
            }
        }

        if self.timeout_secs == 0 {
            issues.push("TimeoutSecs must be greater than 0".to_string());
        }

        issues
    }

    /// Root of the local key cache.
    pub fn key_store_path(&self) -> PathBuf {
        PathBuf::from(&self.key_store)
    }

    /// Deadline applied to every cryptsetup invocation.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn cryptsetup_binary_path(&self) -> Option<PathBuf> {
        self.cryptsetup_path
            .as_deref()
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .map(PathBuf::from)
    }
}
