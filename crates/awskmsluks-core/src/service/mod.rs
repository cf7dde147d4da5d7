//! Key lifecycle and device orchestration.
//!
//! `KmsLuksService` ties together the key authority, the archive, the local
//! cache, and the LUKS tool. Single-target actions surface the first error;
//! `unlock_all` reports one outcome per cached record and keeps going.

use crate::authority::KeyAuthority;
use crate::config::KmsLuksConfig;
use crate::device::{mapping_name, LuksTool};
use crate::error::{KmsLuksError, KmsLuksResult};
use crate::key::{KeyRecord, Passphrase};
use crate::store::{self, KeyArchive, KeyCache};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[cfg(test)]
mod tests;

/// Result of a successful `encrypt` run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatReport {
    pub device: PathBuf,
    pub uuid: String,
    pub key_path: PathBuf,
}

/// Per-record result of a bulk unlock.
#[derive(Debug)]
pub struct UnlockOutcome {
    /// Empty when the cache entry itself could not be read.
    pub uuid: String,
    pub path: PathBuf,
    /// Mapping name on success.
    pub result: KmsLuksResult<String>,
}

impl UnlockOutcome {
    /// Identity to show an operator: the UUID, or the cache path when there is none.
    pub fn label(&self) -> String {
        if self.uuid.is_empty() {
            self.path.display().to_string()
        } else {
            self.uuid.clone()
        }
    }
}

pub struct KmsLuksService<A, R, T> {
    config: Arc<KmsLuksConfig>,
    fqdn: String,
    cache: KeyCache,
    authority: A,
    archive: R,
    tool: T,
}

impl<A, R, T> KmsLuksService<A, R, T>
where
    A: KeyAuthority<Error = KmsLuksError>,
    R: KeyArchive<Error = KmsLuksError>,
    T: LuksTool<Error = KmsLuksError>,
{
    pub fn new(
        config: Arc<KmsLuksConfig>,
        fqdn: impl Into<String>,
        authority: A,
        archive: R,
        tool: T,
    ) -> Self {
        let cache = KeyCache::new(config.key_store_path());
        Self {
            config,
            fqdn: fqdn.into(),
            cache,
            authority,
            archive,
            tool,
        }
    }

    pub fn fqdn(&self) -> &str {
        &self.fqdn
    }

    pub fn cache(&self) -> &KeyCache {
        &self.cache
    }

    /// Generate a data key for this host and persist it (archive, then cache).
    ///
    /// The returned record still holds the plaintext passphrase.
    pub fn create_key(&self) -> KmsLuksResult<(KeyRecord, PathBuf)> {
        let record = KeyRecord::generate(
            &self.authority,
            &self.config.cmk_arn,
            &self.fqdn,
            self.config.production,
        )?;
        info!(
            "generated data key {} under {}",
            record.uuid(),
            record.cmk_arn
        );
        let key_path = store::persist(&record, &self.archive, &self.cache)?;
        Ok((record, key_path))
    }

    /// Create, persist, and apply a new key to `device`.
    ///
    /// The key is recorded before the device is touched so a formatted device
    /// never exists without a recoverable key.
    pub fn encrypt(&self, device: &Path) -> KmsLuksResult<FormatReport> {
        let (mut record, key_path) = self.create_key()?;
        self.format(device, &mut record)?;
        Ok(FormatReport {
            device: device.to_path_buf(),
            uuid: record.uuid().to_string(),
            key_path,
        })
    }

    /// Format `device` with the key's passphrase, then bind its UUID to the key.
    ///
    /// The passphrase is consumed. The UUID step only runs after the format
    /// step succeeded.
    pub fn format(&self, device: &Path, key: &mut KeyRecord) -> KmsLuksResult<()> {
        let passphrase = key.take_passphrase().ok_or_else(|| KmsLuksError::Format {
            device: device.to_path_buf(),
            reason: format!("key {} has not been unwrapped", key.uuid()),
        })?;

        info!("formatting {} for key {}", device.display(), key.uuid());
        self.tool
            .format_device(device, &passphrase)
            .map_err(|err| KmsLuksError::Format {
                device: device.to_path_buf(),
                reason: tool_reason(err),
            })?;
        drop(passphrase);

        self.tool
            .set_device_uuid(device, key.uuid())
            .map_err(|err| KmsLuksError::UuidBinding {
                device: device.to_path_buf(),
                uuid: key.uuid().to_string(),
                reason: tool_reason(err),
            })?;
        info!("{} formatted with UUID {}", device.display(), key.uuid());
        Ok(())
    }

    /// Load the cached record for `uuid` and unwrap it.
    pub fn unwrap_key(&self, uuid: &str) -> KmsLuksResult<KeyRecord> {
        let mut record = self.cache.load(&self.fqdn, uuid)?;
        record
            .decrypt(&self.authority)
            .map_err(|err| match err {
                KmsLuksError::Authority(reason) => {
                    KmsLuksError::Authority(format!("could not decrypt key {uuid}: {reason}"))
                }
                other => other,
            })?;
        Ok(record)
    }

    /// Plaintext passphrase for `uuid`, as printed by `--uuid`.
    pub fn passphrase(&self, uuid: &str) -> KmsLuksResult<Passphrase> {
        let mut record = self.unwrap_key(uuid)?;
        record.take_passphrase().ok_or_else(|| {
            KmsLuksError::Authority(format!("authority returned an empty passphrase for {uuid}"))
        })
    }

    /// Map the device bound to `key`, unwrapping the key first when needed.
    ///
    /// Returns the mapping name.
    pub fn unlock(&self, mut key: KeyRecord) -> KmsLuksResult<String> {
        let uuid = key.uuid().to_string();
        let device = self
            .tool
            .resolve_device(&uuid)
            .map_err(|err| KmsLuksError::unlock(&uuid, tool_reason(err)))?;

        if !key.is_unwrapped() {
            key.decrypt(&self.authority)
                .map_err(|err| KmsLuksError::unlock(&uuid, err))?;
        }

        let name = mapping_name(&device).ok_or_else(|| {
            KmsLuksError::unlock(
                &uuid,
                format!("cannot derive a mapping name from {}", device.display()),
            )
        })?;
        let passphrase = key
            .take_passphrase()
            .ok_or_else(|| KmsLuksError::unlock(&uuid, "authority returned an empty passphrase"))?;

        info!("opening {} as {name}", device.display());
        self.tool
            .open_device(&device, &name, &passphrase)
            .map_err(|err| KmsLuksError::unlock(&uuid, tool_reason(err)))?;
        Ok(name)
    }

    /// Unlock the single device bound to `uuid`.
    pub fn unlock_uuid(&self, uuid: &str) -> KmsLuksResult<String> {
        let record = self.cache.load(&self.fqdn, uuid)?;
        self.unlock(record)
    }

    /// Attempt every cached record for this host, one at a time.
    ///
    /// Only a failure to list the cache itself is returned as `Err`.
    pub fn unlock_all(&self) -> KmsLuksResult<Vec<UnlockOutcome>> {
        let mut outcomes = Vec::new();
        for entry in self.cache.entries(&self.fqdn)? {
            let result = entry.record.and_then(|record| self.unlock(record));
            match &result {
                Ok(name) => info!("unlocked {} as {name}", entry.uuid),
                Err(err) => warn!("skipping {}: {err}", entry.path.display()),
            }
            outcomes.push(UnlockOutcome {
                uuid: entry.uuid,
                path: entry.path,
                result,
            });
        }
        Ok(outcomes)
    }

    /// Copy the archived record for `uuid` back into the local cache.
    pub fn restore(&self, uuid: &str) -> KmsLuksResult<PathBuf> {
        store::restore(&self.archive, &self.cache, &self.fqdn, uuid)
    }
}

fn tool_reason(err: KmsLuksError) -> String {
    match err {
        KmsLuksError::Tool(message) => message,
        other => other.to_string(),
    }
}
