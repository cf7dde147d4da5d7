//! Durable homes for key records: the remote archive and the local cache.
//!
//! Both stores use the same addressing, `{FQDN}/{UUID}.json`. Writes go to the
//! archive first and the local cache second; there is no rollback between
//! them, so a local failure after an archive success is reported with the
//! object key that `restore` can pull back down.

use crate::error::{KmsLuksError, KmsLuksResult};
use crate::key::KeyRecord;
use log::{debug, info};
use std::error::Error;
use std::fs::{self, DirBuilder, ReadDir};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const RECORD_EXTENSION: &str = "json";

/// Remote object store receiving a copy of every key record.
pub trait KeyArchive {
    type Error: Error + Send + Sync + 'static;

    /// Upload `body` under `object_key`, replacing any existing object.
    fn put_object(&self, object_key: &str, body: &[u8]) -> Result<(), Self::Error>;

    /// Download the object stored under `object_key`.
    fn get_object(&self, object_key: &str) -> Result<Vec<u8>, Self::Error>;

    /// Human-readable destination for log lines (e.g. `s3://bucket/prefix`).
    fn describe(&self) -> String;
}

/// Local filesystem cache rooted at `KeyStore`.
#[derive(Debug, Clone)]
pub struct KeyCache {
    root: PathBuf,
}

impl KeyCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn host_dir(&self, fqdn: &str) -> PathBuf {
        self.root.join(fqdn)
    }

    /// `{root}/{fqdn}/{uuid}.json`
    pub fn record_path(&self, fqdn: &str, uuid: &str) -> PathBuf {
        self.host_dir(fqdn)
            .join(format!("{uuid}.{RECORD_EXTENSION}"))
    }

    /// Write the redacted record atomically with owner-only permissions.
    pub fn store(&self, record: &KeyRecord) -> KmsLuksResult<PathBuf> {
        let dir = self.host_dir(record.fqdn());
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&dir)
            .map_err(|err| {
                KmsLuksError::Store(format!(
                    "could not create local key store directory {}: {err}",
                    dir.display()
                ))
            })?;

        let payload = record.to_redacted_json()?;
        let dest = self.record_path(record.fqdn(), record.uuid());
        write_private_file(&dir, &dest, &payload).map_err(|err| {
            KmsLuksError::Store(format!(
                "could not write to local key store ({}): {err}",
                dest.display()
            ))
        })?;
        debug!("stored key {} at {}", record.uuid(), dest.display());
        Ok(dest)
    }

    /// Load one record by identity.
    pub fn load(&self, fqdn: &str, uuid: &str) -> KmsLuksResult<KeyRecord> {
        ensure_identifier("host name", fqdn)?;
        ensure_identifier("key UUID", uuid)?;
        let path = self.record_path(fqdn, uuid);
        let record = read_record(&path)?;
        if record.uuid() != uuid || record.fqdn() != fqdn {
            return Err(KmsLuksError::KeyParse {
                path,
                reason: format!(
                    "record is bound to {}/{} instead of {fqdn}/{uuid}",
                    record.fqdn(),
                    record.uuid()
                ),
            });
        }
        Ok(record)
    }

    /// Lazily walk every cached record for `fqdn`.
    ///
    /// Entries that fail to read or parse are yielded as errors; the walk
    /// continues past them. A missing host directory yields nothing.
    pub fn entries(&self, fqdn: &str) -> KmsLuksResult<CacheEntries> {
        let dir = self.host_dir(fqdn);
        let inner = match fs::read_dir(&dir) {
            Ok(inner) => Some(inner),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => {
                return Err(KmsLuksError::Store(format!(
                    "could not list local key store {}: {err}",
                    dir.display()
                )))
            }
        };
        Ok(CacheEntries { dir, inner })
    }
}

/// One enumerated cache entry: the identity derived from the file name plus the parse outcome.
#[derive(Debug)]
pub struct CacheEntry {
    pub uuid: String,
    pub path: PathBuf,
    pub record: KmsLuksResult<KeyRecord>,
}

/// Iterator returned by [`KeyCache::entries`].
#[derive(Debug)]
pub struct CacheEntries {
    dir: PathBuf,
    inner: Option<ReadDir>,
}

impl Iterator for CacheEntries {
    type Item = CacheEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let inner = self.inner.as_mut()?;
        loop {
            let entry = match inner.next()? {
                Ok(entry) => entry,
                Err(err) => {
                    return Some(CacheEntry {
                        uuid: String::new(),
                        path: self.dir.clone(),
                        record: Err(KmsLuksError::Store(format!(
                            "could not read entry in {}: {err}",
                            self.dir.display()
                        ))),
                    })
                }
            };

            let path = entry.path();
            let is_record = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.eq_ignore_ascii_case(RECORD_EXTENSION))
                .unwrap_or(false);
            if !is_record || path.is_dir() {
                continue;
            }

            let uuid = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            let record = read_record(&path).and_then(|record| {
                if record.uuid() == uuid {
                    Ok(record)
                } else {
                    Err(KmsLuksError::KeyParse {
                        path: path.clone(),
                        reason: format!("file name does not match record UUID {}", record.uuid()),
                    })
                }
            });
            return Some(CacheEntry { uuid, path, record });
        }
    }
}

/// Persist a redacted record to the archive, then to the local cache.
///
/// Returns the local path on success.
pub fn persist<R>(record: &KeyRecord, archive: &R, cache: &KeyCache) -> KmsLuksResult<PathBuf>
where
    R: KeyArchive<Error = KmsLuksError>,
{
    let object_key = record.object_key();
    let payload = record.to_redacted_json()?;

    archive.put_object(&object_key, &payload).map_err(|err| {
        KmsLuksError::Store(format!(
            "could not archive the data key to {}: {}",
            archive.describe(),
            store_reason(err)
        ))
    })?;
    info!("archived key {} to {}", record.uuid(), archive.describe());

    cache.store(record).map_err(|err| {
        KmsLuksError::Store(format!(
            "{}; the key is archived at {} under `{object_key}`, recover it with --restore {}",
            store_reason(err),
            archive.describe(),
            record.uuid()
        ))
    })
}

/// Pull an archived record for `fqdn`/`uuid` back into the local cache.
pub fn restore<R>(archive: &R, cache: &KeyCache, fqdn: &str, uuid: &str) -> KmsLuksResult<PathBuf>
where
    R: KeyArchive<Error = KmsLuksError>,
{
    ensure_identifier("host name", fqdn)?;
    ensure_identifier("key UUID", uuid)?;
    let object_key = format!("{fqdn}/{uuid}.{RECORD_EXTENSION}");
    let bytes = archive.get_object(&object_key).map_err(|err| {
        KmsLuksError::Store(format!(
            "could not fetch `{object_key}` from {}: {}",
            archive.describe(),
            store_reason(err)
        ))
    })?;

    let origin = PathBuf::from(format!("{}/{object_key}", archive.describe()));
    let record = KeyRecord::from_json(&origin, &bytes)?;
    if record.fqdn() != fqdn || record.uuid() != uuid {
        return Err(KmsLuksError::KeyParse {
            path: origin,
            reason: format!(
                "archived record is bound to {}/{}",
                record.fqdn(),
                record.uuid()
            ),
        });
    }

    let path = cache.store(&record)?;
    info!("restored key {uuid} from {} to {}", archive.describe(), path.display());
    Ok(path)
}

/// Identities become path components; reject anything that would escape the cache.
fn ensure_identifier(kind: &str, value: &str) -> KmsLuksResult<()> {
    if value.is_empty() || value == "." || value == ".." || value.contains('/') {
        return Err(KmsLuksError::Config(format!(
            "{kind} `{value}` is not a valid identifier"
        )));
    }
    Ok(())
}

fn store_reason(err: KmsLuksError) -> String {
    match err {
        KmsLuksError::Store(message) => message,
        other => other.to_string(),
    }
}

fn read_record(path: &Path) -> KmsLuksResult<KeyRecord> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(KmsLuksError::KeyNotFound {
                path: path.to_path_buf(),
            })
        }
        Err(err) => {
            return Err(KmsLuksError::KeyParse {
                path: path.to_path_buf(),
                reason: format!("read failed: {err}"),
            })
        }
    };
    KeyRecord::from_json(path, &bytes)
}

fn write_private_file(dir: &Path, dest: &Path, payload: &[u8]) -> std::io::Result<()> {
    let mut temp = NamedTempFile::new_in(dir)?;
    fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o600))?;
    temp.as_file_mut().write_all(payload)?;
    temp.as_file_mut().flush()?;
    let _ = temp.as_file().sync_all();
    temp.persist(dest).map_err(|err| err.error)?;
    let _ = fs::File::open(dir).and_then(|file| file.sync_all());
    Ok(())
}
