//! Contract for the disk-encryption tool driven by the service.
//!
//! A device moves `Unformatted -> Formatted (UUID bound) -> Mapped`. Only
//! those two transitions are driven here; closing a mapping is left to the
//! operator.

use crate::key::Passphrase;
use std::error::Error;
use std::path::{Path, PathBuf};

/// Suffix appended to a device's base name to form its mapping name.
pub const MAPPING_SUFFIX: &str = "_crypt";

/// Abstraction over the LUKS commands the service needs.
///
/// Implementations must deliver passphrases over a private channel (stdin),
/// never via process arguments or the environment.
pub trait LuksTool {
    type Error: Error + Send + Sync + 'static;

    /// Resolve the block device whose LUKS header carries `uuid`.
    fn resolve_device(&self, uuid: &str) -> Result<PathBuf, Self::Error>;

    /// Write a fresh LUKS header to `device` keyed by `passphrase`.
    fn format_device(&self, device: &Path, passphrase: &Passphrase) -> Result<(), Self::Error>;

    /// Replace the LUKS header UUID of `device` with `uuid`.
    fn set_device_uuid(&self, device: &Path, uuid: &str) -> Result<(), Self::Error>;

    /// Map `device` as `/dev/mapper/<name>` using `passphrase`.
    fn open_device(
        &self,
        device: &Path,
        name: &str,
        passphrase: &Passphrase,
    ) -> Result<(), Self::Error>;
}

/// Mapping name for `device`, derived from its base name (`/dev/sdb1` -> `sdb1_crypt`).
pub fn mapping_name(device: &Path) -> Option<String> {
    let base = device.file_name()?.to_str()?;
    if base.is_empty() || base == "." || base == ".." {
        return None;
    }
    Some(format!("{base}{MAPPING_SUFFIX}"))
}
