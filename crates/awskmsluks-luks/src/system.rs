//! System-backed `LuksTool` implementation.
//!
//! Wraps the host `cryptsetup` binary and resolves devices through
//! `/dev/disk/by-uuid`.

use crate::by_uuid::{device_from_uuid, DEV_BY_UUID};
use crate::command::CryptsetupCommand;
use awskmsluks_core::error::{KmsLuksError, KmsLuksResult};
use awskmsluks_core::{KmsLuksConfig, LuksTool, Passphrase};
use std::env;
use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CRYPTSETUP_PATHS: &[&str] = &[
    "/usr/sbin/cryptsetup",
    "/usr/bin/cryptsetup",
    "/sbin/cryptsetup",
    "/bin/cryptsetup",
    "/usr/local/sbin/cryptsetup",
];

/// Tool that formats and maps devices via the host `cryptsetup` binary.
#[derive(Debug, Clone)]
pub struct SystemLuksTool {
    /// Resolution failure is kept and reported by the operations that run `cryptsetup`.
    cryptsetup: Result<CryptsetupCommand, String>,
    by_uuid_root: PathBuf,
    require_block_device: bool,
}

impl SystemLuksTool {
    /// Build a tool from configuration, resolving the `cryptsetup` path.
    ///
    /// A missing binary does not fail construction; device resolution still
    /// works and only format/open calls report the error.
    pub fn from_config(config: &KmsLuksConfig) -> Self {
        let timeout = config.command_timeout();
        let cryptsetup = match resolve_cryptsetup_path(config) {
            Ok(binary) => Ok(CryptsetupCommand::new(binary, timeout)),
            Err(KmsLuksError::Config(message)) => Err(message),
            Err(other) => Err(other.to_string()),
        };
        Self {
            cryptsetup,
            by_uuid_root: PathBuf::from(DEV_BY_UUID),
            require_block_device: true,
        }
    }

    pub fn with_binary(binary: PathBuf, timeout: Duration) -> Self {
        Self {
            cryptsetup: Ok(CryptsetupCommand::new(binary, timeout)),
            by_uuid_root: PathBuf::from(DEV_BY_UUID),
            require_block_device: true,
        }
    }

    /// Directory consulted when resolving a UUID to a device.
    pub fn by_uuid_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.by_uuid_root = root.into();
        self
    }

    /// Refuse to format anything that is not a block device (on by default).
    pub fn require_block_device(mut self, required: bool) -> Self {
        self.require_block_device = required;
        self
    }

    pub fn cryptsetup_path(&self) -> Option<&Path> {
        self.cryptsetup.as_ref().ok().map(CryptsetupCommand::binary)
    }

    fn cryptsetup(&self) -> KmsLuksResult<&CryptsetupCommand> {
        self.cryptsetup
            .as_ref()
            .map_err(|message| KmsLuksError::Config(message.clone()))
    }

    fn ensure_block_device(&self, device: &Path) -> KmsLuksResult<()> {
        if !self.require_block_device {
            return Ok(());
        }
        let metadata = fs::metadata(device).map_err(|err| {
            KmsLuksError::Tool(format!("cannot inspect {}: {err}", device.display()))
        })?;
        if metadata.file_type().is_block_device() {
            Ok(())
        } else {
            Err(KmsLuksError::Tool(format!(
                "{} is not a block device",
                device.display()
            )))
        }
    }
}

impl LuksTool for SystemLuksTool {
    type Error = KmsLuksError;

    fn resolve_device(&self, uuid: &str) -> KmsLuksResult<PathBuf> {
        device_from_uuid(&self.by_uuid_root, uuid).map_err(|err| KmsLuksError::Tool(err.to_string()))
    }

    fn format_device(&self, device: &Path, passphrase: &Passphrase) -> KmsLuksResult<()> {
        let cryptsetup = self.cryptsetup()?;
        self.ensure_block_device(device)?;
        cryptsetup.format(device, passphrase.as_bytes())
    }

    fn set_device_uuid(&self, device: &Path, uuid: &str) -> KmsLuksResult<()> {
        self.cryptsetup()?.set_uuid(device, uuid)
    }

    fn open_device(&self, device: &Path, name: &str, passphrase: &Passphrase) -> KmsLuksResult<()> {
        self.cryptsetup()?.open(device, name, passphrase.as_bytes())
    }
}

fn resolve_cryptsetup_path(config: &KmsLuksConfig) -> KmsLuksResult<PathBuf> {
    if let Some(candidate) = config.cryptsetup_binary_path() {
        if !candidate.exists() {
            return Err(KmsLuksError::Config(format!(
                "cryptsetup binary not found at {}",
                candidate.display()
            )));
        }
        return Ok(candidate);
    }

    for candidate in DEFAULT_CRYPTSETUP_PATHS {
        let p = Path::new(candidate);
        if p.exists() {
            return Ok(p.to_path_buf());
        }
    }

    find_in_path("cryptsetup").ok_or_else(|| {
        KmsLuksError::Config(format!(
            "unable to locate cryptsetup binary; tried {:?} and PATH",
            DEFAULT_CRYPTSETUP_PATHS
        ))
    })
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths).find_map(|dir| {
        let candidate = dir.join(binary);
        if candidate.exists() {
            Some(candidate)
        } else {
            None
        }
    })
}
