//! Device lookup through the udev-maintained `/dev/disk/by-uuid` links.

use std::env;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

pub const DEV_BY_UUID: &str = "/dev/disk/by-uuid";

/// Resolve the device whose filesystem/LUKS UUID is `uuid`.
///
/// Link targets are usually relative (`../../sdb1`); they are re-rooted on
/// the link's directory and normalised lexically.
pub fn device_from_uuid(root: &Path, uuid: &str) -> io::Result<PathBuf> {
    if uuid.is_empty() || uuid.contains('/') || uuid == "." || uuid == ".." {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("`{uuid}` is not a usable UUID"),
        ));
    }

    let root = if root.is_absolute() {
        root.to_path_buf()
    } else {
        env::current_dir()?.join(root)
    };

    let link = root.join(uuid);
    let target = fs::read_link(&link).map_err(|err| {
        io::Error::new(
            err.kind(),
            format!("no device with UUID {uuid} under {}: {err}", root.display()),
        )
    })?;

    if target.is_absolute() {
        Ok(normalize(&target))
    } else {
        Ok(normalize(&root.join(target)))
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
