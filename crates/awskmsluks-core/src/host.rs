//! Host identity used to namespace key records.

use crate::error::{KmsLuksError, KmsLuksResult};
use std::ffi::CStr;

/// Return the kernel hostname, which keys both the local cache and the archive.
pub fn host_identity() -> KmsLuksResult<String> {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return Err(KmsLuksError::Io(std::io::Error::last_os_error()));
    }
    // gethostname may omit the terminator on truncation.
    buf[buf.len() - 1] = 0;

    let name = CStr::from_bytes_until_nul(&buf)
        .map_err(|err| KmsLuksError::Config(format!("could not get host's FQDN: {err}")))?
        .to_str()
        .map_err(|err| KmsLuksError::Config(format!("could not get host's FQDN: {err}")))?
        .trim()
        .to_string();

    if name.is_empty() || name.contains('/') {
        return Err(KmsLuksError::Config(format!(
            "could not get host's FQDN: unusable hostname `{name}`"
        )));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_identity_is_a_single_path_segment() {
        let name = host_identity().unwrap();
        assert!(!name.is_empty());
        assert!(!name.contains('/'));
    }
}
