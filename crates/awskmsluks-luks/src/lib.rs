#![forbid(unsafe_code)]

//! cryptsetup integration for awskmsluks.
//!
//! Integrates with the host via:
//! - `cryptsetup` (luksFormat/luksUUID/open), secrets on stdin only
//! - `/dev/disk/by-uuid` for device resolution

pub mod by_uuid;
mod command;
mod system;

pub use system::SystemLuksTool;
