//! AWS integrations for awskmsluks: KMS as the key authority, S3 as the
//! key archive.

mod kms;
mod s3;
mod session;

pub use kms::KmsAuthority;
pub use s3::{ArchiveDestination, S3Archive};
pub use session::AwsSession;
