//! `KeyArchive` backed by an S3 bucket.

use crate::session::AwsSession;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use awskmsluks_core::error::{KmsLuksError, KmsLuksResult};
use awskmsluks_core::KeyArchive;
use log::debug;

/// Bucket plus optional key prefix, parsed from `bucket[/prefix]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveDestination {
    pub bucket: String,
    pub prefix: Option<String>,
}

impl ArchiveDestination {
    pub fn parse(value: &str) -> KmsLuksResult<Self> {
        let trimmed = value.trim().trim_start_matches("s3://").trim_matches('/');
        let (bucket, prefix) = match trimmed.split_once('/') {
            Some((bucket, prefix)) => (bucket, prefix.trim_matches('/')),
            None => (trimmed, ""),
        };
        if bucket.is_empty() {
            return Err(KmsLuksError::Config(format!(
                "KeyArchiveBucket `{value}` does not name a bucket"
            )));
        }
        Ok(Self {
            bucket: bucket.to_string(),
            prefix: (!prefix.is_empty()).then(|| prefix.to_string()),
        })
    }

    /// Full object key for a record addressed as `{FQDN}/{UUID}.json`.
    pub fn object_key(&self, record_key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{record_key}"),
            None => record_key.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct S3Archive {
    session: AwsSession,
    client: S3Client,
    destination: ArchiveDestination,
}

impl S3Archive {
    /// Archive writing to `destination`.
    ///
    /// `fallback_region` is used when the default AWS chain provides no region.
    pub fn new(
        session: AwsSession,
        destination: ArchiveDestination,
        fallback_region: Option<&str>,
    ) -> Self {
        let mut builder = S3ConfigBuilder::from(session.sdk_config());
        if session.sdk_config().region().is_none() {
            if let Some(region) = fallback_region {
                builder = builder.region(Region::new(region.to_string()));
            }
        }
        let client = S3Client::from_conf(builder.build());
        Self {
            session,
            client,
            destination,
        }
    }

    pub fn destination(&self) -> &ArchiveDestination {
        &self.destination
    }
}

impl KeyArchive for S3Archive {
    type Error = KmsLuksError;

    fn put_object(&self, object_key: &str, body: &[u8]) -> KmsLuksResult<()> {
        let key = self.destination.object_key(object_key);
        debug!("uploading s3://{}/{key}", self.destination.bucket);

        self.session
            .block_on(
                self.client
                    .put_object()
                    .bucket(&self.destination.bucket)
                    .key(&key)
                    .content_type("application/json")
                    .body(ByteStream::from(body.to_vec()))
                    .content_length(body.len() as i64)
                    .send(),
            )
            .map_err(|err| {
                KmsLuksError::Store(format!(
                    "failed to upload s3://{}/{key}: {}",
                    self.destination.bucket,
                    DisplayErrorContext(&err)
                ))
            })?;
        Ok(())
    }

    fn get_object(&self, object_key: &str) -> KmsLuksResult<Vec<u8>> {
        let key = self.destination.object_key(object_key);
        let location = format!("s3://{}/{key}", self.destination.bucket);
        debug!("downloading {location}");

        let response = self
            .session
            .block_on(
                self.client
                    .get_object()
                    .bucket(&self.destination.bucket)
                    .key(&key)
                    .send(),
            )
            .map_err(|err| {
                let message = DisplayErrorContext(&err).to_string();
                if err.into_service_error().is_no_such_key() {
                    KmsLuksError::Store(format!("{location} does not exist"))
                } else {
                    KmsLuksError::Store(format!("failed to download {location}: {message}"))
                }
            })?;

        let bytes = self
            .session
            .block_on(response.body.collect())
            .map_err(|err| KmsLuksError::Store(format!("failed to read {location}: {err}")))?
            .into_bytes();
        Ok(bytes.to_vec())
    }

    fn describe(&self) -> String {
        match &self.destination.prefix {
            Some(prefix) => format!("s3://{}/{prefix}", self.destination.bucket),
            None => format!("s3://{}", self.destination.bucket),
        }
    }
}
