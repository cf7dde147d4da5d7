//! Parsing for KMS key ARNs.
//!
//! The region embedded in the ARN decides which KMS endpoint is called, so the
//! key reference is validated before any remote work happens.

use crate::error::{KmsLuksError, KmsLuksResult};

/// Components of `arn:<partition>:kms:<region>:<account>:<resource>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyArn {
    pub partition: String,
    pub region: String,
    pub account: String,
    pub resource: String,
}

impl KeyArn {
    pub fn parse(value: &str) -> KmsLuksResult<Self> {
        let trimmed = value.trim();
        let invalid = |reason: &str| KmsLuksError::InvalidArn {
            arn: trimmed.to_string(),
            reason: reason.to_string(),
        };

        if trimmed.is_empty() {
            return Err(invalid("value is empty"));
        }

        let parts: Vec<&str> = trimmed.splitn(6, ':').collect();
        if parts.len() != 6 {
            return Err(invalid("expected arn:partition:service:region:account:resource"));
        }
        if parts[0] != "arn" {
            return Err(invalid("must start with `arn:`"));
        }
        if parts[1].is_empty() {
            return Err(invalid("partition segment is empty"));
        }
        if parts[2] != "kms" {
            return Err(invalid("service segment must be `kms`"));
        }
        let region = parts[3];
        if region.is_empty() {
            return Err(invalid("region segment is empty"));
        }
        if !region
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-')
        {
            return Err(invalid("region segment contains invalid characters"));
        }
        let account = parts[4];
        if account.is_empty() || !account.chars().all(|ch| ch.is_ascii_digit()) {
            return Err(invalid("account segment must be numeric"));
        }
        let resource = parts[5];
        let resource_id = resource
            .strip_prefix("key/")
            .or_else(|| resource.strip_prefix("alias/"));
        match resource_id {
            Some(id) if !id.is_empty() => {}
            _ => return Err(invalid("resource must be key/<id> or alias/<name>")),
        }

        Ok(Self {
            partition: parts[1].to_string(),
            region: region.to_string(),
            account: account.to_string(),
            resource: resource.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_arn() {
        let arn = KeyArn::parse("arn:aws:kms:us-east-1:111122223333:key/abcd").unwrap();
        assert_eq!(arn.partition, "aws");
        assert_eq!(arn.region, "us-east-1");
        assert_eq!(arn.account, "111122223333");
        assert_eq!(arn.resource, "key/abcd");
    }

    #[test]
    fn parses_alias_in_other_partition() {
        let arn = KeyArn::parse("arn:aws-us-gov:kms:us-gov-west-1:123456789012:alias/disks").unwrap();
        assert_eq!(arn.region, "us-gov-west-1");
        assert_eq!(arn.resource, "alias/disks");
    }

    #[test]
    fn rejects_malformed_references() {
        for bad in [
            "",
            "abcd",
            "arn:aws:kms:us-east-1:111122223333",
            "arn:aws:s3:us-east-1:111122223333:key/abcd",
            "arn:aws:kms::111122223333:key/abcd",
            "arn:aws:kms:us-east-1:acct:key/abcd",
            "arn:aws:kms:us-east-1:111122223333:key/",
            "arn:aws:kms:us-east-1:111122223333:secret/abcd",
            "urn:aws:kms:us-east-1:111122223333:key/abcd",
        ] {
            match KeyArn::parse(bad) {
                Err(KmsLuksError::InvalidArn { .. }) => {}
                other => panic!("expected InvalidArn for `{bad}`, got {other:?}"),
            }
        }
    }
}
