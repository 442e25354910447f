//! Configuration for the storage backends.
//!
//! Everything a backend needs to reach its service lives in [`StorageConfig`],
//! built via [`StorageConfigBuilder`]. The config is handed to a
//! [`crate::storage::Registry`] once and shared by every location resolved
//! through it; nothing reads the environment behind the caller's back.
//!
//! # Environment lookup
//! [`StorageConfig::from_env`] resolves each AWS setting through four tiers,
//! highest first:
//!
//! | Tier | Variable |
//! |------|----------|
//! | service specific | `AWS_S3_REGION`, `AWS_SQS_QUEUE`, … |
//! | generic | `AWS_REGION`, `AWS_ACCESS_KEY_ID`, … |
//! | default | `AWS_DEFAULT_REGION`, … |
//! | built-in | `us-east-1` for the region, 10 for batch sizes |
//!
//! Values set explicitly on a builder returned by
//! [`StorageConfig::builder_from_env`] override all of the above.

use crate::error::DerivationError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Region used when no tier supplies one.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Largest batch the queue service accepts in a single send.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 10;

/// Object storage settings.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Settings {
    /// Region used for the client and for URIs created by the backend.
    pub region: String,

    /// Bucket used when a backend creates a URI from a bare path.
    pub bucket: Option<String>,

    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,

    /// Custom endpoint (MinIO, localstack). Enables path-style addressing.
    pub endpoint_url: Option<String>,
}

impl Default for S3Settings {
    fn default() -> Self {
        Self {
            region: DEFAULT_REGION.to_string(),
            bucket: None,
            access_key_id: None,
            secret_access_key: None,
            endpoint_url: None,
        }
    }
}

impl fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Settings")
            .field("region", &self.region)
            .field("bucket", &self.bucket)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &redacted(&self.secret_access_key))
            .field("endpoint_url", &self.endpoint_url)
            .finish()
    }
}

/// Message queue settings.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqsSettings {
    pub region: String,

    /// Account id used when a backend creates a URI from a bare path.
    pub account_id: Option<String>,

    /// Queue name used when a backend creates a URI from a bare path.
    pub queue: Option<String>,

    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,

    /// Messages per send. Default: 10.
    pub batch_size: usize,

    /// Upper bound enforced on `batch_size` at send time. Default: 10.
    pub max_batch_size: usize,

    pub endpoint_url: Option<String>,
}

impl Default for SqsSettings {
    fn default() -> Self {
        Self {
            region: DEFAULT_REGION.to_string(),
            account_id: None,
            queue: None,
            access_key_id: None,
            secret_access_key: None,
            batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            endpoint_url: None,
        }
    }
}

impl fmt::Debug for SqsSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqsSettings")
            .field("region", &self.region)
            .field("account_id", &self.account_id)
            .field("queue", &self.queue)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &redacted(&self.secret_access_key))
            .field("batch_size", &self.batch_size)
            .field("max_batch_size", &self.max_batch_size)
            .field("endpoint_url", &self.endpoint_url)
            .finish()
    }
}

fn redacted(secret: &Option<String>) -> Option<&'static str> {
    secret.as_ref().map(|_| "<redacted>")
}

/// Configuration shared by every backend in a registry.
///
/// # Example
/// ```rust
/// use edgequake_derivatives::StorageConfig;
///
/// let config = StorageConfig::builder()
///     .s3_region("eu-west-1")
///     .s3_bucket("scans")
///     .sqs_batch_size(5)
///     .build()
///     .unwrap();
/// assert_eq!(config.s3.region, "eu-west-1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub s3: S3Settings,
    pub sqs: SqsSettings,

    /// Timeout applied to every HTTP request in seconds. Default: 120.
    pub http_timeout_secs: u64,

    /// Separator used to split paths into directory parts. Default: `/`.
    pub separator: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            s3: S3Settings::default(),
            sqs: SqsSettings::default(),
            http_timeout_secs: 120,
            separator: "/".to_string(),
        }
    }
}

impl StorageConfig {
    /// Create a new builder starting from the built-in defaults.
    pub fn builder() -> StorageConfigBuilder {
        StorageConfigBuilder {
            config: Self::default(),
        }
    }

    /// Resolve a config from the process environment.
    pub fn from_env() -> Result<Self, DerivationError> {
        Self::builder_from_env()?.build()
    }

    /// A builder pre-populated from the process environment.
    pub fn builder_from_env() -> Result<StorageConfigBuilder, DerivationError> {
        Self::builder_from_lookup(|name| std::env::var(name).ok())
    }

    /// Resolve a config from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, DerivationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::builder_from_lookup(lookup)?.build()
    }

    /// A builder pre-populated from an arbitrary variable lookup.
    pub fn builder_from_lookup<F>(lookup: F) -> Result<StorageConfigBuilder, DerivationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = AwsEnv { lookup: &lookup };
        let defaults = Self::default();

        let s3 = S3Settings {
            region: env
                .get("S3", "REGION")
                .unwrap_or_else(|| DEFAULT_REGION.to_string()),
            bucket: env.get("S3", "BUCKET"),
            access_key_id: env.get("S3", "ACCESS_KEY_ID"),
            secret_access_key: env.get("S3", "SECRET_ACCESS_KEY"),
            endpoint_url: env.get("S3", "ENDPOINT_URL"),
        };

        let sqs = SqsSettings {
            region: env
                .get("SQS", "REGION")
                .unwrap_or_else(|| DEFAULT_REGION.to_string()),
            account_id: env.get("SQS", "ACCOUNT_ID"),
            queue: env.get("SQS", "QUEUE"),
            access_key_id: env.get("SQS", "ACCESS_KEY_ID"),
            secret_access_key: env.get("SQS", "SECRET_ACCESS_KEY"),
            batch_size: env
                .parse("SQS", "BATCH_SIZE")?
                .unwrap_or(DEFAULT_MAX_BATCH_SIZE),
            max_batch_size: env
                .parse("SQS", "MAX_BATCH_SIZE")?
                .unwrap_or(DEFAULT_MAX_BATCH_SIZE),
            endpoint_url: env.get("SQS", "ENDPOINT_URL"),
        };

        Ok(StorageConfigBuilder {
            config: StorageConfig {
                s3,
                sqs,
                ..defaults
            },
        })
    }
}

/// Tiered `AWS_*` lookup.
struct AwsEnv<'a, F> {
    lookup: &'a F,
}

impl<F> AwsEnv<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, service: &str, name: &str) -> Option<String> {
        [
            format!("AWS_{service}_{name}"),
            format!("AWS_{name}"),
            format!("AWS_DEFAULT_{name}"),
        ]
        .iter()
        .find_map(|var| (self.lookup)(var).filter(|v| !v.trim().is_empty()))
    }

    fn parse(&self, service: &str, name: &str) -> Result<Option<usize>, DerivationError> {
        self.get(service, name)
            .map(|raw| {
                raw.trim().parse::<usize>().map_err(|_| {
                    DerivationError::InvalidConfig(format!(
                        "{service} {name} must be a positive integer, got '{raw}'"
                    ))
                })
            })
            .transpose()
    }
}

/// Builder for [`StorageConfig`].
#[derive(Debug)]
pub struct StorageConfigBuilder {
    config: StorageConfig,
}

impl StorageConfigBuilder {
    pub fn s3_region(mut self, region: impl Into<String>) -> Self {
        self.config.s3.region = region.into();
        self
    }

    pub fn s3_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.config.s3.bucket = Some(bucket.into());
        self
    }

    pub fn s3_credentials(mut self, key_id: impl Into<String>, secret: impl Into<String>) -> Self {
        self.config.s3.access_key_id = Some(key_id.into());
        self.config.s3.secret_access_key = Some(secret.into());
        self
    }

    pub fn s3_endpoint_url(mut self, url: impl Into<String>) -> Self {
        self.config.s3.endpoint_url = Some(url.into());
        self
    }

    pub fn sqs_region(mut self, region: impl Into<String>) -> Self {
        self.config.sqs.region = region.into();
        self
    }

    pub fn sqs_account_id(mut self, account: impl Into<String>) -> Self {
        self.config.sqs.account_id = Some(account.into());
        self
    }

    pub fn sqs_queue(mut self, queue: impl Into<String>) -> Self {
        self.config.sqs.queue = Some(queue.into());
        self
    }

    pub fn sqs_credentials(mut self, key_id: impl Into<String>, secret: impl Into<String>) -> Self {
        self.config.sqs.access_key_id = Some(key_id.into());
        self.config.sqs.secret_access_key = Some(secret.into());
        self
    }

    pub fn sqs_batch_size(mut self, n: usize) -> Self {
        self.config.sqs.batch_size = n;
        self
    }

    pub fn sqs_max_batch_size(mut self, n: usize) -> Self {
        self.config.sqs.max_batch_size = n;
        self
    }

    pub fn sqs_endpoint_url(mut self, url: impl Into<String>) -> Self {
        self.config.sqs.endpoint_url = Some(url.into());
        self
    }

    pub fn http_timeout_secs(mut self, secs: u64) -> Self {
        self.config.http_timeout_secs = secs;
        self
    }

    pub fn separator(mut self, sep: impl Into<String>) -> Self {
        self.config.separator = sep.into();
        self
    }

    /// Build the configuration, validating constraints.
    ///
    /// A batch size above the queue maximum is accepted here and rejected
    /// when a batch is actually sent.
    pub fn build(self) -> Result<StorageConfig, DerivationError> {
        let c = &self.config;
        if c.sqs.batch_size == 0 {
            return Err(DerivationError::InvalidConfig(
                "SQS batch size must be ≥ 1".into(),
            ));
        }
        if c.separator.is_empty() {
            return Err(DerivationError::InvalidConfig(
                "Path separator must not be empty".into(),
            ));
        }
        if c.http_timeout_secs == 0 {
            return Err(DerivationError::InvalidConfig(
                "HTTP timeout must be ≥ 1 second".into(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = StorageConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.s3.region, "us-east-1");
        assert_eq!(config.sqs.region, "us-east-1");
        assert_eq!(config.sqs.max_batch_size, 10);
        assert_eq!(config.sqs.batch_size, 10);
        assert_eq!(config.separator, "/");
    }

    #[test]
    fn service_specific_beats_generic_beats_default() {
        let lookup = lookup_from(&[
            ("AWS_S3_REGION", "eu-west-1"),
            ("AWS_REGION", "us-west-2"),
            ("AWS_DEFAULT_REGION", "ap-south-1"),
        ]);
        let config = StorageConfig::from_lookup(lookup).unwrap();
        assert_eq!(config.s3.region, "eu-west-1");
        // No AWS_SQS_REGION: falls through to the generic tier.
        assert_eq!(config.sqs.region, "us-west-2");
    }

    #[test]
    fn default_tier_used_last() {
        let lookup = lookup_from(&[("AWS_DEFAULT_REGION", "ap-south-1")]);
        let config = StorageConfig::from_lookup(lookup).unwrap();
        assert_eq!(config.s3.region, "ap-south-1");
    }

    #[test]
    fn empty_values_are_skipped() {
        let lookup = lookup_from(&[("AWS_S3_BUCKET", " "), ("AWS_BUCKET", "scans")]);
        let config = StorageConfig::from_lookup(lookup).unwrap();
        assert_eq!(config.s3.bucket.as_deref(), Some("scans"));
    }

    #[test]
    fn explicit_setter_beats_environment() {
        let lookup = lookup_from(&[("AWS_SQS_QUEUE", "from-env")]);
        let config = StorageConfig::builder_from_lookup(lookup)
            .unwrap()
            .sqs_queue("explicit")
            .build()
            .unwrap();
        assert_eq!(config.sqs.queue.as_deref(), Some("explicit"));
    }

    #[test]
    fn bad_batch_size_rejected() {
        let lookup = lookup_from(&[("AWS_SQS_BATCH_SIZE", "lots")]);
        let err = StorageConfig::from_lookup(lookup).unwrap_err();
        assert!(matches!(err, DerivationError::InvalidConfig(_)));

        let err = StorageConfig::builder().sqs_batch_size(0).build().unwrap_err();
        assert!(err.to_string().contains("batch size"));
    }

    #[test]
    fn debug_redacts_secrets() {
        let config = StorageConfig::builder()
            .s3_credentials("AKIA123", "very-secret")
            .build()
            .unwrap();
        let dbg = format!("{config:?}");
        assert!(dbg.contains("AKIA123"));
        assert!(!dbg.contains("very-secret"));
    }
}
