//! Object storage: `s3://<bucket>.s3.<region>.amazonaws.com/<key>`.
//!
//! The bucket and region live in the host, the key is everything after it.
//! Requests go through the [`ObjectStore`] trait so the backend can run
//! against the AWS SDK or against [`super::MemoryObjectStore`]. Each region
//! named by a host gets its own store; hosts without one use the configured
//! region.

use super::{glob, PathParts, StorageBackend};
use crate::config::S3Settings;
use crate::error::DerivationError;
use crate::uri::LocationUri;
use async_trait::async_trait;
use aws_sdk_s3::config::{Credentials, Region};
use futures::future::{BoxFuture, FutureExt};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

static BUCKET: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([^/]+?)\.s3(?:[.-]|$|/)").unwrap());
static REGION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^/]+?\.s3[.-]([a-z0-9-]+)\.amazonaws\.com").unwrap());

/// The requests the S3 backend needs from an object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Keys in `bucket` starting with `prefix`, in listing order.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, DerivationError>;

    async fn get(&self, bucket: &str, key: &str, dest: &Path) -> Result<(), DerivationError>;

    async fn put(&self, bucket: &str, key: &str, src: &Path) -> Result<(), DerivationError>;
}

/// Bucket, region and key of an S3 URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectAddress {
    pub bucket: String,
    pub region: Option<String>,
    pub key: String,
}

impl ObjectAddress {
    pub fn parse(uri: &LocationUri) -> Result<Self, DerivationError> {
        let path = uri.path();
        let (host, key) = path.split_once('/').unwrap_or((path, ""));
        let bucket = BUCKET
            .captures(host)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .filter(|b| !b.is_empty())
            .ok_or_else(|| DerivationError::BucketUnresolvable {
                uri: uri.to_string(),
            })?;
        let region = REGION
            .captures(host)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string());
        Ok(Self {
            bucket,
            region,
            key: key.to_string(),
        })
    }
}

/// Builds the store for one region.
type Connector = Arc<dyn Fn(S3Settings) -> BoxFuture<'static, Arc<dyn ObjectStore>> + Send + Sync>;

pub struct S3Backend {
    settings: S3Settings,
    connect: Connector,
    /// Stores by region, built on first use.
    clients: Mutex<HashMap<String, Arc<dyn ObjectStore>>>,
}

impl S3Backend {
    /// A backend that connects to AWS on first use of each region.
    pub fn new(settings: S3Settings) -> Self {
        Self::with_connector(settings, |settings| async move {
            Arc::new(AwsObjectStore::connect(&settings).await) as Arc<dyn ObjectStore>
        })
    }

    /// A backend over an existing store, shared by every region.
    pub fn with_store(settings: S3Settings, store: Arc<dyn ObjectStore>) -> Self {
        Self::with_connector(settings, move |_| {
            let store = Arc::clone(&store);
            async move { store }
        })
    }

    /// A backend that calls `connect` once per region, with the settings'
    /// region replaced by the one requested.
    pub fn with_connector<F, Fut>(settings: S3Settings, connect: F) -> Self
    where
        F: Fn(S3Settings) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Arc<dyn ObjectStore>> + Send + 'static,
    {
        let connect: Connector = Arc::new(move |settings: S3Settings| connect(settings).boxed());
        Self {
            settings,
            connect,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Region to talk to for `addr`: the host's, else the configured one.
    fn region_for<'a>(&'a self, addr: &'a ObjectAddress) -> &'a str {
        addr.region.as_deref().unwrap_or(&self.settings.region)
    }

    async fn client(&self, addr: &ObjectAddress) -> Arc<dyn ObjectStore> {
        let region = self.region_for(addr);
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(region) {
            return Arc::clone(client);
        }
        let settings = S3Settings {
            region: region.to_string(),
            ..self.settings.clone()
        };
        let client = (self.connect)(settings).await;
        clients.insert(region.to_string(), Arc::clone(&client));
        client
    }

    fn host_for(&self, bucket: &str) -> String {
        format!("{bucket}.s3.{}.amazonaws.com", self.settings.region)
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn schemes(&self) -> &'static [&'static str] {
        &["s3"]
    }

    fn key(&self, uri: &LocationUri) -> Result<String, DerivationError> {
        Ok(ObjectAddress::parse(uri)?.key)
    }

    fn create_uri(&self, path: &str, parts: PathParts) -> Result<String, DerivationError> {
        let bucket = self.settings.bucket.as_deref().ok_or_else(|| {
            DerivationError::InvalidConfig("no S3 bucket configured (set AWS_S3_BUCKET)".into())
        })?;
        let kept = parts.take(path);
        Ok(format!(
            "s3://{}/{}",
            self.host_for(bucket),
            kept.trim_start_matches('/')
        ))
    }

    fn default_path_parts(&self) -> PathParts {
        PathParts::Last(2)
    }

    async fn exists(&self, uri: &LocationUri) -> Result<bool, DerivationError> {
        let addr = ObjectAddress::parse(uri)?;
        let keys = self.client(&addr).await.list(&addr.bucket, &addr.key).await?;
        // The listing is by prefix; only the exact key counts.
        Ok(keys.iter().any(|k| *k == addr.key))
    }

    async fn fetch(&self, uri: &LocationUri, dest: &Path) -> Result<(), DerivationError> {
        let addr = ObjectAddress::parse(uri)?;
        debug!(bucket = %addr.bucket, key = %addr.key, "Downloading object");
        self.client(&addr).await.get(&addr.bucket, &addr.key, dest).await
    }

    async fn store(&self, uri: &LocationUri, src: &Path) -> Result<(), DerivationError> {
        let addr = ObjectAddress::parse(uri)?;
        info!(bucket = %addr.bucket, key = %addr.key, "Uploading object");
        self.client(&addr).await.put(&addr.bucket, &addr.key, src).await
    }

    async fn list_matching(
        &self,
        uri: &LocationUri,
        pattern: &str,
    ) -> Result<Vec<LocationUri>, DerivationError> {
        let addr = ObjectAddress::parse(uri)?;
        let key_dir = addr.key.rfind('/').map_or("", |i| &addr.key[..i]);
        let full = if key_dir.is_empty() {
            pattern.trim_start_matches('/').to_string()
        } else {
            format!("{}/{}", glob::escape(key_dir), pattern.trim_start_matches('/'))
        };

        // No server-side wildcards: list by the literal prefix, filter here.
        let prefix = glob::literal_prefix(&full);
        let matcher = glob::to_regex(&full);
        let keys = self.client(&addr).await.list(&addr.bucket, &prefix).await?;

        let host = uri.path().split('/').next().unwrap_or_default();
        let mut matched: Vec<&String> = keys.iter().filter(|k| matcher.is_match(k)).collect();
        matched.sort();
        debug!(bucket = %addr.bucket, %prefix, listed = keys.len(), matched = matched.len(), "Listed objects");

        matched
            .into_iter()
            .map(|key| LocationUri::parse(format!("s3://{host}/{key}")))
            .collect()
    }
}

// ── AWS SDK store ─────────────────────────────────────────────────────────

/// [`ObjectStore`] over `aws-sdk-s3`.
pub struct AwsObjectStore {
    client: aws_sdk_s3::Client,
}

impl AwsObjectStore {
    /// Build a client from the settings. Credentials fall back to the SDK's
    /// default provider chain when not configured.
    pub async fn connect(settings: &S3Settings) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()));
        if let (Some(key_id), Some(secret)) = (&settings.access_key_id, &settings.secret_access_key) {
            loader = loader.credentials_provider(Credentials::new(
                key_id,
                secret,
                None,
                None,
                "edgequake-derivatives",
            ));
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &settings.endpoint_url {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        info!(region = %settings.region, endpoint = ?settings.endpoint_url, "S3 client ready");
        Self {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
        }
    }
}

fn object_error(bucket: &str, key: &str, err: impl std::error::Error) -> DerivationError {
    DerivationError::ObjectStore {
        uri: format!("s3://{bucket}/{key}"),
        reason: DisplayErrorContext(err).to_string(),
    }
}

#[async_trait]
impl ObjectStore for AwsObjectStore {
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, DerivationError> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        let mut keys = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| object_error(bucket, prefix, e))?;
            keys.extend(page.contents().iter().filter_map(|o| o.key().map(str::to_string)));
        }
        Ok(keys)
    }

    async fn get(&self, bucket: &str, key: &str, dest: &Path) -> Result<(), DerivationError> {
        let resp = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let service = e.into_service_error();
                if service.is_no_such_key() {
                    DerivationError::MissingSource {
                        uri: format!("s3://{bucket}/{key}"),
                    }
                } else {
                    object_error(bucket, key, service)
                }
            })?;
        let bytes = resp
            .body
            .collect()
            .await
            .map_err(|e| object_error(bucket, key, e))?
            .into_bytes();
        tokio::fs::write(dest, &bytes)
            .await
            .map_err(|e| DerivationError::io(dest, e))
    }

    async fn put(&self, bucket: &str, key: &str, src: &Path) -> Result<(), DerivationError> {
        let body = ByteStream::from_path(src)
            .await
            .map_err(|e| object_error(bucket, key, e))?;
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| object_error(bucket, key, e))?;
        Ok(())
    }
}
