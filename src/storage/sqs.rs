//! Message queues: `sqs://<region>.amazonaws.com/<account>/<queue>/<dir…>/<file>[?template=…]`.
//!
//! A queue holds no objects. Nothing ever exists on it, nothing can be read
//! from it, and writing a staged file enqueues a message pointing at that file
//! instead of storing bytes. The message body is a JSON object mapping the
//! file's address (rewritten through the URI's `template` query parameter,
//! when present) to the list of templates it was rewritten with:
//!
//! ```json
//! {"s3://scans.s3.us-east-1.amazonaws.com/box/a.tiff": ["s3://scans.s3.us-east-1.amazonaws.com/box/{{filename}}"]}
//! ```

use super::{PathParts, StorageBackend};
use crate::config::SqsSettings;
use crate::error::DerivationError;
use crate::template::rewrite;
use crate::uri::LocationUri;
use async_trait::async_trait;
use aws_sdk_sqs::config::{Credentials, Region};
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::SendMessageBatchRequestEntry;
use percent_encoding::percent_decode_str;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use walkdir::WalkDir;

/// One message in a batch. Ids only need to be unique within the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub id: String,
    pub body: String,
}

/// The requests the SQS backend needs from a queue service.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Resolve a queue name to the URL messages are sent to.
    async fn queue_url(&self, name: &str) -> Result<String, DerivationError>;

    async fn send(&self, queue_url: &str, body: &str) -> Result<(), DerivationError>;

    async fn send_batch(
        &self,
        queue_url: &str,
        messages: Vec<QueueMessage>,
    ) -> Result<(), DerivationError>;
}

/// The parts of an SQS URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueAddress {
    pub region: String,
    pub account_id: String,
    pub queue_name: String,
    /// Segments between the queue name and the file name, joined by `/`.
    pub directory: String,
    pub file_name: String,
    /// The decoded `template` query parameter.
    pub template: Option<String>,
}

impl QueueAddress {
    pub fn parse(uri: &LocationUri) -> Result<Self, DerivationError> {
        let unresolvable = || DerivationError::QueueUnresolvable {
            uri: uri.to_string(),
        };
        let segments: Vec<&str> = uri.path().split('/').collect();
        let (host, account_id, queue_name) = match segments.as_slice() {
            [host, account, queue, ..] if !account.is_empty() && !queue.is_empty() => {
                (*host, *account, *queue)
            }
            _ => return Err(unresolvable()),
        };
        let region = host.split('.').next().unwrap_or_default().to_string();
        let (directory, file_name) = match &segments[3..] {
            [] => (String::new(), String::new()),
            [dirs @ .., file] => (dirs.join("/"), (*file).to_string()),
        };
        Ok(Self {
            region,
            account_id: account_id.to_string(),
            queue_name: queue_name.to_string(),
            directory,
            file_name,
            template: uri.query().and_then(template_param),
        })
    }

    /// `dir/file`, or just `file` at the queue root.
    pub fn key(&self) -> String {
        if self.directory.is_empty() {
            self.file_name.clone()
        } else {
            format!("{}/{}", self.directory, self.file_name)
        }
    }
}

/// Decode the `template` parameter of a form-encoded query.
fn template_param(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        (name == "template").then(|| {
            let value = value.replace('+', " ");
            percent_decode_str(&value).decode_utf8_lossy().into_owned()
        })
    })
}

pub struct SqsBackend {
    settings: SqsSettings,
    queue: OnceCell<Arc<dyn MessageQueue>>,
}

impl SqsBackend {
    /// A backend that connects to AWS on first use.
    pub fn new(settings: SqsSettings) -> Self {
        Self {
            settings,
            queue: OnceCell::new(),
        }
    }

    /// A backend over an existing queue service.
    pub fn with_queue(settings: SqsSettings, queue: Arc<dyn MessageQueue>) -> Self {
        Self {
            settings,
            queue: OnceCell::new_with(Some(queue)),
        }
    }

    async fn queue(&self) -> &Arc<dyn MessageQueue> {
        self.queue
            .get_or_init(|| async {
                let client = AwsMessageQueue::connect(&self.settings).await;
                Arc::new(client) as Arc<dyn MessageQueue>
            })
            .await
    }

    fn message_body(path: &Path, template: Option<&str>) -> Result<String, DerivationError> {
        let file_uri = format!("file://{}", path.display());
        let key = match template {
            Some(t) => rewrite(&file_uri, t, None)?,
            None => file_uri,
        };
        let mut body = BTreeMap::new();
        body.insert(key, template.map(|t| vec![t.to_string()]).unwrap_or_default());
        serde_json::to_string(&body)
            .map_err(|e| DerivationError::Internal(format!("message encoding failed: {e}")))
    }
}

#[async_trait]
impl StorageBackend for SqsBackend {
    fn schemes(&self) -> &'static [&'static str] {
        &["sqs"]
    }

    fn key(&self, uri: &LocationUri) -> Result<String, DerivationError> {
        Ok(QueueAddress::parse(uri)?.key())
    }

    fn create_uri(&self, path: &str, parts: PathParts) -> Result<String, DerivationError> {
        let (account, queue) = match (&self.settings.account_id, &self.settings.queue) {
            (Some(account), Some(queue)) => (account, queue),
            _ => {
                return Err(DerivationError::InvalidConfig(
                    "SQS account id and queue must be configured (AWS_SQS_ACCOUNT_ID, AWS_SQS_QUEUE)"
                        .into(),
                ))
            }
        };
        Ok(format!(
            "sqs://{}.amazonaws.com/{account}/{queue}/{}",
            self.settings.region,
            parts.take(path).trim_start_matches('/')
        ))
    }

    fn default_path_parts(&self) -> PathParts {
        PathParts::Last(1)
    }

    async fn exists(&self, uri: &LocationUri) -> Result<bool, DerivationError> {
        QueueAddress::parse(uri)?;
        Ok(false)
    }

    async fn fetch(&self, uri: &LocationUri, _dest: &Path) -> Result<(), DerivationError> {
        Err(DerivationError::MissingSource {
            uri: uri.to_string(),
        })
    }

    /// Enqueue one message per file in the staged file's directory.
    async fn store(&self, uri: &LocationUri, src: &Path) -> Result<(), DerivationError> {
        let addr = QueueAddress::parse(uri)?;
        let SqsSettings {
            batch_size,
            max_batch_size,
            ..
        } = self.settings;
        if batch_size > max_batch_size {
            return Err(DerivationError::BatchTooLarge {
                batch_size,
                max: max_batch_size,
            });
        }

        let dir = src.parent().unwrap_or(src);
        let files: Vec<PathBuf> = WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .collect();
        let bodies = files
            .iter()
            .map(|f| Self::message_body(f, addr.template.as_deref()))
            .collect::<Result<Vec<_>, _>>()?;

        let queue = self.queue().await;
        let url = queue.queue_url(&addr.queue_name).await?;
        info!(queue = %addr.queue_name, messages = bodies.len(), batch_size, "Enqueuing file references");

        if let [body] = bodies.as_slice() {
            return queue.send(&url, body).await;
        }
        for chunk in bodies.chunks(batch_size.max(1)) {
            let messages = chunk
                .iter()
                .map(|body| QueueMessage {
                    id: uuid::Uuid::new_v4().simple().to_string(),
                    body: body.clone(),
                })
                .collect();
            queue.send_batch(&url, messages).await?;
            debug!(queue = %addr.queue_name, sent = chunk.len(), "Sent batch");
        }
        Ok(())
    }

    async fn list_matching(
        &self,
        _uri: &LocationUri,
        _pattern: &str,
    ) -> Result<Vec<LocationUri>, DerivationError> {
        Ok(Vec::new())
    }
}

// ── AWS SDK queue ─────────────────────────────────────────────────────────

/// [`MessageQueue`] over `aws-sdk-sqs`.
pub struct AwsMessageQueue {
    client: aws_sdk_sqs::Client,
}

impl AwsMessageQueue {
    pub async fn connect(settings: &SqsSettings) -> Self {
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
        if let Some(endpoint) = &settings.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;
        info!(region = %settings.region, "SQS client ready");
        Self {
            client: aws_sdk_sqs::Client::new(&shared),
        }
    }
}

fn queue_error(queue: &str, err: impl std::error::Error) -> DerivationError {
    DerivationError::Queue {
        queue: queue.to_string(),
        reason: DisplayErrorContext(err).to_string(),
    }
}

#[async_trait]
impl MessageQueue for AwsMessageQueue {
    async fn queue_url(&self, name: &str) -> Result<String, DerivationError> {
        let resp = self
            .client
            .get_queue_url()
            .queue_name(name)
            .send()
            .await
            .map_err(|e| queue_error(name, e))?;
        resp.queue_url()
            .map(str::to_string)
            .ok_or_else(|| DerivationError::Queue {
                queue: name.to_string(),
                reason: "service returned no queue URL".into(),
            })
    }

    async fn send(&self, queue_url: &str, body: &str) -> Result<(), DerivationError> {
        self.client
            .send_message()
            .queue_url(queue_url)
            .message_body(body)
            .send()
            .await
            .map_err(|e| queue_error(queue_url, e))?;
        Ok(())
    }

    async fn send_batch(
        &self,
        queue_url: &str,
        messages: Vec<QueueMessage>,
    ) -> Result<(), DerivationError> {
        let entries = messages
            .into_iter()
            .map(|m| {
                SendMessageBatchRequestEntry::builder()
                    .id(m.id)
                    .message_body(m.body)
                    .build()
                    .map_err(|e| queue_error(queue_url, e))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let resp = self
            .client
            .send_message_batch()
            .queue_url(queue_url)
            .set_entries(Some(entries))
            .send()
            .await
            .map_err(|e| queue_error(queue_url, e))?;

        if let Some(failed) = resp.failed().first() {
            return Err(DerivationError::Queue {
                queue: queue_url.to_string(),
                reason: format!(
                    "{} of the batch rejected, first '{}': {}",
                    resp.failed().len(),
                    failed.id(),
                    failed.message().unwrap_or("no message")
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryQueue;

    const TEMPLATE_QUERY: &str =
        "template=s3%3A%2F%2Fscans.s3.us-east-1.amazonaws.com%2Fbox%2F%7B%7Bfilename%7D%7D";

    fn uri(tail: &str) -> LocationUri {
        LocationUri::parse(format!("sqs://us-east-1.amazonaws.com/123456789012/{tail}")).unwrap()
    }

    fn backend(settings: SqsSettings, queue: Arc<MemoryQueue>) -> SqsBackend {
        SqsBackend::with_queue(settings, queue)
    }

    #[test]
    fn address_parts() {
        let addr = QueueAddress::parse(&uri(&format!("ocr/box/a.tiff?{TEMPLATE_QUERY}"))).unwrap();
        assert_eq!(addr.region, "us-east-1");
        assert_eq!(addr.account_id, "123456789012");
        assert_eq!(addr.queue_name, "ocr");
        assert_eq!(addr.directory, "box");
        assert_eq!(addr.file_name, "a.tiff");
        assert_eq!(addr.key(), "box/a.tiff");
        assert_eq!(
            addr.template.as_deref(),
            Some("s3://scans.s3.us-east-1.amazonaws.com/box/{{filename}}")
        );
    }

    #[test]
    fn queue_required() {
        let u = LocationUri::parse("sqs://us-east-1.amazonaws.com/123456789012").unwrap();
        assert!(matches!(
            QueueAddress::parse(&u).unwrap_err(),
            DerivationError::QueueUnresolvable { .. }
        ));
    }

    #[tokio::test]
    async fn nothing_exists_on_a_queue() {
        let b = backend(SqsSettings::default(), Arc::new(MemoryQueue::new()));
        assert!(!b.exists(&uri("ocr/a.tiff")).await.unwrap());
        assert!(b.list_matching(&uri("ocr/a.tiff"), "*").await.unwrap().is_empty());
        let err = b.fetch(&uri("ocr/a.tiff"), Path::new("/tmp/x")).await.unwrap_err();
        assert!(err.is_missing());
    }

    #[tokio::test]
    async fn store_enqueues_rewritten_reference() {
        let queue = Arc::new(MemoryQueue::new());
        let b = backend(SqsSettings::default(), queue.clone());
        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join("a.tiff");
        std::fs::write(&staged, b"x").unwrap();

        b.store(&uri(&format!("ocr/a.tiff?{TEMPLATE_QUERY}")), &staged)
            .await
            .unwrap();

        let messages = queue.messages("ocr");
        assert_eq!(messages.len(), 1);
        let body: BTreeMap<String, Vec<String>> = serde_json::from_str(&messages[0]).unwrap();
        let templates = &body["s3://scans.s3.us-east-1.amazonaws.com/box/a.tiff"];
        assert_eq!(
            templates,
            &vec!["s3://scans.s3.us-east-1.amazonaws.com/box/{{filename}}".to_string()]
        );
    }

    #[tokio::test]
    async fn store_without_template_sends_file_uri() {
        let queue = Arc::new(MemoryQueue::new());
        let b = backend(SqsSettings::default(), queue.clone());
        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join("a.tiff");
        std::fs::write(&staged, b"x").unwrap();

        b.store(&uri("ocr/a.tiff"), &staged).await.unwrap();

        let body: BTreeMap<String, Vec<String>> =
            serde_json::from_str(&queue.messages("ocr")[0]).unwrap();
        let expected = format!("file://{}", staged.display());
        assert_eq!(body.get(&expected), Some(&Vec::new()));
    }

    #[tokio::test]
    async fn store_batches_by_batch_size() {
        let queue = Arc::new(MemoryQueue::new());
        let settings = SqsSettings {
            batch_size: 2,
            ..SqsSettings::default()
        };
        let b = backend(settings, queue.clone());
        let dir = tempfile::tempdir().unwrap();
        for i in 1..=5 {
            std::fs::write(dir.path().join(format!("a--page-{i}.tiff")), b"x").unwrap();
        }

        b.store(&uri("ocr/a--page-1.tiff"), &dir.path().join("a--page-1.tiff"))
            .await
            .unwrap();

        assert_eq!(queue.batch_sizes(), vec![2, 2, 1]);
        assert_eq!(queue.messages("ocr").len(), 5);
    }

    #[tokio::test]
    async fn batch_larger_than_maximum() {
        let settings = SqsSettings {
            batch_size: 11,
            max_batch_size: 10,
            ..SqsSettings::default()
        };
        let b = backend(settings, Arc::new(MemoryQueue::new()));
        let err = b
            .store(&uri("ocr/a.tiff"), Path::new("/tmp/a.tiff"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DerivationError::BatchTooLarge { batch_size: 11, max: 10 }
        ));
    }

    #[tokio::test]
    async fn unknown_queue() {
        let b = backend(SqsSettings::default(), Arc::new(MemoryQueue::with_queues(["other"])));
        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join("a.tiff");
        std::fs::write(&staged, b"x").unwrap();
        let err = b.store(&uri("ocr/a.tiff"), &staged).await.unwrap_err();
        assert!(matches!(err, DerivationError::Queue { .. }));
    }

    #[test]
    fn create_uri_keeps_file_name() {
        let settings = SqsSettings {
            account_id: Some("123456789012".into()),
            queue: Some("ocr".into()),
            ..SqsSettings::default()
        };
        let b = backend(settings, Arc::new(MemoryQueue::new()));
        assert_eq!(
            b.create_uri("/x/y/a.tiff", PathParts::Last(1)).unwrap(),
            "sqs://us-east-1.amazonaws.com/123456789012/ocr/a.tiff"
        );
    }
}
