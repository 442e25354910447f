//! In-process stand-ins for object storage and queues.
//!
//! Useful offline and in tests: plug them into [`super::S3Backend::with_store`]
//! and [`super::SqsBackend::with_queue`].

use super::s3::ObjectStore;
use super::sqs::{MessageQueue, QueueMessage};
use crate::error::DerivationError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Objects held in memory, keyed by bucket then key.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<(String, String), Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, bucket: &str, key: &str, bytes: Vec<u8>) {
        lock(&self.objects).insert((bucket.to_string(), key.to_string()), bytes);
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        lock(&self.objects)
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// All keys in a bucket, sorted.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        lock(&self.objects)
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, DerivationError> {
        Ok(self
            .keys(bucket)
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect())
    }

    async fn get(&self, bucket: &str, key: &str, dest: &Path) -> Result<(), DerivationError> {
        let bytes = self
            .object(bucket, key)
            .ok_or_else(|| DerivationError::MissingSource {
                uri: format!("s3://{bucket}/{key}"),
            })?;
        tokio::fs::write(dest, bytes)
            .await
            .map_err(|e| DerivationError::io(dest, e))
    }

    async fn put(&self, bucket: &str, key: &str, src: &Path) -> Result<(), DerivationError> {
        let bytes = tokio::fs::read(src)
            .await
            .map_err(|e| DerivationError::io(src, e))?;
        self.insert(bucket, key, bytes);
        Ok(())
    }
}

/// Queues held in memory. Every known queue name resolves; unknown names
/// fail like a missing queue would.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    queues: Mutex<HashMap<String, Vec<String>>>,
    batches: Mutex<Vec<usize>>,
    auto_create: bool,
}

impl MemoryQueue {
    /// A queue service that creates queues on first use.
    pub fn new() -> Self {
        Self {
            auto_create: true,
            ..Self::default()
        }
    }

    /// A queue service that only knows the given queue names.
    pub fn with_queues<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let queues = names
            .into_iter()
            .map(|n| (n.into(), Vec::new()))
            .collect();
        Self {
            queues: Mutex::new(queues),
            ..Self::default()
        }
    }

    /// Message bodies received by a queue, oldest first.
    pub fn messages(&self, queue: &str) -> Vec<String> {
        lock(&self.queues).get(queue).cloned().unwrap_or_default()
    }

    /// Sizes of the batches sent so far.
    pub fn batch_sizes(&self) -> Vec<usize> {
        lock(&self.batches).clone()
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn queue_url(&self, name: &str) -> Result<String, DerivationError> {
        let mut queues = lock(&self.queues);
        if !queues.contains_key(name) {
            if !self.auto_create {
                return Err(DerivationError::Queue {
                    queue: name.to_string(),
                    reason: "queue does not exist".into(),
                });
            }
            queues.insert(name.to_string(), Vec::new());
        }
        Ok(format!("memory://{name}"))
    }

    async fn send(&self, queue_url: &str, body: &str) -> Result<(), DerivationError> {
        self.send_batch(
            queue_url,
            vec![QueueMessage {
                id: "0".into(),
                body: body.to_string(),
            }],
        )
        .await
    }

    async fn send_batch(
        &self,
        queue_url: &str,
        messages: Vec<QueueMessage>,
    ) -> Result<(), DerivationError> {
        let name = queue_url.trim_start_matches("memory://");
        let mut queues = lock(&self.queues);
        let queue = queues.get_mut(name).ok_or_else(|| DerivationError::Queue {
            queue: name.to_string(),
            reason: "queue does not exist".into(),
        })?;
        lock(&self.batches).push(messages.len());
        queue.extend(messages.into_iter().map(|m| m.body));
        Ok(())
    }
}
