//! In-memory collaborators and builders for pipeline and worker tests

#![allow(dead_code)]

use async_trait::async_trait;
use preprocessor_worker::{
    models::job::ObjectLocation,
    models::status::{JobStatus, JobStatusRecord, StatusUpdate},
    pipeline::JobPipeline,
    services::{
        queue::{DeliveryReceipt, MessageSource, QueueError, ReceivedMessage},
        status::{StatusError, StatusStore},
        storage::{ObjectStore, StorageError},
        transform::TransformClient,
    },
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use wiremock::MockServer;

/// Valid job body for the given id and output key, reading `in.png` from bucket `b`.
pub fn job_body(job_id: &str, output_key: &str) -> String {
    serde_json::json!({
        "input_bucket": "b",
        "input_key": "in.png",
        "output_bucket": "b",
        "output_key": output_key,
        "process_id": "canny",
        "job_id": job_id,
    })
    .to_string()
}

/// Job body reading a specific input key.
pub fn job_body_with_input(job_id: &str, input_key: &str) -> String {
    serde_json::json!({
        "input_bucket": "b",
        "input_key": input_key,
        "output_bucket": "b",
        "output_key": format!("{job_id}.webp"),
        "process_id": "canny",
        "job_id": job_id,
    })
    .to_string()
}

fn injected_queue_error() -> QueueError {
    QueueError::Redis(redis::RedisError::from((
        redis::ErrorKind::IoError,
        "injected failure",
    )))
}

/// Queue holding messages in memory, with the same visibility timeout
/// semantics as the Redis queue: every delivery gets a fresh `receipt-{n}`
/// and an unacknowledged message returns to the front of the queue once its
/// deadline passes.
pub struct MemoryQueue {
    pending: Mutex<VecDeque<String>>,
    in_flight: Mutex<HashMap<DeliveryReceipt, (String, Instant)>>,
    acknowledged: Mutex<Vec<DeliveryReceipt>>,
    visibility_timeout: Duration,
    next_receipt: AtomicUsize,
    receive_calls: AtomicUsize,
    redelivered: AtomicUsize,
    failing_receives: AtomicUsize,
    failing_acks: AtomicUsize,
    fail_acks: AtomicBool,
    cancel_on_receive: Mutex<Option<CancellationToken>>,
}

impl MemoryQueue {
    pub fn new() -> Arc<Self> {
        Self::with_visibility_timeout(Duration::from_secs(30))
    }

    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::default(),
            in_flight: Mutex::default(),
            acknowledged: Mutex::default(),
            visibility_timeout,
            next_receipt: AtomicUsize::new(0),
            receive_calls: AtomicUsize::new(0),
            redelivered: AtomicUsize::new(0),
            failing_receives: AtomicUsize::new(0),
            failing_acks: AtomicUsize::new(0),
            fail_acks: AtomicBool::new(false),
            cancel_on_receive: Mutex::default(),
        })
    }

    /// Queue a body. Returns the receipt its first delivery will carry when
    /// nothing else is delivered in between.
    pub fn push(&self, body: impl Into<String>) -> DeliveryReceipt {
        let mut pending = self.pending.lock().unwrap();
        let n = self.next_receipt.load(Ordering::SeqCst) + pending.len();
        pending.push_back(body.into());
        DeliveryReceipt::new(format!("receipt-{n}"))
    }

    /// Hand out a message directly, as `receive` would.
    pub fn deliver(&self, body: impl Into<String>) -> ReceivedMessage {
        self.claim(body.into())
    }

    fn claim(&self, body: String) -> ReceivedMessage {
        let n = self.next_receipt.fetch_add(1, Ordering::SeqCst);
        let receipt = DeliveryReceipt::new(format!("receipt-{n}"));
        self.in_flight.lock().unwrap().insert(
            receipt.clone(),
            (body.clone(), Instant::now() + self.visibility_timeout),
        );
        ReceivedMessage { body, receipt }
    }

    fn requeue_expired(&self) {
        let now = Instant::now();
        let mut in_flight = self.in_flight.lock().unwrap();
        let expired: Vec<DeliveryReceipt> = in_flight
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        let mut pending = self.pending.lock().unwrap();
        for receipt in expired {
            if let Some((body, _)) = in_flight.remove(&receipt) {
                pending.push_front(body);
                self.redelivered.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// How many times a receipt was acknowledged.
    pub fn ack_count(&self, receipt: &DeliveryReceipt) -> usize {
        self.acknowledged
            .lock()
            .unwrap()
            .iter()
            .filter(|r| *r == receipt)
            .count()
    }

    pub fn acknowledged(&self) -> usize {
        self.acknowledged.lock().unwrap().len()
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }

    /// Messages returned to the queue after their visibility timeout.
    pub fn redelivered(&self) -> usize {
        self.redelivered.load(Ordering::SeqCst)
    }

    pub fn receive_calls(&self) -> usize {
        self.receive_calls.load(Ordering::SeqCst)
    }

    pub fn fail_next_receives(&self, count: usize) {
        self.failing_receives.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_acks(&self, count: usize) {
        self.failing_acks.store(count, Ordering::SeqCst);
    }

    pub fn fail_acks(&self) {
        self.fail_acks.store(true, Ordering::SeqCst);
    }

    /// Cancel `token` the next time a batch is received.
    pub fn cancel_on_receive(&self, token: CancellationToken) {
        *self.cancel_on_receive.lock().unwrap() = Some(token);
    }
}

#[async_trait]
impl MessageSource for MemoryQueue {
    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        self.receive_calls.fetch_add(1, Ordering::SeqCst);

        let token = self.cancel_on_receive.lock().unwrap().take();
        if let Some(token) = token {
            token.cancel();
        }

        let failing = self.failing_receives.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_receives.store(failing - 1, Ordering::SeqCst);
            return Err(injected_queue_error());
        }

        self.requeue_expired();
        let bodies: Vec<String> = {
            let mut pending = self.pending.lock().unwrap();
            let take = max_messages.min(pending.len());
            pending.drain(..take).collect()
        };

        if bodies.is_empty() {
            tokio::time::sleep(wait.min(Duration::from_millis(10))).await;
        }

        Ok(bodies.into_iter().map(|body| self.claim(body)).collect())
    }

    async fn acknowledge(&self, receipt: &DeliveryReceipt) -> Result<(), QueueError> {
        if self.fail_acks.load(Ordering::SeqCst) {
            return Err(injected_queue_error());
        }
        let failing = self.failing_acks.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_acks.store(failing - 1, Ordering::SeqCst);
            return Err(injected_queue_error());
        }
        self.in_flight.lock().unwrap().remove(receipt);
        self.acknowledged.lock().unwrap().push(receipt.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub content_type: String,
}

/// Object store in memory, with per-key failure injection.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<ObjectLocation, StoredObject>>,
    failing_gets: Mutex<HashSet<String>>,
    failing_puts: Mutex<HashSet<String>>,
    panicking_gets: Mutex<HashSet<String>>,
    panic_once: Mutex<HashSet<String>>,
    puts: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, bucket: &str, key: &str, data: &[u8]) {
        self.objects.lock().unwrap().insert(
            ObjectLocation::new(bucket, key),
            StoredObject {
                data: data.to_vec(),
                content_type: "application/octet-stream".to_string(),
            },
        );
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects
            .lock()
            .unwrap()
            .get(&ObjectLocation::new(bucket, key))
            .cloned()
    }

    pub fn fail_get(&self, key: &str) {
        self.failing_gets.lock().unwrap().insert(key.to_string());
    }

    pub fn fail_put(&self, key: &str) {
        self.failing_puts.lock().unwrap().insert(key.to_string());
    }

    pub fn panic_on_get(&self, key: &str) {
        self.panicking_gets.lock().unwrap().insert(key.to_string());
    }

    /// Panic on the next read of `key` only.
    pub fn panic_once_on_get(&self, key: &str) {
        self.panic_once.lock().unwrap().insert(key.to_string());
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, location: &ObjectLocation) -> Result<Option<Vec<u8>>, StorageError> {
        let panics = self.panicking_gets.lock().unwrap().contains(&location.key)
            || self.panic_once.lock().unwrap().remove(&location.key);
        if panics {
            panic!("object store blew up reading {location}");
        }
        if self.failing_gets.lock().unwrap().contains(&location.key) {
            return Err(StorageError::Status {
                code: 500,
                location: location.clone(),
            });
        }
        match self.objects.lock().unwrap().get(location) {
            Some(object) if object.data.is_empty() => Ok(None),
            Some(object) => Ok(Some(object.data.clone())),
            None => Err(StorageError::NotFound(location.clone())),
        }
    }

    async fn put(
        &self,
        location: &ObjectLocation,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if self.failing_puts.lock().unwrap().contains(&location.key) {
            return Err(StorageError::Status {
                code: 503,
                location: location.clone(),
            });
        }
        self.objects.lock().unwrap().insert(
            location.clone(),
            StoredObject {
                data: data.to_vec(),
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }
}

/// Status store in memory. Keeps every write so tests can reason about the
/// terminal status independently of when the detached `running` write lands.
#[derive(Default)]
pub struct MemoryStatusStore {
    records: Mutex<HashMap<String, JobStatusRecord>>,
    history: Mutex<Vec<StatusUpdate>>,
    fail_writes: AtomicBool,
}

impl MemoryStatusStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    pub fn record(&self, job_id: &str) -> Option<JobStatusRecord> {
        self.records.lock().unwrap().get(job_id).cloned()
    }

    /// Statuses written for a job, in write order.
    pub fn history(&self, job_id: &str) -> Vec<JobStatus> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.job_id == job_id)
            .map(|u| u.status)
            .collect()
    }

    /// The last terminal status written for a job.
    pub fn terminal_status(&self, job_id: &str) -> Option<JobStatus> {
        self.history(job_id)
            .into_iter()
            .filter(|s| s.is_terminal())
            .last()
    }

    pub fn write_count(&self) -> usize {
        self.history.lock().unwrap().len()
    }

    /// Wait for the detached `running` write of a job to land.
    pub async fn wait_for_running(&self, job_id: &str) -> bool {
        for _ in 0..100 {
            if self.history(job_id).contains(&JobStatus::Running) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn upsert(&self, update: &StatusUpdate) -> Result<(), StatusError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StatusError::Database(sqlx::Error::PoolTimedOut));
        }
        self.history.lock().unwrap().push(update.clone());
        self.records
            .lock()
            .unwrap()
            .entry(update.job_id.clone())
            .and_modify(|record| record.apply(update))
            .or_insert_with(|| JobStatusRecord::from_update(update));
        Ok(())
    }
}

/// Pipeline wired to in-memory collaborators and a mock preprocessor.
pub struct Harness {
    pub queue: Arc<MemoryQueue>,
    pub objects: Arc<MemoryObjectStore>,
    pub statuses: Arc<MemoryStatusStore>,
    pub pipeline: Arc<JobPipeline>,
}

impl Harness {
    pub fn new(server: &MockServer) -> Self {
        Self::with_api_key(server, None)
    }

    pub fn with_api_key(server: &MockServer, api_key: Option<&str>) -> Self {
        Self::build(server, api_key, MemoryQueue::new())
    }

    /// Harness whose queue redelivers unacknowledged messages after `timeout`.
    pub fn with_visibility_timeout(server: &MockServer, timeout: Duration) -> Self {
        Self::build(server, None, MemoryQueue::with_visibility_timeout(timeout))
    }

    fn build(server: &MockServer, api_key: Option<&str>, queue: Arc<MemoryQueue>) -> Self {
        let objects = MemoryObjectStore::new();
        let statuses = MemoryStatusStore::new();
        let transform = TransformClient::new(
            &server.uri(),
            api_key.map(str::to_owned),
            Duration::from_secs(5),
        )
        .expect("mock server URI is a valid base URL");

        let pipeline = Arc::new(JobPipeline::new(
            queue.clone(),
            objects.clone(),
            statuses.clone(),
            Arc::new(transform),
        ));

        objects.insert("b", "in.png", b"\x89PNG input bytes");

        Self {
            queue,
            objects,
            statuses,
            pipeline,
        }
    }
}
