use std::sync::Arc;

use crate::pipeline::JobPipeline;
use crate::services::{
    queue::RedisQueue, status::PgStatusStore, storage::S3Storage, transform::TransformClient,
};

/// Production collaborators, shared by the poll loop and the health routes.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<RedisQueue>,
    pub statuses: Arc<PgStatusStore>,
    pub storage: Arc<S3Storage>,
    pub transform: Arc<TransformClient>,
}

impl AppState {
    pub fn new(
        queue: RedisQueue,
        statuses: PgStatusStore,
        storage: S3Storage,
        transform: TransformClient,
    ) -> Self {
        Self {
            queue: Arc::new(queue),
            statuses: Arc::new(statuses),
            storage: Arc::new(storage),
            transform: Arc::new(transform),
        }
    }

    /// Job pipeline wired to these collaborators.
    pub fn pipeline(&self) -> JobPipeline {
        JobPipeline::new(
            self.queue.clone(),
            self.storage.clone(),
            self.statuses.clone(),
            self.transform.clone(),
        )
    }
}
