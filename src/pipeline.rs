//! Per-job state machine.
//!
//! A received message goes through validate → mark running → fetch →
//! transform → store → mark completed. Any failure marks the job failed.
//! Every job that reaches a terminal status is acknowledged, failed jobs
//! included. Only a failed acknowledge leaves the message for redelivery.

use std::sync::Arc;
use std::time::Instant;

use strum::{AsRefStr, Display, IntoStaticStr};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::models::job::{JobRequest, MessageError, ObjectLocation};
use crate::models::status::StatusUpdate;
use crate::services::queue::{DeliveryReceipt, MessageSource, QueueError, ReceivedMessage};
use crate::services::status::{StatusError, StatusStore};
use crate::services::storage::{ObjectStore, StorageError};
use crate::services::transform::{TransformError, TransformService};

/// Pipeline stage a job failed in. Used as a metrics label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Validate,
    Fetch,
    Transform,
    Store,
    Status,
}

/// Terminal result of one job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed { job_time: f64, gpu_time: Option<f64> },
    Failed { stage: Stage },
}

/// Why a job ended in `failed`.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("invalid job message: {0}")]
    Invalid(#[from] MessageError),

    #[error("failed to fetch input {location}: {source}")]
    Fetch {
        location: ObjectLocation,
        source: StorageError,
    },

    #[error("input object {0} has no body")]
    MissingInput(ObjectLocation),

    #[error("transform failed: {0}")]
    Transform(#[from] TransformError),

    #[error("failed to store output {location}: {source}")]
    Store {
        location: ObjectLocation,
        source: StorageError,
    },

    #[error("failed to record completion: {0}")]
    Status(#[from] StatusError),
}

impl JobError {
    pub fn stage(&self) -> Stage {
        match self {
            JobError::Invalid(_) => Stage::Validate,
            JobError::Fetch { .. } | JobError::MissingInput(_) => Stage::Fetch,
            JobError::Transform(_) => Stage::Transform,
            JobError::Store { .. } => Stage::Store,
            JobError::Status(_) => Stage::Status,
        }
    }
}

/// A job reached a terminal status but its message could not be removed
/// from the queue. The message is delivered again once its visibility
/// timeout expires.
#[derive(Debug, thiserror::Error)]
#[error("failed to acknowledge message for job {job_id:?}: {source}")]
pub struct AcknowledgeError {
    pub job_id: Option<String>,
    pub source: QueueError,
}

/// Runs single jobs against the collaborators.
pub struct JobPipeline {
    source: Arc<dyn MessageSource>,
    objects: Arc<dyn ObjectStore>,
    statuses: Arc<dyn StatusStore>,
    transform: Arc<dyn TransformService>,
}

impl JobPipeline {
    pub fn new(
        source: Arc<dyn MessageSource>,
        objects: Arc<dyn ObjectStore>,
        statuses: Arc<dyn StatusStore>,
        transform: Arc<dyn TransformService>,
    ) -> Self {
        Self {
            source,
            objects,
            statuses,
            transform,
        }
    }

    /// Process one received message to a terminal status and acknowledge it.
    ///
    /// Job failures are absorbed into [`JobOutcome::Failed`]; only a failed
    /// acknowledge is returned as an error.
    pub async fn process(&self, message: ReceivedMessage) -> Result<JobOutcome, AcknowledgeError> {
        let started = Instant::now();
        let ReceivedMessage { body, receipt } = message;

        let job = match JobRequest::parse(&body) {
            Ok(job) => job,
            Err(rejected) => {
                let error = JobError::Invalid(rejected.error);
                warn!(
                    job_id = rejected.job_id.as_deref().unwrap_or("<unknown>"),
                    error = %error,
                    "Rejecting invalid job message"
                );
                if let Some(job_id) = &rejected.job_id {
                    self.record_failure(job_id).await;
                }
                self.acknowledge(rejected.job_id.as_deref(), &receipt).await?;
                return Ok(JobOutcome::Failed {
                    stage: error.stage(),
                });
            }
        };

        let span = info_span!("job", job_id = %job.job_id);
        self.run(job, receipt, started).instrument(span).await
    }

    async fn run(
        &self,
        job: JobRequest,
        receipt: DeliveryReceipt,
        started: Instant,
    ) -> Result<JobOutcome, AcknowledgeError> {
        info!(
            process_id = %job.process_id,
            input = %job.input,
            output = %job.output,
            "Processing job"
        );

        self.mark_running(&job.job_id);

        let outcome = match self.execute(&job, started).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let stage = e.stage();
                error!(stage = %stage, error = %e, "Job failed");
                self.record_failure(&job.job_id).await;
                JobOutcome::Failed { stage }
            }
        };

        self.acknowledge(Some(&job.job_id), &receipt).await?;
        Ok(outcome)
    }

    async fn execute(&self, job: &JobRequest, started: Instant) -> Result<JobOutcome, JobError> {
        let input = self
            .objects
            .get(&job.input)
            .await
            .map_err(|source| JobError::Fetch {
                location: job.input.clone(),
                source,
            })?
            .ok_or_else(|| JobError::MissingInput(job.input.clone()))?;
        debug!(bytes = input.len(), "Fetched input object");

        let output = self.transform.transform(&job.process_id, input).await?;
        debug!(bytes = output.data.len(), gpu_time = ?output.gpu_time, "Preprocessor returned output");

        self.objects
            .put(&job.output, &output.data, job.output_format.content_type())
            .await
            .map_err(|source| JobError::Store {
                location: job.output.clone(),
                source,
            })?;

        let job_time = started.elapsed().as_secs_f64();
        self.statuses
            .upsert(&StatusUpdate::completed(&job.job_id, job_time, output.gpu_time))
            .await?;

        info!(job_time, gpu_time = ?output.gpu_time, "Job completed");
        Ok(JobOutcome::Completed {
            job_time,
            gpu_time: output.gpu_time,
        })
    }

    /// Record `running` without holding up the job. The write is advisory and
    /// may land after later writes for the same job.
    fn mark_running(&self, job_id: &str) {
        let statuses = Arc::clone(&self.statuses);
        let update = StatusUpdate::running(job_id);
        tokio::spawn(
            async move {
                if let Err(e) = statuses.upsert(&update).await {
                    warn!(error = %e, "Failed to mark job running");
                }
            }
            .in_current_span(),
        );
    }

    async fn record_failure(&self, job_id: &str) {
        if let Err(e) = self.statuses.upsert(&StatusUpdate::failed(job_id)).await {
            error!(job_id, error = %e, "Failed to mark job failed");
        }
    }

    async fn acknowledge(
        &self,
        job_id: Option<&str>,
        receipt: &DeliveryReceipt,
    ) -> Result<(), AcknowledgeError> {
        self.source
            .acknowledge(receipt)
            .await
            .map_err(|source| AcknowledgeError {
                job_id: job_id.map(str::to_owned),
                source,
            })
    }
}
