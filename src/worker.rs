//! Poll loop: receive a batch, run every job in it concurrently, repeat.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::pipeline::{AcknowledgeError, JobOutcome, JobPipeline};
use crate::services::queue::{MessageSource, ReceivedMessage};

pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_WAIT_TIME: Duration = Duration::from_secs(20);
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Poll loop settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum messages received (and processed concurrently) per batch.
    pub batch_size: usize,
    /// Long-poll wait for the first message of a batch.
    pub wait_time: Duration,
    /// Pause after a failed receive before polling again.
    pub receive_error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            wait_time: DEFAULT_WAIT_TIME,
            receive_error_backoff: RECEIVE_ERROR_BACKOFF,
        }
    }
}

/// Outcome counts for one batch, or summed over a whole run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub received: usize,
    pub completed: usize,
    pub failed: usize,
    /// Jobs whose acknowledge failed or whose task panicked. Their messages
    /// stay in flight and are redelivered after the visibility timeout.
    pub errored: usize,
}

impl BatchSummary {
    pub fn merge(&mut self, other: BatchSummary) {
        self.received += other.received;
        self.completed += other.completed;
        self.failed += other.failed;
        self.errored += other.errored;
    }

    fn record(&mut self, joined: Result<Result<JobOutcome, AcknowledgeError>, JoinError>) {
        match joined {
            Ok(Ok(JobOutcome::Completed { job_time, gpu_time })) => {
                self.completed += 1;
                metrics::counter!("preprocessor_jobs_completed_total").increment(1);
                metrics::histogram!("preprocessor_job_seconds").record(job_time);
                if let Some(gpu_time) = gpu_time {
                    metrics::histogram!("preprocessor_gpu_seconds").record(gpu_time);
                }
            }
            Ok(Ok(JobOutcome::Failed { stage })) => {
                self.failed += 1;
                let stage: &'static str = stage.into();
                metrics::counter!("preprocessor_jobs_failed_total", "stage" => stage).increment(1);
            }
            Ok(Err(e)) => {
                self.errored += 1;
                metrics::counter!("preprocessor_jobs_errored_total").increment(1);
                error!(error = %e, "Job finished but its message was not acknowledged");
            }
            Err(e) => {
                self.errored += 1;
                metrics::counter!("preprocessor_jobs_errored_total").increment(1);
                error!(error = %e, panicked = e.is_panic(), "Job task aborted");
            }
        }
    }
}

/// Register metric descriptions with the installed recorder.
pub fn describe_metrics() {
    metrics::describe_counter!(
        "preprocessor_jobs_completed_total",
        "Jobs that reached the completed status"
    );
    metrics::describe_counter!(
        "preprocessor_jobs_failed_total",
        "Jobs that reached the failed status, by stage"
    );
    metrics::describe_counter!(
        "preprocessor_jobs_errored_total",
        "Jobs left unacknowledged after an acknowledge error or a panic"
    );
    metrics::describe_counter!("preprocessor_batches_total", "Non-empty batches processed");
    metrics::describe_histogram!(
        "preprocessor_job_seconds",
        metrics::Unit::Seconds,
        "Wall-clock time from receive to completion"
    );
    metrics::describe_histogram!(
        "preprocessor_gpu_seconds",
        metrics::Unit::Seconds,
        "Processing time reported by the preprocessor"
    );
}

/// Drives the job pipeline from a message source.
pub struct Worker {
    config: WorkerConfig,
    source: Arc<dyn MessageSource>,
    pipeline: Arc<JobPipeline>,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        source: Arc<dyn MessageSource>,
        pipeline: Arc<JobPipeline>,
    ) -> Self {
        Self {
            config,
            source,
            pipeline,
        }
    }

    /// Poll until `shutdown` is cancelled.
    ///
    /// Cancellation is checked between batches: a batch that has been
    /// received always runs to completion. Returns totals for the run.
    pub async fn run(&self, shutdown: CancellationToken) -> BatchSummary {
        info!(
            batch_size = self.config.batch_size,
            wait_secs = self.config.wait_time.as_secs_f64(),
            "Worker ready, starting job processing loop"
        );

        let mut totals = BatchSummary::default();
        while !shutdown.is_cancelled() {
            let batch = match self
                .source
                .receive(self.config.batch_size, self.config.wait_time)
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    error!(error = %e, "Failed to receive messages");
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(self.config.receive_error_backoff) => {}
                    }
                    continue;
                }
            };

            if batch.is_empty() {
                debug!("No messages received");
                continue;
            }

            totals.merge(self.dispatch(batch).await);
        }

        info!(
            received = totals.received,
            completed = totals.completed,
            failed = totals.failed,
            errored = totals.errored,
            "Worker stopped"
        );
        totals
    }

    /// Run every message of a batch as its own task and wait for all of them.
    pub async fn dispatch(&self, batch: Vec<ReceivedMessage>) -> BatchSummary {
        info!(count = batch.len(), "Received messages");

        let mut tasks = JoinSet::new();
        for message in batch {
            let pipeline = Arc::clone(&self.pipeline);
            tasks.spawn(async move { pipeline.process(message).await });
        }

        let mut summary = BatchSummary {
            received: tasks.len(),
            ..BatchSummary::default()
        };
        while let Some(joined) = tasks.join_next().await {
            summary.record(joined);
        }

        metrics::counter!("preprocessor_batches_total").increment(1);
        info!(
            received = summary.received,
            completed = summary.completed,
            failed = summary.failed,
            errored = summary.errored,
            "Batch finished"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WorkerConfig::default();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.wait_time, Duration::from_secs(20));
    }

    #[test]
    fn test_summary_merge() {
        let mut totals = BatchSummary {
            received: 3,
            completed: 2,
            failed: 1,
            errored: 0,
        };
        totals.merge(BatchSummary {
            received: 2,
            completed: 0,
            failed: 1,
            errored: 1,
        });
        assert_eq!(
            totals,
            BatchSummary {
                received: 5,
                completed: 2,
                failed: 2,
                errored: 1,
            }
        );
    }
}
