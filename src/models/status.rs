use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Status of a preprocessing job as recorded in the status table.
///
/// There is no pending state: a job without a record has not started yet.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, AsRefStr, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// Column stamped when the job enters this status.
    pub fn time_field(self) -> &'static str {
        match self {
            JobStatus::Running => "time_started",
            JobStatus::Completed => "time_completed",
            JobStatus::Failed => "time_failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// One field-level status write.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub job_id: String,
    pub status: JobStatus,
    pub at: DateTime<Utc>,
    /// Wall-clock job duration in seconds. Only carried by `completed`.
    pub job_time: Option<f64>,
    /// Processing time reported by the preprocessor. Only carried by `completed`.
    pub gpu_time: Option<f64>,
}

impl StatusUpdate {
    pub fn running(job_id: impl Into<String>) -> Self {
        Self::new(job_id, JobStatus::Running)
    }

    pub fn failed(job_id: impl Into<String>) -> Self {
        Self::new(job_id, JobStatus::Failed)
    }

    pub fn completed(job_id: impl Into<String>, job_time: f64, gpu_time: Option<f64>) -> Self {
        Self {
            job_time: Some(job_time),
            gpu_time,
            ..Self::new(job_id, JobStatus::Completed)
        }
    }

    fn new(job_id: impl Into<String>, status: JobStatus) -> Self {
        Self {
            job_id: job_id.into(),
            status,
            at: Utc::now(),
            job_time: None,
            gpu_time: None,
        }
    }
}

/// Current state of a job's status record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusRecord {
    pub job_id: String,
    pub status: JobStatus,
    pub time_started: Option<DateTime<Utc>>,
    pub time_completed: Option<DateTime<Utc>>,
    pub time_failed: Option<DateTime<Utc>>,
    pub job_time: Option<f64>,
    pub gpu_time: Option<f64>,
}

impl JobStatusRecord {
    /// The record produced by a first write for a job.
    pub fn from_update(update: &StatusUpdate) -> Self {
        let mut record = Self {
            job_id: update.job_id.clone(),
            status: update.status,
            time_started: None,
            time_completed: None,
            time_failed: None,
            job_time: None,
            gpu_time: None,
        };
        record.apply(update);
        record
    }

    /// Merge a later write into this record.
    ///
    /// The status and the status's own timestamp are overwritten; other
    /// timestamps are kept, and absent metrics leave stored ones in place.
    pub fn apply(&mut self, update: &StatusUpdate) {
        self.status = update.status;
        let stamp = match update.status {
            JobStatus::Running => &mut self.time_started,
            JobStatus::Completed => &mut self.time_completed,
            JobStatus::Failed => &mut self.time_failed,
        };
        *stamp = Some(update.at);
        if update.job_time.is_some() {
            self.job_time = update.job_time;
        }
        if update.gpu_time.is_some() {
            self.gpu_time = update.gpu_time;
        }
    }
}
