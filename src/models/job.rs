use garde::Validate;
use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{AsRefStr, EnumString};

/// Output encodings a job may request, keyed by the output key's extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum OutputFormat {
    Png,
    Webp,
}

impl OutputFormat {
    /// Resolve the format from an object key such as `renders/out.webp`.
    pub fn from_key(key: &str) -> Option<Self> {
        let (_, extension) = key.rsplit_once('.')?;
        extension.parse().ok()
    }

    pub fn content_type(self) -> &'static str {
        match self {
            OutputFormat::Png => "image/png",
            OutputFormat::Webp => "image/webp",
        }
    }
}

/// A (bucket, key) pair addressing one object in the object store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Job payload as producers put it on the queue.
///
/// Every field is optional on the wire so that a message with missing fields
/// still deserializes and can be reported against its `job_id`. Presence and
/// the output extension are checked by [`JobRequest::parse`].
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct JobMessageBody {
    #[garde(length(min = 1))]
    pub job_id: Option<String>,

    #[garde(length(min = 1))]
    pub input_bucket: Option<String>,

    #[garde(length(min = 1))]
    pub input_key: Option<String>,

    #[garde(length(min = 1))]
    pub output_bucket: Option<String>,

    #[garde(length(min = 1))]
    pub output_key: Option<String>,

    #[garde(length(min = 1))]
    pub process_id: Option<String>,
}

fn required(value: Option<String>, field: &'static str) -> Result<String, MessageError> {
    value.ok_or(MessageError::MissingField(field))
}

/// A job message that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub job_id: String,
    pub input: ObjectLocation,
    pub output: ObjectLocation,
    pub output_format: OutputFormat,
    pub process_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("message body is not a job record: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("job record failed validation: {0}")]
    Invalid(#[from] garde::Report),

    #[error("job record is missing {0}")]
    MissingField(&'static str),

    #[error("unsupported output key {0:?}")]
    UnsupportedOutput(String),
}

/// A message that cannot be processed, with the job id when one was readable.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct RejectedJob {
    pub job_id: Option<String>,
    #[source]
    pub error: MessageError,
}

impl JobRequest {
    /// Decode and validate a raw queue message body.
    pub fn parse(body: &str) -> Result<Self, RejectedJob> {
        let raw: JobMessageBody = serde_json::from_str(body).map_err(|e| RejectedJob {
            job_id: salvage_job_id(body),
            error: MessageError::Malformed(e),
        })?;

        if let Err(report) = raw.validate() {
            return Err(RejectedJob {
                job_id: raw.job_id.filter(|id| !id.is_empty()),
                error: MessageError::Invalid(report),
            });
        }

        let job_id = required(raw.job_id, "job_id")
            .map_err(|error| RejectedJob { job_id: None, error })?;
        let rejected = |error: MessageError| RejectedJob {
            job_id: Some(job_id.clone()),
            error,
        };

        let input_bucket = required(raw.input_bucket, "input_bucket").map_err(&rejected)?;
        let input_key = required(raw.input_key, "input_key").map_err(&rejected)?;
        let output_bucket = required(raw.output_bucket, "output_bucket").map_err(&rejected)?;
        let output_key = required(raw.output_key, "output_key").map_err(&rejected)?;
        let process_id = required(raw.process_id, "process_id").map_err(&rejected)?;

        let output_format = OutputFormat::from_key(&output_key)
            .ok_or_else(|| rejected(MessageError::UnsupportedOutput(output_key.clone())))?;

        Ok(Self {
            job_id,
            input: ObjectLocation::new(input_bucket, input_key),
            output: ObjectLocation::new(output_bucket, output_key),
            output_format,
            process_id,
        })
    }
}

/// Best-effort read of `job_id` from a body that does not fit the schema.
fn salvage_job_id(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("job_id")?
        .as_str()
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
}
