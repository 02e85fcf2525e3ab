use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};

use crate::models::job::ObjectLocation;

/// Byte storage addressed by (bucket, key).
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object. `Ok(None)` means the object exists but has no body.
    async fn get(&self, location: &ObjectLocation) -> Result<Option<Vec<u8>>, StorageError>;

    async fn put(
        &self,
        location: &ObjectLocation,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError>;
}

/// Connection settings for an S3-compatible store.
#[derive(Debug, Clone)]
pub struct S3Settings {
    pub region: String,
    /// Custom endpoint (LocalStack, MinIO, R2). AWS is used when unset.
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub path_style: bool,
}

impl S3Settings {
    fn endpoint(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://s3.{}.amazonaws.com", self.region),
        }
    }
}

/// Client for S3-compatible object storage.
///
/// Jobs name their own buckets, so a bucket handle is built per request from
/// the shared region and credentials.
pub struct S3Storage {
    region: Region,
    credentials: Credentials,
    path_style: bool,
}

impl S3Storage {
    pub fn new(settings: &S3Settings) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: settings.region.clone(),
            endpoint: settings.endpoint(),
        };

        let credentials = match (&settings.access_key, &settings.secret_key) {
            (Some(access_key), Some(secret_key)) => Credentials::new(
                Some(access_key.as_str()),
                Some(secret_key.as_str()),
                None,
                None,
                None,
            ),
            _ => Credentials::default(),
        }
        .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self {
            region,
            credentials,
            path_style: settings.path_style,
        })
    }

    fn bucket(&self, name: &str) -> Result<Box<Bucket>, StorageError> {
        let bucket = Bucket::new(name, self.region.clone(), self.credentials.clone())
            .map_err(StorageError::S3)?;
        Ok(if self.path_style {
            bucket.with_path_style()
        } else {
            bucket
        })
    }

    /// Delete an object.
    pub async fn delete(&self, location: &ObjectLocation) -> Result<(), StorageError> {
        let bucket = self.bucket(&location.bucket)?;
        let response = bucket.delete_object(&location.key).await?;
        check_status(response.status_code(), location)
    }
}

fn check_status(code: u16, location: &ObjectLocation) -> Result<(), StorageError> {
    match code {
        200..=299 => Ok(()),
        404 => Err(StorageError::NotFound(location.clone())),
        code => Err(StorageError::Status {
            code,
            location: location.clone(),
        }),
    }
}

#[async_trait]
impl ObjectStore for S3Storage {
    async fn get(&self, location: &ObjectLocation) -> Result<Option<Vec<u8>>, StorageError> {
        let bucket = self.bucket(&location.bucket)?;
        let response = bucket.get_object(&location.key).await?;
        check_status(response.status_code(), location)?;

        let data = response.bytes().to_vec();
        Ok((!data.is_empty()).then_some(data))
    }

    async fn put(
        &self,
        location: &ObjectLocation,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError> {
        let bucket = self.bucket(&location.bucket)?;
        let response = bucket
            .put_object_with_content_type(&location.key, data, content_type)
            .await?;
        check_status(response.status_code(), location)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Object {0} not found")]
    NotFound(ObjectLocation),

    #[error("S3 returned HTTP {code} for {location}")]
    Status { code: u16, location: ObjectLocation },

    #[error("Storage configuration error: {0}")]
    Config(String),
}
