//! Object-storage download and local staging for bulk-upload files.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bulkup_core::{BucketLocation, FileReference};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::{StatusCode, Url};
use tempfile::TempPath;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "bulkup-storage";

pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Result of a `GetObject` call. `body` is `None` when the store answered
/// without content.
pub struct ObjectResponse {
    pub content_length: Option<u64>,
    pub body: Option<ByteStream>,
}

impl std::fmt::Debug for ObjectResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectResponse")
            .field("content_length", &self.content_length)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ObjectStorageError {
    #[error("building object storage client for {endpoint}")]
    Client {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("invalid object storage endpoint `{0}`")]
    InvalidEndpoint(String),
    #[error("object storage request failed")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn get_object(
        &self,
        location: &BucketLocation,
        key: &str,
    ) -> Result<ObjectResponse, ObjectStorageError>;
}

#[derive(Debug, Clone)]
pub struct ObjectStorageConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for ObjectStorageConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    endpoint: String,
    region: String,
}

/// HTTP client bound to one storage endpoint and region.
#[derive(Debug)]
pub struct ObjectStorageClient {
    client: reqwest::Client,
    endpoint: Url,
    region: String,
}

impl ObjectStorageClient {
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Path-style object URL: `{endpoint}/{bucket}/{key}`.
    pub fn object_url(&self, bucket: &str, key: &str) -> Result<Url, ObjectStorageError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| ObjectStorageError::InvalidEndpoint(self.endpoint.to_string()))?
            .pop_if_empty()
            .push(bucket)
            .extend(key.split('/'));
        Ok(url)
    }

    pub async fn get_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<ObjectResponse, ObjectStorageError> {
        let url = self.object_url(bucket, key)?;
        let resp = self.client.get(url.clone()).send().await?;
        let status = resp.status();

        if !status.is_success() {
            return Err(ObjectStorageError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        if status == StatusCode::NO_CONTENT {
            return Ok(ObjectResponse {
                content_length: Some(0),
                body: None,
            });
        }

        let content_length = resp.content_length();
        let body = resp.bytes_stream().map_err(io::Error::other).boxed();
        Ok(ObjectResponse {
            content_length,
            body: Some(body),
        })
    }
}

/// Long-lived pool of storage clients keyed by `(endpoint, region)`.
#[derive(Debug)]
pub struct ObjectStorageClientPool {
    config: ObjectStorageConfig,
    clients: Mutex<HashMap<ClientKey, Arc<ObjectStorageClient>>>,
}

impl ObjectStorageClientPool {
    pub fn new(config: ObjectStorageConfig) -> Self {
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub async fn client_for(
        &self,
        location: &BucketLocation,
    ) -> Result<Arc<ObjectStorageClient>, ObjectStorageError> {
        let key = ClientKey {
            endpoint: location.endpoint.clone(),
            region: location.region.clone(),
        };
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let client = Arc::new(self.build_client(location)?);
        clients.insert(key, client.clone());
        Ok(client)
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn build_client(&self, location: &BucketLocation) -> Result<ObjectStorageClient, ObjectStorageError> {
        let endpoint = Url::parse(&location.endpoint)
            .map_err(|_| ObjectStorageError::InvalidEndpoint(location.endpoint.clone()))?;

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(self.config.timeout);
        if let Some(user_agent) = &self.config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().map_err(|source| ObjectStorageError::Client {
            endpoint: location.endpoint.clone(),
            source,
        })?;

        Ok(ObjectStorageClient {
            client,
            endpoint,
            region: location.region.clone(),
        })
    }
}

#[async_trait]
impl ObjectStorage for ObjectStorageClientPool {
    async fn get_object(
        &self,
        location: &BucketLocation,
        key: &str,
    ) -> Result<ObjectResponse, ObjectStorageError> {
        let client = self.client_for(location).await?;
        client.get_object(&location.name, key).await
    }
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("fetching {bucket}/{key} failed")]
    Fetch {
        bucket: String,
        key: String,
        #[source]
        source: ObjectStorageError,
    },
    #[error("object {bucket}/{key} returned no body")]
    MissingBody { bucket: String, key: String },
    #[error("reading body of {bucket}/{key} failed")]
    Body {
        bucket: String,
        key: String,
        #[source]
        source: io::Error,
    },
    #[error("writing staged file failed")]
    Local(#[source] io::Error),
}

/// Local copy of a downloaded object. Dropping it removes the file; call
/// [`StagedFile::cleanup`] to observe removal errors.
#[derive(Debug)]
pub struct StagedFile {
    path: TempPath,
    byte_size: u64,
}

impl StagedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    pub fn open(&self) -> io::Result<std::fs::File> {
        std::fs::File::open(&self.path)
    }

    pub fn cleanup(self) -> io::Result<()> {
        self.path.close()
    }
}

/// Downloads task files into a scratch directory.
#[derive(Clone)]
pub struct FileStager {
    storage: Arc<dyn ObjectStorage>,
    staging_dir: PathBuf,
}

impl FileStager {
    pub fn new(storage: Arc<dyn ObjectStorage>, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage,
            staging_dir: staging_dir.into(),
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub async fn stage(&self, file: &FileReference) -> Result<StagedFile, DownloadError> {
        let span = info_span!(
            "object_fetch",
            bucket = %file.bucket.name,
            region = %file.bucket.region,
            key = %file.storage_key,
        );
        self.stage_inner(file).instrument(span).await
    }

    async fn stage_inner(&self, file: &FileReference) -> Result<StagedFile, DownloadError> {
        let (std_file, path) = tempfile::Builder::new()
            .prefix("bulk-upload-")
            .suffix(".csv")
            .tempfile_in(&self.staging_dir)
            .map_err(DownloadError::Local)?
            .into_parts();

        match self.download_into(file, tokio::fs::File::from_std(std_file)).await {
            Ok(byte_size) => {
                debug!(byte_size, path = %path.display(), "staged object");
                Ok(StagedFile { path, byte_size })
            }
            Err(err) => {
                if let Err(cleanup_err) = path.close() {
                    warn!(error = %cleanup_err, "removing partial staged file failed");
                }
                Err(err)
            }
        }
    }

    async fn download_into(
        &self,
        file: &FileReference,
        mut out: tokio::fs::File,
    ) -> Result<u64, DownloadError> {
        let bucket = &file.bucket.name;
        let key = &file.storage_key;

        let response = self
            .storage
            .get_object(&file.bucket, key)
            .await
            .map_err(|source| DownloadError::Fetch {
                bucket: bucket.clone(),
                key: key.clone(),
                source,
            })?;

        let mut body = response.body.ok_or_else(|| DownloadError::MissingBody {
            bucket: bucket.clone(),
            key: key.clone(),
        })?;

        let mut written = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|source| DownloadError::Body {
                bucket: bucket.clone(),
                key: key.clone(),
                source,
            })?;
            out.write_all(&chunk).await.map_err(DownloadError::Local)?;
            written += chunk.len() as u64;
        }
        out.flush().await.map_err(DownloadError::Local)?;
        out.sync_all().await.map_err(DownloadError::Local)?;

        Ok(written)
    }
}
