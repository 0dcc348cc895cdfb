//! Two-tier image storage: remote object store first, local disk on failure.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use thiserror::Error;
use tracing::{debug, error, instrument, warn};
use url::Url;

use crate::image_processing::{sniff_content_type, sniff_extension};
use crate::model::{DetectionId, StorageReference};

pub const DEFAULT_REMOTE_FOLDER: &str = "pest_detection";
pub const DEFAULT_UPLOAD_ROOT: &str = "static/uploads";
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid store url: {0}")]
    InvalidUrl(String),

    #[error("remote store rejected upload with status {status}")]
    Rejected { status: u16 },

    #[error("remote store request failed: {0}")]
    Transport(String),

    #[error("remote store timed out after {0:?}")]
    Timeout(Duration),

    #[error("local write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("local write task aborted")]
    Aborted,
}

impl From<reqwest::Error> for StorageError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            StorageError::Transport("request timed out".into())
        } else {
            StorageError::Transport(e.without_url().to_string())
        }
    }
}

/// Primary object store. Returns the absolute public URL of the stored object.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(
        &self,
        key: &str,
        bytes: Arc<[u8]>,
        content_type: &str,
    ) -> Result<String, StorageError>;
}

// ============================================================================
// HTTP object store
// ============================================================================

/// PUTs objects to `<endpoint>/<key>` and serves them from `<public_base_url>/<key>`.
pub struct HttpObjectStore {
    client: reqwest::Client,
    endpoint: Url,
    public_base_url: Url,
    token: Option<String>,
}

impl HttpObjectStore {
    pub fn new(
        endpoint: &str,
        public_base_url: &str,
        token: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, StorageError> {
        let endpoint = parse_base(endpoint)?;
        let public_base_url = parse_base(public_base_url)?;
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| StorageError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            public_base_url,
            token,
        })
    }
}

fn parse_base(raw: &str) -> Result<Url, StorageError> {
    let url = Url::parse(raw).map_err(|e| StorageError::InvalidUrl(format!("{raw}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") || url.cannot_be_a_base() {
        return Err(StorageError::InvalidUrl(raw.to_string()));
    }
    Ok(url)
}

fn object_url(base: &Url, key: &str) -> Result<Url, StorageError> {
    let joined = format!("{}/{}", base.as_str().trim_end_matches('/'), key);
    Url::parse(&joined).map_err(|e| StorageError::InvalidUrl(format!("{joined}: {e}")))
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    async fn put(
        &self,
        key: &str,
        bytes: Arc<[u8]>,
        content_type: &str,
    ) -> Result<String, StorageError> {
        let target = object_url(&self.endpoint, key)?;

        let mut request = self
            .client
            .put(target)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes.to_vec());
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StorageError::Rejected {
                status: status.as_u16(),
            });
        }

        Ok(object_url(&self.public_base_url, key)?.to_string())
    }
}

// ============================================================================
// Local uploads
// ============================================================================

#[derive(Clone, Debug)]
pub struct LocalUploadStore {
    root: PathBuf,
}

impl LocalUploadStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem location of a reference returned by [`Self::write`].
    pub fn resolve(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.root.join(relative)
    }

    /// Writes `file_name` under the root through a temp file and rename.
    /// Returns `file_name`, the path relative to the root.
    pub async fn write(&self, file_name: &str, bytes: Arc<[u8]>) -> Result<String, StorageError> {
        let path = self.root.join(file_name);
        let tmp_path = self.root.join(format!(".{file_name}.tmp"));

        tokio::task::spawn_blocking(move || write_atomic(&path, &tmp_path, &bytes))
            .await
            .map_err(|_| StorageError::Aborted)??;

        Ok(file_name.to_string())
    }
}

fn write_atomic(path: &Path, tmp_path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = File::create(tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;

    std::fs::rename(tmp_path, path)?;

    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}

// ============================================================================
// Tiered store
// ============================================================================

pub struct TieredImageStore {
    remote: Option<Arc<dyn ObjectStore>>,
    remote_folder: String,
    remote_timeout: Duration,
    local: LocalUploadStore,
}

impl TieredImageStore {
    pub fn new(
        remote: Option<Arc<dyn ObjectStore>>,
        remote_folder: impl Into<String>,
        remote_timeout: Duration,
        local: LocalUploadStore,
    ) -> Self {
        Self {
            remote,
            remote_folder: remote_folder.into(),
            remote_timeout,
            local,
        }
    }

    /// Local-only store, used when no remote endpoint is configured.
    pub fn local_only(local: LocalUploadStore) -> Self {
        Self::new(None, DEFAULT_REMOTE_FOLDER, DEFAULT_REMOTE_TIMEOUT, local)
    }

    /// Never fails: the worst outcome is `StorageReference::None`.
    #[instrument(skip(self, bytes), fields(detection_id = %id, size = bytes.len()))]
    pub async fn store(&self, id: &DetectionId, bytes: Arc<[u8]>) -> StorageReference {
        let file_name = format!("{id}.{}", sniff_extension(&bytes));

        match &self.remote {
            Some(remote) => {
                let key = format!("{}/{file_name}", self.remote_folder.trim_matches('/'));
                let content_type = sniff_content_type(&bytes);
                let attempt = tokio::time::timeout(
                    self.remote_timeout,
                    remote.put(&key, Arc::clone(&bytes), content_type),
                )
                .await
                .unwrap_or(Err(StorageError::Timeout(self.remote_timeout)));

                match attempt {
                    Ok(url) => {
                        counter!("storage.remote.stored").increment(1);
                        return StorageReference::Remote { url };
                    }
                    Err(e) => {
                        counter!("storage.remote.failures").increment(1);
                        warn!(error = %e, "remote image write failed, falling back to local");
                    }
                }
            }
            None => debug!("no remote store configured"),
        }

        match self.local.write(&file_name, bytes).await {
            Ok(path) => {
                counter!("storage.local.stored").increment(1);
                StorageReference::Local { path }
            }
            Err(e) => {
                counter!("storage.local.failures").increment(1);
                error!(error = %e, "local image write failed, keeping detection without image");
                StorageReference::None
            }
        }
    }
}
