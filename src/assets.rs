use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use sha1::{Digest, Sha1};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
pub const IMAGES_DIR: &str = "images";

pub type AssetStream = BoxStream<'static, reqwest::Result<Bytes>>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("download interrupted: {0}")]
    Transfer(#[from] reqwest::Error),
    #[error("upload failed: {0}")]
    Upload(String),
}

/// Destination for fetched images. `put` returns the locator recorded in the
/// canonical record.
#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn put(&self, key: &str, body: AssetStream) -> Result<String, StoreError>;
}

// ── Local filesystem ──

/// Writes under `{root}/images/` and hands back paths relative to `root`.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: &Path) -> Self {
        LocalStore {
            root: root.to_path_buf(),
        }
    }
}

#[async_trait]
impl ImageStore for LocalStore {
    async fn put(&self, key: &str, mut body: AssetStream) -> Result<String, StoreError> {
        let relative = format!("{}/{}", IMAGES_DIR, key);
        let path = self.root.join(&relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::File::create(&path).await?;
        let written: Result<(), StoreError> = async {
            while let Some(chunk) = body.next().await {
                file.write_all(&chunk?).await?;
            }
            file.flush().await?;
            Ok(())
        }
        .await;

        if let Err(e) = written {
            drop(file);
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e);
        }
        Ok(relative)
    }
}

// ── S3 ──

pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
    region: Option<String>,
}

impl S3Store {
    /// Build a client from the default AWS credential chain.
    pub async fn connect(bucket: &str, prefix: &str, region: Option<&str>) -> Result<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(r) = region {
            loader = loader.region(aws_config::Region::new(r.to_string()));
        }
        let cfg = loader.load().await;
        let client = aws_sdk_s3::Client::new(&cfg);
        Ok(S3Store {
            client,
            bucket: bucket.to_string(),
            prefix: prefix.trim_matches('/').to_string(),
            region: region.map(str::to_string),
        })
    }

    fn object_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix, key)
        }
    }

    fn object_url(&self, key: &str) -> String {
        s3_url(&self.bucket, self.region.as_deref(), key)
    }
}

fn s3_url(bucket: &str, region: Option<&str>, key: &str) -> String {
    match region {
        Some(r) => format!("https://{}.s3.{}.amazonaws.com/{}", bucket, r, key),
        None => format!("s3://{}/{}", bucket, key),
    }
}

#[async_trait]
impl ImageStore for S3Store {
    async fn put(&self, key: &str, body: AssetStream) -> Result<String, StoreError> {
        let chunks: Vec<Bytes> = body.try_collect().await?;
        let bytes = chunks.concat();
        let object_key = self.object_key(key);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .body(aws_sdk_s3::primitives::ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| StoreError::Upload(format!("{:?}", e)))?;

        Ok(self.object_url(&object_key))
    }
}

// ── Resolver ──

/// Where an image lands: directory plus file-name prefix, e.g.
/// `("jee/phy/kin", "opt2_0007")`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetSlot {
    pub dir: String,
    pub stem: String,
}

/// Fetches remote images and stores them under content-addressed names.
pub struct AssetResolver {
    http: reqwest::Client,
    store: Arc<dyn ImageStore>,
}

impl AssetResolver {
    pub fn new(store: Arc<dyn ImageStore>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .context("Failed to build image HTTP client")?;
        Ok(AssetResolver { http, store })
    }

    /// Download `url` and store it. Never fails: any problem is logged and
    /// yields `None`, as does an empty or root-relative reference.
    pub async fn resolve(&self, url: &str, slot: &AssetSlot) -> Option<String> {
        if url.is_empty() || url.starts_with('/') {
            return None;
        }

        let response = match self.http.get(url).send().await.and_then(|r| r.error_for_status()) {
            Ok(r) => r,
            Err(e) => {
                warn!("Failed to fetch image {}: {}", url, e);
                return None;
            }
        };

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let key = asset_key(url, slot, content_type.as_deref());

        match self.store.put(&key, response.bytes_stream().boxed()).await {
            Ok(locator) => {
                debug!("Stored {} as {}", url, locator);
                Some(locator)
            }
            Err(e) => {
                warn!("Failed to store image {}: {}", url, e);
                None
            }
        }
    }
}

/// Stable storage key for an image: `{dir}/{stem}_{sha1(url)}{ext}`.
pub fn asset_key(url: &str, slot: &AssetSlot, content_type: Option<&str>) -> String {
    format!(
        "{}/{}_{}{}",
        slot.dir,
        slot.stem,
        url_hash(url),
        file_extension(url, content_type)
    )
}

pub fn url_hash(url: &str) -> String {
    hex::encode(Sha1::digest(url.as_bytes()))
}

/// Extension from the URL path, else from the content type, else `.jpg`.
pub fn file_extension(url: &str, content_type: Option<&str>) -> String {
    let path = match reqwest::Url::parse(url) {
        Ok(u) => u.path().to_string(),
        Err(_) => url.split(['?', '#']).next().unwrap_or("").to_string(),
    };
    let file_name = path.rsplit('/').next().unwrap_or("");
    if let Some((stem, ext)) = file_name.rsplit_once('.') {
        if !stem.is_empty() && !ext.is_empty() {
            return format!(".{}", ext.to_lowercase());
        }
    }

    match content_type {
        Some(ct) if ct.contains("image/png") => ".png",
        Some(ct) if ct.contains("image/jpeg") || ct.contains("image/jpg") => ".jpg",
        Some(ct) if ct.contains("image/webp") => ".webp",
        Some(ct) if ct.contains("image/svg") => ".svg",
        _ => ".jpg",
    }
    .to_string()
}
