use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Args, ValueEnum};

use crate::assets::{ImageStore, LocalStore, S3Store};
use crate::catalog::DEFAULT_BASE_URL;
use crate::output::Compression;
use crate::progress::Limits;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ImageBackend {
    #[default]
    Local,
    S3,
}

/// Settings for a crawl. Every flag can also come from its environment variable.
#[derive(Debug, Clone, Args)]
pub struct RunSettings {
    /// Bearer token for the catalog API
    #[arg(long, env = "GETMARKS_AUTH_TOKEN", hide_env_values = true)]
    pub auth_token: String,

    #[arg(long, env = "CATALOG_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    /// Root for json/, images/ and the master index
    #[arg(long, env = "OUTPUT_DIR", default_value = "getmarks_data")]
    pub output_dir: PathBuf,

    #[arg(long, env = "IMAGE_BACKEND", value_enum, default_value_t = ImageBackend::Local)]
    pub image_backend: ImageBackend,

    /// Required when the image backend is s3
    #[arg(long, env = "S3_BUCKET")]
    pub s3_bucket: Option<String>,

    #[arg(long, env = "S3_PREFIX", default_value = "getmarks")]
    pub s3_prefix: String,

    #[arg(long, env = "S3_REGION")]
    pub s3_region: Option<String>,

    #[arg(long, env = "OUTPUT_COMPRESSION", value_enum, default_value_t = Compression::Plain)]
    pub output_compression: Compression,

    /// Enables the database sink (sqlite://PATH, sqlite:PATH or a bare path)
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Only crawl this exam
    #[arg(long, env = "EXAM_ID")]
    pub exam_id: Option<String>,

    /// Only crawl this subject
    #[arg(long, env = "SUBJECT_ID")]
    pub subject_id: Option<String>,

    /// Only crawl this chapter
    #[arg(long, env = "CHAPTER_ID")]
    pub chapter_id: Option<String>,

    /// Stop after this many chapters (0 = no limit)
    #[arg(long, env = "MAX_CHAPTERS", default_value_t = 0)]
    pub max_chapters: usize,

    /// Stop after this many questions (0 = no limit)
    #[arg(long, env = "MAX_QUESTIONS", default_value_t = 0)]
    pub max_questions: usize,

    /// Chapters processed in parallel
    #[arg(long, env = "CONCURRENCY", default_value_t = 4, value_parser = clap::value_parser!(u16).range(1..))]
    pub concurrency: u16,
}

/// Single-id allow-lists, one per level. `None` lets everything through.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filters {
    pub exam_id: Option<String>,
    pub subject_id: Option<String>,
    pub chapter_id: Option<String>,
}

fn non_empty(v: &Option<String>) -> Option<String> {
    v.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl RunSettings {
    pub fn filters(&self) -> Filters {
        Filters {
            exam_id: non_empty(&self.exam_id),
            subject_id: non_empty(&self.subject_id),
            chapter_id: non_empty(&self.chapter_id),
        }
    }

    pub fn limits(&self) -> Limits {
        Limits::from_raw(self.max_chapters, self.max_questions)
    }

    /// Fail fast on settings that cannot work, before any request is made.
    pub fn validate(&self) -> Result<()> {
        if self.auth_token.trim().is_empty() {
            bail!("GETMARKS_AUTH_TOKEN is required");
        }
        if self.image_backend == ImageBackend::S3 && non_empty(&self.s3_bucket).is_none() {
            bail!("S3_BUCKET is required for IMAGE_BACKEND=s3");
        }
        if let Some(url) = non_empty(&self.database_url) {
            crate::db::sqlite_path(&url)?;
        }
        Ok(())
    }

    /// Build the image backend chosen for this run.
    pub async fn image_store(&self) -> Result<Arc<dyn ImageStore>> {
        Ok(match self.image_backend {
            ImageBackend::Local => Arc::new(LocalStore::new(&self.output_dir)),
            ImageBackend::S3 => {
                let Some(bucket) = non_empty(&self.s3_bucket) else {
                    bail!("S3_BUCKET is required for IMAGE_BACKEND=s3");
                };
                Arc::new(
                    S3Store::connect(&bucket, &self.s3_prefix, non_empty(&self.s3_region).as_deref())
                        .await?,
                )
            }
        })
    }

    pub fn database_url(&self) -> Option<String> {
        non_empty(&self.database_url)
    }
}
