use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use flate2::write::GzEncoder;
use serde::Serialize;

use crate::assets::IMAGES_DIR;
use crate::normalize::CanonicalRecord;

pub const JSON_DIR: &str = "json";
pub const INDEX_FILE: &str = "master_index.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Compression {
    #[default]
    #[value(name = "none")]
    Plain,
    Gzip,
}

impl Compression {
    pub fn file_name(self, base: &str) -> String {
        match self {
            Compression::Plain => base.to_string(),
            Compression::Gzip => format!("{}.gz", base),
        }
    }
}

// ── Run index ──

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChapterSummary {
    pub exam: String,
    pub exam_id: String,
    pub subject: String,
    pub subject_id: String,
    pub chapter: String,
    pub chapter_id: String,
    pub total_questions: usize,
    pub file: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunIndex {
    pub total_exams: usize,
    pub total_subjects: usize,
    pub total_chapters: usize,
    pub processed_chapters: usize,
    pub total_questions: usize,
    pub generated_at: DateTime<Utc>,
    pub chapters: Vec<ChapterSummary>,
}

// ── Writers ──

enum Stream {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Stream::Plain(w) => w.write(buf),
            Stream::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Plain(w) => w.flush(),
            Stream::Gzip(w) => w.flush(),
        }
    }
}

impl Stream {
    fn create(path: &Path, compression: Compression) -> Result<Self> {
        let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
        let buffered = BufWriter::new(file);
        Ok(match compression {
            Compression::Plain => Stream::Plain(buffered),
            Compression::Gzip => {
                Stream::Gzip(GzEncoder::new(buffered, flate2::Compression::default()))
            }
        })
    }

    /// Flush everything and write the gzip trailer.
    fn finish(self) -> std::io::Result<()> {
        match self {
            Stream::Plain(mut w) => w.flush(),
            Stream::Gzip(w) => w.finish()?.flush(),
        }
    }
}

/// Append-only JSONL writer for one chapter.
///
/// Dropping it without `finish` still flushes what was written (both
/// `BufWriter` and `GzEncoder` finish on drop), so no file is left open.
pub struct ChapterWriter {
    stream: Stream,
    path: PathBuf,
    file_name: String,
    lines: usize,
}

impl ChapterWriter {
    /// Write one record as one line. Returns the serialized JSON.
    pub fn append(&mut self, record: &CanonicalRecord) -> Result<String> {
        let json = serde_json::to_string(record).context("Failed to serialize record")?;
        let mut line = Vec::with_capacity(json.len() + 1);
        line.extend_from_slice(json.as_bytes());
        line.push(b'\n');
        self.stream
            .write_all(&line)
            .with_context(|| format!("Failed to write {}", self.file_name))?;
        self.lines += 1;
        Ok(json)
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lines(&self) -> usize {
        self.lines
    }

    pub fn finish(self) -> Result<()> {
        let name = self.file_name;
        self.stream
            .finish()
            .with_context(|| format!("Failed to close {}", name))
    }

    /// Close and delete the file. Used when nothing made it into the chapter.
    pub fn discard(self) -> Result<()> {
        let ChapterWriter { stream, path, .. } = self;
        drop(stream);
        std::fs::remove_file(&path).with_context(|| format!("Failed to remove {:?}", path))
    }
}

/// Catalog ids end up in file and directory names; refuse anything that could
/// leave the output tree.
fn check_path_segment(id: &str) -> Result<()> {
    if id.is_empty() || id == "." || id.contains("..") || id.contains(['/', '\\']) {
        bail!("Unsafe id for a file name: {:?}", id);
    }
    Ok(())
}

/// Output tree: `{root}/json/*.jsonl[.gz]`, `{root}/images/`, `{root}/master_index.json[.gz]`.
#[derive(Debug, Clone)]
pub struct OutputDir {
    root: PathBuf,
    compression: Compression,
}

impl OutputDir {
    pub fn create(root: &Path, compression: Compression) -> Result<Self> {
        for dir in [root.to_path_buf(), root.join(JSON_DIR), root.join(IMAGES_DIR)] {
            std::fs::create_dir_all(&dir).with_context(|| format!("Failed to create {:?}", dir))?;
        }
        Ok(OutputDir {
            root: root.to_path_buf(),
            compression,
        })
    }

    /// Open (truncating) the stream for one chapter.
    pub fn open_chapter(&self, exam_id: &str, subject_id: &str, chapter_id: &str) -> Result<ChapterWriter> {
        for id in [exam_id, subject_id, chapter_id] {
            check_path_segment(id)?;
        }
        let base = format!("{}_{}_{}.jsonl", exam_id, subject_id, chapter_id);
        let file_name = self.compression.file_name(&base);
        let path = self.root.join(JSON_DIR).join(&file_name);
        Ok(ChapterWriter {
            stream: Stream::create(&path, self.compression)?,
            path,
            file_name,
            lines: 0,
        })
    }

    pub fn write_index(&self, index: &RunIndex) -> Result<PathBuf> {
        let path = self.root.join(self.compression.file_name(INDEX_FILE));
        let mut stream = Stream::create(&path, self.compression)?;
        serde_json::to_writer_pretty(&mut stream, index)?;
        stream
            .finish()
            .with_context(|| format!("Failed to close {:?}", path))?;
        Ok(path)
    }
}
