use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, Context, Result};
use rusqlite::Connection;

pub const DEFAULT_DB_PATH: &str = "data/getmarks.sqlite";

/// Questions are sent to the database in batches of this size.
pub const BATCH_SIZE: usize = 500;

/// Map a `DATABASE_URL` onto a SQLite path. Other schemes have no driver here.
pub fn sqlite_path(url: &str) -> Result<&str> {
    if let Some(rest) = url.strip_prefix("sqlite://") {
        return Ok(rest);
    }
    if let Some(rest) = url.strip_prefix("sqlite:") {
        return Ok(rest);
    }
    if let Some(scheme) = url_scheme(url) {
        bail!("No database driver for '{}' (only sqlite is supported)", scheme);
    }
    Ok(url)
}

/// `scheme` of a `scheme:rest` URL. A single letter is a Windows drive, not a scheme.
fn url_scheme(url: &str) -> Option<&str> {
    let (scheme, _) = url.split_once(':')?;
    let mut chars = scheme.chars();
    let first = chars.next()?;
    let valid = first.is_ascii_alphabetic()
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    (valid && scheme.len() > 1).then_some(scheme)
}

pub fn connect(url: &str) -> Result<Connection> {
    let path = sqlite_path(url)?;
    if path.is_empty() {
        bail!("DATABASE_URL has no path: {}", url);
    }
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("Failed to create {:?}", parent))?;
    }
    let conn = Connection::open(path).with_context(|| format!("Failed to open database {}", path))?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS subgroup_summaries (
            collection_id   TEXT NOT NULL,
            group_id        TEXT NOT NULL,
            subgroup_id     TEXT NOT NULL,
            collection_name TEXT NOT NULL,
            group_name      TEXT NOT NULL,
            subgroup_name   TEXT NOT NULL,
            item_count      INTEGER NOT NULL,
            created_at      TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (collection_id, group_id, subgroup_id)
        );

        CREATE TABLE IF NOT EXISTS items (
            collection_id TEXT NOT NULL,
            group_id      TEXT NOT NULL,
            subgroup_id   TEXT NOT NULL,
            item_index    INTEGER NOT NULL,
            payload_json  TEXT NOT NULL,
            created_at    TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (collection_id, group_id, subgroup_id, item_index)
        );
        ",
    )?;
    Ok(())
}

// ── Rows ──

pub struct QuestionRow {
    pub exam_id: String,
    pub subject_id: String,
    pub chapter_id: String,
    pub index: usize,
    pub payload: String,
}

pub struct ChapterRow {
    pub exam_id: String,
    pub subject_id: String,
    pub chapter_id: String,
    pub exam_name: String,
    pub subject_name: String,
    pub chapter_name: String,
    pub question_count: usize,
}

/// Shared handle to the relational sink.
///
/// The connection sits behind a mutex: each batch runs in its own transaction
/// and never interleaves with another chapter's. Clones share the connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open the database and create the schema if it is missing.
    pub fn open(url: &str) -> Result<Self> {
        Self::from_connection(connect(url)?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self> {
        init_schema(&conn)?;
        Ok(Database {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or refresh a batch of questions keyed by (exam, subject, chapter, index).
    pub fn upsert_questions(&self, rows: &[QuestionRow]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO items (collection_id, group_id, subgroup_id, item_index, payload_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (collection_id, group_id, subgroup_id, item_index)
                 DO UPDATE SET payload_json = excluded.payload_json",
            )?;
            for r in rows {
                count += stmt.execute(rusqlite::params![
                    r.exam_id, r.subject_id, r.chapter_id, r.index as i64, r.payload,
                ])?;
            }
        }
        tx.commit()?;
        Ok(count)
    }

    pub fn upsert_chapter(&self, row: &ChapterRow) -> Result<()> {
        self.lock().execute(
            "INSERT INTO subgroup_summaries
             (collection_id, group_id, subgroup_id, collection_name, group_name, subgroup_name, item_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (collection_id, group_id, subgroup_id)
             DO UPDATE SET collection_name = excluded.collection_name,
                           group_name = excluded.group_name,
                           subgroup_name = excluded.subgroup_name,
                           item_count = excluded.item_count",
            rusqlite::params![
                row.exam_id,
                row.subject_id,
                row.chapter_id,
                row.exam_name,
                row.subject_name,
                row.chapter_name,
                row.question_count as i64,
            ],
        )?;
        Ok(())
    }

    pub fn stats(&self) -> Result<Stats> {
        get_stats(&self.lock())
    }
}

// ── Stats ──

pub struct ExamStats {
    pub exam_id: String,
    pub exam_name: String,
    pub chapters: usize,
    pub questions: usize,
}

pub struct Stats {
    pub chapters: usize,
    pub questions: usize,
    pub recorded_questions: usize,
    pub exams: Vec<ExamStats>,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let chapters: usize =
        conn.query_row("SELECT COUNT(*) FROM subgroup_summaries", [], |r| r.get(0))?;
    let questions: usize = conn.query_row("SELECT COUNT(*) FROM items", [], |r| r.get(0))?;
    let recorded_questions: usize = conn.query_row(
        "SELECT COALESCE(SUM(item_count), 0) FROM subgroup_summaries",
        [],
        |r| r.get(0),
    )?;

    let mut stmt = conn.prepare(
        "SELECT collection_id, MAX(collection_name), COUNT(*), SUM(item_count)
         FROM subgroup_summaries
         GROUP BY collection_id
         ORDER BY collection_id",
    )?;
    let exams = stmt
        .query_map([], |row| {
            Ok(ExamStats {
                exam_id: row.get(0)?,
                exam_name: row.get(1)?,
                chapters: row.get(2)?,
                questions: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Stats {
        chapters,
        questions,
        recorded_questions,
        exams,
    })
}
