use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use indicatif::ProgressBar;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::assets::AssetResolver;
use crate::catalog::{Catalog, Chapter, Exam, Subject};
use crate::config::Filters;
use crate::db::{ChapterRow, Database, QuestionRow, BATCH_SIZE};
use crate::normalize::Normalizer;
use crate::output::{ChapterSummary, ChapterWriter, OutputDir, RunIndex};
use crate::progress::RunTracker;

/// Exams are kept only when their title mentions one of these.
const EXAM_TAGS: &[&str] = &["JEE", "IIT"];

/// Everything a chapter worker needs, shared across tasks.
pub struct Pipeline {
    pub catalog: Arc<dyn Catalog>,
    pub resolver: AssetResolver,
    pub output: OutputDir,
    pub db: Option<Database>,
    pub tracker: RunTracker,
    pub progress: ProgressBar,
}

/// Drives exam → subject → chapter → question traversal.
pub struct Walker {
    pipeline: Arc<Pipeline>,
    filters: Filters,
    semaphore: Arc<Semaphore>,
}

type ChapterTask = JoinHandle<Option<ChapterSummary>>;

pub fn matches_exam_tags(title: &str) -> bool {
    let upper = title.to_uppercase();
    EXAM_TAGS.iter().any(|tag| upper.contains(tag))
}

impl Walker {
    pub fn new(pipeline: Arc<Pipeline>, filters: Filters, concurrency: usize) -> Self {
        Walker {
            pipeline,
            filters,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    pub fn tracker(&self) -> &RunTracker {
        &self.pipeline.tracker
    }

    fn keep_exam(&self, exam: &Exam) -> bool {
        if let Some(id) = &self.filters.exam_id {
            if &exam.id != id {
                return false;
            }
        }
        matches_exam_tags(&exam.name)
    }

    fn keep_subject(&self, subject: &Subject) -> bool {
        self.filters.subject_id.as_ref().map_or(true, |id| &subject.id == id)
    }

    fn keep_chapter(&self, chapter: &Chapter) -> bool {
        self.filters.chapter_id.as_ref().map_or(true, |id| &chapter.id == id)
    }

    fn quota_reached(&self) -> bool {
        let t = &self.pipeline.tracker;
        t.chapter_quota_reached() || t.question_quota_reached()
    }

    /// Walk the whole catalog. Returns `None` when no exam matched.
    pub async fn run(&self) -> Result<Option<RunIndex>> {
        let catalog = &self.pipeline.catalog;
        let tracker = &self.pipeline.tracker;

        let exams: Vec<Exam> = catalog.exams().await.into_iter().filter(|e| self.keep_exam(e)).collect();
        tracker.record_exams(exams.len());
        info!("Found {} exams", exams.len());
        if exams.is_empty() {
            return Ok(None);
        }

        let mut summaries = Vec::new();

        'exams: for exam in &exams {
            info!("Processing exam: {}", exam.name);
            debug!(exam_id = %exam.id, icon = %exam.icon, "exam metadata");

            let subjects: Vec<Subject> =
                catalog.subjects(&exam.id).await.into_iter().filter(|s| self.keep_subject(s)).collect();
            tracker.record_subjects(subjects.len());
            info!("  Found {} subjects", subjects.len());

            for subject in &subjects {
                if self.quota_reached() {
                    break 'exams;
                }
                info!("  Subject: {}", subject.name);
                debug!(subject_id = %subject.id, icon = %subject.icon, "subject metadata");

                let chapters: Vec<Chapter> = catalog
                    .chapters(&exam.id, &subject.id)
                    .await
                    .into_iter()
                    .filter(|c| self.keep_chapter(c))
                    .collect();
                tracker.record_chapters(chapters.len());
                info!("    Found {} chapters", chapters.len());

                let stopped = self.walk_chapters(exam, subject, chapters, &mut summaries).await;
                if stopped {
                    break 'exams;
                }
            }
        }

        let c = tracker.snapshot();
        Ok(Some(RunIndex {
            total_exams: c.exams,
            total_subjects: c.subjects,
            total_chapters: c.chapters,
            processed_chapters: c.processed_chapters,
            total_questions: c.questions,
            generated_at: Utc::now(),
            chapters: summaries,
        }))
    }

    /// Run one subject's chapters on the worker pool. Summaries are appended in
    /// catalog order. Returns true when a quota stopped the walk.
    async fn walk_chapters(
        &self,
        exam: &Exam,
        subject: &Subject,
        chapters: Vec<Chapter>,
        summaries: &mut Vec<ChapterSummary>,
    ) -> bool {
        let tracker = &self.pipeline.tracker;
        let mut pending: Vec<ChapterTask> = Vec::new();
        let mut stopped = false;

        for chapter in chapters {
            if tracker.question_quota_reached() {
                stopped = true;
                break;
            }
            if !tracker.reserve_chapter() {
                // In-flight chapters may come back empty and free their slot.
                drain(&mut pending, summaries).await;
                if tracker.question_quota_reached() || !tracker.reserve_chapter() {
                    stopped = true;
                    break;
                }
            }
            pending.push(self.spawn_chapter(exam.clone(), subject.clone(), chapter));
        }

        drain(&mut pending, summaries).await;
        stopped || self.quota_reached()
    }

    fn spawn_chapter(&self, exam: Exam, subject: Subject, chapter: Chapter) -> ChapterTask {
        let pipeline = Arc::clone(&self.pipeline);
        let semaphore = Arc::clone(&self.semaphore);

        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok()?;
            match process_chapter(&pipeline, &exam, &subject, &chapter).await {
                Ok(Some(summary)) => {
                    pipeline.tracker.finish_chapter();
                    Some(summary)
                }
                Ok(None) => {
                    pipeline.tracker.release_chapter();
                    None
                }
                Err(e) => {
                    error!("Chapter {} ({}) failed: {:#}", chapter.name, chapter.id, e);
                    pipeline.tracker.release_chapter();
                    None
                }
            }
        })
    }
}

async fn drain(pending: &mut Vec<ChapterTask>, summaries: &mut Vec<ChapterSummary>) {
    for handle in pending.drain(..) {
        match handle.await {
            Ok(Some(summary)) => summaries.push(summary),
            Ok(None) => {}
            Err(e) => error!("Chapter task panicked: {}", e),
        }
    }
}

/// Fetch, normalize and persist one chapter.
///
/// `Ok(None)` means nothing was processed: the catalog returned no questions,
/// or the question limit was spent before the first one. No file, no summary.
/// A chapter that fails gives back the questions it claimed and removes its file.
pub async fn process_chapter(
    pipeline: &Pipeline,
    exam: &Exam,
    subject: &Subject,
    chapter: &Chapter,
) -> Result<Option<ChapterSummary>> {
    // Queued behind other workers; the question limit may already be spent.
    if pipeline.tracker.question_quota_reached() {
        return Ok(None);
    }
    info!("    {} ({} questions)", chapter.name, chapter.declared_questions);
    debug!(chapter_id = %chapter.id, icon = ?chapter.icon, "chapter metadata");

    let raw_questions = pipeline.catalog.questions(&exam.id, &subject.id, &chapter.id).await;
    if raw_questions.is_empty() {
        warn!("    No questions found for {}", chapter.name);
        return Ok(None);
    }

    let writer = pipeline.output.open_chapter(&exam.id, &subject.id, &chapter.id)?;
    let path = writer.path().to_path_buf();
    let mut written = 0;

    let result = write_chapter(pipeline, exam, subject, chapter, &raw_questions, writer, &mut written).await;
    if result.is_err() {
        pipeline.tracker.forget_questions(written);
        let pb = &pipeline.progress;
        pb.set_position(pb.position().saturating_sub(written as u64));
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("    Failed to remove {:?}: {}", path, e);
            }
        }
    }
    result
}

async fn write_chapter(
    pipeline: &Pipeline,
    exam: &Exam,
    subject: &Subject,
    chapter: &Chapter,
    raw_questions: &[Value],
    mut writer: ChapterWriter,
    written: &mut usize,
) -> Result<Option<ChapterSummary>> {
    let normalizer = Normalizer::new(&pipeline.resolver);
    let image_dir = format!("{}/{}/{}", exam.id, subject.id, chapter.id);
    let mut batch: Vec<QuestionRow> = Vec::new();
    let mut claimed_any = false;

    for (idx, raw) in raw_questions.iter().enumerate() {
        if !pipeline.tracker.claim_question() {
            info!("    Question limit reached, stopping {}", chapter.name);
            break;
        }
        claimed_any = true;

        let record = match normalizer.normalize(raw, idx, &image_dir).await {
            Ok(r) => r,
            Err(e) => {
                pipeline.tracker.release_question();
                warn!("    Failed to process question {}: {}", idx, e);
                continue;
            }
        };

        let payload = match writer.append(&record) {
            Ok(json) => json,
            Err(e) => {
                pipeline.tracker.release_question();
                warn!("    Failed to save question {}: {:#}", idx, e);
                continue;
            }
        };
        *written += 1;
        pipeline.progress.inc(1);

        if let Some(db) = &pipeline.db {
            batch.push(QuestionRow {
                exam_id: exam.id.clone(),
                subject_id: subject.id.clone(),
                chapter_id: chapter.id.clone(),
                index: idx,
                payload,
            });
            if batch.len() >= BATCH_SIZE {
                flush_batch(db, std::mem::take(&mut batch)).await?;
            }
        }
    }

    if !claimed_any {
        writer.discard()?;
        return Ok(None);
    }

    let question_count = writer.lines();
    let file = writer.file_name().to_string();
    writer.finish()?;

    if let Some(db) = &pipeline.db {
        flush_batch(db, batch).await?;
        let row = ChapterRow {
            exam_id: exam.id.clone(),
            subject_id: subject.id.clone(),
            chapter_id: chapter.id.clone(),
            exam_name: exam.name.clone(),
            subject_name: subject.name.clone(),
            chapter_name: chapter.name.clone(),
            question_count,
        };
        let db = db.clone();
        tokio::task::spawn_blocking(move || db.upsert_chapter(&row)).await??;
    }

    if question_count == 0 {
        warn!("    No valid questions in {}", chapter.name);
    }
    info!("    Saved {} questions to {}", question_count, file);

    Ok(Some(ChapterSummary {
        exam: exam.name.clone(),
        exam_id: exam.id.clone(),
        subject: subject.name.clone(),
        subject_id: subject.id.clone(),
        chapter: chapter.name.clone(),
        chapter_id: chapter.id.clone(),
        total_questions: question_count,
        file,
    }))
}

/// Upsert one batch off the async workers; SQLite calls block.
async fn flush_batch(db: &Database, rows: Vec<QuestionRow>) -> Result<usize> {
    if rows.is_empty() {
        return Ok(0);
    }
    let db = db.clone();
    tokio::task::spawn_blocking(move || db.upsert_questions(&rows)).await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::LocalStore;
    use crate::output::Compression;
    use crate::progress::Limits;
    use async_trait::async_trait;
    use rusqlite::Connection;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::path::Path;

    #[derive(Default)]
    struct MockCatalog {
        exams: Vec<Exam>,
        subjects: HashMap<String, Vec<Subject>>,
        chapters: HashMap<(String, String), Vec<Chapter>>,
        questions: HashMap<(String, String, String), Vec<Value>>,
    }

    impl MockCatalog {
        fn exam(mut self, id: &str, name: &str) -> Self {
            self.exams.push(Exam {
                id: id.into(),
                name: name.into(),
                icon: Value::Null,
            });
            self
        }

        fn subject(mut self, exam: &str, id: &str) -> Self {
            self.subjects.entry(exam.into()).or_default().push(Subject {
                id: id.into(),
                name: format!("Subject {}", id),
                icon: String::new(),
            });
            self
        }

        fn chapter(mut self, exam: &str, subject: &str, id: &str, questions: Vec<Value>) -> Self {
            self.chapters
                .entry((exam.into(), subject.into()))
                .or_default()
                .push(Chapter {
                    id: id.into(),
                    name: format!("Chapter {}", id),
                    icon: None,
                    declared_questions: 99,
                });
            self.questions
                .insert((exam.into(), subject.into(), id.into()), questions);
            self
        }
    }

    #[async_trait]
    impl Catalog for MockCatalog {
        async fn exams(&self) -> Vec<Exam> {
            self.exams.clone()
        }

        async fn subjects(&self, exam_id: &str) -> Vec<Subject> {
            self.subjects.get(exam_id).cloned().unwrap_or_default()
        }

        async fn chapters(&self, exam_id: &str, subject_id: &str) -> Vec<Chapter> {
            self.chapters
                .get(&(exam_id.to_string(), subject_id.to_string()))
                .cloned()
                .unwrap_or_default()
        }

        async fn questions(&self, exam_id: &str, subject_id: &str, chapter_id: &str) -> Vec<Value> {
            self.questions
                .get(&(exam_id.to_string(), subject_id.to_string(), chapter_id.to_string()))
                .cloned()
                .unwrap_or_default()
        }
    }

    fn question(text: &str) -> Value {
        json!({
            "type": "singleCorrect",
            "question": {"text": text},
            "options": [{"text": "a", "isCorrect": true}, {"text": "b"}]
        })
    }

    fn questions(n: usize) -> Vec<Value> {
        (0..n).map(|i| question(&format!("q{}", i))).collect()
    }

    fn pipeline(catalog: MockCatalog, root: &Path, limits: Limits, db: Option<Database>) -> Arc<Pipeline> {
        Arc::new(Pipeline {
            catalog: Arc::new(catalog),
            resolver: AssetResolver::new(Arc::new(LocalStore::new(root))).unwrap(),
            output: OutputDir::create(root, Compression::Plain).unwrap(),
            db,
            tracker: RunTracker::new(limits),
            progress: ProgressBar::hidden(),
        })
    }

    async fn walk(
        catalog: MockCatalog,
        root: &Path,
        limits: Limits,
        filters: Filters,
        concurrency: usize,
    ) -> RunIndex {
        let walker = Walker::new(pipeline(catalog, root, limits, None), filters, concurrency);
        walker.run().await.unwrap().unwrap()
    }

    fn read_lines(root: &Path, file: &str) -> Vec<Value> {
        std::fs::read_to_string(root.join("json").join(file))
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn exam_tag_rule_is_case_insensitive() {
        assert!(matches_exam_tags("JEE Main"));
        assert!(matches_exam_tags("jee advanced"));
        assert!(matches_exam_tags("Foundation for IIT"));
        assert!(!matches_exam_tags("NEET UG"));
        assert!(!matches_exam_tags(""));
    }

    #[tokio::test]
    async fn end_to_end_single_chapter() {
        let tmp = tempfile::tempdir().unwrap();
        let items = vec![
            json!({
                "type": "multipleCorrect",
                "level": "medium",
                "previousYearPapers": [{"title": "JEE Main 2022"}],
                "question": {"text": "Pick two", "image": ""},
                "options": [
                    {"text": "w", "isCorrect": true},
                    {"text": "x"},
                    {"text": "y", "isCorrect": true},
                    {"text": "z"}
                ],
                "solution": {"text": "w and y"}
            }),
            json!({
                "type": "numerical",
                "question": {"text": "2+2"},
                "correctValue": 4,
                "solution": {"text": "four"}
            }),
            json!({
                "type": "singleCorrect",
                "question": {"text": "No picture here"},
                "options": [{"text": "only", "isCorrect": true}]
            }),
        ];
        let catalog = MockCatalog::default()
            .exam("jee", "JEE Main")
            .subject("jee", "phy")
            .chapter("jee", "phy", "kin", items);

        let db = Database::from_connection(Connection::open_in_memory().unwrap()).unwrap();
        let pipeline = pipeline(catalog, tmp.path(), Limits::default(), Some(db));
        let walker = Walker::new(Arc::clone(&pipeline), Filters::default(), 2);
        let index = walker.run().await.unwrap().unwrap();
        pipeline.output.write_index(&index).unwrap();

        let lines = read_lines(tmp.path(), "jee_phy_kin.jsonl");
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["correct_answer"], json!(["A", "C"]));
        assert_eq!(lines[1]["correct_answer"], json!(4));
        assert!(lines[2]["question"].get("image").is_none());
        assert_eq!(lines[2]["index"], 2);

        let raw = std::fs::read_to_string(tmp.path().join("master_index.json")).unwrap();
        let master: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(master["total_questions"], 3);
        assert_eq!(master["total_exams"], 1);
        assert_eq!(master["chapters"][0]["file"], "jee_phy_kin.jsonl");
        assert_eq!(master["chapters"][0]["total_questions"], 3);

        let stats = pipeline.db.as_ref().unwrap().stats().unwrap();
        assert_eq!(stats.questions, 3);
        assert_eq!(stats.chapters, 1);
    }

    #[tokio::test]
    async fn malformed_question_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let items = vec![question("ok 0"), json!("not an object"), question("ok 2")];
        let catalog = MockCatalog::default()
            .exam("jee", "JEE Main")
            .subject("jee", "phy")
            .chapter("jee", "phy", "kin", items);

        let index = walk(catalog, tmp.path(), Limits::default(), Filters::default(), 1).await;
        let lines = read_lines(tmp.path(), "jee_phy_kin.jsonl");
        assert_eq!(lines.len(), 2);
        // source positions are kept
        assert_eq!(lines[1]["index"], 2);
        assert_eq!(index.total_questions, 2);
        assert_eq!(index.chapters[0].total_questions, 2);
    }

    #[tokio::test]
    async fn chapter_of_only_malformed_questions_still_completes() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = MockCatalog::default()
            .exam("jee", "JEE Main")
            .subject("jee", "phy")
            .chapter("jee", "phy", "bad", vec![json!(1), json!("x")]);

        let db = Database::from_connection(Connection::open_in_memory().unwrap()).unwrap();
        let pipeline = pipeline(catalog, tmp.path(), Limits::default(), Some(db));
        let walker = Walker::new(Arc::clone(&pipeline), Filters::default(), 1);
        let index = walker.run().await.unwrap().unwrap();

        assert_eq!(index.chapters.len(), 1);
        assert_eq!(index.chapters[0].total_questions, 0);
        assert_eq!(index.processed_chapters, 1);
        assert_eq!(index.total_questions, 0);
        assert!(read_lines(tmp.path(), "jee_phy_bad.jsonl").is_empty());

        let stats = pipeline.db.as_ref().unwrap().stats().unwrap();
        assert_eq!(stats.chapters, 1);
        assert_eq!(stats.questions, 0);
    }

    #[tokio::test]
    async fn queued_chapter_after_spent_quota_writes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = MockCatalog::default()
            .exam("jee", "JEE Main")
            .subject("jee", "phy")
            .chapter("jee", "phy", "a", questions(2))
            .chapter("jee", "phy", "b", questions(2));
        let pipeline = pipeline(catalog, tmp.path(), Limits::from_raw(0, 2), None);
        pipeline.tracker.claim_question();
        pipeline.tracker.claim_question();

        let exam = pipeline.catalog.exams().await.remove(0);
        let subject = pipeline.catalog.subjects("jee").await.remove(0);
        let chapter = pipeline.catalog.chapters("jee", "phy").await.remove(1);
        let summary = process_chapter(&pipeline, &exam, &subject, &chapter).await.unwrap();
        assert!(summary.is_none());
        assert!(!tmp.path().join("json/jee_phy_b.jsonl").exists());
    }

    #[tokio::test]
    async fn failed_chapter_gives_back_its_questions() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("broken.sqlite");
        let url = db_path.display().to_string();
        let db = Database::open(&url).unwrap();
        Connection::open(&db_path).unwrap().execute_batch("DROP TABLE items;").unwrap();

        let catalog = MockCatalog::default()
            .exam("jee", "JEE Main")
            .subject("jee", "phy")
            .chapter("jee", "phy", "kin", questions(3));
        let pipeline = pipeline(catalog, tmp.path(), Limits::default(), Some(db));
        let walker = Walker::new(Arc::clone(&pipeline), Filters::default(), 1);
        let index = walker.run().await.unwrap().unwrap();

        assert!(index.chapters.is_empty());
        assert_eq!(index.total_questions, 0);
        assert_eq!(index.processed_chapters, 0);
        assert_eq!(pipeline.progress.position(), 0);
        assert!(!tmp.path().join("json/jee_phy_kin.jsonl").exists());
    }

    #[tokio::test]
    async fn unsafe_chapter_id_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = MockCatalog::default()
            .exam("jee", "JEE Main")
            .subject("jee", "phy")
            .chapter("jee", "phy", "../escape", questions(1))
            .chapter("jee", "phy", "ok", questions(1));

        let index = walk(catalog, tmp.path(), Limits::default(), Filters::default(), 1).await;
        let ids: Vec<&str> = index.chapters.iter().map(|c| c.chapter_id.as_str()).collect();
        assert_eq!(ids, vec!["ok"]);
        assert_eq!(index.total_questions, 1);
    }

    #[tokio::test]
    async fn empty_chapter_leaves_no_trace() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = MockCatalog::default()
            .exam("jee", "JEE Main")
            .subject("jee", "phy")
            .chapter("jee", "phy", "empty", vec![])
            .chapter("jee", "phy", "full", questions(1));

        let index = walk(catalog, tmp.path(), Limits::default(), Filters::default(), 1).await;
        assert_eq!(index.chapters.len(), 1);
        assert_eq!(index.chapters[0].chapter_id, "full");
        assert_eq!(index.total_chapters, 2);
        assert_eq!(index.processed_chapters, 1);
        assert!(!tmp.path().join("json/jee_phy_empty.jsonl").exists());
    }

    #[tokio::test]
    async fn question_quota_caps_total_output() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = MockCatalog::default()
            .exam("jee", "JEE Main")
            .subject("jee", "phy")
            .chapter("jee", "phy", "a", questions(3))
            .chapter("jee", "phy", "b", questions(3))
            .subject("jee", "chem")
            .chapter("jee", "chem", "c", questions(3));

        let index = walk(catalog, tmp.path(), Limits::from_raw(0, 4), Filters::default(), 1).await;
        assert_eq!(index.total_questions, 4);
        let written: usize = index
            .chapters
            .iter()
            .map(|c| read_lines(tmp.path(), &c.file).len())
            .sum();
        assert_eq!(written, 4);
        assert_eq!(index.chapters.len(), 2);
        assert_eq!(index.chapters[1].total_questions, 1);
        assert!(!tmp.path().join("json/jee_chem_c.jsonl").exists());
    }

    #[tokio::test]
    async fn question_quota_holds_under_concurrency() {
        let tmp = tempfile::tempdir().unwrap();
        let mut catalog = MockCatalog::default().exam("jee", "JEE Main").subject("jee", "phy");
        for i in 0..6 {
            catalog = catalog.chapter("jee", "phy", &format!("c{}", i), questions(5));
        }

        let index = walk(catalog, tmp.path(), Limits::from_raw(0, 7), Filters::default(), 4).await;
        let written: usize = index
            .chapters
            .iter()
            .map(|c| read_lines(tmp.path(), &c.file).len())
            .sum();
        assert!(written <= 7);
        assert_eq!(written, index.total_questions);
    }

    #[tokio::test]
    async fn chapter_quota_skips_empty_chapters() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = MockCatalog::default()
            .exam("jee", "JEE Main")
            .subject("jee", "phy")
            .chapter("jee", "phy", "empty", vec![])
            .chapter("jee", "phy", "a", questions(1))
            .chapter("jee", "phy", "b", questions(1))
            .chapter("jee", "phy", "c", questions(1))
            .subject("jee", "chem")
            .chapter("jee", "chem", "d", questions(1));

        let index = walk(catalog, tmp.path(), Limits::from_raw(2, 0), Filters::default(), 3).await;
        let ids: Vec<&str> = index.chapters.iter().map(|c| c.chapter_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(index.processed_chapters, 2);
    }

    #[tokio::test]
    async fn summaries_follow_catalog_order() {
        let tmp = tempfile::tempdir().unwrap();
        let mut catalog = MockCatalog::default().exam("jee", "JEE Main").subject("jee", "phy");
        for i in 0..8 {
            catalog = catalog.chapter("jee", "phy", &format!("c{}", i), questions(8 - i));
        }

        let index = walk(catalog, tmp.path(), Limits::default(), Filters::default(), 4).await;
        let ids: Vec<String> = index.chapters.iter().map(|c| c.chapter_id.clone()).collect();
        let expected: Vec<String> = (0..8).map(|i| format!("c{}", i)).collect();
        assert_eq!(ids, expected);
        assert_eq!(index.total_questions, (1..=8).sum::<usize>());
    }

    fn two_exam_catalog() -> MockCatalog {
        MockCatalog::default()
            .exam("main", "JEE Main")
            .exam("adv", "JEE Advanced")
            .exam("neet", "NEET")
            .subject("main", "phy")
            .chapter("main", "phy", "kin", questions(1))
            .chapter("main", "phy", "opt", questions(1))
            .subject("adv", "phy")
            .chapter("adv", "phy", "kin", questions(1))
            .subject("neet", "bio")
            .chapter("neet", "bio", "cell", questions(1))
    }

    #[tokio::test]
    async fn unset_filters_keep_tagged_exams() {
        let tmp = tempfile::tempdir().unwrap();
        let index = walk(two_exam_catalog(), tmp.path(), Limits::default(), Filters::default(), 2).await;
        assert_eq!(index.total_exams, 2);
        let exams: Vec<&str> = index.chapters.iter().map(|c| c.exam_id.as_str()).collect();
        assert_eq!(exams, vec!["main", "main", "adv"]);
    }

    #[tokio::test]
    async fn exam_filter_excludes_others() {
        let tmp = tempfile::tempdir().unwrap();
        let filters = Filters {
            exam_id: Some("adv".into()),
            ..Default::default()
        };
        let index = walk(two_exam_catalog(), tmp.path(), Limits::default(), filters, 2).await;
        assert_eq!(index.total_exams, 1);
        assert!(index.chapters.iter().all(|c| c.exam_id == "adv"));
        assert_eq!(index.chapters.len(), 1);
    }

    #[tokio::test]
    async fn subject_filter_excludes_other_subjects() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = MockCatalog::default()
            .exam("jee", "JEE Main")
            .subject("jee", "phy")
            .chapter("jee", "phy", "kin", questions(2))
            .subject("jee", "chem")
            .chapter("jee", "chem", "mole", questions(1))
            .chapter("jee", "chem", "bond", questions(1));
        let filters = Filters {
            subject_id: Some("chem".into()),
            ..Default::default()
        };

        let index = walk(catalog, tmp.path(), Limits::default(), filters, 2).await;
        assert_eq!(index.total_subjects, 1);
        assert!(index.chapters.iter().all(|c| c.subject_id == "chem"));
        let files: Vec<&str> = index.chapters.iter().map(|c| c.file.as_str()).collect();
        assert_eq!(files, vec!["jee_chem_mole.jsonl", "jee_chem_bond.jsonl"]);
        assert_eq!(index.total_questions, 2);
        assert!(!tmp.path().join("json/jee_phy_kin.jsonl").exists());
    }

    #[tokio::test]
    async fn chapter_filter_narrows_every_subject() {
        let tmp = tempfile::tempdir().unwrap();
        let filters = Filters {
            chapter_id: Some("kin".into()),
            ..Default::default()
        };
        let index = walk(two_exam_catalog(), tmp.path(), Limits::default(), filters, 2).await;
        let files: Vec<&str> = index.chapters.iter().map(|c| c.file.as_str()).collect();
        assert_eq!(files, vec!["main_phy_kin.jsonl", "adv_phy_kin.jsonl"]);
    }

    #[tokio::test]
    async fn exam_filter_on_untagged_exam_finds_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let filters = Filters {
            exam_id: Some("neet".into()),
            ..Default::default()
        };
        let walker = Walker::new(
            pipeline(two_exam_catalog(), tmp.path(), Limits::default(), None),
            filters,
            1,
        );
        assert!(walker.run().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rerun_updates_database_rows_in_place() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("run.sqlite");
        let url = db_path.display().to_string();

        for _ in 0..2 {
            let catalog = MockCatalog::default()
                .exam("jee", "JEE Main")
                .subject("jee", "phy")
                .chapter("jee", "phy", "kin", questions(3));
            let db = Database::open(&url).unwrap();
            let walker = Walker::new(pipeline(catalog, tmp.path(), Limits::default(), Some(db)), Filters::default(), 1);
            walker.run().await.unwrap().unwrap();
        }

        let stats = Database::open(&url).unwrap().stats().unwrap();
        assert_eq!(stats.questions, 3);
        assert_eq!(stats.chapters, 1);
        assert_eq!(read_lines(tmp.path(), "jee_phy_kin.jsonl").len(), 3);
    }
}
