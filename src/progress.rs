use std::sync::{Mutex, MutexGuard};

/// Global quotas; `None` means unlimited.
#[derive(Debug, Clone, Copy, Default)]
pub struct Limits {
    pub max_chapters: Option<usize>,
    pub max_questions: Option<usize>,
}

impl Limits {
    /// Build from the env-style knobs where `0` disables the quota.
    pub fn from_raw(max_chapters: usize, max_questions: usize) -> Self {
        Limits {
            max_chapters: (max_chapters > 0).then_some(max_chapters),
            max_questions: (max_questions > 0).then_some(max_questions),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub exams: usize,
    pub subjects: usize,
    pub chapters: usize,
    pub processed_chapters: usize,
    pub questions: usize,
    /// Chapters currently holding a quota slot (in flight or finished).
    reserved_chapters: usize,
}

/// Run-wide counters shared by every chapter worker.
///
/// All reads and writes go through one mutex so quota checks stay consistent
/// when several chapters are processed at once.
#[derive(Debug, Default)]
pub struct RunTracker {
    limits: Limits,
    state: Mutex<Counters>,
}

impl RunTracker {
    pub fn new(limits: Limits) -> Self {
        RunTracker {
            limits,
            state: Mutex::new(Counters::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_exams(&self, n: usize) {
        self.lock().exams = n;
    }

    pub fn record_subjects(&self, n: usize) {
        self.lock().subjects += n;
    }

    pub fn record_chapters(&self, n: usize) {
        self.lock().chapters += n;
    }

    /// Take a chapter slot. Returns false once `max_chapters` slots are held.
    pub fn reserve_chapter(&self) -> bool {
        let mut c = self.lock();
        if let Some(max) = self.limits.max_chapters {
            if c.reserved_chapters >= max {
                return false;
            }
        }
        c.reserved_chapters += 1;
        true
    }

    /// Give back a slot for a chapter that produced no output.
    pub fn release_chapter(&self) {
        let mut c = self.lock();
        c.reserved_chapters = c.reserved_chapters.saturating_sub(1);
    }

    pub fn finish_chapter(&self) {
        self.lock().processed_chapters += 1;
    }

    /// Take a question slot. Returns false once `max_questions` is reached.
    pub fn claim_question(&self) -> bool {
        let mut c = self.lock();
        if let Some(max) = self.limits.max_questions {
            if c.questions >= max {
                return false;
            }
        }
        c.questions += 1;
        true
    }

    /// Undo a claim for a question that failed to normalize.
    pub fn release_question(&self) {
        let mut c = self.lock();
        c.questions = c.questions.saturating_sub(1);
    }

    /// Drop `n` claimed questions of a chapter that failed after writing them.
    pub fn forget_questions(&self, n: usize) {
        let mut c = self.lock();
        c.questions = c.questions.saturating_sub(n);
    }

    pub fn chapter_quota_reached(&self) -> bool {
        match self.limits.max_chapters {
            Some(max) => self.lock().reserved_chapters >= max,
            None => false,
        }
    }

    pub fn question_quota_reached(&self) -> bool {
        match self.limits.max_questions {
            Some(max) => self.lock().questions >= max,
            None => false,
        }
    }

    pub fn snapshot(&self) -> Counters {
        *self.lock()
    }

    pub fn print_status(&self) {
        let c = self.snapshot();
        println!("\n{}", "=".repeat(60));
        println!("Progress Summary:");
        println!("  Exams:     {}", c.exams);
        println!("  Subjects:  {}", c.subjects);
        println!("  Chapters:  {}/{}", c.processed_chapters, c.chapters);
        println!("  Questions: {}", c.questions);
        println!("{}\n", "=".repeat(60));
    }
}
