use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;
use tracing::{info, warn};

pub const DEFAULT_BASE_URL: &str = "https://web.getmarks.app/api";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PAGE_LIMIT: &str = "10000";
const EXAMS_COMPONENT: &str = "ChapterwiseExams";

#[derive(Debug, Clone, PartialEq)]
pub struct Exam {
    pub id: String,
    pub name: String,
    pub icon: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subject {
    pub id: String,
    pub name: String,
    pub icon: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Chapter {
    pub id: String,
    pub name: String,
    pub icon: Option<String>,
    /// Advertised by the catalog, never checked against what is fetched.
    pub declared_questions: u64,
}

/// Read-only view of the remote question bank.
///
/// Every method degrades to an empty list on failure; callers treat that as
/// "nothing found".
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn exams(&self) -> Vec<Exam>;
    async fn subjects(&self, exam_id: &str) -> Vec<Subject>;
    async fn chapters(&self, exam_id: &str, subject_id: &str) -> Vec<Chapter>;
    async fn questions(&self, exam_id: &str, subject_id: &str, chapter_id: &str) -> Vec<Value>;
}

/// HTTP client for the catalog API.
pub struct CatalogClient {
    http: reqwest::Client,
    base_url: String,
}

impl CatalogClient {
    pub fn new(base_url: &str, token: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", token))
            .context("Auth token contains invalid header characters")?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build catalog HTTP client")?;

        Ok(CatalogClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// GET an endpoint and return its `data` payload, or `None` on any failure.
    async fn get_data(&self, path: &str, params: &[(&str, &str)]) -> Option<Value> {
        let url = format!("{}/{}", self.base_url, path);
        let response = match self.http.get(&url).query(params).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!("Request failed for {}: {}", url, e);
                return None;
            }
        };
        let response = match response.error_for_status() {
            Ok(r) => r,
            Err(e) => {
                warn!("Request failed for {}: {}", url, e);
                return None;
            }
        };
        match response.json::<Value>().await {
            Ok(mut body) => Some(body.get_mut("data").map(Value::take).unwrap_or(Value::Null)),
            Err(e) => {
                warn!("Invalid JSON from {}: {}", url, e);
                None
            }
        }
    }
}

#[async_trait]
impl Catalog for CatalogClient {
    async fn exams(&self) -> Vec<Exam> {
        info!("Fetching exam list...");
        self.get_data("v3/dashboard/platform/web", &[("limit", PAGE_LIMIT)])
            .await
            .map(|data| parse_exams(&data))
            .unwrap_or_default()
    }

    async fn subjects(&self, exam_id: &str) -> Vec<Subject> {
        let path = format!("v4/cpyqb/exam/{}", exam_id);
        self.get_data(&path, &[("limit", PAGE_LIMIT)])
            .await
            .map(|data| parse_subjects(&data))
            .unwrap_or_default()
    }

    async fn chapters(&self, exam_id: &str, subject_id: &str) -> Vec<Chapter> {
        let path = format!("v4/cpyqb/exam/{}/subject/{}", exam_id, subject_id);
        self.get_data(&path, &[("limit", PAGE_LIMIT)])
            .await
            .map(|data| parse_chapters(&data))
            .unwrap_or_default()
    }

    async fn questions(&self, exam_id: &str, subject_id: &str, chapter_id: &str) -> Vec<Value> {
        let path = format!(
            "v4/cpyqb/exam/{}/subject/{}/chapter/{}/questions",
            exam_id, subject_id, chapter_id
        );
        self.get_data(&path, &[("limit", PAGE_LIMIT), ("hideOutOfSyllabus", "false")])
            .await
            .map(parse_questions)
            .unwrap_or_default()
    }
}

// ── Payload parsing ──

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key)
        .and_then(|s| s.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Pull the chapter-wise exam entries out of the dashboard payload.
pub fn parse_exams(data: &Value) -> Vec<Exam> {
    let component = data
        .get("items")
        .and_then(|i| i.as_array())
        .and_then(|items| {
            items
                .iter()
                .find(|i| i.get("componentTitle").and_then(|t| t.as_str()) == Some(EXAMS_COMPONENT))
        });

    let Some(entries) = component.and_then(|c| c.get("items")).and_then(|i| i.as_array()) else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|e| {
            Some(Exam {
                id: str_field(e, "examId")?,
                name: e.get("title").and_then(|t| t.as_str()).unwrap_or("").to_string(),
                icon: e.get("icon").cloned().unwrap_or_else(|| Value::Object(Default::default())),
            })
        })
        .collect()
}

pub fn parse_subjects(data: &Value) -> Vec<Subject> {
    data.get("subjects")
        .and_then(|s| s.as_array())
        .map(|subjects| {
            subjects
                .iter()
                .filter_map(|s| {
                    Some(Subject {
                        id: str_field(s, "_id")?,
                        name: str_field(s, "title")?,
                        icon: s.get("icon").and_then(|i| i.as_str()).unwrap_or("").to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

pub fn parse_chapters(data: &Value) -> Vec<Chapter> {
    data.get("chapters")
        .and_then(|c| c.get("data"))
        .and_then(|d| d.as_array())
        .map(|chapters| {
            chapters
                .iter()
                .filter_map(|c| {
                    Some(Chapter {
                        id: str_field(c, "_id")?,
                        name: str_field(c, "title")?,
                        icon: str_field(c, "icon"),
                        declared_questions: c
                            .get("allPyqs")
                            .and_then(|p| p.get("totalQs"))
                            .and_then(|n| n.as_u64())
                            .unwrap_or(0),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Questions stay as raw JSON; shape checks happen during normalization.
pub fn parse_questions(mut data: Value) -> Vec<Value> {
    match data.get_mut("questions").map(Value::take) {
        Some(Value::Array(questions)) => questions,
        _ => Vec::new(),
    }
}
