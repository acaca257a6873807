use serde::Serialize;
use serde_json::{Map, Value};

use crate::assets::{AssetResolver, AssetSlot};

const CHOICE_LABELS: [&str; 4] = ["A", "B", "C", "D"];
const NUMERICAL: &str = "numerical";

#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("question payload is not a JSON object (got {0})")]
    NotAnObject(&'static str),
}

// ── Raw catalog payload ──

/// Text plus optional image, as the catalog ships question bodies and solutions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawContent {
    pub text: Value,
    pub image: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawOption {
    pub text: Value,
    pub image: Option<String>,
    pub is_correct: bool,
}

/// One catalog question with every field optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawQuestion {
    pub kind: Option<String>,
    pub level: Value,
    pub paper: String,
    pub body: RawContent,
    pub options: Vec<RawOption>,
    pub correct_value: Value,
    pub solution: RawContent,
}

impl RawQuestion {
    pub fn is_numerical(&self) -> bool {
        self.kind.as_deref() == Some(NUMERICAL)
    }
}

impl TryFrom<&Value> for RawQuestion {
    type Error = NormalizeError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        let obj = value.as_object().ok_or(NormalizeError::NotAnObject(json_kind(value)))?;

        let paper = obj
            .get("previousYearPapers")
            .and_then(|p| p.as_array())
            .and_then(|papers| papers.first())
            .and_then(|first| first.get("title"))
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .to_string();

        let options = obj
            .get("options")
            .and_then(|o| o.as_array())
            .map(|opts| {
                opts.iter()
                    .map(|o| {
                        let fields = o.as_object();
                        RawOption {
                            text: text_field(fields),
                            image: image_field(fields),
                            is_correct: fields
                                .and_then(|f| f.get("isCorrect"))
                                .map(truthy)
                                .unwrap_or(false),
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(RawQuestion {
            kind: obj.get("type").and_then(|t| t.as_str()).map(str::to_string),
            level: obj.get("level").cloned().unwrap_or(Value::Null),
            paper,
            body: content_field(obj, "question"),
            options,
            correct_value: obj.get("correctValue").cloned().unwrap_or(Value::Null),
            solution: content_field(obj, "solution"),
        })
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn content_field(obj: &Map<String, Value>, key: &str) -> RawContent {
    let fields = obj.get(key).and_then(|c| c.as_object());
    RawContent {
        text: text_field(fields),
        image: image_field(fields),
    }
}

/// Missing or null text becomes `""`; anything else passes through untouched.
fn text_field(fields: Option<&Map<String, Value>>) -> Value {
    match fields.and_then(|f| f.get("text")) {
        None | Some(Value::Null) => Value::String(String::new()),
        Some(v) => v.clone(),
    }
}

fn image_field(fields: Option<&Map<String, Value>>) -> Option<String> {
    fields
        .and_then(|f| f.get("image"))
        .and_then(|i| i.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Null => false,
    }
}

// ── Canonical record ──

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Content {
    pub text: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Choice {
    pub text: Value,
    pub is_correct: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Numerical questions keep the declared value; everything else lists the
/// labels of the correct choices.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CorrectAnswer {
    Value(Value),
    Labels(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalRecord {
    pub index: usize,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub difficulty: Value,
    pub pyq_info: String,
    pub question: Content,
    pub options: Vec<Choice>,
    pub correct_answer: CorrectAnswer,
    pub solution: Content,
}

/// A, B, C, D for the first four choices, then "5", "6", ...
pub fn choice_label(position: usize) -> String {
    CHOICE_LABELS
        .get(position)
        .map(|l| l.to_string())
        .unwrap_or_else(|| (position + 1).to_string())
}

pub fn correct_answer(raw: &RawQuestion) -> CorrectAnswer {
    if raw.is_numerical() {
        return CorrectAnswer::Value(raw.correct_value.clone());
    }
    CorrectAnswer::Labels(
        raw.options
            .iter()
            .enumerate()
            .filter(|(_, o)| o.is_correct)
            .map(|(i, _)| choice_label(i))
            .collect(),
    )
}

/// Turns raw catalog questions into canonical records, pulling images along.
pub struct Normalizer<'a> {
    resolver: &'a AssetResolver,
}

impl<'a> Normalizer<'a> {
    pub fn new(resolver: &'a AssetResolver) -> Self {
        Normalizer { resolver }
    }

    /// Normalize the question at `index` of a chapter whose images live under `dir`.
    pub async fn normalize(
        &self,
        value: &Value,
        index: usize,
        dir: &str,
    ) -> Result<CanonicalRecord, NormalizeError> {
        let raw = RawQuestion::try_from(value)?;
        let answer = correct_answer(&raw);

        let question = Content {
            image: self.image(&raw.body.image, dir, format!("q_{:04}", index)).await,
            text: raw.body.text,
        };

        let mut options = Vec::with_capacity(raw.options.len());
        for (i, opt) in raw.options.into_iter().enumerate() {
            let image = self
                .image(&opt.image, dir, format!("opt{}_{:04}", i + 1, index))
                .await;
            options.push(Choice {
                text: opt.text,
                is_correct: opt.is_correct,
                image,
            });
        }

        let solution = Content {
            image: self.image(&raw.solution.image, dir, format!("sol_{:04}", index)).await,
            text: raw.solution.text,
        };

        Ok(CanonicalRecord {
            index,
            kind: raw.kind,
            difficulty: raw.level,
            pyq_info: raw.paper,
            question,
            options,
            correct_answer: answer,
            solution,
        })
    }

    async fn image(&self, url: &Option<String>, dir: &str, stem: String) -> Option<String> {
        let url = url.as_deref()?;
        let slot = AssetSlot {
            dir: dir.to_string(),
            stem,
        };
        self.resolver.resolve(url, &slot).await
    }
}
