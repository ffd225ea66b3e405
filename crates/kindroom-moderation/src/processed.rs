use serde::Deserialize;
use serde_json::Value;

use kindroom_types::moderation::Verdict;

/// The service's `processed_text` field. It is either the replacement text
/// itself or a JSON payload carrying a replacement sentence and the terms
/// that were flagged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessedText {
    Structured {
        sentence: Option<String>,
        flagged_terms: Vec<String>,
    },
    Plain(String),
}

#[derive(Debug, Deserialize)]
struct StructuredPayload {
    #[serde(rename = "대체 문장", alias = "replacement_sentence", default)]
    sentence: Option<String>,
    #[serde(rename = "문장중 유해한 단어들", alias = "flagged_terms", default)]
    flagged_terms: Vec<String>,
}

impl From<StructuredPayload> for ProcessedText {
    fn from(p: StructuredPayload) -> Self {
        ProcessedText::Structured {
            sentence: p.sentence,
            flagged_terms: p.flagged_terms,
        }
    }
}

impl ProcessedText {
    /// Structured first, plain text on any parse failure. Never fails.
    pub fn parse(raw: &str) -> Self {
        match serde_json::from_str::<StructuredPayload>(raw) {
            Ok(payload) => payload.into(),
            Err(_) => ProcessedText::Plain(raw.to_string()),
        }
    }

    /// Same policy for a field that arrived as JSON rather than as a string.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::String(s) => Self::parse(&s),
            other => match serde_json::from_value::<StructuredPayload>(other.clone()) {
                Ok(payload) => payload.into(),
                Err(_) => ProcessedText::Plain(other.to_string()),
            },
        }
    }
}

/// Body of `POST /process_text`.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ProcessTextResponse {
    #[serde(default)]
    pub original_text: Option<String>,
    #[serde(default)]
    pub processed_text: Option<Value>,
    /// Only trusted when the service actually sends it.
    #[serde(default)]
    pub is_harmful: Option<bool>,
    #[serde(default)]
    pub quiz_results: Option<Vec<Value>>,
    #[serde(default)]
    pub report_results: Option<Value>,
}

/// Turn a service reply into a verdict about `submitted`.
///
/// An absent or empty `processed_text`, or one equal to the original, means
/// the service changed nothing. A structured payload without a sentence keeps
/// the original text.
pub(crate) fn build_verdict(submitted: &str, response: ProcessTextResponse) -> Verdict {
    let original = response
        .original_text
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| submitted.to_string());

    let processed = response.processed_text.filter(|v| match v {
        Value::Null => false,
        Value::String(s) => !s.is_empty() && *s != original,
        _ => true,
    });

    let (purified_text, flagged_terms) = match processed.map(ProcessedText::from_value) {
        None => (original.clone(), Vec::new()),
        Some(ProcessedText::Structured {
            sentence,
            flagged_terms,
        }) => (sentence.unwrap_or_else(|| original.clone()), flagged_terms),
        Some(ProcessedText::Plain(text)) => (text, Vec::new()),
    };

    let harmful = response.is_harmful.unwrap_or(purified_text != original);

    Verdict {
        harmful,
        purified_text,
        flagged_terms,
        quiz_results: response.quiz_results,
        report_results: response.report_results,
    }
}
