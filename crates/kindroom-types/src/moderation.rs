use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The moderation service's judgment on one message.
/// Built once per message and consumed by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub harmful: bool,
    pub purified_text: String,
    pub flagged_terms: Vec<String>,
    pub quiz_results: Option<Vec<Value>>,
    pub report_results: Option<Value>,
}

impl Verdict {
    /// Benign verdict that leaves the text untouched. Used when the
    /// moderation service cannot be reached.
    pub fn pass_through(text: &str) -> Self {
        Self {
            harmful: false,
            purified_text: text.to_string(),
            flagged_terms: Vec::new(),
            quiz_results: None,
            report_results: None,
        }
    }
}

/// Reply of the quiz/report escalation service.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Escalation {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub quiz_results: Vec<Value>,
    #[serde(default = "empty_object")]
    pub report_results: Value,
}

impl Escalation {
    pub fn empty() -> Self {
        Self {
            message: String::new(),
            quiz_results: Vec::new(),
            report_results: empty_object(),
        }
    }
}

pub fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}
