/// Post-filtering of generated recommendation sets against session feedback.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::FeedbackState;

pub const FILTERED_NOTE: &str = "Filtered based on previous feedback";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecommendationSet {
    #[serde(default)]
    pub subsections: Vec<Subsection>,
    /// Fields this crate does not interpret, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A titled group of recommendations. Items arrive under `exercises` or
/// `items` and are written back under the same key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Subsection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exercises: Option<Vec<RecommendationItem>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<RecommendationItem>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Subsection {
    pub fn entries(&self) -> impl Iterator<Item = &RecommendationItem> {
        self.exercises.iter().chain(self.items.iter()).flatten()
    }

    fn entries_mut(&mut self) -> impl Iterator<Item = &mut RecommendationItem> {
        self.exercises.iter_mut().chain(self.items.iter_mut()).flatten()
    }

    fn lists_mut(&mut self) -> impl Iterator<Item = &mut Vec<RecommendationItem>> {
        self.exercises.iter_mut().chain(self.items.iter_mut())
    }
}

/// Free text or a list of lines; written back in the form it arrived in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Notes {
    Text(String),
    List(Vec<String>),
}

impl Notes {
    pub fn push(&mut self, note: &str) {
        match self {
            Notes::Text(text) if text.trim().is_empty() => *text = note.to_string(),
            Notes::Text(text) => {
                text.push_str(" (");
                text.push_str(note);
                text.push(')');
            }
            Notes::List(lines) => lines.push(note.to_string()),
        }
    }
}

/// Keys a recommendation's billing code may be stored under, in lookup order.
const CODE_KEYS: [&str; 2] = ["cpt", "code"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecommendationItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<Notes>,
    /// Everything else, including the code under whichever key it arrived
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RecommendationItem {
    fn code_key(&self) -> Option<&'static str> {
        CODE_KEYS
            .into_iter()
            .find(|key| self.extra.get(*key).is_some_and(Value::is_string))
    }

    pub fn code(&self) -> Option<&str> {
        self.code_key()
            .and_then(|key| self.extra.get(key))
            .and_then(Value::as_str)
    }

    fn set_code(&mut self, code: &str) {
        if let Some(key) = self.code_key() {
            self.extra.insert(key.to_string(), Value::String(code.to_string()));
        }
    }

    pub fn add_note(&mut self, note: &str) {
        match &mut self.notes {
            Some(notes) => notes.push(note),
            None => self.notes = Some(Notes::Text(note.to_string())),
        }
    }
}

/// Drop blocked items, annotate what was filtered, then apply code corrections.
pub fn filter_recommendations(state: &FeedbackState, set: &RecommendationSet) -> RecommendationSet {
    let mut filtered = set.clone();

    for subsection in &mut filtered.subsections {
        let before = subsection.entries().count();
        for list in subsection.lists_mut() {
            list.retain(|item| {
                let code_blocked = item.code().is_some_and(|code| state.blocked_codes.contains(code));
                let title_blocked = item
                    .title
                    .as_ref()
                    .is_some_and(|title| state.blocked_items.contains(title));
                !code_blocked && !title_blocked
            });
        }

        if subsection.entries().count() < before {
            for item in subsection.entries_mut() {
                item.add_note(FILTERED_NOTE);
            }
        }

        for item in subsection.entries_mut() {
            let Some(old) = item.code().map(str::to_string) else {
                continue;
            };
            if let Some(new) = state.preferences.corrections.get(&old) {
                item.set_code(new);
                item.add_note(&format!("Code corrected from {}", old));
            }
        }
    }
    filtered
}
