/// Per-session feedback: typed payloads, state projection and request adaptation.
///
/// Feedback is appended per session and projected into a small preference
/// state. That state biases retrieval boosts before a search
/// (`apply_feedback_to_request`) and filters recommendation sets afterwards
/// (`filter::filter_recommendations`).

pub mod filter;
pub mod manager;
pub mod store;

pub use filter::{filter_recommendations, Notes, RecommendationItem, RecommendationSet, Subsection};
pub use manager::FeedbackManager;
pub use store::FeedbackStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::errors::GroundrankError;
use crate::search::BoostManifest;
use crate::types::SourceType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackType {
    #[serde(alias = "thumbs_up")]
    Positive,
    #[serde(alias = "thumbs_down")]
    Negative,
    Correction,
    Preference,
    Block,
}

impl FeedbackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackType::Positive => "positive",
            FeedbackType::Negative => "negative",
            FeedbackType::Correction => "correction",
            FeedbackType::Preference => "preference",
            FeedbackType::Block => "block",
        }
    }
}

impl fmt::Display for FeedbackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedbackType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "positive" | "thumbs_up" => Ok(FeedbackType::Positive),
            "negative" | "thumbs_down" => Ok(FeedbackType::Negative),
            "correction" => Ok(FeedbackType::Correction),
            "preference" => Ok(FeedbackType::Preference),
            "block" => Ok(FeedbackType::Block),
            other => Err(format!("Unknown feedback type: {}", other)),
        }
    }
}

/// What a block entry blocks.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockTarget {
    #[serde(alias = "cpt")]
    Code(String),
    /// A recommendation item, by title
    #[serde(alias = "exercise")]
    Item(String),
    /// A source type the user wants favoured
    Source(SourceType),
}

/// A feedback payload, keyed by its type.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "feedback_type", content = "feedback_data", rename_all = "snake_case")]
pub enum Feedback {
    #[serde(alias = "thumbs_up")]
    Positive {
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(alias = "thumbs_down")]
    Negative {
        #[serde(default)]
        reason: Option<String>,
        #[serde(default, alias = "cpt_code")]
        code: Option<String>,
    },
    Correction {
        #[serde(alias = "old_cpt")]
        old_code: String,
        #[serde(alias = "corrected_cpt")]
        new_code: String,
    },
    Preference {
        #[serde(alias = "preference_type")]
        key: String,
        #[serde(alias = "preference_value")]
        value: Value,
    },
    Block {
        blocked_content: BlockTarget,
    },
}

impl Feedback {
    /// Build a payload from an untyped `(feedback_type, feedback_data)` pair.
    pub fn from_parts(feedback_type: &str, feedback_data: Value) -> Result<Self, GroundrankError> {
        let feedback: Feedback = serde_json::from_value(json!({
            "feedback_type": feedback_type,
            "feedback_data": feedback_data,
        }))
        .map_err(|e| {
            GroundrankError::validation(
                "feedback_data",
                &format!("invalid {} feedback: {}", feedback_type, e),
            )
        })?;
        feedback.validate()?;
        Ok(feedback)
    }

    pub fn feedback_type(&self) -> FeedbackType {
        match self {
            Feedback::Positive { .. } => FeedbackType::Positive,
            Feedback::Negative { .. } => FeedbackType::Negative,
            Feedback::Correction { .. } => FeedbackType::Correction,
            Feedback::Preference { .. } => FeedbackType::Preference,
            Feedback::Block { .. } => FeedbackType::Block,
        }
    }

    /// The payload as persisted under `feedback_data`.
    pub fn data(&self) -> Value {
        match self {
            Feedback::Positive { reason } => json!({ "reason": reason }),
            Feedback::Negative { reason, code } => json!({ "reason": reason, "code": code }),
            Feedback::Correction { old_code, new_code } => {
                json!({ "old_code": old_code, "new_code": new_code })
            }
            Feedback::Preference { key, value } => json!({ "key": key, "value": value }),
            Feedback::Block { blocked_content } => {
                let target = match blocked_content {
                    BlockTarget::Code(code) => json!({ "code": code }),
                    BlockTarget::Item(item) => json!({ "item": item }),
                    BlockTarget::Source(source) => json!({ "source": source.to_string() }),
                };
                json!({ "blocked_content": target })
            }
        }
    }

    pub fn validate(&self) -> Result<(), GroundrankError> {
        let blank = |s: &str| s.trim().is_empty();
        match self {
            Feedback::Correction { old_code, new_code } if blank(old_code) || blank(new_code) => {
                Err(GroundrankError::validation("feedback_data", "correction needs old_code and new_code"))
            }
            Feedback::Preference { key, .. } if blank(key) => {
                Err(GroundrankError::validation("feedback_data", "preference key cannot be empty"))
            }
            Feedback::Preference { key, value } if is_corrections_key(key) => {
                correction_pairs(value).map(|_| ()).ok_or_else(|| {
                    GroundrankError::validation("feedback_data", "corrections must map old codes to new codes")
                })
            }
            Feedback::Preference { key, value } if key == "difficulty" => {
                serde_json::from_value::<Difficulty>(value.clone()).map(|_| ()).map_err(|_| {
                    GroundrankError::validation("feedback_data", "difficulty must be 'easier' or 'harder'")
                })
            }
            Feedback::Block { blocked_content: BlockTarget::Code(v) | BlockTarget::Item(v) } if blank(v) => {
                Err(GroundrankError::validation("feedback_data", "blocked content cannot be empty"))
            }
            _ => Ok(()),
        }
    }
}

/// Preference keys that name the typed `Preferences::corrections` map.
const CORRECTIONS_KEYS: [&str; 2] = ["corrections", "cpt_corrections"];

fn is_corrections_key(key: &str) -> bool {
    CORRECTIONS_KEYS.contains(&key)
}

/// Old code -> new code pairs, or None unless every side is a non-blank string.
fn correction_pairs(value: &Value) -> Option<BTreeMap<String, String>> {
    let pairs: BTreeMap<String, String> = serde_json::from_value(value.clone()).ok()?;
    let blank = |s: &String| s.trim().is_empty();
    if pairs.iter().any(|(old, new)| blank(old) || blank(new)) {
        return None;
    }
    Some(pairs)
}

/// One submitted piece of feedback. Serialized as a flat record with
/// `feedback_type` and `feedback_data` fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "EntryRecord", try_from = "EntryRecord")]
pub struct FeedbackEntry {
    pub feedback_id: String,
    pub session_id: String,
    pub recommendation_id: Option<String>,
    pub feedback: Feedback,
    pub comment: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryRecord {
    pub feedback_id: String,
    pub session_id: String,
    #[serde(default)]
    pub recommendation_id: Option<String>,
    pub feedback_type: FeedbackType,
    pub feedback_data: Value,
    #[serde(default)]
    pub comment: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl From<FeedbackEntry> for EntryRecord {
    fn from(entry: FeedbackEntry) -> Self {
        EntryRecord {
            feedback_type: entry.feedback.feedback_type(),
            feedback_data: entry.feedback.data(),
            feedback_id: entry.feedback_id,
            session_id: entry.session_id,
            recommendation_id: entry.recommendation_id,
            comment: entry.comment,
            timestamp: entry.timestamp,
        }
    }
}

impl TryFrom<EntryRecord> for FeedbackEntry {
    type Error = GroundrankError;

    fn try_from(record: EntryRecord) -> Result<Self, Self::Error> {
        Ok(FeedbackEntry {
            feedback: Feedback::from_parts(record.feedback_type.as_str(), record.feedback_data)?,
            feedback_id: record.feedback_id,
            session_id: record.session_id,
            recommendation_id: record.recommendation_id,
            comment: record.comment,
            timestamp: record.timestamp,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easier,
    Harder,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Preferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<Difficulty>,
    /// old code -> corrected code
    #[serde(default, alias = "cpt_corrections")]
    pub corrections: BTreeMap<String, String>,
    /// Free-form preferences set through preference feedback
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackState {
    pub session_id: String,
    #[serde(default)]
    pub feedback_entries: Vec<FeedbackEntry>,
    #[serde(default)]
    pub preferences: Preferences,
    #[serde(default, alias = "blocked_cpts")]
    pub blocked_codes: BTreeSet<String>,
    #[serde(default, alias = "blocked_exercises")]
    pub blocked_items: BTreeSet<String>,
    #[serde(default)]
    pub preferred_sources: BTreeSet<SourceType>,
    pub last_updated: DateTime<Utc>,
}

impl FeedbackState {
    pub fn new(session_id: &str) -> Self {
        FeedbackState {
            session_id: session_id.to_string(),
            feedback_entries: Vec::new(),
            preferences: Preferences::default(),
            blocked_codes: BTreeSet::new(),
            blocked_items: BTreeSet::new(),
            preferred_sources: BTreeSet::new(),
            last_updated: Utc::now(),
        }
    }

    /// Append `entry` and fold it into the preference state.
    pub fn record(&mut self, entry: FeedbackEntry) {
        self.project(&entry.feedback);
        self.last_updated = entry.timestamp;
        self.feedback_entries.push(entry);
    }

    fn project(&mut self, feedback: &Feedback) {
        match feedback {
            Feedback::Positive { .. } => {}
            Feedback::Negative { reason, code } => {
                let reason = reason.as_deref().unwrap_or("");
                if reason.contains("too_advanced") {
                    self.preferences.difficulty = Some(Difficulty::Easier);
                } else if reason.contains("too_basic") {
                    self.preferences.difficulty = Some(Difficulty::Harder);
                } else if reason.contains("mismatch") {
                    if let Some(code) = code {
                        self.blocked_codes.insert(code.clone());
                    }
                }
            }
            Feedback::Correction { old_code, new_code } => {
                self.blocked_codes.remove(old_code);
                self.preferences.corrections.insert(old_code.clone(), new_code.clone());
            }
            Feedback::Preference { key, value } => {
                if key == "difficulty" {
                    if let Ok(difficulty) = serde_json::from_value(value.clone()) {
                        self.preferences.difficulty = Some(difficulty);
                    }
                } else if is_corrections_key(key) {
                    for (old_code, new_code) in correction_pairs(value).unwrap_or_default() {
                        self.blocked_codes.remove(&old_code);
                        self.preferences.corrections.insert(old_code, new_code);
                    }
                } else {
                    self.preferences.other.insert(key.clone(), value.clone());
                }
            }
            Feedback::Block { blocked_content } => match blocked_content {
                BlockTarget::Code(code) => {
                    self.blocked_codes.insert(code.clone());
                }
                BlockTarget::Item(title) => {
                    self.blocked_items.insert(title.clone());
                }
                BlockTarget::Source(source) => {
                    self.preferred_sources.insert(*source);
                }
            },
        }
    }

    /// True when nothing in the state would change a request or response.
    pub fn is_neutral(&self) -> bool {
        self.preferences.difficulty.is_none()
            && self.preferences.corrections.is_empty()
            && self.blocked_codes.is_empty()
            && self.blocked_items.is_empty()
            && self.preferred_sources.is_empty()
    }
}

/// Bias a boost manifest with the session's accumulated preferences.
///
/// A neutral state returns the manifest unchanged.
pub fn apply_feedback_to_request(state: &FeedbackState, manifest: &BoostManifest) -> BoostManifest {
    let mut adapted = manifest.clone();

    match state.preferences.difficulty {
        Some(Difficulty::Easier) => {
            adapted.topic_boosts.insert("beginner".to_string(), 1.2);
            adapted.topic_boosts.insert("basic".to_string(), 1.1);
        }
        Some(Difficulty::Harder) => {
            adapted.topic_boosts.insert("advanced".to_string(), 1.2);
            adapted.topic_boosts.insert("complex".to_string(), 1.1);
        }
        None => {}
    }

    for source in &state.preferred_sources {
        adapted.source_boosts.insert(*source, 1.2);
    }
    adapted
}
