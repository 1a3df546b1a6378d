//! Logical field sets and the canonical digest shared by the plan and both
//! trackers.
//!
//! A [`FieldSet`] is the tracker-neutral projection of an entity: the same
//! story hashed from the plan, from a GitHub issue, or from a Jira issue must
//! produce the same [`ContentHash`] when the three agree. Normalization
//! (label order, line endings, trailing whitespace) happens here, once.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 digest of a [`FieldSet`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(pub String);

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell hashes apart in logs.
        let short = self.0.get(..12).unwrap_or(&self.0);
        f.write_str(short)
    }
}

/// The logical fields compared across the plan and the trackers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSet {
    /// Epic title, story summary, sprint or view name.
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<i64>,
    /// Kind-specific values (sprint dates, view type and columns).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// Canonical form fed to the hasher. Field order here is part of the hash.
#[derive(Serialize)]
struct Canonical<'a> {
    title: &'a str,
    description: String,
    labels: BTreeSet<&'a str>,
    status: Option<&'a str>,
    points: Option<i64>,
    extra: &'a BTreeMap<String, String>,
}

impl FieldSet {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    /// Digest over the normalized fields.
    pub fn digest(&self) -> ContentHash {
        let canonical = Canonical {
            title: self.title.trim(),
            description: normalize_text(&self.description),
            labels: self
                .labels
                .iter()
                .map(|l| l.trim())
                .filter(|l| !l.is_empty())
                .collect(),
            status: self.status.as_deref().map(str::trim),
            points: self.points,
            extra: &self.extra,
        };
        // Serializing plain strings, sets and maps cannot fail.
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        ContentHash(hex::encode(hasher.finalize()))
    }

    /// Names of the logical fields whose normalized values differ.
    pub fn diff(&self, other: &FieldSet) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.title.trim() != other.title.trim() {
            changed.push("title");
        }
        if normalize_text(&self.description) != normalize_text(&other.description) {
            changed.push("description");
        }
        if label_set(&self.labels) != label_set(&other.labels) {
            changed.push("labels");
        }
        if self.status.as_deref().map(str::trim) != other.status.as_deref().map(str::trim) {
            changed.push("status");
        }
        if self.points != other.points {
            changed.push("points");
        }
        if self.extra != other.extra {
            changed.push("extra");
        }
        changed
    }

    /// Every field that carries a value, for changes that create a record.
    pub fn populated(&self) -> Vec<&'static str> {
        self.diff(&FieldSet::default())
    }
}

fn normalize_text(text: &str) -> String {
    text.replace("\r\n", "\n").trim_end().to_string()
}

fn label_set(labels: &[String]) -> BTreeSet<&str> {
    labels
        .iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect()
}

/// Encode kind-specific extras as `key: value` lines.
///
/// Used where a tracker has no native slot for a value (milestone
/// descriptions, project short descriptions).
pub fn encode_extras(extra: &BTreeMap<String, String>) -> String {
    extra
        .iter()
        .map(|(k, v)| format!("{k}: {v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Inverse of [`encode_extras`]. Lines without a `key: value` shape are
/// ignored.
pub fn decode_extras(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect()
}
