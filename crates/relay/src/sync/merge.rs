// Merge policies deciding how candidate document states combine.

use std::cmp::Ordering;
use std::sync::Arc;

use serde_json::{Map, Value};

/// One candidate state tagged with the revision that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeCandidate {
    pub version: u64,
    pub user_id: String,
    pub state: Value,
}

impl MergeCandidate {
    pub fn new(version: u64, user_id: impl Into<String>, state: Value) -> Self {
        Self { version, user_id: user_id.into(), state }
    }
}

/// Strategy reconciling concurrent or out-of-order states.
///
/// Implementations must be deterministic: the same set of candidates yields
/// the same state whatever order the slice is in, and ties never surface as
/// errors.
pub trait MergeResolver: Send + Sync {
    fn name(&self) -> &'static str;

    fn merge(&self, candidates: &[MergeCandidate]) -> Value;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    LastWriterWins,
    Keyed,
}

impl MergePolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "lww" | "last_writer_wins" => Some(Self::LastWriterWins),
            "keyed" | "keyed_lww" => Some(Self::Keyed),
            _ => None,
        }
    }

    pub fn resolver(self) -> Arc<dyn MergeResolver> {
        match self {
            Self::LastWriterWins => Arc::new(LastWriterWins),
            Self::Keyed => Arc::new(KeyedMerge),
        }
    }
}

/// Whole-document last-writer-wins.
///
/// The candidate with the highest `(version, user_id)` tag wins outright.
/// Concurrent edits to disjoint parts of the document are not preserved.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriterWins;

impl MergeResolver for LastWriterWins {
    fn name(&self) -> &'static str {
        "lww"
    }

    fn merge(&self, candidates: &[MergeCandidate]) -> Value {
        candidates
            .iter()
            .max_by(|left, right| compare_tags(left, right))
            .map(|winner| winner.state.clone())
            .unwrap_or_else(empty_state)
    }
}

/// Per-field last-writer-wins over JSON object states.
///
/// Candidates are ordered by their tag and folded field by field, so each
/// top-level key keeps the value of the highest-tagged candidate that wrote
/// it. A `null` value deletes the key; a non-object candidate replaces the
/// whole state. Sorting before folding makes the result independent of the
/// order candidates arrive in.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyedMerge;

impl MergeResolver for KeyedMerge {
    fn name(&self) -> &'static str {
        "keyed"
    }

    fn merge(&self, candidates: &[MergeCandidate]) -> Value {
        let mut ordered: Vec<&MergeCandidate> = candidates.iter().collect();
        ordered.sort_by(|left, right| compare_tags(left, right));

        let mut merged = empty_state();
        for candidate in ordered {
            match (&mut merged, &candidate.state) {
                (Value::Object(fields), Value::Object(changes)) => overlay(fields, changes),
                (_, Value::Object(changes)) => {
                    let mut fields = Map::new();
                    overlay(&mut fields, changes);
                    merged = Value::Object(fields);
                }
                (_, other) => merged = other.clone(),
            }
        }
        merged
    }
}

fn overlay(fields: &mut Map<String, Value>, changes: &Map<String, Value>) {
    for (key, value) in changes {
        if value.is_null() {
            fields.remove(key);
        } else {
            fields.insert(key.clone(), value.clone());
        }
    }
}

/// Total order over candidates: version, then author, then canonical state.
fn compare_tags(left: &MergeCandidate, right: &MergeCandidate) -> Ordering {
    left.version
        .cmp(&right.version)
        .then_with(|| left.user_id.cmp(&right.user_id))
        .then_with(|| left.state.to_string().cmp(&right.state.to_string()))
}

pub(crate) fn empty_state() -> Value {
    Value::Object(Map::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn candidate(version: u64, user: &str, state: Value) -> MergeCandidate {
        MergeCandidate::new(version, user, state)
    }

    #[test]
    fn lww_picks_highest_version_regardless_of_order() {
        let older = candidate(1, "u1", json!({ "title": "a" }));
        let newer = candidate(2, "u2", json!({ "body": "b" }));

        let forward = LastWriterWins.merge(&[older.clone(), newer.clone()]);
        let backward = LastWriterWins.merge(&[newer, older]);

        assert_eq!(forward, json!({ "body": "b" }));
        assert_eq!(forward, backward);
    }

    #[test]
    fn lww_breaks_version_ties_by_user_id() {
        let a = candidate(3, "alice", json!("from alice"));
        let b = candidate(3, "bob", json!("from bob"));

        assert_eq!(LastWriterWins.merge(&[a.clone(), b.clone()]), json!("from bob"));
        assert_eq!(LastWriterWins.merge(&[b, a]), json!("from bob"));
    }

    #[test]
    fn lww_loses_disjoint_concurrent_edits() {
        let base = candidate(1, "u1", json!({ "title": "t" }));
        let edit = candidate(2, "u2", json!({ "body": "b" }));

        let merged = LastWriterWins.merge(&[base, edit]);
        assert!(merged.get("title").is_none());
    }

    #[test]
    fn merge_of_nothing_is_empty_object() {
        assert_eq!(LastWriterWins.merge(&[]), json!({}));
        assert_eq!(KeyedMerge.merge(&[]), json!({}));
    }

    #[test]
    fn keyed_preserves_disjoint_concurrent_edits() {
        let base = candidate(1, "u1", json!({ "title": "t", "body": "old" }));
        let title_edit = candidate(2, "u2", json!({ "title": "new title" }));
        let body_edit = candidate(2, "u3", json!({ "body": "new body" }));

        let merged = KeyedMerge.merge(&[body_edit, base, title_edit]);
        assert_eq!(merged, json!({ "title": "new title", "body": "new body" }));
    }

    #[test]
    fn keyed_null_deletes_field() {
        let base = candidate(1, "u1", json!({ "title": "t", "draft": true }));
        let delete = candidate(2, "u1", json!({ "draft": null }));

        assert_eq!(KeyedMerge.merge(&[base, delete]), json!({ "title": "t" }));
    }

    #[test]
    fn keyed_non_object_candidate_replaces_state() {
        let base = candidate(1, "u1", json!({ "title": "t" }));
        let replace = candidate(2, "u1", json!(["raw", "blob"]));
        let after = candidate(3, "u2", json!({ "title": "again" }));

        assert_eq!(KeyedMerge.merge(&[base.clone(), replace.clone()]), json!(["raw", "blob"]));
        assert_eq!(KeyedMerge.merge(&[after, base, replace]), json!({ "title": "again" }));
    }

    #[test]
    fn keyed_same_key_same_version_uses_deterministic_tie_break() {
        let a = candidate(5, "u1", json!({ "k": "one" }));
        let b = candidate(5, "u1", json!({ "k": "two" }));

        let forward = KeyedMerge.merge(&[a.clone(), b.clone()]);
        let backward = KeyedMerge.merge(&[b, a]);
        assert_eq!(forward, backward);
        assert_eq!(forward, json!({ "k": "two" }));
    }

    #[test]
    fn policy_parse_and_resolver_names() {
        assert_eq!(MergePolicy::parse("LWW"), Some(MergePolicy::LastWriterWins));
        assert_eq!(MergePolicy::parse(" keyed "), Some(MergePolicy::Keyed));
        assert_eq!(MergePolicy::parse("other"), None);
        assert_eq!(MergePolicy::LastWriterWins.resolver().name(), "lww");
        assert_eq!(MergePolicy::Keyed.resolver().name(), "keyed");
    }
}
