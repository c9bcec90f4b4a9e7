/// Structured civics topics.
///
/// Each jurisdiction ships a directory of curated rule files: an
/// `index.json` naming topics (with keyword lists) and canonical common
/// questions, plus one JSON detail file per topic. These power the
/// deterministic answer layer that runs before any embedding or LLM call.
///
/// Loading is lazy and cached per jurisdiction in [`TopicCache`], an
/// explicit injected cache rather than ambient module state so tests can
/// build isolated instances. A concurrent load of the same jurisdiction is
/// idempotent: the first insert wins and the duplicate work is discarded.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use regex::Regex;
use serde_json::Value;
use tracing::{error, warn};

use crate::model::{CommonQuestionMatch, TopicIndex, TopicMatch};
use crate::rules::get_nested;

// Heuristic weights carried over from the production matcher. They are
// tuning knobs, not calibrated probabilities; changing them changes match
// precedence for existing jurisdictions.
const KEYWORD_WEIGHT: f32 = 0.4;
const EXACT_PHRASE_WEIGHT: f32 = 0.3;
const KEYWORD_WORD_RATIO: f32 = 0.5;
const COMMON_QUESTION_WORD_RATIO: f32 = 0.6;

/// A jurisdiction's loaded topic index plus the detail data for every topic
/// whose file was present and parseable.
#[derive(Debug)]
pub struct JurisdictionRules {
    pub index: TopicIndex,
    pub topics: HashMap<String, Value>,
}

/// Process-wide cache of loaded jurisdiction rule files.
pub struct TopicCache {
    rules_dir: PathBuf,
    inner: RwLock<HashMap<String, Arc<JurisdictionRules>>>,
}

impl TopicCache {
    pub fn new(rules_dir: impl Into<PathBuf>) -> Self {
        Self {
            rules_dir: rules_dir.into(),
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Load a jurisdiction's rules, reading from disk on first access.
    /// Returns `None` when the jurisdiction has no rules directory or its
    /// index fails to parse.
    pub fn load(&self, jurisdiction: &str) -> Option<Arc<JurisdictionRules>> {
        let slug = jurisdiction_slug(jurisdiction);

        {
            let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(found) = map.get(&slug) {
                return Some(Arc::clone(found));
            }
        }

        let loaded = Arc::new(load_rules_dir(&self.rules_dir.join(&slug))?);

        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        // Two requests may race to load the same jurisdiction; keep whichever
        // insert landed first.
        Some(Arc::clone(map.entry(slug).or_insert(loaded)))
    }

    /// Drop everything. Rule files are re-read on next access.
    pub fn clear(&self) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Jurisdiction identifiers found in the rules directory (one per
    /// subdirectory with a readable `index.json`).
    pub fn available_jurisdictions(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.rules_dir) else {
            return Vec::new();
        };

        let mut jurisdictions = Vec::new();
        for entry in entries.flatten() {
            let index_path = entry.path().join("index.json");
            let Ok(raw) = std::fs::read_to_string(&index_path) else {
                continue;
            };
            match serde_json::from_str::<Value>(&raw) {
                Ok(index) => {
                    if let Some(id) = index.get("jurisdiction").and_then(Value::as_str) {
                        jurisdictions.push(id.to_string());
                    }
                }
                Err(e) => {
                    warn!(path = %index_path.display(), error = %e, "skipping invalid index file");
                }
            }
        }
        jurisdictions.sort();
        jurisdictions
    }
}

fn load_rules_dir(dir: &Path) -> Option<JurisdictionRules> {
    let index_path = dir.join("index.json");
    let raw = std::fs::read_to_string(&index_path).ok()?;

    let index: TopicIndex = match serde_json::from_str(&raw) {
        Ok(index) => index,
        Err(e) => {
            error!(path = %index_path.display(), error = %e, "failed to parse topic index");
            return None;
        }
    };

    let mut topics = HashMap::new();
    for topic in &index.topics {
        let topic_path = dir.join(&topic.file);
        let Ok(raw) = std::fs::read_to_string(&topic_path) else {
            warn!(topic = %topic.id, path = %topic_path.display(), "topic detail file missing");
            continue;
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(data) => {
                topics.insert(topic.id.clone(), data);
            }
            Err(e) => {
                warn!(topic = %topic.id, error = %e, "topic detail file is not valid JSON");
            }
        }
    }

    Some(JurisdictionRules { index, topics })
}

/// Normalize "Cincinnati, OH" / "cincinnati-oh" / "Cincinnati" to a rules
/// directory slug ("cincinnati").
pub fn jurisdiction_slug(raw: &str) -> String {
    let comma_state = Regex::new(r",\s*[a-z]{2}\.?$").expect("valid regex");
    let hyphen_state = Regex::new(r"-[a-z]{2}$").expect("valid regex");
    let non_alnum = Regex::new(r"[^a-z0-9]").expect("valid regex");

    let lower = raw.trim().to_lowercase();
    let stripped = comma_state.replace(&lower, "");
    let stripped = hyphen_state.replace(&stripped, "");
    non_alnum.replace_all(&stripped, "").into_owned()
}

/// Score every topic against a free-text question by keyword overlap.
///
/// A keyword counts when the full phrase appears in the question, or when at
/// least half of its words appear individually. Topics with no matched
/// keywords are excluded, as is any topic whose detail data failed to load
/// even when its keywords match. Results are sorted by descending confidence
/// (stable, so source order breaks ties).
pub fn find_matching_topics(rules: &JurisdictionRules, question: &str) -> Vec<TopicMatch> {
    let question_lower = question.to_lowercase();
    let question_words: Vec<&str> = question_lower.split_whitespace().collect();

    let mut matches = Vec::new();
    for topic in &rules.index.topics {
        let mut matched_keywords: Vec<String> = Vec::new();

        for keyword in &topic.keywords {
            let keyword_lower = keyword.to_lowercase();

            if question_lower.contains(&keyword_lower) {
                matched_keywords.push(keyword.clone());
                continue;
            }

            let keyword_words: Vec<&str> = keyword_lower.split_whitespace().collect();
            let hit = keyword_words
                .iter()
                .filter(|w| question_words.contains(w))
                .count();
            if hit > 0 && hit as f32 >= keyword_words.len() as f32 * KEYWORD_WORD_RATIO {
                matched_keywords.push(keyword.clone());
            }
        }

        if matched_keywords.is_empty() {
            continue;
        }
        let Some(data) = rules.topics.get(&topic.id) else {
            continue;
        };

        let exact_phrase_matches = matched_keywords
            .iter()
            .filter(|k| question_lower.contains(&k.to_lowercase()))
            .count();
        let confidence = (matched_keywords.len() as f32 * KEYWORD_WEIGHT
            + exact_phrase_matches as f32 * EXACT_PHRASE_WEIGHT)
            .min(1.0);

        matches.push(TopicMatch {
            topic: topic.clone(),
            data: data.clone(),
            matched_keywords,
            confidence,
        });
    }

    matches.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    matches
}

/// Match a question against the curated common-question list.
///
/// A canonical question qualifies when at least 60% of its words appear as
/// substrings of the input. The first qualifier in source order wins;
/// precedence depends on list order.
pub fn match_common_question(
    rules: &JurisdictionRules,
    question: &str,
) -> Option<CommonQuestionMatch> {
    let question_lower = question.to_lowercase();

    for cq in &rules.index.common_questions {
        let canonical = cq.question.to_lowercase();
        let words: Vec<&str> = canonical.split_whitespace().collect();
        let hit = words.iter().filter(|w| question_lower.contains(*w)).count();

        if hit as f32 >= words.len() as f32 * COMMON_QUESTION_WORD_RATIO {
            let Some(data) = rules.topics.get(&cq.topic) else {
                continue;
            };
            return Some(CommonQuestionMatch {
                topic: cq.topic.clone(),
                answer_path: cq.answer_path.clone(),
                data: data.clone(),
            });
        }
    }

    None
}

/// Resolve a common-question answer path against its topic data.
pub fn resolve_answer<'a>(matched: &'a CommonQuestionMatch) -> Option<&'a Value> {
    get_nested(&matched.data, &matched.answer_path)
}

/// Render structured topic data for display.
pub fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "Not specified".to_string(),
        Value::Bool(true) => "Yes".to_string(),
        Value::Bool(false) => "No".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|v| format!("- {}", format_value(v)))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| format!("{}: {}", k.replace('_', " "), format_value(v)))
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use serde_json::json;

    /// Write a small jurisdiction rules tree and return the rules dir root.
    pub fn rules_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let city = dir.path().join("cincinnati");
        std::fs::create_dir_all(&city).unwrap();

        let index = json!({
            "jurisdiction": "cincinnati-oh",
            "jurisdiction_name": "Cincinnati",
            "state": "OH",
            "version": "1.2",
            "last_updated": "2025-06-01",
            "topics": [
                {
                    "id": "fences",
                    "file": "fences.json",
                    "title": "Fence Regulations",
                    "keywords": ["fence", "front yard", "fence height"],
                    "ordinance_reference": "Chapter 701"
                },
                {
                    "id": "noise",
                    "file": "noise.json",
                    "title": "Noise Ordinance",
                    "keywords": ["noise", "quiet hours", "loud music"],
                    "ordinance_reference": "Chapter 910"
                },
                {
                    "id": "ghost",
                    "file": "ghost.json",
                    "title": "Unloaded Topic",
                    "keywords": ["fence"],
                    "ordinance_reference": "Chapter 999"
                }
            ],
            "common_questions": [
                {
                    "question": "How tall can my fence be?",
                    "topic": "fences",
                    "answer_path": "residential.max_height"
                },
                {
                    "question": "What are the quiet hours?",
                    "topic": "noise",
                    "answer_path": "quiet_hours"
                }
            ],
            "contact": {
                "general_info": "311",
                "website": "https://example.gov",
                "service_requests": "https://example.gov/311"
            }
        });
        std::fs::write(city.join("index.json"), index.to_string()).unwrap();

        let fences = json!({
            "title": "Fence Regulations",
            "ordinance_reference": "Chapter 701",
            "summary": "Fences are regulated by height and placement.",
            "residential": {"max_height": "6 feet", "front_yard_max": "4 feet"},
            "permit_required": false
        });
        std::fs::write(city.join("fences.json"), fences.to_string()).unwrap();

        let noise = json!({
            "title": "Noise Ordinance",
            "ordinance_reference": "Chapter 910",
            "summary": "Amplified sound is restricted overnight.",
            "quiet_hours": "10pm to 7am"
        });
        std::fs::write(city.join("noise.json"), noise.to_string()).unwrap();

        // ghost.json intentionally not written: its topic must be excluded.
        dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_normalization() {
        assert_eq!(jurisdiction_slug("Cincinnati, OH"), "cincinnati");
        assert_eq!(jurisdiction_slug("cincinnati-oh"), "cincinnati");
        assert_eq!(jurisdiction_slug("Cincinnati"), "cincinnati");
        assert_eq!(jurisdiction_slug("St. Bernard, OH"), "stbernard");
        assert_eq!(jurisdiction_slug("Park Hills, KY"), "parkhills");
    }

    #[test]
    fn exact_phrase_match_ranks_fence_topic_first() {
        let dir = fixtures::rules_dir();
        let cache = TopicCache::new(dir.path());
        let rules = cache.load("cincinnati-oh").unwrap();

        let matches = find_matching_topics(&rules, "Can I build a fence in my front yard?");
        assert!(!matches.is_empty());
        assert_eq!(matches[0].topic.id, "fences");
        assert!(matches[0].confidence > 0.0);
        assert!(matches[0]
            .matched_keywords
            .iter()
            .any(|k| k == "fence"));
    }

    #[test]
    fn confidence_formula() {
        let dir = fixtures::rules_dir();
        let cache = TopicCache::new(dir.path());
        let rules = cache.load("cincinnati-oh").unwrap();

        // "noise" alone: one matched keyword, one exact phrase.
        let single = find_matching_topics(&rules, "noise");
        assert_eq!(single[0].topic.id, "noise");
        assert!((single[0].confidence - 0.7).abs() < 1e-6);

        // Adding "quiet hours" matches a second keyword; confidence must not
        // decrease, and here caps at 1.0.
        let double = find_matching_topics(&rules, "noise during quiet hours");
        assert_eq!(double[0].topic.id, "noise");
        assert!(double[0].confidence >= single[0].confidence);
        assert!((double[0].confidence - 1.0).abs() < 1e-6);
    }

    #[test]
    fn half_of_keyword_words_is_enough() {
        let dir = fixtures::rules_dir();
        let cache = TopicCache::new(dir.path());
        let rules = cache.load("cincinnati-oh").unwrap();

        // "music" alone is one of the two words of "loud music".
        let matches = find_matching_topics(&rules, "is music allowed outside");
        assert!(matches.iter().any(|m| m.topic.id == "noise"
            && m.matched_keywords.iter().any(|k| k == "loud music")));
    }

    #[test]
    fn topic_without_detail_data_is_excluded() {
        let dir = fixtures::rules_dir();
        let cache = TopicCache::new(dir.path());
        let rules = cache.load("cincinnati-oh").unwrap();

        // "ghost" shares the "fence" keyword but its detail file is missing.
        let matches = find_matching_topics(&rules, "fence");
        assert!(matches.iter().all(|m| m.topic.id != "ghost"));
    }

    #[test]
    fn unmatched_question_yields_nothing() {
        let dir = fixtures::rules_dir();
        let cache = TopicCache::new(dir.path());
        let rules = cache.load("cincinnati-oh").unwrap();

        let matches = find_matching_topics(&rules, "where do I vote");
        assert!(matches.is_empty());
    }

    #[test]
    fn common_question_match_and_answer_path() {
        let dir = fixtures::rules_dir();
        let cache = TopicCache::new(dir.path());
        let rules = cache.load("cincinnati-oh").unwrap();

        let matched = match_common_question(&rules, "how tall can my new fence be?").unwrap();
        assert_eq!(matched.topic, "fences");
        assert_eq!(matched.answer_path, "residential.max_height");
        assert_eq!(resolve_answer(&matched).unwrap().as_str(), Some("6 feet"));
    }

    #[test]
    fn common_question_requires_sixty_percent_of_words() {
        let dir = fixtures::rules_dir();
        let cache = TopicCache::new(dir.path());
        let rules = cache.load("cincinnati-oh").unwrap();

        assert!(match_common_question(&rules, "fence?").is_none());
    }

    #[test]
    fn first_qualifying_common_question_wins() {
        let dir = fixtures::rules_dir();
        let cache = TopicCache::new(dir.path());
        let rules = cache.load("cincinnati-oh").unwrap();

        // Qualifies for the first entry; the second is never considered.
        let matched =
            match_common_question(&rules, "how tall can my fence be during quiet hours").unwrap();
        assert_eq!(matched.topic, "fences");
    }

    #[test]
    fn missing_answer_path_segment_resolves_to_none() {
        let dir = fixtures::rules_dir();
        let cache = TopicCache::new(dir.path());
        let rules = cache.load("cincinnati-oh").unwrap();

        let matched = CommonQuestionMatch {
            topic: "fences".to_string(),
            answer_path: "commercial.max_height".to_string(),
            data: rules.topics.get("fences").unwrap().clone(),
        };
        assert!(resolve_answer(&matched).is_none());
    }

    #[test]
    fn cache_is_isolated_and_clearable() {
        let dir = fixtures::rules_dir();
        let cache = TopicCache::new(dir.path());

        assert!(cache.load("cincinnati-oh").is_some());
        assert!(cache.load("atlantis-oh").is_none());

        cache.clear();
        assert!(cache.load("Cincinnati, OH").is_some());

        let other = TopicCache::new(std::env::temp_dir().join("civix-empty-rules"));
        assert!(other.load("cincinnati-oh").is_none());
    }

    #[test]
    fn lists_available_jurisdictions() {
        let dir = fixtures::rules_dir();
        let cache = TopicCache::new(dir.path());
        assert_eq!(cache.available_jurisdictions(), vec!["cincinnati-oh"]);
    }

    #[test]
    fn format_value_variants() {
        use serde_json::json;

        assert_eq!(format_value(&json!(null)), "Not specified");
        assert_eq!(format_value(&json!(true)), "Yes");
        assert_eq!(format_value(&json!(false)), "No");
        assert_eq!(format_value(&json!(42)), "42");
        assert_eq!(format_value(&json!("6 feet")), "6 feet");
        assert_eq!(
            format_value(&json!(["permit", "inspection"])),
            "- permit\n- inspection"
        );
        assert_eq!(
            format_value(&json!({"max_height": "6 feet"})),
            "max height: 6 feet"
        );
    }
}
