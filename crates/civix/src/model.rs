use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A governed geographic scope (city/county/metro/state) that owns its own
/// ordinance text, zoning records, and rule definitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jurisdiction {
    /// Stable identifier; the join key for all dependent data.
    pub id: String,
    /// Display name, e.g. "Cincinnati".
    pub name: String,
    /// Two-letter state code, e.g. "OH".
    pub state: String,
    /// city | county | metro | state
    pub kind: String,
}

/// A retrievable fragment of codified municipal law.
///
/// Usable for similarity search only when `embedding` is present; chunks
/// whose embedding is missing are excluded from scoring, never scored as
/// zero.
#[derive(Debug, Clone)]
pub struct OrdinanceChunk {
    pub id: String,
    pub chapter: String,
    pub section: Option<String>,
    pub title: String,
    pub content: String,
    pub embedding: Option<Vec<f32>>,
    pub source_url: Option<String>,
}

/// A chunk scored against a question, retained for prompt construction and
/// citation rendering. `similarity` is the raw cosine score; display
/// clamping happens at the response edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub id: String,
    pub chapter: String,
    pub section: Option<String>,
    pub title: String,
    pub content: String,
    pub source_url: Option<String>,
    pub similarity: f32,
}

// --- Topic index files ---

/// One topic entry in a jurisdiction's `index.json`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TopicInfo {
    pub id: String,
    /// Detail file name, relative to the jurisdiction's rules directory.
    pub file: String,
    pub title: String,
    pub keywords: Vec<String>,
    pub ordinance_reference: String,
}

/// A curated canonical question with a precomputed answer path.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CommonQuestion {
    pub question: String,
    /// Topic id the answer lives under.
    pub topic: String,
    /// Dot-delimited pointer into the topic's detail data.
    pub answer_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ContactInfo {
    pub general_info: String,
    pub website: String,
    pub service_requests: String,
}

/// Per-jurisdiction structured metadata, loaded from `index.json`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TopicIndex {
    pub jurisdiction: String,
    pub jurisdiction_name: String,
    pub state: String,
    pub version: String,
    pub last_updated: String,
    pub topics: Vec<TopicInfo>,
    #[serde(default)]
    pub common_questions: Vec<CommonQuestion>,
    pub contact: Option<ContactInfo>,
}

/// A topic that matched a question, with the keywords that hit and a
/// heuristic confidence in [0, 1] (not a calibrated probability).
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct TopicMatch {
    pub topic: TopicInfo,
    pub data: serde_json::Value,
    pub matched_keywords: Vec<String>,
    pub confidence: f32,
}

/// Result of matching a question against the curated common-question list.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct CommonQuestionMatch {
    pub topic: String,
    pub answer_path: String,
    pub data: serde_json::Value,
}

// --- Ask (RAG) responses ---

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JurisdictionRef {
    pub id: String,
    pub name: String,
    pub state: String,
}

impl From<&Jurisdiction> for JurisdictionRef {
    fn from(j: &Jurisdiction) -> Self {
        Self {
            id: j.id.clone(),
            name: j.name.clone(),
            state: j.state.clone(),
        }
    }
}

/// A cited ordinance chunk backing an answer. `similarity` is a display
/// percentage in [0, 100], rounded from cosine similarity.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OrdinanceSource {
    pub citation: String,
    pub title: String,
    pub chapter: String,
    pub section: Option<String>,
    pub similarity: u8,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AskMetadata {
    pub chunks_searched: usize,
    pub top_chunks_used: usize,
    pub provider: String,
    pub tokens_used: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AskResponse {
    pub answer: String,
    pub sources: Vec<OrdinanceSource>,
    pub jurisdiction: JurisdictionRef,
    pub metadata: AskMetadata,
}

// --- Hybrid civic answers ---

/// Source attribution for a hybrid answer: either the structured rule file
/// that answered deterministically, or the ordinance text retrieved for RAG.
#[derive(Debug, Clone, Serialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CivicSource {
    StructuredRule {
        topic: String,
        title: String,
        ordinance_reference: String,
        /// Match confidence as a display percentage.
        confidence: u8,
    },
    OrdinanceText {
        citation: String,
        title: String,
        similarity: u8,
    },
}

#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct CivicMetadata {
    /// "rules" when answered deterministically, "rag" otherwise.
    pub source: String,
    pub matched_topic: Option<String>,
}

#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct CivicAnswer {
    pub answer: String,
    pub sources: Vec<CivicSource>,
    pub jurisdiction: JurisdictionRef,
    pub metadata: CivicMetadata,
}

// --- Rule evaluation responses ---

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RuleCitation {
    pub ordinance_number: String,
    pub section: String,
    pub title: Option<String>,
    pub text: String,
    pub url: Option<String>,
    pub page_number: Option<i64>,
}

#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct MatchedRule {
    pub key: String,
    pub description: String,
    pub outcome: String,
    pub priority: i64,
}

#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct EvaluationResult {
    /// The winning rule's stored outcome tag, or "ALLOWED" when no rule
    /// matched. Tags pass through verbatim because seeded rulesets use both
    /// vocabularies (ALLOWED/PROHIBITED/... and approved/conditional/denied).
    pub outcome: String,
    pub rationale: String,
    pub matched_rules: Vec<MatchedRule>,
    pub citations: Vec<RuleCitation>,
    pub jurisdiction_id: String,
}
