/// Question answering over ordinance text.
///
/// `ask` is the retrieval-augmented path: rank chunks, build a
/// citation-labeled context block, and have the completion provider
/// synthesize an answer constrained to that context. `civic_answer` is the
/// hybrid path: the deterministic layer (curated common questions, then
/// keyword topic matches) answers first at zero upstream cost, and RAG is
/// the fallback.
///
/// Retrieval always completes before synthesis; the prompt depends on the
/// ranked chunks. Completion failures propagate as typed errors; there is
/// no silent empty-answer fallback.
use std::sync::Arc;

use civix_common::completion::{CompletionProvider, CompletionRequest};
use civix_common::error::CommonError;

use crate::error::AppError;
use crate::model::{
    AskMetadata, AskResponse, CivicAnswer, CivicMetadata, CivicSource, Jurisdiction,
    OrdinanceSource, RetrievedChunk, TopicMatch,
};
use crate::retrieval::{similarity_percent, RankedRetrieval, Retrieval, Retriever, DEFAULT_TOP_K};
use crate::store::Store;
use crate::topics::{self, TopicCache};

const MAX_ANSWER_TOKENS: u32 = 2_000;
const ANSWER_TEMPERATURE: f32 = 0.1;
// A topic match below this confidence is not trusted to answer on its own;
// the question falls through to RAG.
const DETERMINISTIC_CONFIDENCE_CUTOFF: f32 = 0.5;

pub struct QueryService {
    store: Store,
    retriever: Retriever,
    completion: Arc<dyn CompletionProvider>,
    topics: Arc<TopicCache>,
}

impl QueryService {
    pub fn new(
        store: Store,
        retriever: Retriever,
        completion: Arc<dyn CompletionProvider>,
        topics: Arc<TopicCache>,
    ) -> Self {
        Self {
            store,
            retriever,
            completion,
            topics,
        }
    }

    /// Answer a question from a jurisdiction's ordinance text.
    ///
    /// Unknown jurisdiction ids fail with `JurisdictionNotFound`. A known
    /// jurisdiction with no usable chunks gets a polite explanatory answer
    /// with empty sources, not an error.
    pub async fn ask(
        &self,
        question: &str,
        jurisdiction_id: &str,
        top_k: Option<usize>,
    ) -> Result<AskResponse, AppError> {
        let k = top_k.unwrap_or(DEFAULT_TOP_K);

        let jurisdiction = self
            .store
            .jurisdiction(jurisdiction_id)
            .await?
            .ok_or_else(|| AppError::JurisdictionNotFound(jurisdiction_id.to_string()))?;

        match self.retriever.retrieve(&jurisdiction.id, question, k).await? {
            Retrieval::NoChunks => Ok(no_data_response(
                &jurisdiction,
                format!(
                    "I don't have ordinance data for {}, {} yet. We're working on adding more cities!",
                    jurisdiction.name, jurisdiction.state
                ),
            )),
            Retrieval::NoEmbeddedChunks => Ok(no_data_response(
                &jurisdiction,
                format!(
                    "No ordinance data found for {}, {}.",
                    jurisdiction.name, jurisdiction.state
                ),
            )),
            Retrieval::Ranked(ranked) => self.synthesize(question, &jurisdiction, ranked).await,
        }
    }

    async fn synthesize(
        &self,
        question: &str,
        jurisdiction: &Jurisdiction,
        ranked: RankedRetrieval,
    ) -> Result<AskResponse, AppError> {
        let completion = self
            .completion
            .complete(CompletionRequest {
                system: system_prompt(&jurisdiction.name),
                prompt: user_prompt(question, jurisdiction, &ranked.top),
                max_tokens: MAX_ANSWER_TOKENS,
                temperature: ANSWER_TEMPERATURE,
            })
            .await
            .map_err(CommonError::from)?;

        let sources: Vec<OrdinanceSource> = ranked
            .top
            .iter()
            .map(|chunk| OrdinanceSource {
                citation: citation_label(&jurisdiction.name, chunk),
                title: chunk.title.clone(),
                chapter: chunk.chapter.clone(),
                section: chunk.section.clone(),
                similarity: similarity_percent(chunk.similarity),
                url: chunk.source_url.clone(),
            })
            .collect();

        Ok(AskResponse {
            answer: completion.text,
            metadata: AskMetadata {
                chunks_searched: ranked.chunks_searched,
                top_chunks_used: sources.len(),
                provider: self.completion.name().to_string(),
                tokens_used: completion.tokens_used,
            },
            sources,
            jurisdiction: jurisdiction.into(),
        })
    }

    /// Hybrid lookup: deterministic rule files first, RAG as fallback.
    pub async fn civic_answer(
        &self,
        question: &str,
        jurisdiction_param: &str,
    ) -> Result<CivicAnswer, AppError> {
        let jurisdiction = self.resolve_jurisdiction(jurisdiction_param).await?;

        if let Some(rules) = self.topics.load(jurisdiction_param) {
            // Curated common questions are the cheapest, highest-precision
            // path: a canonical question with a precomputed answer pointer.
            if let Some(matched) = topics::match_common_question(&rules, question) {
                if let Some(answer_value) = topics::resolve_answer(&matched) {
                    let info = rules.index.topics.iter().find(|t| t.id == matched.topic);
                    let (title, reference) = match info {
                        Some(t) => (t.title.clone(), t.ordinance_reference.clone()),
                        None => (matched.topic.clone(), String::new()),
                    };
                    let answer = format!(
                        "Based on {title} ({reference}):\n\n{}",
                        topics::format_value(answer_value)
                    );
                    return Ok(CivicAnswer {
                        answer,
                        sources: vec![CivicSource::StructuredRule {
                            topic: matched.topic.clone(),
                            title,
                            ordinance_reference: reference,
                            confidence: 100,
                        }],
                        jurisdiction: (&jurisdiction).into(),
                        metadata: CivicMetadata {
                            source: "rules".to_string(),
                            matched_topic: Some(matched.topic),
                        },
                    });
                }
            }

            let matches = topics::find_matching_topics(&rules, question);
            if let Some(top) = matches
                .first()
                .filter(|m| m.confidence >= DETERMINISTIC_CONFIDENCE_CUTOFF)
            {
                return Ok(CivicAnswer {
                    answer: format_topic_answer(question, top),
                    sources: vec![CivicSource::StructuredRule {
                        topic: top.topic.id.clone(),
                        title: top.topic.title.clone(),
                        ordinance_reference: top.topic.ordinance_reference.clone(),
                        confidence: (top.confidence * 100.0).round() as u8,
                    }],
                    jurisdiction: (&jurisdiction).into(),
                    metadata: CivicMetadata {
                        source: "rules".to_string(),
                        matched_topic: Some(top.topic.id.clone()),
                    },
                });
            }
        }

        self.civic_rag_fallback(question, &jurisdiction).await
    }

    async fn civic_rag_fallback(
        &self,
        question: &str,
        jurisdiction: &Jurisdiction,
    ) -> Result<CivicAnswer, AppError> {
        let outcome = self
            .retriever
            .retrieve(&jurisdiction.id, question, DEFAULT_TOP_K)
            .await?;

        let ranked = match outcome {
            Retrieval::NoChunks | Retrieval::NoEmbeddedChunks => {
                return Ok(CivicAnswer {
                    answer: format!(
                        "I don't have detailed ordinance data for {} to answer this question.",
                        jurisdiction.name
                    ),
                    sources: vec![],
                    jurisdiction: jurisdiction.into(),
                    metadata: CivicMetadata {
                        source: "rag".to_string(),
                        matched_topic: None,
                    },
                });
            }
            Retrieval::Ranked(ranked) => ranked,
        };

        let response = self.synthesize(question, jurisdiction, ranked).await?;
        Ok(CivicAnswer {
            answer: response.answer,
            sources: response
                .sources
                .into_iter()
                .map(|s| CivicSource::OrdinanceText {
                    citation: s.citation,
                    title: s.title,
                    similarity: s.similarity,
                })
                .collect(),
            jurisdiction: jurisdiction.into(),
            metadata: CivicMetadata {
                source: "rag".to_string(),
                matched_topic: None,
            },
        })
    }

    /// Resolve a jurisdiction by stable id, falling back to the display name
    /// implied by a slug ("cincinnati-oh" → "cincinnati").
    async fn resolve_jurisdiction(&self, param: &str) -> Result<Jurisdiction, AppError> {
        if let Some(found) = self.store.jurisdiction(param).await? {
            return Ok(found);
        }
        let name = param.split('-').next().unwrap_or(param).trim();
        self.store
            .find_jurisdiction(name, None)
            .await?
            .ok_or_else(|| AppError::JurisdictionNotFound(param.to_string()))
    }
}

fn no_data_response(jurisdiction: &Jurisdiction, answer: String) -> AskResponse {
    AskResponse {
        answer,
        sources: vec![],
        jurisdiction: jurisdiction.into(),
        metadata: AskMetadata {
            chunks_searched: 0,
            top_chunks_used: 0,
            provider: "none".to_string(),
            tokens_used: 0,
        },
    }
}

/// Citation label for a chunk, e.g. "Cincinnati Code §701-3".
fn citation_label(jurisdiction_name: &str, chunk: &RetrievedChunk) -> String {
    match &chunk.section {
        Some(section) => format!("{jurisdiction_name} Code §{}-{section}", chunk.chapter),
        None => format!("{jurisdiction_name} Code §{}", chunk.chapter),
    }
}

fn system_prompt(jurisdiction_name: &str) -> String {
    format!(
        "You are a helpful assistant that answers questions about local ordinances and regulations.

CRITICAL RULES - FOLLOW EXACTLY:
1. ONLY use information from the provided ordinance sections - NEVER guess or make up information
2. Always cite specific sections using the format: [{jurisdiction_name} Code §123-45]
3. If the question is VAGUE or UNCLEAR, ask clarifying questions to narrow down the exact regulation
4. If multiple regulations might apply, list the options and ask which situation applies to the user
5. If the answer isn't in the provided context, say \"I don't have information about that in the {jurisdiction_name} ordinances\"
6. NEVER hallucinate - if you're not sure, ask for clarification instead of guessing

FUNNELING STRATEGY:
- If the question is too broad (e.g., \"can I build?\"), ask: \"What type of structure? (fence, shed, deck, addition, etc.)\"
- If location matters, ask: \"What is your property zoning? (residential, commercial, etc.)\"
- If multiple rules apply, present options: \"This could apply to: 1) X, 2) Y. Which describes your situation?\"

ONLY provide a definitive answer when you have a clear match in the ordinance text."
    )
}

/// Context block with pre-formatted citation labels. The model is instructed
/// to reuse these exact labels so every citation stays traceable to a real
/// chunk.
fn user_prompt(question: &str, jurisdiction: &Jurisdiction, chunks: &[RetrievedChunk]) -> String {
    let sections = chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            format!(
                "[{}] {} - {}\n{}",
                i + 1,
                citation_label(&jurisdiction.name, chunk),
                chunk.title,
                chunk.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n---\n\n");

    format!(
        "Question: {question}\n\n\
         Location: {}, {}\n\n\
         Relevant Ordinance Sections:\n\n{sections}\n\n\
         Answer the question based ONLY on the ordinance sections above. \
         Include specific citations in your answer.",
        jurisdiction.name, jurisdiction.state
    )
}

// Question patterns and the detail-data keys they pull into a deterministic
// answer. A question about fees should surface fee fields even when the
// topic file buries them a level deep.
const SECTION_PATTERNS: &[(&[&str], &[&str])] = &[
    (
        &["permit", "need", "require"],
        &["permit", "permit_required", "permit_requirements", "requirements"],
    ),
    (
        &["fee", "cost", "price"],
        &["fee", "fees", "penalties", "fine", "fines"],
    ),
    (
        &["time", "hour", "when"],
        &["hours", "timeframe", "schedule", "prohibited_hours", "quiet_hours"],
    ),
    (
        &["height", "tall", "high"],
        &["max_height", "height", "residential_zones", "commercial_zones"],
    ),
    (&["where", "location"], &["location", "placement", "setback"]),
    (
        &["how", "process", "step"],
        &["process", "registration", "application", "how_to"],
    ),
    (
        &["penalty", "fine", "violation"],
        &["penalties", "fines", "enforcement", "violations"],
    ),
    (&["contact", "phone", "help"], &["contact", "department", "phone"]),
];

// Keys that are topic metadata, not answer content.
const META_KEYS: &[&str] = &["jurisdiction", "topic", "title", "ordinance_reference", "summary"];

/// Render a matched topic's structured data as a readable answer: header,
/// summary, then the sections relevant to the question.
fn format_topic_answer(question: &str, matched: &TopicMatch) -> String {
    let mut answer = format!(
        "Based on {} ({}):\n\n",
        matched.topic.title, matched.topic.ordinance_reference
    );

    if let Some(summary) = matched.data.get("summary").and_then(|v| v.as_str()) {
        answer.push_str(summary);
        answer.push_str("\n\n");
    }

    for (key, value) in relevant_sections(question, &matched.data) {
        answer.push_str(&format!(
            "### {}\n{}\n\n",
            section_label(&key),
            topics::format_value(&value)
        ));
    }

    answer.trim_end().to_string()
}

/// Pick the detail-data entries worth showing for this question. When no
/// pattern hits, fall back to every non-meta top-level key.
fn relevant_sections(question: &str, data: &serde_json::Value) -> Vec<(String, serde_json::Value)> {
    let Some(map) = data.as_object() else {
        return Vec::new();
    };
    let question_lower = question.to_lowercase();

    let mut selected: Vec<(String, serde_json::Value)> = Vec::new();
    for (patterns, keys) in SECTION_PATTERNS {
        if !patterns.iter().any(|p| question_lower.contains(p)) {
            continue;
        }
        for key in *keys {
            if selected.iter().any(|(k, _)| k == key) {
                continue;
            }
            if let Some(value) = map.get(*key) {
                selected.push((key.to_string(), value.clone()));
                continue;
            }
            // One level of nesting: surface e.g. residential.max_height.
            for (outer_key, outer_value) in map {
                if let Some(inner) = outer_value.as_object().and_then(|o| o.get(*key)) {
                    let label = format!("{outer_key}.{key}");
                    if !selected.iter().any(|(k, _)| k == &label) {
                        selected.push((label, inner.clone()));
                    }
                }
            }
        }
    }

    if selected.is_empty() {
        for (key, value) in map {
            if !META_KEYS.contains(&key.as_str()) {
                selected.push((key.clone(), value.clone()));
            }
        }
    }

    selected
}

/// "quiet_hours" → "Quiet Hours", "residential.max_height" → "Residential Max Height".
fn section_label(key: &str) -> String {
    key.replace(['_', '.'], " ")
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use civix_common::completion::{Completion, CompletionError};
    use civix_common::redis::RedisCache;

    use crate::cache::QueryCache;
    use crate::retrieval::testing::FixedEmbedder;
    use crate::topics::fixtures;

    /// Completion fake recording every request it receives.
    struct RecordingCompletion {
        calls: AtomicUsize,
        last: Mutex<Option<CompletionRequest>>,
    }

    impl RecordingCompletion {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                last: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl CompletionProvider for RecordingCompletion {
        fn name(&self) -> &str {
            "fake"
        }

        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<Completion, CompletionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some(request);
            Ok(Completion {
                text: "Per [Cincinnati Code §701-3], fences may be up to 6 feet.".to_string(),
                tokens_used: 42,
            })
        }
    }

    async fn service(
        query_vec: Vec<f32>,
        rules_dir: &std::path::Path,
    ) -> (QueryService, Store, Arc<RecordingCompletion>) {
        let store = Store::connect_in_memory().await.unwrap();
        store.migrate().await.unwrap();
        store
            .insert_jurisdiction("cincinnati-oh", "Cincinnati", "OH", "city")
            .await;

        let cache = Arc::new(QueryCache::new(RedisCache::new(None)));
        let retriever = Retriever::new(
            store.clone(),
            Arc::new(FixedEmbedder(query_vec)),
            cache,
        );
        let completion = RecordingCompletion::new();
        let topics = Arc::new(TopicCache::new(rules_dir));
        let provider: Arc<dyn CompletionProvider> = completion.clone();
        let service = QueryService::new(store.clone(), retriever, provider, topics);
        (service, store, completion)
    }

    #[tokio::test]
    async fn unknown_jurisdiction_is_a_typed_not_found() {
        let dir = fixtures::rules_dir();
        let (service, _store, _completion) = service(vec![1.0, 0.0], dir.path()).await;

        let err = service.ask("noise?", "atlantis-oh", None).await.unwrap_err();
        assert!(matches!(err, AppError::JurisdictionNotFound(ref id) if id == "atlantis-oh"));
    }

    #[tokio::test]
    async fn zero_chunk_jurisdiction_gets_a_graceful_answer() {
        let dir = fixtures::rules_dir();
        let (service, _store, completion) = service(vec![1.0, 0.0], dir.path()).await;

        let response = service
            .ask("What are the noise rules?", "cincinnati-oh", None)
            .await
            .unwrap();
        assert!(response.sources.is_empty());
        assert!(response.answer.contains("Cincinnati"));
        assert_eq!(response.metadata.chunks_searched, 0);
        // No synthesis without retrieved context.
        assert_eq!(completion.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ask_synthesizes_with_cited_sources() {
        let dir = fixtures::rules_dir();
        let (service, store, completion) = service(vec![1.0, 0.0], dir.path()).await;
        store
            .insert_chunk(
                "c1", "cincinnati-oh", "701", Some("3"), "Fence Heights",
                "Fences in residential districts shall not exceed six feet.",
                Some("[1.0, 0.0]"), Some("https://example.gov/701-3"),
            )
            .await;
        store
            .insert_chunk(
                "c2", "cincinnati-oh", "910", None, "Quiet Hours",
                "Amplified sound is prohibited between 10pm and 7am.",
                Some("[0.0, 1.0]"), None,
            )
            .await;

        let response = service
            .ask("How tall can a fence be?", "cincinnati-oh", Some(2))
            .await
            .unwrap();

        assert_eq!(response.sources.len(), 2);
        assert_eq!(response.sources[0].citation, "Cincinnati Code §701-3");
        assert_eq!(response.sources[0].similarity, 100);
        assert_eq!(response.sources[1].citation, "Cincinnati Code §910");
        assert_eq!(response.sources[1].similarity, 0);
        assert_eq!(response.metadata.chunks_searched, 2);
        assert_eq!(response.metadata.top_chunks_used, 2);
        assert_eq!(response.metadata.provider, "fake");
        assert_eq!(response.metadata.tokens_used, 42);

        // The prompt carries the labeled context and a low temperature.
        assert_eq!(completion.calls.load(Ordering::SeqCst), 1);
        let request = completion.last.lock().unwrap().clone().unwrap();
        assert!(request.temperature <= 0.2);
        assert!(request.system.contains("Cincinnati Code"));
        assert!(request.prompt.contains("[1] Cincinnati Code §701-3 - Fence Heights"));
        assert!(request.prompt.contains("six feet"));
    }

    #[tokio::test]
    async fn civic_answer_prefers_the_deterministic_layer() {
        let dir = fixtures::rules_dir();
        let (service, _store, completion) = service(vec![1.0, 0.0], dir.path()).await;

        let answer = service
            .civic_answer("Can I build a fence in my front yard?", "cincinnati-oh")
            .await
            .unwrap();

        assert_eq!(answer.metadata.source, "rules");
        assert_eq!(answer.metadata.matched_topic.as_deref(), Some("fences"));
        assert!(answer.answer.contains("Fence Regulations"));
        assert!(matches!(
            answer.sources[0],
            CivicSource::StructuredRule { ref topic, .. } if topic == "fences"
        ));
        // Deterministic answers never touch the completion service.
        assert_eq!(completion.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn civic_answer_resolves_common_questions_by_answer_path() {
        let dir = fixtures::rules_dir();
        let (service, _store, completion) = service(vec![1.0, 0.0], dir.path()).await;

        let answer = service
            .civic_answer("How tall can my fence be?", "cincinnati-oh")
            .await
            .unwrap();

        assert_eq!(answer.metadata.source, "rules");
        assert!(answer.answer.contains("6 feet"));
        assert_eq!(completion.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn civic_answer_falls_back_to_rag() {
        let dir = fixtures::rules_dir();
        let (service, store, completion) = service(vec![1.0, 0.0], dir.path()).await;
        store
            .insert_chunk(
                "c1", "cincinnati-oh", "1501", None, "Elections",
                "Polling locations are designated by the board of elections.",
                Some("[1.0, 0.0]"), None,
            )
            .await;

        let answer = service
            .civic_answer("where do I vote", "cincinnati-oh")
            .await
            .unwrap();

        assert_eq!(answer.metadata.source, "rag");
        assert_eq!(completion.calls.load(Ordering::SeqCst), 1);
        assert!(matches!(answer.sources[0], CivicSource::OrdinanceText { .. }));
    }

    #[tokio::test]
    async fn civic_answer_without_any_data_stays_graceful() {
        let dir = fixtures::rules_dir();
        let (service, _store, completion) = service(vec![1.0, 0.0], dir.path()).await;

        let answer = service
            .civic_answer("where do I vote", "cincinnati-oh")
            .await
            .unwrap();

        assert_eq!(answer.metadata.source, "rag");
        assert!(answer.sources.is_empty());
        assert!(answer.answer.contains("Cincinnati"));
        assert_eq!(completion.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn citation_labels_with_and_without_section() {
        let with_section = RetrievedChunk {
            id: "c1".to_string(),
            chapter: "701".to_string(),
            section: Some("3".to_string()),
            title: "Fences".to_string(),
            content: String::new(),
            source_url: None,
            similarity: 1.0,
        };
        let without_section = RetrievedChunk {
            section: None,
            ..with_section.clone()
        };
        assert_eq!(citation_label("Cincinnati", &with_section), "Cincinnati Code §701-3");
        assert_eq!(citation_label("Cincinnati", &without_section), "Cincinnati Code §701");
    }

    #[test]
    fn topic_answers_surface_question_relevant_sections() {
        let matched = TopicMatch {
            topic: crate::model::TopicInfo {
                id: "fences".to_string(),
                file: "fences.json".to_string(),
                title: "Fence Regulations".to_string(),
                keywords: vec!["fence".to_string()],
                ordinance_reference: "Chapter 701".to_string(),
            },
            data: json!({
                "summary": "Fences are regulated by height and placement.",
                "residential": {"max_height": "6 feet"},
                "permit_required": false,
            }),
            matched_keywords: vec!["fence".to_string()],
            confidence: 0.7,
        };

        let answer = format_topic_answer("how tall can my fence be", &matched);
        assert!(answer.starts_with("Based on Fence Regulations (Chapter 701):"));
        assert!(answer.contains("Fences are regulated"));
        assert!(answer.contains("Residential Max Height"));
        assert!(answer.contains("6 feet"));
    }

    #[test]
    fn section_labels_are_title_cased() {
        assert_eq!(section_label("quiet_hours"), "Quiet Hours");
        assert_eq!(section_label("residential.max_height"), "Residential Max Height");
    }
}
