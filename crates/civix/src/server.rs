/// MCP server for Civix.
///
/// Exposes the two entry points and the civics lookup surface as tools:
/// - `ask_ordinances`: RAG question answering with citations
/// - `civic_answer`: hybrid deterministic-rules-then-RAG answering
/// - `evaluate_compliance`: condition-tree rule evaluation over a fact map
/// - `match_topics` / `common_question`: the deterministic matchers directly
/// - `list_topics` / `get_topic` / `list_jurisdictions`: civics metadata
use std::sync::Arc;

use rmcp::{
    Json, ServerHandler,
    handler::server::router::tool::ToolRouter,
    handler::server::wrapper::Parameters,
    model::*,
    tool, tool_handler, tool_router,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::model::{CommonQuestionMatch, TopicIndex, TopicInfo, TopicMatch};
use crate::model::{AskResponse, CivicAnswer, EvaluationResult};
use crate::rag::QueryService;
use crate::rules::{EvaluationRequest, RulesEngine};
use crate::topics::{self, TopicCache};

#[derive(Clone)]
pub struct CivixServer {
    query: Arc<QueryService>,
    engine: Arc<RulesEngine>,
    topics: Arc<TopicCache>,
    tool_router: ToolRouter<CivixServer>,
}

impl CivixServer {
    pub fn new(query: Arc<QueryService>, engine: Arc<RulesEngine>, topics: Arc<TopicCache>) -> Self {
        Self {
            query,
            engine,
            topics,
            tool_router: Self::tool_router(),
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct AskParams {
    /// The user's question about local ordinances.
    question: String,
    /// Stable jurisdiction identifier, e.g. "cincinnati-oh".
    jurisdiction_id: String,
    /// Number of ordinance chunks to ground the answer on (default: 5, max: 20).
    top_k: Option<u32>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct CivicAnswerParams {
    question: String,
    /// Jurisdiction id or name, e.g. "cincinnati-oh" or "Cincinnati, OH".
    jurisdiction: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct EvaluateParams {
    /// "Name, ST" form, e.g. "Covington, KY".
    jurisdiction: String,
    /// Ruleset category, e.g. "animals" or "short_term_rentals".
    category: String,
    /// Optional subcategory narrowing, e.g. "restricted-breeds".
    subcategory: Option<String>,
    /// Fact map collected from the user, addressed by dot paths in rule
    /// conditions.
    inputs: serde_json::Value,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct TopicQuestionParams {
    jurisdiction: String,
    question: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ListTopicsParams {
    jurisdiction: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct GetTopicParams {
    jurisdiction: String,
    /// Topic id from `list_topics`, e.g. "fences".
    topic: String,
}

#[derive(Debug, Serialize, JsonSchema)]
struct MatchTopicsResponse {
    matches: Vec<TopicMatch>,
}

#[derive(Debug, Serialize, JsonSchema)]
struct CommonQuestionResponse {
    matched: Option<CommonQuestionMatch>,
    /// The resolved answer value rendered for display, when matched.
    answer: Option<String>,
}

#[derive(Debug, Serialize, JsonSchema)]
struct TopicDetailResponse {
    jurisdiction: String,
    topic: TopicInfo,
    data: serde_json::Value,
}

#[derive(Debug, Serialize, JsonSchema)]
struct JurisdictionListResponse {
    jurisdictions: Vec<String>,
}

#[tool_router]
impl CivixServer {
    #[tool(description = "Answer an ordinance question for a jurisdiction using retrieval-augmented generation. Returns the answer plus cited code sections with similarity scores.")]
    async fn ask_ordinances(
        &self,
        Parameters(params): Parameters<AskParams>,
    ) -> Result<Json<AskResponse>, String> {
        let question = params.question.trim().to_string();
        if question.is_empty() {
            return Err("question must not be empty".to_string());
        }
        let jurisdiction_id = params.jurisdiction_id.trim().to_string();
        if jurisdiction_id.is_empty() {
            return Err("jurisdiction_id must not be empty".to_string());
        }
        let top_k = params.top_k.map(|k| k.clamp(1, 20) as usize);

        self.query
            .ask(&question, &jurisdiction_id, top_k)
            .await
            .map(Json)
            .map_err(|e| e.to_string())
    }

    #[tool(description = "Answer a civics question, preferring the jurisdiction's structured rule files and falling back to ordinance-text RAG. The response says which path answered.")]
    async fn civic_answer(
        &self,
        Parameters(params): Parameters<CivicAnswerParams>,
    ) -> Result<Json<CivicAnswer>, String> {
        let question = params.question.trim().to_string();
        if question.is_empty() {
            return Err("question must not be empty".to_string());
        }

        self.query
            .civic_answer(&question, params.jurisdiction.trim())
            .await
            .map(Json)
            .map_err(|e| e.to_string())
    }

    #[tool(description = "Evaluate a jurisdiction's compliance rules against collected facts. Returns the winning rule's outcome with citations, or the default ALLOWED outcome when no rule matches.")]
    async fn evaluate_compliance(
        &self,
        Parameters(params): Parameters<EvaluateParams>,
    ) -> Result<Json<EvaluationResult>, String> {
        if !params.inputs.is_object() {
            return Err("inputs must be a JSON object of collected facts".to_string());
        }

        let request = EvaluationRequest {
            jurisdiction: params.jurisdiction.trim().to_string(),
            category: params.category.trim().to_string(),
            subcategory: params.subcategory.map(|s| s.trim().to_string()),
            inputs: params.inputs,
        };

        self.engine
            .evaluate(request)
            .await
            .map(Json)
            .map_err(|e| e.to_string())
    }

    #[tool(description = "Score a jurisdiction's structured topics against a question by keyword overlap. Returns matches ordered by descending confidence.")]
    async fn match_topics(
        &self,
        Parameters(params): Parameters<TopicQuestionParams>,
    ) -> Result<Json<MatchTopicsResponse>, String> {
        let matches = match self.topics.load(&params.jurisdiction) {
            Some(rules) => topics::find_matching_topics(&rules, &params.question),
            None => Vec::new(),
        };
        Ok(Json(MatchTopicsResponse { matches }))
    }

    #[tool(description = "Match a question against the jurisdiction's curated common-question list. At most one match; the first canonical question meeting the overlap threshold wins.")]
    async fn common_question(
        &self,
        Parameters(params): Parameters<TopicQuestionParams>,
    ) -> Result<Json<CommonQuestionResponse>, String> {
        let matched = self
            .topics
            .load(&params.jurisdiction)
            .and_then(|rules| topics::match_common_question(&rules, &params.question));

        let answer = matched
            .as_ref()
            .and_then(topics::resolve_answer)
            .map(topics::format_value);

        Ok(Json(CommonQuestionResponse { matched, answer }))
    }

    #[tool(description = "List the structured civics topics, common questions, and contact info available for a jurisdiction.")]
    async fn list_topics(
        &self,
        Parameters(params): Parameters<ListTopicsParams>,
    ) -> Result<Json<TopicIndex>, String> {
        let rules = self
            .topics
            .load(&params.jurisdiction)
            .ok_or_else(|| format!("no structured rules available for {}", params.jurisdiction))?;
        Ok(Json(rules.index.clone()))
    }

    #[tool(description = "Fetch the full structured rule data for one topic.")]
    async fn get_topic(
        &self,
        Parameters(params): Parameters<GetTopicParams>,
    ) -> Result<Json<TopicDetailResponse>, String> {
        let rules = self
            .topics
            .load(&params.jurisdiction)
            .ok_or_else(|| format!("no structured rules available for {}", params.jurisdiction))?;

        let info = rules
            .index
            .topics
            .iter()
            .find(|t| t.id == params.topic)
            .ok_or_else(|| {
                let available: Vec<&str> =
                    rules.index.topics.iter().map(|t| t.id.as_str()).collect();
                crate::error::AppError::TopicNotFound(format!(
                    "{} (available: {})",
                    params.topic,
                    available.join(", ")
                ))
                .to_string()
            })?;

        let data = rules
            .topics
            .get(&params.topic)
            .cloned()
            .ok_or_else(|| format!("topic data failed to load: {}", params.topic))?;

        Ok(Json(TopicDetailResponse {
            jurisdiction: rules.index.jurisdiction.clone(),
            topic: info.clone(),
            data,
        }))
    }

    #[tool(description = "List jurisdiction identifiers that have structured civics rules.")]
    async fn list_jurisdictions(&self) -> Result<Json<JurisdictionListResponse>, String> {
        Ok(Json(JurisdictionListResponse {
            jurisdictions: self.topics.available_jurisdictions(),
        }))
    }
}

#[tool_handler]
impl ServerHandler for CivixServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_06_18,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "civix".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Municipal-compliance lookup for supported jurisdictions. Use ask_ordinances for \
cited answers from ordinance text, civic_answer for questions the structured rule files may \
answer deterministically, and evaluate_compliance once a guided flow has collected the facts a \
ruleset needs. list_jurisdictions/list_topics/get_topic expose the available civics data."
                    .to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::CivixServer;

    #[test]
    fn tools_publish_output_schemas() {
        let tools = CivixServer::tool_router().list_all();
        for name in [
            "ask_ordinances",
            "civic_answer",
            "evaluate_compliance",
            "match_topics",
            "common_question",
            "list_topics",
            "get_topic",
            "list_jurisdictions",
        ] {
            let tool = tools
                .iter()
                .find(|t| t.name == name)
                .unwrap_or_else(|| panic!("missing tool: {name}"));
            assert!(
                tool.output_schema.is_some(),
                "tool {name} should publish output_schema"
            );
        }
    }
}
