/// Deterministic rules engine.
///
/// Rules carry a boolean condition tree evaluated against a fact map supplied
/// by a guided flow. Among all rules whose condition holds, the highest
/// priority wins; when none hold the engine answers ALLOWED with no
/// citations.
///
/// Condition trees arrive as JSON blobs authored administratively. Parsing
/// never fails: unrecognized shapes land in an explicit `Invalid` arm and
/// unrecognized operator spellings in `Operator::Unknown`, both of which
/// evaluate to false and are reported by [`lint_condition`] so operators can
/// audit rules that silently degrade to the default outcome.
use serde_json::Value;
use tracing::warn;

use crate::error::AppError;
use crate::model::{EvaluationResult, MatchedRule, RuleCitation};
use crate::store::Store;

pub const DEFAULT_OUTCOME: &str = "ALLOWED";
pub const DEFAULT_RATIONALE: &str = "No restrictions found based on the information provided.";

/// Comparison operators. Alias spellings from both seeded engines are
/// accepted on parse; anything else becomes `Unknown` and never matches.
#[derive(Debug, Clone, PartialEq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Contains,
    NotContains,
    Unknown(String),
}

impl Operator {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "eq" | "equal" => Operator::Eq,
            "ne" | "notEqual" => Operator::Ne,
            "gt" | "greaterThan" => Operator::Gt,
            "gte" | "greaterThanOrEqual" => Operator::Gte,
            "lt" | "lessThan" => Operator::Lt,
            "lte" | "lessThanOrEqual" => Operator::Lte,
            "in" => Operator::In,
            "notIn" | "not_in" => Operator::NotIn,
            "contains" => Operator::Contains,
            "notContains" | "not_contains" => Operator::NotContains,
            other => Operator::Unknown(other.to_string()),
        }
    }
}

/// A boolean condition tree.
///
/// `Invalid` is the explicit fallback arm for nodes with a missing or
/// unrecognized `type`, or a non-object node; it always evaluates to false.
#[derive(Debug, Clone)]
pub enum Condition {
    Comparison {
        fact: String,
        operator: Operator,
        value: Value,
    },
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
    Invalid(String),
}

impl Condition {
    /// Interpret a stored JSON blob as a condition tree. Never fails.
    pub fn from_value(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Condition::Invalid(format!("condition is not an object: {value}"));
        };

        let Some(kind) = obj.get("type").and_then(Value::as_str) else {
            return Condition::Invalid("condition has no type field".to_string());
        };

        match kind {
            "and" | "or" => {
                let Some(children) = obj.get("conditions").and_then(Value::as_array) else {
                    return Condition::Invalid(format!("{kind} condition has no conditions array"));
                };
                let parsed = children.iter().map(Condition::from_value).collect();
                if kind == "and" {
                    Condition::And(parsed)
                } else {
                    Condition::Or(parsed)
                }
            }
            "not" => match obj.get("condition") {
                Some(child) => Condition::Not(Box::new(Condition::from_value(child))),
                None => Condition::Invalid("not condition has no child".to_string()),
            },
            "comparison" => {
                let Some(fact) = obj.get("fact").and_then(Value::as_str) else {
                    return Condition::Invalid("comparison has no fact field".to_string());
                };
                let Some(operator) = obj.get("operator").and_then(Value::as_str) else {
                    return Condition::Invalid("comparison has no operator field".to_string());
                };
                Condition::Comparison {
                    fact: fact.to_string(),
                    operator: Operator::parse(operator),
                    value: obj.get("value").cloned().unwrap_or(Value::Null),
                }
            }
            other => Condition::Invalid(format!("unrecognized condition type: {other}")),
        }
    }

    /// Recursively evaluate against a fact map.
    ///
    /// Empty `and` is vacuously true and empty `or` vacuously false, matching
    /// the all/any semantics the stored rules were authored against.
    pub fn evaluate(&self, facts: &Value) -> bool {
        match self {
            Condition::And(children) => children.iter().all(|c| c.evaluate(facts)),
            Condition::Or(children) => children.iter().any(|c| c.evaluate(facts)),
            Condition::Not(child) => !child.evaluate(facts),
            Condition::Comparison {
                fact,
                operator,
                value,
            } => compare(get_nested(facts, fact), operator, value),
            Condition::Invalid(reason) => {
                warn!(%reason, "invalid condition node evaluated to false");
                false
            }
        }
    }
}

/// Walk a dot-separated path into a fact map. Returns `None` the moment any
/// segment is missing; never panics.
pub fn get_nested<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn compare(fact: Option<&Value>, operator: &Operator, value: &Value) -> bool {
    match operator {
        Operator::Eq => fact.is_some_and(|f| json_eq(f, value)),
        // An absent fact is not equal to any stored value.
        Operator::Ne => !fact.is_some_and(|f| json_eq(f, value)),
        Operator::Gt => json_ord(fact, value).is_some_and(|(l, r)| l > r),
        Operator::Gte => json_ord(fact, value).is_some_and(|(l, r)| l >= r),
        Operator::Lt => json_ord(fact, value).is_some_and(|(l, r)| l < r),
        Operator::Lte => json_ord(fact, value).is_some_and(|(l, r)| l <= r),
        // in/notIn require an array value; anything else fails both ways.
        Operator::In => match value.as_array() {
            Some(items) => fact.is_some_and(|f| items.iter().any(|item| json_eq(item, f))),
            None => false,
        },
        Operator::NotIn => match value.as_array() {
            Some(items) => !fact.is_some_and(|f| items.iter().any(|item| json_eq(item, f))),
            None => false,
        },
        Operator::Contains => match fact {
            Some(f) => json_text(f).contains(&json_text(value)),
            None => false,
        },
        Operator::NotContains => match fact {
            Some(f) => !json_text(f).contains(&json_text(value)),
            None => false,
        },
        Operator::Unknown(name) => {
            warn!(operator = %name, "unknown operator evaluated to false");
            false
        }
    }
}

/// Equality with numeric widening: 5 and 5.0 compare equal, as they did when
/// facts flowed through JavaScript.
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Numeric coercion for ordered comparisons: numbers, numeric strings, and
/// booleans (1/0). Anything else makes the comparison false.
fn json_ord(fact: Option<&Value>, value: &Value) -> Option<(f64, f64)> {
    Some((json_num(fact?)?, json_num(value)?))
}

fn json_num(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Stringify for substring containment. Strings are used verbatim; other
/// values render as JSON.
fn json_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Collect audit findings for a condition tree: invalid nodes and unknown
/// operators. Runtime evaluation fails safe to false; the lint pass makes
/// the degradation visible to operators.
pub fn lint_condition(condition: &Condition, findings: &mut Vec<String>) {
    match condition {
        Condition::And(children) | Condition::Or(children) => {
            for child in children {
                lint_condition(child, findings);
            }
        }
        Condition::Not(child) => lint_condition(child, findings),
        Condition::Comparison { fact, operator, .. } => {
            if let Operator::Unknown(name) = operator {
                findings.push(format!("unknown operator \"{name}\" on fact {fact}"));
            }
        }
        Condition::Invalid(reason) => findings.push(reason.clone()),
    }
}

/// A rule loaded from the store, ready to evaluate.
#[derive(Debug, Clone)]
pub struct Rule {
    pub key: String,
    pub description: String,
    pub outcome: String,
    pub priority: i64,
    pub condition: Condition,
    pub citations: Vec<RuleCitation>,
}

/// Pick the winning rule: highest priority among those whose condition holds.
///
/// Sorts by priority itself (stable, so equal priorities keep their input
/// order) rather than trusting storage order.
pub fn select_rule<'a>(rules: &'a [Rule], facts: &Value) -> Option<&'a Rule> {
    let mut ordered: Vec<&Rule> = rules.iter().collect();
    ordered.sort_by(|a, b| b.priority.cmp(&a.priority));
    ordered.into_iter().find(|rule| rule.condition.evaluate(facts))
}

/// Evaluation request collected by a guided flow.
#[derive(Debug, Clone)]
pub struct EvaluationRequest {
    /// "Name, ST" form, e.g. "Cincinnati, OH".
    pub jurisdiction: String,
    pub category: String,
    pub subcategory: Option<String>,
    pub inputs: Value,
}

pub struct RulesEngine {
    store: Store,
}

impl RulesEngine {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Resolve the jurisdiction and ruleset, evaluate every rule against the
    /// supplied facts, and report the winning rule or the default-allow
    /// outcome.
    pub async fn evaluate(&self, request: EvaluationRequest) -> Result<EvaluationResult, AppError> {
        let (name, state) = split_jurisdiction(&request.jurisdiction);

        let jurisdiction = self
            .store
            .find_jurisdiction(name, state)
            .await?
            .ok_or_else(|| AppError::JurisdictionNotFound(request.jurisdiction.clone()))?;

        let rules = self
            .store
            .load_rules(
                &jurisdiction.id,
                &request.category,
                request.subcategory.as_deref(),
            )
            .await?;

        if rules.is_empty() {
            return Err(AppError::RulesetNotFound {
                jurisdiction: request.jurisdiction.clone(),
                category: request.category.clone(),
            });
        }

        for rule in &rules {
            let mut findings = Vec::new();
            lint_condition(&rule.condition, &mut findings);
            for finding in findings {
                warn!(rule = %rule.key, %finding, "malformed rule condition");
            }
        }

        let Some(winner) = select_rule(&rules, &request.inputs) else {
            return Ok(EvaluationResult {
                outcome: DEFAULT_OUTCOME.to_string(),
                rationale: DEFAULT_RATIONALE.to_string(),
                matched_rules: vec![],
                citations: vec![],
                jurisdiction_id: jurisdiction.id,
            });
        };

        Ok(EvaluationResult {
            outcome: winner.outcome.clone(),
            rationale: winner.description.clone(),
            matched_rules: vec![MatchedRule {
                key: winner.key.clone(),
                description: winner.description.clone(),
                outcome: winner.outcome.clone(),
                priority: winner.priority,
            }],
            citations: winner.citations.clone(),
            jurisdiction_id: jurisdiction.id,
        })
    }
}

/// Split "Name, ST" into name and optional state.
fn split_jurisdiction(raw: &str) -> (&str, Option<&str>) {
    match raw.split_once(',') {
        Some((name, state)) => (name.trim(), Some(state.trim()).filter(|s| !s.is_empty())),
        None => (raw.trim(), None),
    }
}
