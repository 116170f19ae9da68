//! Parsers for model output
//!
//! Models are unreliable about output format, so both parsers degrade instead
//! of failing: the tool-selection parser falls back to delimiter splitting and
//! the decision parser falls back to a fixed "could not parse" record. Each
//! result carries the path taken so tests and logs can tell them apart.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Reasoning text substituted when a decision cannot be parsed.
pub const PARSE_FAILURE_MARKER: &str = "Could not parse LLM output.";

/// Which tier of the tool-selection parser produced the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPath {
    Json,
    CommaSeparated,
    LineSeparated,
}

/// Parsed tool-selection answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSelection {
    pub tools: Vec<String>,
    pub path: SelectionPath,
}

/// Extract an ordered list of tool names from free text.
///
/// A JSON array of strings wins; otherwise the text is split on commas when
/// any comma is present, else on newlines. No registry validation happens
/// here.
pub fn parse_tool_selection(text: &str) -> ToolSelection {
    let content = strip_code_fence(text.trim());

    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(content) {
        let names: Option<Vec<String>> = items
            .iter()
            .map(|v| v.as_str().map(|s| s.trim().to_string()))
            .collect();
        if let Some(tools) = names {
            debug!(count = tools.len(), "tool selection parsed as JSON list");
            return ToolSelection {
                tools,
                path: SelectionPath::Json,
            };
        }
    }

    let (parts, path): (Vec<&str>, _) = if content.contains(',') {
        (content.split(',').collect(), SelectionPath::CommaSeparated)
    } else {
        (content.lines().collect(), SelectionPath::LineSeparated)
    };
    let tools = parts
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    ToolSelection { tools, path }
}

/// The model's routing answer for one round.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub chain_of_thought: String,
    pub routing_decision: Vec<String>,
    pub confidences: BTreeMap<String, f64>,
}

impl RoutingDecision {
    /// The safe default returned for malformed model output.
    pub fn unparsed() -> Self {
        Self {
            chain_of_thought: PARSE_FAILURE_MARKER.to_string(),
            routing_decision: Vec::new(),
            confidences: BTreeMap::new(),
        }
    }

    pub fn is_unparsed(&self) -> bool {
        self.chain_of_thought == PARSE_FAILURE_MARKER && self.routing_decision.is_empty()
    }
}

/// Shape requested from the model; used to render the JSON schema in prompts.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DecisionShape {
    /// Step-by-step reasoning behind the routing choice
    pub chain_of_thought: String,
    /// Agent name(s) to hand off to, or ["done"]
    pub routing_decision: Vec<String>,
    /// Confidence between 0 and 1 for each agent
    pub confidences: BTreeMap<String, f64>,
}

/// Which tier of the decision parser produced the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionPath {
    /// The whole text was a JSON object.
    Strict,
    /// A JSON object was recovered from a code fence or surrounding prose.
    Extracted,
    /// Nothing usable; the safe default was substituted.
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedDecision {
    pub decision: RoutingDecision,
    pub path: DecisionPath,
}

/// Parse a structured decision. Never fails.
pub fn parse_decision(text: &str) -> ParsedDecision {
    let trimmed = text.trim();

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if let Some(decision) = decision_from_value(&value) {
            return ParsedDecision {
                decision,
                path: DecisionPath::Strict,
            };
        }
    } else if let Some(decision) = extract_object(trimmed).and_then(|v| decision_from_value(&v)) {
        debug!("decision recovered from surrounding text");
        return ParsedDecision {
            decision,
            path: DecisionPath::Extracted,
        };
    }

    warn!(raw_len = text.len(), "could not parse routing decision; using default");
    ParsedDecision {
        decision: RoutingDecision::unparsed(),
        path: DecisionPath::Default,
    }
}

fn decision_from_value(value: &Value) -> Option<RoutingDecision> {
    let map = value.as_object()?;
    let routing_decision = routing_targets(map.get("routing_decision")?)?;
    let chain_of_thought = match map.get("chain_of_thought") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    let confidences = map
        .get("confidences")
        .and_then(Value::as_object)
        .map(|c| {
            c.iter()
                .filter_map(|(agent, v)| v.as_f64().map(|f| (agent.clone(), f.clamp(0.0, 1.0))))
                .collect()
        })
        .unwrap_or_default();
    Some(RoutingDecision {
        chain_of_thought,
        routing_decision,
        confidences,
    })
}

/// Accept a single name or a (possibly nested) list of names.
fn routing_targets(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            Some(if s.is_empty() { vec![] } else { vec![s.to_string()] })
        }
        Value::Array(items) => {
            let mut out = Vec::new();
            for item in items {
                out.extend(routing_targets(item)?);
            }
            Some(out)
        }
        Value::Null => Some(vec![]),
        _ => None,
    }
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest
        .strip_prefix("json")
        .or_else(|| rest.strip_prefix("JSON"))
        .unwrap_or(rest);
    match rest.rfind("```") {
        Some(end) => rest[..end].trim(),
        None => rest.trim(),
    }
}

fn extract_object(text: &str) -> Option<Value> {
    let fenced = strip_code_fence(text);
    if fenced.len() != text.len() {
        if let Ok(value) = serde_json::from_str::<Value>(fenced) {
            return Some(value);
        }
    }
    let (start, end) = (text.find('{')?, text.rfind('}')?);
    if start < end {
        serde_json::from_str::<Value>(&text[start..=end]).ok()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_json_list() {
        let s = parse_tool_selection(r#"["a","b"]"#);
        assert_eq!(s.tools, vec!["a", "b"]);
        assert_eq!(s.path, SelectionPath::Json);
    }

    #[test]
    fn selection_json_list_entries_are_trimmed() {
        let s = parse_tool_selection(r#"[" lookup_code_details ", "vector_store_retriever"]"#);
        assert_eq!(s.tools, vec!["lookup_code_details", "vector_store_retriever"]);
    }

    #[test]
    fn selection_comma_fallback() {
        let s = parse_tool_selection("a, b, c");
        assert_eq!(s.tools, vec!["a", "b", "c"]);
        assert_eq!(s.path, SelectionPath::CommaSeparated);
    }

    #[test]
    fn selection_newline_fallback() {
        let s = parse_tool_selection("a\nb");
        assert_eq!(s.tools, vec!["a", "b"]);
        assert_eq!(s.path, SelectionPath::LineSeparated);
    }

    #[test]
    fn selection_empty_text() {
        let s = parse_tool_selection("");
        assert!(s.tools.is_empty());
    }

    #[test]
    fn selection_non_string_json_falls_back() {
        let s = parse_tool_selection("[1, 2]");
        assert_eq!(s.path, SelectionPath::CommaSeparated);
        assert_eq!(s.tools, vec!["[1", "2]"]);
    }

    #[test]
    fn selection_fenced_json_list() {
        let s = parse_tool_selection("```json\n[\"search_latest_knowledge\"]\n```");
        assert_eq!(s.tools, vec!["search_latest_knowledge"]);
        assert_eq!(s.path, SelectionPath::Json);
    }

    #[test]
    fn decision_well_formed() {
        let p = parse_decision(
            r#"{"chain_of_thought":"x","routing_decision":["done"],"confidences":{}}"#,
        );
        assert_eq!(p.path, DecisionPath::Strict);
        assert_eq!(p.decision.chain_of_thought, "x");
        assert_eq!(p.decision.routing_decision, vec!["done"]);
        assert!(p.decision.confidences.is_empty());
    }

    #[test]
    fn decision_malformed_never_raises() {
        let p = parse_decision("not json");
        assert_eq!(p.path, DecisionPath::Default);
        assert!(p.decision.routing_decision.is_empty());
        assert_eq!(p.decision.chain_of_thought, PARSE_FAILURE_MARKER);
        assert!(p.decision.is_unparsed());
    }

    #[test]
    fn decision_single_string_route() {
        let p = parse_decision(
            r#"{"chain_of_thought":"routine","routing_decision":"sourcing_logistics","confidences":{"sourcing_logistics":0.9}}"#,
        );
        assert_eq!(p.decision.routing_decision, vec!["sourcing_logistics"]);
        assert_eq!(p.decision.confidences.get("sourcing_logistics"), Some(&0.9));
    }

    #[test]
    fn decision_nested_lists_flatten() {
        let p = parse_decision(r#"{"routing_decision":[["vector_store_retriever"],"lookup_code_details"]}"#);
        assert_eq!(
            p.decision.routing_decision,
            vec!["vector_store_retriever", "lookup_code_details"]
        );
        assert_eq!(p.decision.chain_of_thought, "");
    }

    #[test]
    fn decision_missing_routing_key_is_default() {
        let p = parse_decision(r#"{"chain_of_thought":"hmm","confidences":{}}"#);
        assert_eq!(p.path, DecisionPath::Default);
        assert!(p.decision.is_unparsed());
    }

    #[test]
    fn decision_confidences_are_clamped_and_filtered() {
        let p = parse_decision(
            r#"{"routing_decision":["done"],"confidences":{"a":1.7,"b":-0.2,"c":"high","d":0.4}}"#,
        );
        let c = &p.decision.confidences;
        assert_eq!(c.get("a"), Some(&1.0));
        assert_eq!(c.get("b"), Some(&0.0));
        assert_eq!(c.get("c"), None);
        assert_eq!(c.get("d"), Some(&0.4));
    }

    #[test]
    fn decision_extracted_from_fence_and_prose() {
        let fenced = "```json\n{\"routing_decision\":[\"declaration_review\"]}\n```";
        let p = parse_decision(fenced);
        assert_eq!(p.path, DecisionPath::Extracted);
        assert_eq!(p.decision.routing_decision, vec!["declaration_review"]);

        let prose = "Here you go: {\"routing_decision\": [\"done\"]} hope that helps";
        let p = parse_decision(prose);
        assert_eq!(p.path, DecisionPath::Extracted);
        assert_eq!(p.decision.routing_decision, vec!["done"]);
    }

    #[test]
    fn decision_json_that_is_not_an_object_is_default() {
        assert_eq!(parse_decision("[\"done\"]").path, DecisionPath::Default);
        assert_eq!(parse_decision("42").path, DecisionPath::Default);
    }
}
