//! Prompt construction
//!
//! Pure functions of registries, case text and cached tool outputs. Nothing
//! here talks to a model.

use std::fmt::Write as _;
use std::sync::Arc;

use crate::dispatch::ToolOutputCache;
use crate::parse::DecisionShape;
use crate::provider::ChatMessage;
use crate::registry::{AgentRegistry, ToolRegistry, DONE};

/// Builds the two prompts a round needs.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    tools: Arc<ToolRegistry>,
    agents: Arc<AgentRegistry>,
    base: Arc<str>,
}

impl PromptBuilder {
    pub fn new(tools: Arc<ToolRegistry>, agents: Arc<AgentRegistry>) -> Self {
        let base = router_instructions(&tools, &agents);
        Self {
            tools,
            agents,
            base: Arc::from(base),
        }
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    /// Ask which tools to run for this case.
    pub fn tool_selection(&self, case_text: &str) -> Vec<ChatMessage> {
        let tool_list = self.tools.names().join(", ");
        vec![ChatMessage::system(format!(
            "Given the question: '{case_text}', and these tools: [{tool_list}], which tool(s) should be used? \
             Respond with a comma-separated list of tool names, or a JSON list if you prefer."
        ))]
    }

    /// Ask for the routing decision given everything gathered so far.
    pub fn decision(&self, case_text: &str, outputs: &ToolOutputCache) -> Vec<ChatMessage> {
        let mut messages = vec![
            ChatMessage::system(format!("{}\n\nQuestion: {case_text}", self.base)),
            ChatMessage::user(case_text),
        ];
        if let Some(context) = tool_context(outputs) {
            messages.push(ChatMessage::system(context));
        }
        messages
    }
}

/// `Tool outputs:` block, or `None` when nothing has been gathered yet.
pub fn tool_context(outputs: &ToolOutputCache) -> Option<String> {
    if outputs.is_empty() {
        return None;
    }
    let mut block = String::from("\nTool outputs:\n");
    let lines: Vec<String> = outputs
        .iter()
        .map(|(name, result)| format!("{name}: {}", result.to_context_string()))
        .collect();
    block.push_str(&lines.join("\n"));
    Some(block)
}

fn decision_schema() -> String {
    let schema = schemars::schema_for!(DecisionShape);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

fn router_instructions(tools: &ToolRegistry, agents: &AgentRegistry) -> String {
    let allowed = agents.names().join(", ");
    let mut out = String::new();
    out.push_str(
        "You are the router agent. Given the question and the case details, decide whether we should call \
         one or multiple tools to learn more about the situation or if we are ready to make a decision on a handoff.\n",
    );
    let _ = writeln!(
        out,
        "When you are ready to make a final decision, your routing_decision must be one of the following agent handoffs: \
         {allowed}, or '{DONE}' if no further action is needed. Do not invent new agent names."
    );
    out.push_str("For each possible agent, provide a confidence score (0-1) for how appropriate it is for this case.\n");
    out.push_str(
        "Return your answer as a JSON object with keys: chain_of_thought (string), routing_decision \
         (list of agent names for the final decision), confidences (object of agent name to confidence float).\n",
    );
    let _ = writeln!(out, "The object must match this JSON schema:\n{}", decision_schema());
    out.push_str("Let's think step by step:\n");
    out.push_str("- Review document types and content\n");
    out.push_str("- Determine if more tool calls are needed\n");
    out.push_str("- Determine if a handoff is needed and to which agent\n");
    out.push_str("\nAvailable tools:\n");
    for t in tools.descriptors() {
        let _ = writeln!(out, "- {}: {}", t.name, t.description);
    }
    out.push_str("Available agents for handoff:\n");
    let agent_lines: Vec<String> = agents
        .descriptors()
        .iter()
        .map(|a| format!("- {}: {}", a.name, a.description))
        .collect();
    out.push_str(&agent_lines.join("\n"));
    out
}
