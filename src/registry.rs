//! Tool and agent registries
//!
//! Both registries are built once at startup and are read-only afterwards, so
//! they can be shared across concurrent runs behind an `Arc`.

use std::collections::HashMap;

use serde::Serialize;

use crate::error::{Result, TriageError};

/// Reserved routing value meaning "no further handoff needed".
pub const DONE: &str = "done";

/// Lower-cased, trimmed form used for every routing comparison.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Name and description of a tool, as shown to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
}

/// Result of resolving a tool name against the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolLookup {
    Found { index: usize },
    NotFound,
}

/// Static tool name → descriptor table.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    descriptors: Vec<ToolDescriptor>,
    name_to_index: HashMap<&'static str, usize>,
}

impl ToolRegistry {
    /// Register a descriptor; a repeated name replaces the earlier entry.
    pub(crate) fn push(&mut self, descriptor: ToolDescriptor) -> usize {
        if let Some(&index) = self.name_to_index.get(descriptor.name) {
            self.descriptors[index] = descriptor;
            return index;
        }
        let index = self.descriptors.len();
        self.name_to_index.insert(descriptor.name, index);
        self.descriptors.push(descriptor);
        index
    }

    /// Total lookup: every name resolves to either a slot or `NotFound`.
    pub fn lookup(&self, name: &str) -> ToolLookup {
        match self.name_to_index.get(name.trim()) {
            Some(&index) => ToolLookup::Found { index },
            None => ToolLookup::NotFound,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        matches!(self.lookup(name), ToolLookup::Found { .. })
    }

    pub fn descriptors(&self) -> &[ToolDescriptor] {
        &self.descriptors
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.descriptors.iter().map(|d| d.name).collect()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// A downstream handoff target and when to pick it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentDescriptor {
    pub name: &'static str,
    pub description: &'static str,
}

impl AgentDescriptor {
    pub const fn new(name: &'static str, description: &'static str) -> Self {
        Self { name, description }
    }
}

/// Static agent table with case-insensitive membership.
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: Vec<AgentDescriptor>,
    normalized: Vec<String>,
}

impl AgentRegistry {
    /// Build the registry, rejecting duplicates and the reserved `done` name.
    pub fn new(agents: Vec<AgentDescriptor>) -> Result<Self> {
        let mut registry = AgentRegistry::default();
        for agent in agents {
            let key = normalize_name(agent.name);
            if key.is_empty() || key == DONE {
                return Err(TriageError::Config {
                    message: format!("'{}' cannot be used as an agent name", agent.name),
                });
            }
            if registry.normalized.contains(&key) {
                return Err(TriageError::Config {
                    message: format!("duplicate agent name '{}'", agent.name),
                });
            }
            registry.normalized.push(key);
            registry.agents.push(agent);
        }
        Ok(registry)
    }

    pub fn contains(&self, name: &str) -> bool {
        let key = normalize_name(name);
        self.normalized.iter().any(|n| *n == key)
    }

    /// Names the model may use in `routing_decision`, without the sentinel.
    pub fn names(&self) -> Vec<&'static str> {
        self.agents.iter().map(|a| a.name).collect()
    }

    pub fn descriptors(&self) -> &[AgentDescriptor] {
        &self.agents
    }

    /// True when a name must never be dispatched as a tool.
    pub fn is_reserved(&self, name: &str) -> bool {
        let key = normalize_name(name);
        key.is_empty() || key == DONE || self.contains(&key)
    }

    /// Classify a routing decision as terminal or not.
    ///
    /// Terminal when the normalized targets are exactly `["done"]`, or when
    /// every one of them is a known agent. An empty list names no unknown
    /// agent, so it ends the run as [`TerminalKind::Unrouted`].
    pub fn terminal_kind(&self, targets: &[String]) -> Option<TerminalKind> {
        let normalized: Vec<String> = targets.iter().map(|t| normalize_name(t)).collect();
        if normalized.is_empty() {
            return Some(TerminalKind::Unrouted);
        }
        if normalized.len() == 1 && normalized[0] == DONE {
            return Some(TerminalKind::Done);
        }
        if normalized.iter().all(|n| self.contains(n)) {
            return Some(TerminalKind::Handoff(normalized));
        }
        None
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

/// How a terminal routing decision ended the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalKind {
    Handoff(Vec<String>),
    Done,
    /// The decision named nothing, e.g. after unparseable model output.
    Unrouted,
}
