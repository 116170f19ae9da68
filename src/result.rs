//! Result types for a triage run

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::core::StepAux;
use crate::dispatch::ToolOutputCache;
use crate::parse::{DecisionPath, RoutingDecision, SelectionPath};
use crate::usage::Usage;

/// Everything one round produced.
#[derive(Debug, Clone, Serialize)]
pub struct RoundResult {
    /// 1-based round number
    pub round: usize,
    pub chosen_tools: Vec<String>,
    pub selection_raw: String,
    pub selection_path: SelectionPath,
    /// Snapshot of the cache after this round's own dispatch.
    pub tool_outputs: ToolOutputCache,
    pub model_raw_response: String,
    pub decision: RoutingDecision,
    pub decision_path: DecisionPath,
    /// Tools run because the decision named them instead of an agent.
    pub followup_tools: Vec<String>,
    pub aux: StepAux,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Append-only audit trail, one entry per completed round.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct Trajectory(Vec<RoundResult>);

impl Trajectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, round: RoundResult) {
        self.0.push(round);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn last(&self) -> Option<&RoundResult> {
        self.0.last()
    }

    pub fn rounds(&self) -> &[RoundResult] {
        &self.0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RoundResult> {
        self.0.iter()
    }
}

impl<'a> IntoIterator for &'a Trajectory {
    type Item = &'a RoundResult;
    type IntoIter = std::slice::Iter<'a, RoundResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "targets", rename_all = "snake_case")]
pub enum StopReason {
    /// Every target is a known agent; names are normalized.
    Handoff(Vec<String>),
    Done,
    /// The decision named no target at all.
    Unrouted,
    BudgetExhausted,
}

impl StopReason {
    pub fn label(&self) -> &'static str {
        match self {
            StopReason::Handoff(_) => "handoff",
            StopReason::Done => "done",
            StopReason::Unrouted => "unrouted",
            StopReason::BudgetExhausted => "budget_exhausted",
        }
    }
}

/// Final summary of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub trajectory: Trajectory,
    /// The last round's decision, terminal or not.
    pub final_decision: RoutingDecision,
    pub stop: StopReason,
    pub tool_outputs: ToolOutputCache,
    pub usage: Usage,
}

impl RunOutcome {
    pub fn steps(&self) -> usize {
        self.trajectory.len()
    }

    /// Agents to hand the case to, if the run ended in a handoff.
    pub fn handoff_targets(&self) -> Option<&[String]> {
        match &self.stop {
            StopReason::Handoff(targets) => Some(targets),
            _ => None,
        }
    }
}
