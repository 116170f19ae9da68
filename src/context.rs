//! # Run context
//!
//! Everything that belongs to a single run and nothing else: its id, the
//! rendered case text, and the tool output cache. The loop owns one
//! [`RunContext`] per call and moves it through each step by value, so two
//! runs on clones of the same service never observe each other's state.

use std::sync::Arc;

use uuid::Uuid;

use crate::case::CaseRecord;
use crate::dispatch::ToolOutputCache;

#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub case_text: Arc<str>,
    pub tools: ToolOutputCache,
}

impl RunContext {
    /// Start a fresh run for `case`. An empty case renders as empty text.
    pub fn new(case: &CaseRecord) -> Self {
        Self::from_text(case.render())
    }

    /// Start a run over pre-rendered case text.
    pub fn from_text(case_text: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            case_text: Arc::from(case_text.into()),
            tools: ToolOutputCache::new(),
        }
    }
}
