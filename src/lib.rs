//! # Tower Triage
//!
//! A Tower-based orchestrator loop that reviews a shipment case, gathers
//! evidence through tools, and routes the case to one of a fixed set of
//! downstream agents.
//!
//! ## Core Concepts
//!
//! - **Round**: ask the model which tools to run, run the ones not yet
//!   cached, then ask for a structured routing decision
//! - **Decision loop**: repeat rounds until the decision names only known
//!   agents, says `done`, or the step budget runs out
//! - **Tools**: Tower services over the rendered case text, memoized per run
//! - **Static DI**: the model, tools and agents are injected at build time
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tower_triage::{builtin, run_case, CaseRecord, Client, OpenAIConfig, Triage};
//!
//! # async fn example() -> tower_triage::Result<()> {
//! let client = Arc::new(Client::<OpenAIConfig>::new());
//! let mut triage = Triage::builder(client)
//!     .model("gpt-4o-mini")
//!     .tools(builtin::default_tools())
//!     .agents(builtin::default_agents())
//!     .build()?;
//!
//! let case = CaseRecord::new()
//!     .field("Product Name", "Lightning Cable")
//!     .field("HS/HTS Code(s)", "8507.60.0020");
//! let outcome = run_case(&mut triage, case).await?;
//! println!("{:?} after {} rounds", outcome.stop, outcome.steps());
//! # Ok(())
//! # }
//! ```

pub mod builtin;
pub mod case;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod observability;
pub mod parse;
pub mod prompt;
pub mod provider;
pub mod registry;
pub mod result;
pub mod tool;
pub mod usage;

// Core module with main implementation
mod core;

// Re-export core types
pub use core::{
    policies, run_case, CompositePolicy, DecisionLoop, DecisionLoopLayer, LoopState, MetricsSvc,
    ModelSvc, Policy, PolicyFn, RoutingPolicy, Step, StepAux, StepLayer, StepOutcome,
    StepRequest, Triage, TriageBuilder, TriageSvc,
};

// Public re-exports for convenience
pub use case::CaseRecord;
pub use config::TriageConfig;
pub use dispatch::{ToolOutputCache, ToolRouter};
pub use error::{Result, TriageError};
pub use parse::RoutingDecision;
pub use registry::AgentDescriptor;
pub use result::{RoundResult, RunOutcome, StopReason, Trajectory};
pub use tool::{tool_fn, ToolDef, ToolResult};

// Re-export async-openai types that users need
pub use async_openai::{config::OpenAIConfig, Client};

// Re-export Tower traits that users need
pub use tower::{Layer, Service, ServiceExt};
