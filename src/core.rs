//! Core triage loop built from Tower services and static dependency injection.
//!
//! The stack, innermost first:
//! - [`ToolRouter`]: name → tool service
//! - [`Step`]: one round (tool selection, dispatch, decision)
//! - [`DecisionLoop`]: repeats steps until its [`RoutingPolicy`] stops it
//!
//! [`Triage::builder`] wires all three with a model service and returns a
//! cloneable [`TriageSvc`].

use std::{future::Future, pin::Pin, sync::Arc};

use async_openai::{config::OpenAIConfig, Client};
use chrono::Utc;
use serde::Serialize;
use tower::{
    util::BoxCloneService,
    BoxError, Layer, Service, ServiceBuilder, ServiceExt,
};
use tracing::{debug, info, info_span, Instrument};

use crate::case::CaseRecord;
use crate::config::{TriageConfig, DEFAULT_MAX_STEPS};
use crate::context::RunContext;
use crate::dispatch::{Dispatch, ToolOutputCache, ToolRouter};
use crate::error::{Result, TriageError};
use crate::observability::{MetricRecord, MetricsCollector, MetricsLayer, TracingLayer};
use crate::parse::{parse_decision, parse_tool_selection};
use crate::prompt::PromptBuilder;
use crate::provider::{FixedProvider, ModelRequest, ModelService, OpenAIProvider, ProviderResponse};
use crate::registry::{AgentDescriptor, AgentRegistry, TerminalKind};
use crate::result::{RoundResult, RunOutcome, StopReason, Trajectory};
use crate::tool::{ToolDef, ToolInvocation, ToolOutput};
use crate::usage::Usage;

/// Boxed model service used once the builder has assembled the provider stack.
pub type ModelSvc = BoxCloneService<ModelRequest, ProviderResponse, BoxError>;

/// Boxed metrics sink.
pub type MetricsSvc = BoxCloneService<MetricRecord, (), BoxError>;

// =============================
// Step service and layer
// =============================

/// Auxiliary accounting captured per step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StepAux {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub model_calls: usize,
    pub tool_invocations: usize,
}

impl StepAux {
    fn record(&mut self, resp: &ProviderResponse) {
        self.prompt_tokens += resp.prompt_tokens;
        self.completion_tokens += resp.completion_tokens;
        self.model_calls += 1;
    }

    pub fn usage(&self) -> Usage {
        Usage {
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            model_calls: self.model_calls,
        }
    }
}

/// Input to one round. The context is moved in and handed back in [`StepOutcome`].
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub round: usize,
    pub context: RunContext,
}

#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub context: RunContext,
    pub round: RoundResult,
}

/// One-round service parameterized by a model `P` and a routed tool service `T`.
///
/// Built by [`StepLayer`].
#[derive(Clone)]
pub struct Step<P, T> {
    provider: P,
    tools: T,
    prompts: PromptBuilder,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

/// Layer that lifts a routed tool service `T` into a `Step<P, T>` service.
#[derive(Clone)]
pub struct StepLayer<P> {
    provider: P,
    prompts: PromptBuilder,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl<P> StepLayer<P> {
    pub fn new(provider: P, prompts: PromptBuilder) -> Self {
        Self {
            provider,
            prompts,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn temperature(mut self, t: Option<f32>) -> Self {
        self.temperature = t;
        self
    }

    pub fn max_tokens(mut self, mt: Option<u32>) -> Self {
        self.max_tokens = mt;
        self
    }
}

impl<P, T> Layer<T> for StepLayer<P>
where
    P: Clone,
{
    type Service = Step<P, T>;

    fn layer(&self, tools: T) -> Self::Service {
        Step {
            provider: self.provider.clone(),
            tools,
            prompts: self.prompts.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

async fn ask<P>(provider: &mut P, request: ModelRequest) -> std::result::Result<ProviderResponse, BoxError>
where
    P: ModelService,
{
    ServiceExt::ready(provider).await?.call(request).await
}

impl<P, T> Service<StepRequest> for Step<P, T>
where
    P: ModelService + Clone + Send + 'static,
    P::Future: Send + 'static,
    T: Service<ToolInvocation, Response = Option<ToolOutput>, Error = BoxError> + Clone + Send + 'static,
    T::Future: Send + 'static,
{
    type Response = StepOutcome;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        // Model and tool readiness is awaited inside `call`.
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: StepRequest) -> Self::Future {
        let mut provider = self.provider.clone();
        let mut tools = self.tools.clone();
        let prompts = self.prompts.clone();
        let temperature = self.temperature;
        let max_tokens = self.max_tokens;
        let span = info_span!("round", round = req.round);

        Box::pin(
            async move {
                let StepRequest { round, mut context } = req;
                let started_at = Utc::now();
                let case_text = context.case_text.clone();
                let mut aux = StepAux::default();

                // 1. Which tools?
                let selection_resp = ask(
                    &mut provider,
                    ModelRequest {
                        messages: prompts.tool_selection(&case_text),
                        temperature,
                        max_tokens,
                    },
                )
                .await?;
                aux.record(&selection_resp);
                let selection = parse_tool_selection(&selection_resp.content);
                debug!(path = ?selection.path, tools = ?selection.tools, "tool selection parsed");

                // 2. Run what is new.
                for name in &selection.tools {
                    if prompts.agents().is_reserved(name) {
                        debug!(name = %name, "selection names an agent or sentinel; not a tool");
                        continue;
                    }
                    if context.tools.get_or_dispatch(name, &mut tools, &case_text).await?
                        == Dispatch::Invoked
                    {
                        aux.tool_invocations += 1;
                    }
                }

                // 3. Decide with everything gathered so far.
                let decision_resp = ask(
                    &mut provider,
                    ModelRequest {
                        messages: prompts.decision(&case_text, &context.tools),
                        temperature,
                        max_tokens,
                    },
                )
                .await?;
                aux.record(&decision_resp);
                let parsed = parse_decision(&decision_resp.content);
                debug!(path = ?parsed.path, routing = ?parsed.decision.routing_decision, "decision parsed");

                let round = RoundResult {
                    round,
                    chosen_tools: selection.tools,
                    selection_raw: selection_resp.content,
                    selection_path: selection.path,
                    tool_outputs: context.tools.clone(),
                    model_raw_response: decision_resp.content,
                    decision: parsed.decision,
                    decision_path: parsed.path,
                    followup_tools: Vec::new(),
                    aux,
                    started_at,
                    finished_at: Utc::now(),
                };
                Ok(StepOutcome { context, round })
            }
            .instrument(span),
        )
    }
}

// =============================
// Decision loop: composable policies and layer
// =============================

/// Loop state visible to policies.
#[derive(Debug, Clone, Default)]
pub struct LoopState {
    /// Completed rounds, including the one being judged.
    pub steps: usize,
}

/// Policy interface controlling loop termination.
pub trait RoutingPolicy: Send + Sync {
    fn decide(&self, state: &LoopState, last: &RoundResult) -> Option<StopReason>;
}

/// Function-backed policy for ergonomic composition.
#[derive(Clone)]
#[allow(clippy::type_complexity)]
pub struct PolicyFn(
    pub Arc<dyn Fn(&LoopState, &RoundResult) -> Option<StopReason> + Send + Sync + 'static>,
);

impl PolicyFn {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&LoopState, &RoundResult) -> Option<StopReason> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }
}

impl RoutingPolicy for PolicyFn {
    fn decide(&self, state: &LoopState, last: &RoundResult) -> Option<StopReason> {
        (self.0)(state, last)
    }
}

/// Composite policy: the first sub-policy to return a reason wins.
#[derive(Clone, Default)]
pub struct CompositePolicy {
    policies: Vec<PolicyFn>,
}

impl CompositePolicy {
    pub fn new(policies: Vec<PolicyFn>) -> Self {
        Self { policies }
    }

    pub fn push(&mut self, p: PolicyFn) {
        self.policies.push(p);
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

impl RoutingPolicy for CompositePolicy {
    fn decide(&self, state: &LoopState, last: &RoundResult) -> Option<StopReason> {
        self.policies.iter().find_map(|p| p.decide(state, last))
    }
}

/// Chainable policy builder.
#[derive(Default, Clone)]
pub struct Policy {
    inner: CompositePolicy,
}

impl Policy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn until_handoff(mut self, agents: Arc<AgentRegistry>) -> Self {
        self.inner.push(policies::until_handoff(agents));
        self
    }

    pub fn or(mut self, policy: PolicyFn) -> Self {
        self.inner.push(policy);
        self
    }

    pub fn or_max_steps(mut self, max: usize) -> Self {
        self.inner.push(policies::max_steps(max));
        self
    }

    pub fn build(self) -> CompositePolicy {
        self.inner
    }
}

/// Built-in policies
pub mod policies {
    use super::*;

    /// Stop on `["done"]`, an empty decision, or when every routing target is a known agent.
    pub fn until_handoff(agents: Arc<AgentRegistry>) -> PolicyFn {
        PolicyFn::new(move |_s, last| {
            agents
                .terminal_kind(&last.decision.routing_decision)
                .map(|kind| match kind {
                    TerminalKind::Done => StopReason::Done,
                    TerminalKind::Handoff(targets) => StopReason::Handoff(targets),
                    TerminalKind::Unrouted => StopReason::Unrouted,
                })
        })
    }

    pub fn max_steps(max: usize) -> PolicyFn {
        PolicyFn::new(move |s, _| (s.steps >= max).then_some(StopReason::BudgetExhausted))
    }
}

/// Layer that wraps a step service with a decision loop controlled by a policy.
///
/// The loop also needs the tool router for the second dispatch pass over
/// whatever the decision names that is not an agent.
#[derive(Clone)]
pub struct DecisionLoopLayer<T, P> {
    tools: T,
    agents: Arc<AgentRegistry>,
    policy: P,
}

impl<T, P> DecisionLoopLayer<T, P> {
    /// The policy must eventually stop; pair custom policies with `policies::max_steps`.
    pub fn new(tools: T, agents: Arc<AgentRegistry>, policy: P) -> Self {
        Self {
            tools,
            agents,
            policy,
        }
    }
}

#[derive(Clone)]
pub struct DecisionLoop<S, T, P> {
    step: S,
    tools: T,
    agents: Arc<AgentRegistry>,
    policy: P,
}

impl<S, T, P> Layer<S> for DecisionLoopLayer<T, P>
where
    T: Clone,
    P: Clone,
{
    type Service = DecisionLoop<S, T, P>;
    fn layer(&self, step: S) -> Self::Service {
        DecisionLoop {
            step,
            tools: self.tools.clone(),
            agents: self.agents.clone(),
            policy: self.policy.clone(),
        }
    }
}

/// Dispatch tool names that the decision itself asked for.
async fn followup_dispatch<T>(
    round: &mut RoundResult,
    cache: &mut ToolOutputCache,
    tools: &mut T,
    agents: &AgentRegistry,
    case_text: &Arc<str>,
) -> std::result::Result<(), BoxError>
where
    T: Service<ToolInvocation, Response = Option<ToolOutput>, Error = BoxError>,
{
    let targets = round.decision.routing_decision.clone();
    for name in targets.iter().filter(|n| !agents.is_reserved(n)) {
        if cache.get_or_dispatch(name, tools, case_text).await? == Dispatch::Invoked {
            round.followup_tools.push(name.trim().to_string());
        }
    }
    Ok(())
}

impl<S, T, P> Service<CaseRecord> for DecisionLoop<S, T, P>
where
    S: Service<StepRequest, Response = StepOutcome, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
    T: Service<ToolInvocation, Response = Option<ToolOutput>, Error = BoxError> + Clone + Send + 'static,
    T::Future: Send + 'static,
    P: RoutingPolicy + Clone + 'static,
{
    type Response = RunOutcome;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, case: CaseRecord) -> Self::Future {
        let mut step = self.step.clone();
        let mut tools = self.tools.clone();
        let agents = self.agents.clone();
        let policy = self.policy.clone();

        let mut context = RunContext::new(&case);
        let run_id = context.run_id;
        let span = info_span!("triage_run", run_id = %run_id);

        Box::pin(
            async move {
                info!(fields = case.len(), "run started");
                let mut state = LoopState::default();
                let mut trajectory = Trajectory::new();
                let mut usage = Usage::default();

                loop {
                    let StepOutcome {
                        context: returned,
                        mut round,
                    } = ServiceExt::ready(&mut step)
                        .await?
                        .call(StepRequest {
                            round: state.steps + 1,
                            context,
                        })
                        .await?;
                    context = returned;
                    usage += round.aux.usage();

                    let case_text = context.case_text.clone();
                    followup_dispatch(&mut round, &mut context.tools, &mut tools, &agents, &case_text)
                        .await?;

                    state.steps += 1;
                    let stop = policy.decide(&state, &round);
                    info!(
                        round = round.round,
                        routing = ?round.decision.routing_decision,
                        new_tools = round.aux.tool_invocations + round.followup_tools.len(),
                        "round finished"
                    );
                    let final_decision = round.decision.clone();
                    trajectory.push(round);

                    if let Some(stop) = stop {
                        info!(stop = stop.label(), steps = state.steps, "run finished");
                        return Ok(RunOutcome {
                            run_id,
                            trajectory,
                            final_decision,
                            stop,
                            tool_outputs: context.tools,
                            usage,
                        });
                    }
                }
            }
            .instrument(span),
        )
    }
}

// =============================
// Builder and run helper
// =============================

/// Boxed triage service type for ergonomic returns.
pub type TriageSvc = BoxCloneService<CaseRecord, RunOutcome, BoxError>;

/// Thin facade to build a triage stack from tools, agents, and a model.
pub struct Triage;

pub struct TriageBuilder {
    client: Arc<Client<OpenAIConfig>>,
    model: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    tools: Vec<ToolDef>,
    agents: Vec<AgentDescriptor>,
    max_steps: usize,
    policies: Vec<PolicyFn>,
    provider: Option<ModelSvc>,
    metrics: Option<MetricsSvc>,
}

impl Triage {
    pub fn builder(client: Arc<Client<OpenAIConfig>>) -> TriageBuilder {
        TriageBuilder {
            client,
            model: TriageConfig::default().model,
            temperature: None,
            max_tokens: None,
            tools: Vec::new(),
            agents: Vec::new(),
            max_steps: DEFAULT_MAX_STEPS,
            policies: Vec::new(),
            provider: None,
            metrics: None,
        }
    }
}

impl TriageBuilder {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = Some(t);
        self
    }
    pub fn max_tokens(mut self, mt: u32) -> Self {
        self.max_tokens = Some(mt);
        self
    }
    pub fn tool(mut self, tool: ToolDef) -> Self {
        self.tools.push(tool);
        self
    }
    pub fn tools(mut self, tools: Vec<ToolDef>) -> Self {
        self.tools.extend(tools);
        self
    }
    pub fn agent(mut self, agent: AgentDescriptor) -> Self {
        self.agents.push(agent);
        self
    }
    pub fn agents(mut self, agents: Vec<AgentDescriptor>) -> Self {
        self.agents.extend(agents);
        self
    }
    pub fn max_steps(mut self, max: usize) -> Self {
        self.max_steps = max;
        self
    }

    /// Extra stop condition, checked after the handoff rule and before the step budget.
    pub fn policy(mut self, policy: PolicyFn) -> Self {
        self.policies.push(policy);
        self
    }

    /// Override the hosted model (useful for testing with a fixed or scripted model).
    pub fn with_provider<P>(mut self, provider: P) -> Self
    where
        P: ModelService + Clone + Send + 'static,
        P::Future: Send + 'static,
    {
        self.provider = Some(BoxCloneService::new(provider));
        self
    }

    /// Report model call counters to `collector`.
    pub fn metrics<C>(mut self, collector: C) -> Self
    where
        C: MetricsCollector + Clone + Send + 'static,
        C::Future: Send + 'static,
    {
        self.metrics = Some(BoxCloneService::new(collector));
        self
    }

    /// Apply model settings and the step budget from configuration.
    ///
    /// A configured mock response replaces the hosted model with [`FixedProvider`].
    pub fn config(mut self, config: &TriageConfig) -> Self {
        self.model = config.model.clone();
        self.temperature = config.temperature;
        self.max_tokens = config.max_tokens;
        self.max_steps = config.max_steps;
        if let Some(mock) = &config.mock_response {
            self = self.with_provider(FixedProvider::new(mock.clone()));
        }
        self
    }

    pub fn build(self) -> Result<TriageSvc> {
        if self.max_steps == 0 {
            return Err(TriageError::Config {
                message: "max_steps must be at least 1".to_string(),
            });
        }
        let agents = Arc::new(AgentRegistry::new(self.agents)?);
        let (router, tool_registry) = ToolRouter::new(self.tools);
        let prompts = PromptBuilder::new(tool_registry, agents.clone());

        let base: ModelSvc = match self.provider {
            Some(p) => p,
            None => BoxCloneService::new(OpenAIProvider::new(self.client, self.model.clone())),
        };
        let traced = TracingLayer::new().layer(base);
        let model: ModelSvc = match self.metrics {
            Some(collector) => BoxCloneService::new(MetricsLayer::new(collector).layer(traced)),
            None => BoxCloneService::new(traced),
        };

        let mut policy = Policy::new().until_handoff(agents.clone());
        for extra in self.policies {
            policy = policy.or(extra);
        }
        let policy = policy.or_max_steps(self.max_steps).build();

        let svc = ServiceBuilder::new()
            .layer(DecisionLoopLayer::new(router.clone(), agents, policy))
            .layer(
                StepLayer::new(model, prompts)
                    .temperature(self.temperature)
                    .max_tokens(self.max_tokens),
            )
            .service(router);
        Ok(BoxCloneService::new(svc))
    }
}

/// Convenience: run one case through a triage service.
pub async fn run_case(svc: &mut TriageSvc, case: CaseRecord) -> Result<RunOutcome> {
    let ready = ServiceExt::ready(svc).await.map_err(TriageError::from_boxed)?;
    ready.call(case).await.map_err(TriageError::from_boxed)
}
