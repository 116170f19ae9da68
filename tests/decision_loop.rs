//! End-to-end tests for the triage loop with stubbed models and tools.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use proptest::prelude::*;
use serde_json::json;
use tower::{service_fn, BoxError};
use tower_triage::builtin::{default_agents, default_tools, LOOKUP_CODE_DETAILS, VECTOR_STORE_RETRIEVER};
use tower_triage::observability::{InMemoryCollector, COMPLETION_TOKENS, MODEL_CALLS, PROMPT_TOKENS};
use tower_triage::provider::{FixedProvider, ModelRequest, ProviderResponse, ScriptedProvider};
use tower_triage::{
    run_case, tool_fn, AgentDescriptor, CaseRecord, Client, OpenAIConfig, StopReason, ToolDef,
    ToolResult, Triage, TriageBuilder, TriageError,
};

fn builder() -> TriageBuilder {
    Triage::builder(Arc::new(Client::<OpenAIConfig>::new())).agents(default_agents())
}

fn case() -> CaseRecord {
    CaseRecord::new()
        .field("Product Name", "Lightning Cable")
        .field("SKU", "LIB-2025")
        .field("HS/HTS Code(s)", "8507.60.0020")
}

fn decision(route: &[&str]) -> String {
    json!({
        "chain_of_thought": "reviewed the case",
        "routing_decision": route,
        "confidences": {"declaration_review": 0.2, "sourcing_logistics": 0.7}
    })
    .to_string()
}

fn counting_tool(name: &'static str, counter: Arc<AtomicUsize>) -> ToolDef {
    tool_fn(name, "stub evidence source", move |_case: Arc<str>| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(ToolResult::lines([format!("{name} evidence")]))
        }
    })
}

#[tokio::test]
async fn immediate_done_produces_single_round() {
    let model = ScriptedProvider::new(["".to_string(), decision(&["done"])]);
    let mut svc = builder().with_provider(model).build().unwrap();

    let outcome = run_case(&mut svc, case()).await.unwrap();

    assert_eq!(outcome.trajectory.len(), 1);
    assert_eq!(outcome.final_decision.routing_decision, vec!["done"]);
    assert_eq!(outcome.stop, StopReason::Done);
    assert!(outcome.tool_outputs.is_empty());
}

#[tokio::test]
async fn requested_tool_then_handoff() {
    let calls = Arc::new(AtomicUsize::new(0));
    let model = ScriptedProvider::new([LOOKUP_CODE_DETAILS.to_string(), decision(&["sourcing_logistics"])]);
    let mut svc = builder()
        .tool(counting_tool(LOOKUP_CODE_DETAILS, calls.clone()))
        .with_provider(model)
        .build()
        .unwrap();

    let outcome = run_case(&mut svc, case()).await.unwrap();

    assert_eq!(outcome.trajectory.len(), 1);
    assert_eq!(outcome.tool_outputs.len(), 1);
    assert!(outcome.tool_outputs.contains(LOOKUP_CODE_DETAILS));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.stop, StopReason::Handoff(vec!["sourcing_logistics".into()]));
    assert_eq!(outcome.handoff_targets(), Some(&["sourcing_logistics".to_string()][..]));
}

#[tokio::test]
async fn unknown_agent_triggers_another_round() {
    let model = ScriptedProvider::new([
        "".to_string(),
        decision(&["unknown_agent"]),
        "".to_string(),
        decision(&["declaration_review"]),
    ]);
    let mut svc = builder().with_provider(model.clone()).build().unwrap();

    let outcome = run_case(&mut svc, case()).await.unwrap();

    assert_eq!(outcome.trajectory.len(), 2);
    assert_eq!(outcome.trajectory.rounds()[0].round, 1);
    assert_eq!(outcome.trajectory.rounds()[1].round, 2);
    assert_eq!(outcome.stop, StopReason::Handoff(vec!["declaration_review".into()]));
    assert_eq!(model.remaining(), 0);
}

#[tokio::test]
async fn budget_exhaustion_keeps_last_decision() {
    let mut svc = builder()
        .with_provider(FixedProvider::new(decision(&["unknown_agent"])))
        .max_steps(3)
        .build()
        .unwrap();

    let outcome = run_case(&mut svc, case()).await.unwrap();

    assert_eq!(outcome.trajectory.len(), 3);
    assert_eq!(outcome.stop, StopReason::BudgetExhausted);
    assert_eq!(outcome.final_decision.routing_decision, vec!["unknown_agent"]);
}

#[tokio::test]
async fn malformed_output_ends_the_run_unrouted() {
    let mut svc = builder()
        .tools(default_tools())
        .with_provider(FixedProvider::new("not json"))
        .build()
        .unwrap();

    let outcome = run_case(&mut svc, case()).await.unwrap();

    assert_eq!(outcome.trajectory.len(), 1);
    assert_eq!(outcome.stop, StopReason::Unrouted);
    assert!(outcome.final_decision.is_unparsed());
    assert!(outcome.tool_outputs.is_empty());
    assert_eq!(outcome.usage.model_calls, 2);
}

#[tokio::test]
async fn done_mixed_with_agent_is_not_terminal() {
    let model = ScriptedProvider::new([
        "".to_string(),
        decision(&["done", "declaration_review"]),
        "".to_string(),
        decision(&["DONE"]),
    ]);
    let mut svc = builder().with_provider(model).build().unwrap();

    let outcome = run_case(&mut svc, case()).await.unwrap();

    assert_eq!(outcome.trajectory.len(), 2);
    assert_eq!(outcome.stop, StopReason::Done);
}

#[tokio::test]
async fn multi_agent_handoff_is_case_insensitive() {
    let model = ScriptedProvider::new([
        "".to_string(),
        decision(&[" Declaration_Review", "REGULATORY_SUSTAINABILITY"]),
    ]);
    let mut svc = builder().with_provider(model).build().unwrap();

    let outcome = run_case(&mut svc, case()).await.unwrap();

    assert_eq!(
        outcome.stop,
        StopReason::Handoff(vec!["declaration_review".into(), "regulatory_sustainability".into()])
    );
}

#[tokio::test]
async fn tools_run_at_most_once_per_run() {
    let lookups = Arc::new(AtomicUsize::new(0));
    let vectors = Arc::new(AtomicUsize::new(0));
    let model = ScriptedProvider::new([
        LOOKUP_CODE_DETAILS.to_string(),
        decision(&["unknown_agent"]),
        format!(r#"["{LOOKUP_CODE_DETAILS}", "{VECTOR_STORE_RETRIEVER}"]"#),
        decision(&["done"]),
    ]);
    let mut svc = builder()
        .tool(counting_tool(LOOKUP_CODE_DETAILS, lookups.clone()))
        .tool(counting_tool(VECTOR_STORE_RETRIEVER, vectors.clone()))
        .with_provider(model)
        .build()
        .unwrap();

    let outcome = run_case(&mut svc, case()).await.unwrap();

    assert_eq!(lookups.load(Ordering::SeqCst), 1);
    assert_eq!(vectors.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.tool_outputs.invocations(), 2);
    let rounds = outcome.trajectory.rounds();
    assert_eq!(rounds[0].aux.tool_invocations, 1);
    assert_eq!(rounds[1].aux.tool_invocations, 1);
    assert_eq!(rounds[0].tool_outputs.len(), 1);
    assert_eq!(rounds[1].tool_outputs.len(), 2);
    assert_eq!(
        outcome.tool_outputs.names().collect::<Vec<_>>(),
        vec![LOOKUP_CODE_DETAILS, VECTOR_STORE_RETRIEVER]
    );
}

#[tokio::test]
async fn tools_named_in_routing_decision_are_dispatched() {
    let vectors = Arc::new(AtomicUsize::new(0));
    let model = ScriptedProvider::new([
        "".to_string(),
        decision(&["declaration_review", VECTOR_STORE_RETRIEVER]),
        VECTOR_STORE_RETRIEVER.to_string(),
        decision(&["declaration_review"]),
    ]);
    let mut svc = builder()
        .tool(counting_tool(VECTOR_STORE_RETRIEVER, vectors.clone()))
        .with_provider(model.clone())
        .build()
        .unwrap();

    let outcome = run_case(&mut svc, case()).await.unwrap();

    assert_eq!(vectors.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.trajectory.len(), 2);
    assert_eq!(outcome.trajectory.rounds()[0].followup_tools, vec![VECTOR_STORE_RETRIEVER]);
    assert!(outcome.trajectory.rounds()[1].followup_tools.is_empty());
    // Round two's decision prompt carries the follow-up output.
    let second_decision = &model.requests()[3];
    let context = &second_decision.messages.last().unwrap().content;
    assert!(context.starts_with("\nTool outputs:\n"));
    assert!(context.contains("vector_store_retriever: [\"vector_store_retriever evidence\"]"));
}

#[tokio::test]
async fn agent_names_in_tool_selection_are_never_dispatched() {
    let shadow = Arc::new(AtomicUsize::new(0));
    let model = ScriptedProvider::new(["declaration_review, done".to_string(), decision(&["done"])]);
    let mut svc = builder()
        .tool(counting_tool("declaration_review", shadow.clone()))
        .with_provider(model)
        .build()
        .unwrap();

    let outcome = run_case(&mut svc, case()).await.unwrap();

    assert_eq!(shadow.load(Ordering::SeqCst), 0);
    assert!(outcome.tool_outputs.is_empty());
    assert_eq!(outcome.trajectory.rounds()[0].chosen_tools, vec!["declaration_review", "done"]);
}

#[tokio::test]
async fn model_transport_error_propagates() {
    let failing = service_fn(|_req: ModelRequest| async move {
        Err::<ProviderResponse, BoxError>("upstream returned 503".into())
    });
    let mut svc = builder().with_provider(failing).build().unwrap();

    let err = run_case(&mut svc, case()).await.unwrap_err();

    match err {
        TriageError::Service(inner) => assert_eq!(inner.to_string(), "upstream returned 503"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn tool_failure_propagates_as_tool_failed() {
    let broken = tool_fn(LOOKUP_CODE_DETAILS, "broken", |_case: Arc<str>| async move {
        Err::<ToolResult, BoxError>("tariff service unreachable".into())
    });
    let model = ScriptedProvider::new([LOOKUP_CODE_DETAILS.to_string(), decision(&["done"])]);
    let mut svc = builder().tool(broken).with_provider(model).build().unwrap();

    let err = run_case(&mut svc, case()).await.unwrap_err();

    match err {
        TriageError::ToolFailed { tool, message } => {
            assert_eq!(tool, LOOKUP_CODE_DETAILS);
            assert!(message.contains("tariff service unreachable"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_runs_share_no_state() {
    let calls = Arc::new(AtomicUsize::new(0));
    // Stateless stub: one message means the tool-selection prompt.
    let model = service_fn(|req: ModelRequest| async move {
        let content = if req.messages.len() == 1 {
            LOOKUP_CODE_DETAILS.to_string()
        } else {
            decision(&["sourcing_logistics"])
        };
        Ok::<_, BoxError>(ProviderResponse {
            content,
            prompt_tokens: 0,
            completion_tokens: 0,
        })
    });
    let svc = builder()
        .tool(counting_tool(LOOKUP_CODE_DETAILS, calls.clone()))
        .with_provider(model)
        .build()
        .unwrap();

    let (mut a, mut b) = (svc.clone(), svc);
    let (left, right) = tokio::join!(run_case(&mut a, case()), run_case(&mut b, case()));
    let (left, right) = (left.unwrap(), right.unwrap());

    assert_ne!(left.run_id, right.run_id);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(left.tool_outputs.len(), 1);
    assert_eq!(right.tool_outputs.len(), 1);
}

#[tokio::test]
async fn metrics_and_usage_are_accumulated() {
    let collector = InMemoryCollector::new();
    let reply = |content: String, prompt, completion| ProviderResponse {
        content,
        prompt_tokens: prompt,
        completion_tokens: completion,
    };
    let model = ScriptedProvider::from_responses([
        reply("".into(), 12, 1),
        reply(decision(&["unknown_agent"]), 80, 20),
        reply("".into(), 12, 1),
        reply(decision(&["sourcing_logistics"]), 90, 25),
    ]);
    let mut svc = builder()
        .with_provider(model)
        .metrics(collector.clone())
        .build()
        .unwrap();

    let outcome = run_case(&mut svc, case()).await.unwrap();

    assert_eq!(outcome.usage.model_calls, 4);
    assert_eq!(outcome.usage.prompt_tokens, 194);
    assert_eq!(outcome.usage.completion_tokens, 47);
    assert_eq!(collector.counter(MODEL_CALLS), 4);
    assert_eq!(collector.counter(PROMPT_TOKENS), 194);
    assert_eq!(collector.counter(COMPLETION_TOKENS), 47);
}

#[tokio::test]
async fn default_tools_feed_the_decision_prompt() {
    let model = ScriptedProvider::new([
        "search_latest_knowledge, batch_process_client_docs".to_string(),
        decision(&["regulatory_sustainability"]),
    ]);
    let mut svc = builder()
        .tools(default_tools())
        .with_provider(model.clone())
        .build()
        .unwrap();

    let outcome = run_case(&mut svc, case()).await.unwrap();

    assert_eq!(outcome.tool_outputs.len(), 2);
    let context = &model.requests()[1].messages[2].content;
    assert!(context.contains("search_latest_knowledge: [\"Latest knowledge about: Product Name: Lightning Cable"));
    assert!(context.contains("\"PageContent\":\"Parsed content of file2.pdf\""));
}

#[tokio::test]
async fn outcome_serializes_for_the_host() {
    let model = ScriptedProvider::new(["".to_string(), decision(&["done"])]);
    let mut svc = builder().with_provider(model).build().unwrap();
    let outcome = run_case(&mut svc, case()).await.unwrap();

    let value = serde_json::to_value(&outcome).unwrap();
    assert_eq!(value["stop"], json!({"reason": "done"}));
    assert_eq!(value["trajectory"][0]["decision_path"], "strict");
    assert_eq!(value["final_decision"]["routing_decision"], json!(["done"]));
}

#[test]
fn custom_agents_are_validated_at_build_time() {
    let err = Triage::builder(Arc::new(Client::<OpenAIConfig>::new()))
        .agent(AgentDescriptor::new("customs_broker", "x"))
        .agent(AgentDescriptor::new("Customs_Broker", "y"))
        .with_provider(FixedProvider::new(""))
        .build()
        .err()
        .unwrap();
    assert!(matches!(err, TriageError::Config { .. }));
}

fn model_reply() -> impl Strategy<Value = String> {
    let name = prop::sample::select(vec![
        "declaration_review",
        "Sourcing_Logistics",
        "done",
        "unknown_agent",
        "lookup_code_details",
        "",
    ]);
    prop_oneof![
        ".*",
        prop::collection::vec(name, 0..4).prop_map(|names| decision(&names)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn any_model_output_ends_within_budget(reply in model_reply(), max_steps in 1usize..6) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let outcome = rt.block_on(async {
            let mut svc = builder()
                .tools(default_tools())
                .with_provider(FixedProvider::new(reply.clone()))
                .max_steps(max_steps)
                .build()
                .unwrap();
            run_case(&mut svc, case()).await.unwrap()
        });

        prop_assert!(outcome.steps() >= 1);
        prop_assert!(outcome.steps() <= max_steps);
        let last = outcome.trajectory.last().unwrap();
        prop_assert_eq!(&outcome.final_decision, &last.decision);
        for (i, round) in outcome.trajectory.iter().enumerate() {
            prop_assert_eq!(round.round, i + 1);
        }
        if outcome.stop == StopReason::BudgetExhausted {
            prop_assert_eq!(outcome.steps(), max_steps);
        }
    }
}
