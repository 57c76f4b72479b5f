//! Orchestrator integration tests
//!
//! Drive whole turns through scripted models and fake tools.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_agent::agent::{FAILURE_REPLY, InvocationStatus, ModelRequest, ModelResponse, Role};
use arc_agent::config::AgentConfig;
use arc_agent::tools::{ToolKind, ToolRegistry};
use arc_agent::TurnOutcome;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

mod common;

use common::{
    FnProvider, ScriptedProvider, ToolLog, call, exec, orchestrator, setup_test_store, setup_test_store_with_pool,
    sleep_tool,
};

fn registry() -> ToolRegistry {
    ToolRegistry::new(Duration::from_secs(5))
}

fn log() -> ToolLog {
    Arc::new(Mutex::new(Vec::new()))
}

fn last_user_text(request: &ModelRequest) -> &str {
    request
        .turns
        .iter()
        .rev()
        .find(|t| t.role == Role::User)
        .map_or("", |t| t.content.as_str())
}

#[tokio::test]
async fn remembers_name_across_sessions() {
    let store = setup_test_store();
    let provider = Arc::new(FnProvider(|request: &ModelRequest| {
        let said = last_user_text(request).to_lowercase();
        if said.contains("my name is") {
            ModelResponse::text("Nice to meet you, Sam. <remember key=\"user name\">Sam</remember>")
        } else if request.system_prompt.contains("user_name: Sam") {
            ModelResponse::text("Your name is Sam.")
        } else {
            ModelResponse::text("I don't know your name yet.")
        }
    }));

    let mut first = orchestrator(provider.clone(), registry(), store.clone(), AgentConfig::default());
    assert_eq!(first.process_turn("What's my name?").await, "I don't know your name yet.");

    let report = first.run_turn("My name is Sam", &CancellationToken::new()).await;
    assert_eq!(report.outcome, TurnOutcome::Replied);
    assert_eq!(report.reply, "Nice to meet you, Sam.");
    assert_eq!(report.remembered, vec!["user_name".to_string()]);
    first.end_session();
    assert!(first.transcript().is_empty());

    let fact = store.get("user_name").unwrap().unwrap();
    assert_eq!(fact.value, "Sam");
    assert!(fact.source_turn_ref.is_some());

    // A new session shares nothing but the store
    let mut second = orchestrator(provider, registry(), store, AgentConfig::default());
    let reply = second.process_turn("What's my name?").await;
    assert_eq!(reply, "Your name is Sam.");

    // Recalled facts are never transcript entries
    let turns = second.transcript().turns();
    assert_eq!(turns.len(), 2);
    assert!(turns.iter().all(|t| !t.content.contains("user_name")));
}

#[tokio::test]
async fn step_bound_stops_runaway_tool_loop() {
    let log = log();
    let mut tools = registry();
    tools
        .register(sleep_tool("noop", ToolKind::Read, Duration::ZERO, &log))
        .unwrap();

    let provider = Arc::new(ScriptedProvider::repeating(ModelResponse::calls(vec![call(
        "c1",
        "noop",
        json!({}),
    )])));
    let config = AgentConfig {
        max_steps: 3,
        ..AgentConfig::default()
    };
    let mut agent = orchestrator(provider.clone(), tools, setup_test_store(), config);

    let report = agent.run_turn("loop forever", &CancellationToken::new()).await;

    assert_eq!(report.outcome, TurnOutcome::StepBoundExceeded);
    assert_eq!(report.steps, 3);
    assert_eq!(provider.requests().len(), 3);
    assert_eq!(report.invocations.len(), 3);
    assert!(report.reply.contains("3 steps"), "reply: {}", report.reply);

    let last = agent.transcript().turns().last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    assert_eq!(last.content, report.reply);
}

#[tokio::test]
async fn tool_timeout_becomes_error_turn() {
    let log = log();
    let mut tools = registry();
    tools
        .register(
            sleep_tool("slow_lookup", ToolKind::Read, Duration::from_secs(2), &log)
                .with_timeout(Duration::from_millis(50)),
        )
        .unwrap();

    let provider = Arc::new(ScriptedProvider::new([
        ModelResponse::calls(vec![call("c1", "slow_lookup", json!({}))]),
        ModelResponse::text("Sorry, that took too long."),
    ]));
    let mut agent = orchestrator(provider.clone(), tools, setup_test_store(), AgentConfig::default());

    let report = agent.run_turn("look it up", &CancellationToken::new()).await;

    assert_eq!(report.outcome, TurnOutcome::Replied);
    assert_eq!(report.reply, "Sorry, that took too long.");
    assert_eq!(report.invocations.len(), 1);
    assert_eq!(report.invocations[0].status, InvocationStatus::Failed);

    // The model saw the structured failure on its next step
    let requests = provider.requests();
    let tool_turn = requests[1]
        .turns
        .iter()
        .find(|t| t.role == Role::Tool)
        .expect("tool turn");
    assert_eq!(tool_turn.tool_call_id.as_deref(), Some("c1"));
    let body: Value = serde_json::from_str(&tool_turn.content).unwrap();
    assert_eq!(body["error"], "ToolExecutionError");

    let episodes = agent.memory().recent_episodes(5).unwrap();
    assert_eq!(episodes.len(), 1);
    assert_eq!(episodes[0].tool, "slow_lookup");
}

#[tokio::test]
async fn every_tool_turn_has_a_terminal_invocation() {
    let log = log();
    let mut tools = registry();
    tools
        .register(sleep_tool("weather", ToolKind::Read, Duration::ZERO, &log))
        .unwrap();

    let provider = Arc::new(ScriptedProvider::new([
        ModelResponse::calls(vec![
            call("c1", "weather", json!({})),
            call("c2", "teleport", json!({ "to": "mars" })),
            call("c3", "weather", json!({ "unexpected": true })),
        ]),
        ModelResponse::text("Done."),
    ]));
    let mut agent = orchestrator(provider, tools, setup_test_store(), AgentConfig::default());

    let report = agent.run_turn("check things", &CancellationToken::new()).await;
    assert_eq!(report.outcome, TurnOutcome::Replied);

    let transcript = agent.transcript();
    let tool_turns: Vec<_> = transcript.turns().iter().filter(|t| t.role == Role::Tool).collect();
    assert_eq!(tool_turns.len(), transcript.invocations().len());
    assert!(transcript.all_terminal());

    let statuses: Vec<_> = transcript.invocations().iter().map(|i| i.status).collect();
    assert_eq!(statuses[0], InvocationStatus::Succeeded);
    assert_eq!(statuses[1], InvocationStatus::Failed);

    let unknown: Value = serde_json::from_str(&tool_turns[1].content).unwrap();
    assert_eq!(unknown["error"], "ToolNotFound");
}

#[tokio::test]
async fn parallel_reads_keep_request_order() {
    let log = log();
    let mut tools = registry();
    tools
        .register_all([
            sleep_tool("a", ToolKind::Read, Duration::from_millis(80), &log),
            sleep_tool("b", ToolKind::Read, Duration::from_millis(10), &log),
            sleep_tool("c", ToolKind::Read, Duration::from_millis(40), &log),
        ])
        .unwrap();

    let provider = Arc::new(ScriptedProvider::new([
        ModelResponse::calls(vec![
            call("c1", "a", json!({})),
            call("c2", "b", json!({})),
            call("c3", "c", json!({})),
        ]),
        ModelResponse::text("All three."),
    ]));
    let mut agent = orchestrator(provider, tools, setup_test_store(), AgentConfig::default());
    agent.process_turn("run them").await;

    // All started before any finished
    let events = log.lock().unwrap().clone();
    assert!(events[..3].iter().all(|e| e.starts_with("start:")), "{events:?}");

    let ids: Vec<_> = agent
        .transcript()
        .turns()
        .iter()
        .filter_map(|t| t.tool_call_id.clone())
        .collect();
    assert_eq!(ids, ["c1", "c2", "c3"]);
}

#[tokio::test]
async fn mutating_call_splits_the_batch() {
    let log = log();
    let mut tools = registry();
    tools
        .register_all([
            sleep_tool("read_a", ToolKind::Read, Duration::from_millis(20), &log),
            sleep_tool("write", ToolKind::Mutate, Duration::from_millis(5), &log),
            sleep_tool("read_b", ToolKind::Read, Duration::from_millis(5), &log),
        ])
        .unwrap();

    let provider = Arc::new(ScriptedProvider::new([
        ModelResponse::calls(vec![
            call("c1", "read_a", json!({})),
            call("c2", "write", json!({})),
            call("c3", "read_b", json!({})),
        ]),
        ModelResponse::text("Done."),
    ]));
    let mut agent = orchestrator(provider, tools, setup_test_store(), AgentConfig::default());
    agent.process_turn("go").await;

    let events = log.lock().unwrap().clone();
    assert_eq!(
        events,
        ["start:read_a", "end:read_a", "start:write", "end:write", "start:read_b", "end:read_b"]
    );
}

#[tokio::test]
async fn cancellation_interrupts_without_a_reply() {
    let log = log();
    let mut tools = registry();
    tools
        .register_all([
            sleep_tool("search", ToolKind::Read, Duration::from_secs(5), &log),
            sleep_tool("note", ToolKind::Memory, Duration::from_millis(100), &log),
        ])
        .unwrap();

    let provider = Arc::new(ScriptedProvider::new([ModelResponse::calls(vec![
        call("c1", "note", json!({})),
        call("c2", "search", json!({})),
    ])]));
    let mut agent = orchestrator(provider, tools, setup_test_store(), AgentConfig::default());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let report = agent.run_turn("remember and search", &cancel).await;

    assert_eq!(report.outcome, TurnOutcome::Interrupted);
    assert!(report.reply.is_empty());

    // The memory call ran to completion; the search was abandoned
    let events = log.lock().unwrap().clone();
    assert!(events.contains(&"end:note".to_string()), "{events:?}");
    assert!(!events.contains(&"end:search".to_string()), "{events:?}");
    assert_eq!(report.invocations[0].status, InvocationStatus::Succeeded);
    assert_eq!(report.invocations[1].status, InvocationStatus::Failed);

    let transcript = agent.transcript();
    assert!(transcript.all_terminal());
    assert_eq!(transcript.turns().last().unwrap().role, Role::Tool);
}

#[tokio::test]
async fn provider_failure_gives_failure_reply() {
    let provider = Arc::new(ScriptedProvider::new(Vec::<ModelResponse>::new()));
    let mut agent = orchestrator(provider, registry(), setup_test_store(), AgentConfig::default());

    let report = agent.run_turn("hello?", &CancellationToken::new()).await;

    assert_eq!(report.outcome, TurnOutcome::Aborted);
    assert_eq!(report.reply, FAILURE_REPLY);
    assert_eq!(agent.transcript().len(), 2);
}

#[tokio::test]
async fn memory_failure_aborts_only_that_turn() {
    let (store, pool) = setup_test_store_with_pool();
    let provider = Arc::new(FnProvider(|request: &ModelRequest| {
        if last_user_text(request).contains("live in") {
            ModelResponse::text("Noted. <remember key=\"home city\">Lisbon</remember>")
        } else {
            ModelResponse::text("Hello again.")
        }
    }));
    let mut agent = orchestrator(provider, registry(), store.clone(), AgentConfig::default());

    // Recall fails before the model is asked anything
    exec(&pool, "ALTER TABLE facts RENAME TO facts_offline");
    let report = agent.run_turn("hello", &CancellationToken::new()).await;
    assert_eq!(report.outcome, TurnOutcome::Aborted);
    assert_eq!(report.reply, FAILURE_REPLY);
    assert_eq!(report.steps, 0);
    exec(&pool, "ALTER TABLE facts_offline RENAME TO facts");

    // Reads work but the remembered fact cannot be written
    exec(
        &pool,
        "CREATE TRIGGER reject_facts BEFORE INSERT ON facts BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
    );
    let report = agent.run_turn("I live in Lisbon", &CancellationToken::new()).await;
    assert_eq!(report.outcome, TurnOutcome::Aborted);
    assert_eq!(report.reply, FAILURE_REPLY);
    assert!(report.remembered.is_empty());
    exec(&pool, "DROP TRIGGER reject_facts");
    assert!(store.get("home_city").unwrap().is_none());

    // The session carries on with one failure reply per broken turn
    let report = agent.run_turn("hello", &CancellationToken::new()).await;
    assert_eq!(report.outcome, TurnOutcome::Replied);
    assert_eq!(report.reply, "Hello again.");

    let replies: Vec<_> = agent
        .transcript()
        .turns()
        .iter()
        .filter(|t| t.role == Role::Assistant)
        .map(|t| t.content.as_str())
        .collect();
    assert_eq!(replies, [FAILURE_REPLY, FAILURE_REPLY, "Hello again."]);
    assert_eq!(agent.transcript().len(), 6);
}
