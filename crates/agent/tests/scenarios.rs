//! End-to-end scenarios for the orchestration loop.
//!
//! Every test drives `AgentLoop` against a scripted backend, so outcomes are
//! fully deterministic.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde_json::{Value, json};
use steploop_agent::scripted::{
    make_response, text_chunks, text_response, tool_call, tool_call_response,
};
use steploop_agent::{
    AgentError, AgentLoop, AgentStreamEvent, GenerateOptions, RunStatus, ScriptedProvider,
    ScriptedTurn, StopReason, step_count_is, text_contains, text_stream,
};
use steploop_config::{LoopConfig, TimeoutConfig};
use steploop_core::error::{ProviderError, ToolError};
use steploop_core::message::{Message, Role};
use steploop_core::provider::{StreamEvent, Usage};
use steploop_core::shape::{FieldKind, InputShape};
use steploop_core::step::FinishReason;
use steploop_core::tool::{ToolDefinition, ToolInputHooks, ToolRegistry};
use steploop_tools::{FindOrdersTool, default_registry, deferred_find_orders};
use tokio_util::sync::CancellationToken;

// ── Helpers ──────────────────────────────────────────────────────────────

fn agent(provider: Arc<ScriptedProvider>, tools: ToolRegistry) -> AgentLoop {
    AgentLoop::new(provider, Arc::new(tools), LoopConfig::default())
}

fn agent_with(
    provider: Arc<ScriptedProvider>,
    tools: ToolRegistry,
    config: LoopConfig,
) -> AgentLoop {
    AgentLoop::new(provider, Arc::new(tools), config)
}

fn weather_tool(temperature: i64) -> ToolDefinition {
    ToolDefinition::new(
        "getWeather",
        "Get the weather for a city",
        InputShape::object().field("city", FieldKind::String),
    )
    .with_execute(move |input| async move {
        Ok(json!({"city": input["city"], "temperature": temperature}))
    })
}

fn registry(defs: Vec<ToolDefinition>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for def in defs {
        registry.register(def).unwrap();
    }
    registry
}

fn last_tool_output(messages: &[Message]) -> Option<Value> {
    match messages.last() {
        Some(m) if m.role == Role::Tool => serde_json::from_str(&m.content).ok(),
        _ => None,
    }
}

// ── Basic flows ──────────────────────────────────────────────────────────

#[tokio::test]
async fn echo_prompt_single_step() {
    let provider = Arc::new(ScriptedProvider::from_fn(|req| {
        let prompt = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        text_response(format!("the prompt was {prompt}"))
    }));
    let result = agent(provider, ToolRegistry::new())
        .generate(GenerateOptions::prompt("Hello, test!"))
        .await;

    assert_eq!(result.text, "the prompt was Hello, test!");
    assert_eq!(result.steps.len(), 1);
    assert_eq!(result.finish_reason, FinishReason::Stop);
    assert_eq!(result.status, RunStatus::Stopped);
    assert_eq!(result.stop_reason, Some(StopReason::ModelFinished));
    assert_eq!(result.usage, Usage::new(10, 5));
}

#[tokio::test]
async fn tokyo_weather_two_steps() {
    let provider = Arc::new(ScriptedProvider::from_fn(|req| {
        match last_tool_output(&req.messages) {
            Some(weather) => text_response(format!(
                "It is {}°F in {}.",
                weather["temperature"],
                weather["city"].as_str().unwrap_or("?")
            )),
            None => tool_call_response(vec![tool_call(
                "call_1",
                "getWeather",
                json!({"city": "Tokyo"}),
            )]),
        }
    }));
    let result = agent(provider.clone(), registry(vec![weather_tool(68)]))
        .generate(
            GenerateOptions::prompt("What's the weather in Tokyo?")
                .stop_when(vec![step_count_is(5)]),
        )
        .await;

    assert_eq!(result.steps.len(), 2);
    assert_eq!(result.tool_results.len(), 1);
    assert!(result.text.contains("68"), "final text: {}", result.text);
    assert_eq!(result.finish_reason, FinishReason::Stop);
    assert_eq!(provider.call_count(), 2);
    assert_eq!(provider.requests()[0].tools[0].name, "getWeather");
}

#[tokio::test]
async fn parallel_arithmetic_in_one_step() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_call_response(vec![
            tool_call("call_add", "add", json!({"a": 5, "b": 3})),
            tool_call("call_mul", "multiply", json!({"a": 4, "b": 7})),
        ]),
        text_response("5 + 3 = 8 and 4 * 7 = 28"),
    ]));
    let result = agent(provider, default_registry(Some(0)).unwrap())
        .generate(
            GenerateOptions::prompt("add 5 and 3, multiply 4 by 7")
                .stop_when(vec![step_count_is(5)]),
        )
        .await;

    let step = &result.steps[0];
    assert_eq!(step.tool_results.len(), 2);
    assert_eq!(step.tool_results[0].call_id, "call_add");
    assert_eq!(step.tool_results[0].value(), Some(&json!({"result": 8})));
    assert_eq!(step.tool_results[1].call_id, "call_mul");
    assert_eq!(step.tool_results[1].value(), Some(&json!({"result": 28})));
    assert_eq!(result.steps.len(), 2);
}

#[tokio::test]
async fn step_ordinals_are_contiguous() {
    let provider = Arc::new(ScriptedProvider::from_fn(|req| {
        tool_call_response(vec![tool_call(
            format!("call_{}", req.messages.len()),
            "add",
            json!({"a": 1, "b": 1}),
        )])
    }));
    let result = agent(provider.clone(), default_registry(Some(0)).unwrap())
        .generate(GenerateOptions::prompt("count").stop_when(vec![step_count_is(4)]))
        .await;

    let indices: Vec<usize> = result.steps.iter().map(|s| s.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);
    assert_eq!(provider.call_count(), 4);
    assert_eq!(result.stop_reason, Some(StopReason::StepCount { limit: 4 }));
    assert_eq!(result.finish_reason, FinishReason::MaxSteps);
}

#[tokio::test]
async fn unknown_tool_proceeds_to_next_step() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_call_response(vec![tool_call("call_1", "teleport", json!({"to": "Mars"}))]),
        text_response("I can't do that."),
    ]));
    let result = agent(provider.clone(), registry(vec![weather_tool(68)]))
        .generate(GenerateOptions::prompt("beam me up").stop_when(vec![step_count_is(5)]))
        .await;

    assert_eq!(result.steps.len(), 2);
    assert!(matches!(
        result.steps[0].tool_results[0].tool_error(),
        Some(ToolError::NotFound { tool_name }) if tool_name == "teleport"
    ));
    let fed_back = provider.requests()[1].messages.last().unwrap().content.clone();
    assert!(fed_back.contains("Tool not found"), "{fed_back}");
    assert_eq!(result.text, "I can't do that.");
}

// ── Deferred execution ───────────────────────────────────────────────────

#[tokio::test]
async fn missing_executor_defers_to_caller() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_call_response(vec![tool_call("call_1", "findOrders", json!({"userId": "1234"}))]),
        text_response("You ordered a chair."),
    ]));
    let tools = registry(vec![deferred_find_orders()]);
    let agent = agent(provider.clone(), tools);
    let result = agent
        .generate(GenerateOptions::prompt("my orders?").stop_when(vec![step_count_is(5)]))
        .await;

    assert_eq!(result.status, RunStatus::Deferred);
    assert_eq!(result.steps.len(), 1);
    assert_eq!(result.finish_reason, FinishReason::Deferred);
    assert_eq!(result.tool_calls.len(), 1);
    assert_eq!(result.tool_calls[0].arguments, json!({"userId": "1234", "limit": 3}));
    assert!(result.tool_results.is_empty());
    assert_eq!(
        result.stop_reason,
        Some(StopReason::Deferred {
            tool_name: "findOrders".into()
        })
    );

    // The caller fulfils the call and continues the conversation.
    let pending = result.pending_tool_calls();
    assert_eq!(pending.len(), 1);
    let mut messages = result.messages.clone();
    messages.push(Message::tool_result(&pending[0].id, r#"[{"id":"1234","product":"Chair"}]"#));
    let resumed = agent
        .generate(GenerateOptions::messages(messages).stop_when(vec![step_count_is(5)]))
        .await;

    assert_eq!(resumed.status, RunStatus::Stopped);
    assert_eq!(resumed.text, "You ordered a chair.");
    let sent = &provider.requests()[1].messages;
    assert_eq!(sent.last().unwrap().tool_call_id.as_deref(), Some("call_1"));
}

// ── Stop predicates over randomized tools ────────────────────────────────

fn order_responder() -> ScriptedProvider {
    ScriptedProvider::from_fn(|req| {
        let text = last_tool_output(&req.messages)
            .map(|orders| {
                format!("Found your {}", orders[0]["product"].as_str().unwrap_or("nothing"))
            })
            .unwrap_or_default();
        ScriptedTurn::Response(make_response(
            text,
            vec![tool_call(
                format!("call_{}", req.messages.len()),
                "findOrders",
                json!({"userId": "1111"}),
            )],
            FinishReason::ToolCalls,
        ))
    })
}

fn orders_registry(chair_probability: f64) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry
        .register_tool(Box::new(
            FindOrdersTool::new(Some(7)).with_chair_probability(chair_probability),
        ))
        .unwrap();
    registry
}

#[tokio::test]
async fn chair_predicate_never_stops_early() {
    let config = LoopConfig {
        max_steps: 5,
        ..LoopConfig::default()
    };
    let result = agent_with(Arc::new(order_responder()), orders_registry(0.0), config)
        .generate(GenerateOptions::prompt("find my chair").stop_when(vec![text_contains("chair")]))
        .await;

    assert_eq!(result.steps.len(), 5);
    assert!(result.steps[1..].iter().all(|s| s.text == "Found your Table"));
    assert_eq!(result.stop_reason, Some(StopReason::MaxSteps { limit: 5 }));
    assert_eq!(result.finish_reason, FinishReason::MaxSteps);
}

#[tokio::test]
async fn chair_predicate_stops_once_seen() {
    let result = agent(Arc::new(order_responder()), orders_registry(1.0))
        .generate(GenerateOptions::prompt("find my chair").stop_when(vec![text_contains("chair")]))
        .await;

    assert_eq!(result.steps.len(), 2);
    assert_eq!(result.text, "Found your Chair");
    assert_eq!(
        result.stop_reason,
        Some(StopReason::TextMatched {
            pattern: "chair".into()
        })
    );
    assert_eq!(result.finish_reason, FinishReason::ToolCalls);
}

// ── Streaming ────────────────────────────────────────────────────────────

#[tokio::test]
async fn streaming_emits_text_deltas_in_order() {
    let provider = Arc::new(ScriptedProvider::new(vec![text_chunks(&["Hel", "lo ", "world"])]));
    let config = LoopConfig {
        streaming: true,
        ..LoopConfig::default()
    };
    let agent = Arc::new(agent_with(provider.clone(), ToolRegistry::new(), config));
    let mut run = agent.stream(GenerateOptions::prompt("greet"));

    let mut events = Vec::new();
    while let Some(event) = run.events.recv().await {
        events.push(event);
    }
    let result = run.handle.await.unwrap();

    let deltas: Vec<&str> = events.iter().filter_map(|e| e.text()).collect();
    assert_eq!(deltas, vec!["Hel", "lo ", "world"]);
    assert_eq!(events.first().map(|e| e.event_type()), Some("step_start"));
    assert!(matches!(
        events.last(),
        Some(AgentStreamEvent::Done { status: RunStatus::Stopped, .. })
    ));
    assert_eq!(result.text, "Hello world");
    assert!(provider.requests()[0].stream);
}

#[tokio::test]
async fn text_stream_helper_yields_only_text() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_call_response(vec![tool_call("c1", "getWeather", json!({"city": "Oslo"}))]),
        text_chunks(&["Cold ", "today."]),
    ]));
    let config = LoopConfig {
        streaming: true,
        ..LoopConfig::default()
    };
    let agent = Arc::new(agent_with(provider, registry(vec![weather_tool(20)]), config));
    let run = agent.stream(GenerateOptions::prompt("weather").stop_when(vec![step_count_is(3)]));

    let text: Vec<String> = text_stream(run.events).collect().await;
    assert_eq!(text.concat(), "Cold today.");
    let result = run.handle.await.unwrap();
    assert_eq!(result.steps.len(), 2);
}

#[tokio::test]
async fn stream_without_finish_fails_run() {
    let provider = Arc::new(ScriptedProvider::new(vec![ScriptedTurn::Stream(vec![
        StreamEvent::Start,
        StreamEvent::TextDelta {
            id: "t".into(),
            delta: "partial".into(),
        },
    ])]));
    let config = LoopConfig {
        streaming: true,
        ..LoopConfig::default()
    };
    let result = agent_with(provider, ToolRegistry::new(), config)
        .generate(GenerateOptions::prompt("x"))
        .await;

    assert_eq!(result.status, RunStatus::Failed);
    assert!(matches!(
        result.error,
        Some(AgentError::Provider(ProviderError::StreamInterrupted(_)))
    ));
    assert!(result.steps.is_empty());
}

// ── Tool input hooks ─────────────────────────────────────────────────────

#[derive(Default)]
struct RecordingHooks(Mutex<Vec<String>>);

impl ToolInputHooks for RecordingHooks {
    fn on_input_start(&self, call_id: &str) {
        self.0.lock().unwrap().push(format!("start:{call_id}"));
    }
    fn on_input_delta(&self, _call_id: &str, delta: &str) {
        self.0.lock().unwrap().push(format!("delta:{delta}"));
    }
    fn on_input_available(&self, _call_id: &str, input: &Value) {
        self.0
            .lock()
            .unwrap()
            .push(format!("available:{}", input["city"].as_str().unwrap_or_default()));
    }
}

struct PanickingHooks;

impl ToolInputHooks for PanickingHooks {
    fn on_input_start(&self, _call_id: &str) {
        panic!("hook exploded");
    }
    fn on_input_available(&self, _call_id: &str, _input: &Value) {
        panic!("hook exploded again");
    }
}

#[tokio::test]
async fn hooks_fire_in_order_and_panics_are_contained() {
    let hooks = Arc::new(RecordingHooks::default());
    let noisy = ToolDefinition::new("noisy", "Panicking observer", InputShape::object())
        .with_execute(|_| async { Ok(json!("still ran")) })
        .with_hooks(Arc::new(PanickingHooks));
    let tools = registry(vec![weather_tool(41).with_hooks(hooks.clone()), noisy]);

    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedTurn::Stream(vec![
            StreamEvent::Start,
            StreamEvent::ToolInputStart {
                call_id: "c1".into(),
                tool_name: "getWeather".into(),
            },
            StreamEvent::ToolInputDelta {
                call_id: "c1".into(),
                delta: r#"{"city":"#.into(),
            },
            StreamEvent::ToolInputDelta {
                call_id: "c1".into(),
                delta: r#""Oslo"}"#.into(),
            },
            StreamEvent::ToolInputAvailable {
                call_id: "c1".into(),
                tool_name: "getWeather".into(),
                input: r#"{"city":"Oslo"}"#.into(),
            },
            StreamEvent::ToolInputStart {
                call_id: "c2".into(),
                tool_name: "noisy".into(),
            },
            StreamEvent::ToolInputAvailable {
                call_id: "c2".into(),
                tool_name: "noisy".into(),
                input: "{}".into(),
            },
            StreamEvent::End,
            StreamEvent::Finish {
                finish_reason: FinishReason::ToolCalls,
                raw_finish_reason: None,
                usage: Usage::new(10, 5),
                model: None,
            },
        ]),
        text_response("done"),
    ]));
    let config = LoopConfig {
        streaming: true,
        ..LoopConfig::default()
    };
    let result = agent_with(provider, tools, config)
        .generate(GenerateOptions::prompt("weather").stop_when(vec![step_count_is(5)]))
        .await;

    assert_eq!(
        *hooks.0.lock().unwrap(),
        vec![
            "start:c1".to_string(),
            r#"delta:{"city":"#.to_string(),
            r#"delta:"Oslo"}"#.to_string(),
            "available:Oslo".to_string(),
        ]
    );
    let step = &result.steps[0];
    assert_eq!(step.tool_results.len(), 2);
    assert_eq!(step.tool_results[1].value(), Some(&json!("still ran")));
    assert_eq!(result.status, RunStatus::Stopped);
}

// ── Failures, cancellation, timeouts ─────────────────────────────────────

#[tokio::test]
async fn backend_error_keeps_partial_transcript() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_call_response(vec![tool_call("c1", "getWeather", json!({"city": "Lima"}))]),
        ScriptedTurn::Error(ProviderError::ApiError {
            status_code: 503,
            message: "overloaded".into(),
        }),
    ]));
    let result = agent(provider, registry(vec![weather_tool(75)]))
        .generate(GenerateOptions::prompt("weather").stop_when(vec![step_count_is(5)]))
        .await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.finish_reason, FinishReason::Error);
    assert_eq!(result.steps.len(), 1);
    assert_eq!(result.tool_results.len(), 1);
    assert!(result.stop_reason.is_none());
    assert!(matches!(
        result.error,
        Some(AgentError::Provider(ProviderError::ApiError { status_code: 503, .. }))
    ));
}

#[tokio::test]
async fn exhausted_script_fails_run() {
    let provider = Arc::new(ScriptedProvider::new(vec![tool_call_response(vec![tool_call(
        "c1",
        "getWeather",
        json!({"city": "Rome"}),
    )])]));
    let result = agent(provider, registry(vec![weather_tool(80)]))
        .generate(GenerateOptions::prompt("weather").stop_when(vec![step_count_is(5)]))
        .await;

    assert!(result.is_failed());
    assert_eq!(
        result.error,
        Some(AgentError::Provider(ProviderError::ScriptExhausted { calls: 1 }))
    );
}

#[tokio::test]
async fn failing_tool_is_recorded_and_run_continues() {
    let flaky = ToolDefinition::new("saveNote", "Persist a note", InputShape::object())
        .with_execute(|_| async { Err(ToolError::failed("saveNote", "disk full")) });
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_call_response(vec![tool_call("c1", "saveNote", json!({}))]),
        text_response("Saving failed, sorry."),
    ]));
    let result = agent(provider.clone(), registry(vec![flaky]))
        .generate(GenerateOptions::prompt("save it").stop_when(vec![step_count_is(5)]))
        .await;

    assert!(matches!(
        result.steps[0].tool_results[0].tool_error(),
        Some(ToolError::ExecutionFailed { reason, .. }) if reason == "disk full"
    ));
    let fed_back = provider.requests()[1].messages.last().unwrap().content.clone();
    assert!(fed_back.starts_with("Error: "), "{fed_back}");
    assert!(fed_back.contains("disk full"));
    assert_eq!(result.status, RunStatus::Stopped);
    assert_eq!(result.steps.len(), 2);
    assert!(result.error.is_none());
}

#[tokio::test]
async fn duplicate_call_ids_fail_run() {
    let provider = Arc::new(ScriptedProvider::new(vec![tool_call_response(vec![
        tool_call("c1", "add", json!({"a": 1, "b": 2})),
        tool_call("c1", "multiply", json!({"a": 3, "b": 4})),
    ])]));
    let result = agent(provider, default_registry(Some(0)).unwrap())
        .generate(GenerateOptions::prompt("math").stop_when(vec![step_count_is(5)]))
        .await;

    assert_eq!(result.status, RunStatus::Failed);
    assert!(matches!(
        result.error,
        Some(AgentError::Provider(ProviderError::InvalidResponse(_)))
    ));
    assert!(result.steps.is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_tool_execution() {
    let slow = ToolDefinition::new("slowLookup", "Takes a while", InputShape::object())
        .with_execute(|_| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(json!("late"))
        });
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_call_response(vec![tool_call("c1", "slowLookup", json!({}))]),
        text_response("never requested"),
    ]));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let result = agent(provider.clone(), registry(vec![slow]))
        .generate(
            GenerateOptions::prompt("look it up")
                .stop_when(vec![step_count_is(5)])
                .cancel_token(cancel),
        )
        .await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.error, Some(AgentError::Cancelled));
    assert_eq!(result.steps.len(), 1);
    assert!(matches!(
        result.steps[0].tool_results[0].tool_error(),
        Some(ToolError::Cancelled { tool_name }) if tool_name == "slowLookup"
    ));
    assert_eq!(provider.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancellation_between_steps() {
    let provider = Arc::new(
        ScriptedProvider::new(vec![
            tool_call_response(vec![tool_call("c1", "getWeather", json!({"city": "Paris"}))]),
            text_response("never delivered"),
        ])
        .with_latency(Duration::from_secs(1)),
    );
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        trigger.cancel();
    });

    let result = agent(provider.clone(), registry(vec![weather_tool(60)]))
        .generate(
            GenerateOptions::prompt("weather")
                .stop_when(vec![step_count_is(5)])
                .cancel_token(cancel),
        )
        .await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.error, Some(AgentError::Cancelled));
    assert_eq!(result.finish_reason, FinishReason::Error);
    assert_eq!(result.steps.len(), 1);
    assert_eq!(provider.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn backend_timeout_fails_run() {
    let provider = Arc::new(
        ScriptedProvider::new(vec![text_response("too slow")]).with_latency(Duration::from_secs(5)),
    );
    let config = LoopConfig {
        timeouts: TimeoutConfig {
            backend_ms: Some(100),
            tool_ms: None,
        },
        ..LoopConfig::default()
    };
    let result = agent_with(provider, ToolRegistry::new(), config)
        .generate(GenerateOptions::prompt("x"))
        .await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(
        result.error,
        Some(AgentError::Provider(ProviderError::Timeout(100)))
    );
    assert!(result.steps.is_empty());
}

#[tokio::test]
async fn system_prompt_and_declarations_reach_backend() {
    let provider = Arc::new(ScriptedProvider::new(vec![text_response("ok")]));
    agent(provider.clone(), default_registry(Some(0)).unwrap())
        .generate(GenerateOptions::prompt("hi").system("You are terse."))
        .await;

    let request = &provider.requests()[0];
    assert_eq!(request.messages[0].role, Role::System);
    assert_eq!(request.messages[0].content, "You are terse.");
    let names: Vec<&str> = request.tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["add", "findOrders", "getWeather", "multiply"]);
    assert_eq!(request.tools[2].parameters["required"], json!(["city"]));
}
