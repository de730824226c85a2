mod common;

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use common::*;
use desk_hands::config::{LoopStrategy, Options, SafetyLevel};
use desk_hands::guardrails::TakeoverSource;
use desk_hands::react;
use desk_hands::CuaError;

fn opts() -> Options {
    Options { api_key: Some("test".into()), ..Options::default() }
}

#[tokio::test(start_paused = true)]
async fn happy_path_opens_calculator() {
    let desk = Arc::new(RecordingDesktop::new());
    let model = ScriptedModel::new(vec![
        call("screenshot", json!({})),
        call("key_press", json!({ "key": "space", "modifiers": ["cmd"] })),
        call("type_text", json!({ "text": "Calculator" })),
        call("key_press", json!({ "key": "enter" })),
        call("complete_task", json!({ "summary": "Opened calculator" })),
    ]);
    let cfg = config(opts());
    let rails = guardrails(&cfg);
    let s = session("open calculator", cfg, desk.clone(), CancellationToken::new());

    let result = react::run(&s, &model, &rails, None).await;

    assert!(result.success, "{result:?}");
    assert_eq!(result.steps.len(), 5);
    assert_eq!(result.summary, "Opened calculator");
    assert!(result.error.is_none());
    assert_eq!(s.memory.consecutive_fails(), 0);
    for (i, step) in result.steps.iter().enumerate() {
        assert_eq!(step.number, i + 1);
        assert!(step.success);
    }
    assert_eq!(
        desk.inputs(),
        vec![
            Input::KeyDown("cmd".into()),
            Input::KeyTap("space".into()),
            Input::KeyUp("cmd".into()),
            Input::Type("Calculator".into()),
            Input::KeyTap("enter".into()),
        ]
    );
    assert_eq!(desk.captures(), 1);
}

#[tokio::test(start_paused = true)]
async fn run_stops_at_max_actions() {
    let desk = Arc::new(RecordingDesktop::new());
    let turns = (0..51).map(|_| call("wait", json!({ "duration_ms": 100 }))).collect();
    let model = ScriptedModel::new(turns);
    let cfg = config(opts());
    let rails = guardrails(&cfg);
    let s = session("wait forever", cfg, desk, CancellationToken::new());

    let result = react::run(&s, &model, &rails, None).await;

    assert!(!result.success);
    assert_eq!(result.steps.len(), 50);
    assert_eq!(result.steps.last().map(|s| s.number), Some(50));
    assert_eq!(result.error.as_ref().map(|e| e.kind()), Some(&CuaError::MaxActions));
    assert_eq!(model.remaining(), 1);
}

#[tokio::test(start_paused = true)]
async fn strict_safety_blocks_password_typing() {
    let desk = Arc::new(RecordingDesktop::new());
    let model = ScriptedModel::new(vec![
        call("screenshot", json!({})),
        call("type_text", json!({ "text": "password123" })),
    ]);
    let cfg = config(Options { safety_level: SafetyLevel::Strict, ..opts() });
    let rails = guardrails(&cfg);
    let s = session("log in", cfg, desk.clone(), CancellationToken::new());

    let result = react::run(&s, &model, &rails, None).await;

    let blocked = &result.steps[1];
    assert!(!blocked.success);
    assert!(matches!(blocked.error.as_ref().map(|e| &e.source), Some(CuaError::SafetyBlock(_))));
    assert_eq!(s.memory.consecutive_fails(), 1);
    assert!(!desk.inputs().iter().any(|i| matches!(i, Input::Type(_))));
    // the model saw the denial as an observation and was asked again
    assert_eq!(model.requests().len(), 3);
    assert!(rails.audit_entries().iter().any(|e| e.result == "denied"));
}

#[tokio::test(start_paused = true)]
async fn repeated_failures_end_as_stuck() {
    let desk = Arc::new(RecordingDesktop::new());
    *desk.click_error.lock().unwrap() = Some(CuaError::ElementNotFound("Save button".into()));
    let turns = (0..8).map(|_| call("click", json!({ "x": 100, "y": 100 }))).collect();
    let model = ScriptedModel::new(turns);
    let cfg = config(opts());
    let rails = guardrails(&cfg);
    let s = session("save the file", cfg, desk, CancellationToken::new());

    let result = react::run(&s, &model, &rails, None).await;

    assert!(!result.success);
    assert!(result.needs_help);
    assert_eq!(result.steps.len(), 5);
    assert!(result.steps.iter().all(|s| !s.success));
    assert_eq!(result.error.as_ref().map(|e| e.kind()), Some(&CuaError::AgentStuck));
    assert!(s.memory.to_prompt().contains("NEEDS HELP"));
    assert!(rails
        .takeover_history()
        .iter()
        .any(|e| e.source == TakeoverSource::ConsecutiveFailures));
}

#[tokio::test(start_paused = true)]
async fn cancel_during_wait_returns_promptly() {
    let desk = Arc::new(RecordingDesktop::new());
    let model = ScriptedModel::new(vec![
        call("wait", json!({ "duration_ms": 5000 })),
        call("complete_task", json!({ "summary": "never" })),
    ]);
    let cfg = config(opts());
    let rails = guardrails(&cfg);
    let token = CancellationToken::new();
    let s = session("wait", cfg, desk, token.clone());

    let started = Instant::now();
    let (result, _) = tokio::join!(react::run(&s, &model, &rails, None), async {
        tokio::time::sleep(SHORT).await;
        token.cancel();
    });

    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(result.error.as_ref().map(|e| e.kind()), Some(&CuaError::Canceled));
    assert_eq!(result.steps.len(), 1);
    assert_eq!(model.remaining(), 1);
}

#[tokio::test(start_paused = true)]
async fn clicks_are_read_as_normalized_or_image_pixels() {
    let desk = Arc::new(RecordingDesktop::with_display(1512, 982, 2.0));
    let model = ScriptedModel::new(vec![
        call("screenshot", json!({})),
        call("click", json!({ "x": 500, "y": 500 })),
        call("click", json!({ "x": 1500, "y": 500 })),
        call("complete_task", json!({ "summary": "clicked" })),
    ]);
    let cfg = config(opts());
    let rails = guardrails(&cfg);
    let s = session("click around", cfg, desk.clone(), CancellationToken::new());

    let result = react::run(&s, &model, &rails, None).await;
    assert!(result.success, "{result:?}");

    let coords = s.coordinates();
    assert_eq!((coords.logical_screen_size.width, coords.logical_screen_size.height), (1512, 982));
    assert_eq!((coords.image_size.width, coords.image_size.height), (1280, 831));

    let clicks = desk.clicks();
    assert_eq!(clicks.len(), 2);
    assert!(near(clicks[0], 756.0, 491.0), "{:?}", clicks[0]);
    // 1500 image px * (3024 / 1280) / 2, clamped to the screen edge
    assert!(near(clicks[1], 1511.0, 591.0), "{:?}", clicks[1]);
}

// ===== Loop behaviour =====

#[tokio::test(start_paused = true)]
async fn need_help_hands_off() {
    let desk = Arc::new(RecordingDesktop::new());
    let model = ScriptedModel::new(vec![call(
        "need_help",
        json!({ "reason": "captcha", "attempts_made": 2 }),
    )]);
    let cfg = config(opts());
    let rails = guardrails(&cfg);
    let s = session("sign up", cfg, desk, CancellationToken::new());

    let result = react::run(&s, &model, &rails, None).await;

    assert!(!result.success);
    assert!(result.needs_help);
    assert_eq!(result.summary, "captcha");
    assert_eq!(result.error.as_ref().map(|e| e.kind()), Some(&CuaError::HumanTakeover));
    assert!(!rails.is_paused());
    assert_eq!(rails.takeover_history()[0].source, TakeoverSource::Programmatic);
}

#[tokio::test(start_paused = true)]
async fn strict_safety_still_allows_asking_for_help() {
    let desk = Arc::new(RecordingDesktop::new());
    let model = ScriptedModel::new(vec![call(
        "need_help",
        json!({ "reason": "the login form needs my password" }),
    )]);
    let cfg = config(Options { safety_level: SafetyLevel::Strict, ..opts() });
    let rails = guardrails(&cfg);
    let s = session("log in", cfg, desk, CancellationToken::new());

    let result = react::run(&s, &model, &rails, None).await;

    assert!(result.needs_help);
    assert_eq!(result.steps.len(), 1);
    assert!(result.steps[0].success);
    assert_eq!(result.summary, "the login form needs my password");
    assert_eq!(result.error.as_ref().map(|e| e.kind()), Some(&CuaError::HumanTakeover));
    assert_eq!(s.memory.consecutive_fails(), 0);
}

#[tokio::test(start_paused = true)]
async fn provider_rate_limit_is_terminal() {
    let desk = Arc::new(RecordingDesktop::new());
    let limited = CuaError::Model("429 Too Many Requests: RESOURCE_EXHAUSTED".into());
    let model = ScriptedModel::new(vec![Err(limited)]);
    let cfg = config(opts());
    let rails = guardrails(&cfg);
    let s = session("anything", cfg, desk, CancellationToken::new());

    let result = react::run(&s, &model, &rails, None).await;

    assert!(result.steps.is_empty());
    match result.error.as_ref().map(|e| e.kind()) {
        Some(CuaError::ModelRateLimited(msg)) => assert!(msg.contains("wait")),
        other => panic!("expected rate limit, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn unknown_tools_are_ignored() {
    let desk = Arc::new(RecordingDesktop::new());
    let model = ScriptedModel::new(vec![
        call("launch_rocket", json!({})),
        Err(CuaError::Model("model stopped: MALFORMED_FUNCTION_CALL".into())),
        say("Let me finish."),
        call("complete_task", json!({ "summary": "done" })),
    ]);
    let cfg = config(opts());
    let rails = guardrails(&cfg);
    let s = session("do it", cfg, desk, CancellationToken::new());

    let result = react::run(&s, &model, &rails, None).await;

    assert!(result.success, "{result:?}");
    assert_eq!(result.steps.len(), 1);
    assert_eq!(result.steps[0].number, 1);
    assert_eq!(model.requests().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn summary_falls_back_to_last_text() {
    let desk = Arc::new(RecordingDesktop::new());
    let model = ScriptedModel::new(vec![say("The window is already open.")]);
    let cfg = config(opts());
    let rails = guardrails(&cfg);
    let s = session("open the window", cfg, desk, CancellationToken::new());

    let result = react::run(&s, &model, &rails, None).await;

    assert!(!result.success);
    assert_eq!(result.summary, "The window is already open.");
}

#[tokio::test(start_paused = true)]
async fn observe_first_sends_a_screen_each_turn() {
    let desk = Arc::new(RecordingDesktop::new());
    let model = ScriptedModel::new(vec![
        call("wait", json!({ "duration_ms": 10 })),
        call("complete_task", json!({ "summary": "looked" })),
    ]);
    let cfg = config(Options { strategy: LoopStrategy::ObserveFirst, ..opts() });
    let rails = guardrails(&cfg);
    let s = session("look", cfg, desk.clone(), CancellationToken::new());

    let result = react::run(&s, &model, &rails, None).await;

    assert!(result.success);
    assert_eq!(result.steps.len(), 2);
    assert_eq!(desk.captures(), 2);
    assert!(model.requests().iter().all(has_image));
}

#[tokio::test(start_paused = true)]
async fn guardrail_rate_limit_waits_for_a_slot() {
    let desk = Arc::new(RecordingDesktop::new());
    let mut turns: Vec<_> = (0..3).map(|_| call("wait", json!({ "duration_ms": 10 }))).collect();
    turns.push(call("complete_task", json!({ "summary": "ok" })));
    let model = ScriptedModel::new(turns);
    let cfg = config(Options {
        rate_limit_per_minute: 2,
        timeout: Duration::from_secs(600),
        ..opts()
    });
    let rails = guardrails(&cfg);
    let s = session("slowly", cfg, desk, CancellationToken::new());

    let started = Instant::now();
    let result = react::run(&s, &model, &rails, None).await;

    assert!(result.success, "{result:?}");
    assert!(result.steps.iter().all(|s| s.success));
    assert!(started.elapsed() >= Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn progress_events_arrive_in_step_order() {
    use desk_hands::{ProgressEvent, ProgressFn};
    use std::sync::Mutex;

    let desk = Arc::new(RecordingDesktop::new());
    let model = ScriptedModel::new(vec![
        Ok(desk_hands::llm::ModelTurn {
            events: vec![
                desk_hands::llm::ModelEvent::Thinking("need a look".into()),
                desk_hands::llm::ModelEvent::ToolCall {
                    name: "screenshot".into(),
                    args: json!({}),
                    signature: None,
                },
            ],
        }),
        call("wait", json!({ "duration_ms": 5 })),
        call("complete_task", json!({ "summary": "fine" })),
    ]);
    let cfg = config(opts());
    let rails = guardrails(&cfg);
    let s = session("watch", cfg, desk, CancellationToken::new());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let cb: ProgressFn = Arc::new(move |e: &ProgressEvent| {
        let label = match e {
            ProgressEvent::Thinking(t) => format!("think:{t}"),
            ProgressEvent::Message(m) => format!("say:{m}"),
            ProgressEvent::Step(s) => format!("step:{}:{}", s.number, s.action),
        };
        sink.lock().unwrap().push(label);
    });

    let result = react::run(&s, &model, &rails, Some(&cb)).await;
    assert!(result.success);
    assert_eq!(
        *seen.lock().unwrap(),
        vec!["think:need a look", "step:1:screenshot", "step:2:wait", "step:3:complete_task"]
    );
}
