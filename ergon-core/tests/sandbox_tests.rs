//! End-to-end tests for sandboxed invocations

use ergon_core::prelude::*;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

fn config() -> SandboxConfig {
    SandboxConfig::default()
        .with_timeout_ms(5_000)
        .with_console_forwarding(false)
}

fn definition(
    name: &str,
    handler: Arc<dyn Capability>,
) -> CapabilityDefinition {
    CapabilityDefinition::new(name, format!("{name} capability"), handler)
}

fn weather_capabilities() -> CapabilityTable {
    CapabilityTable::new()
        .with(definition(
            "getUserLocation",
            capability_fn(|_| async { Ok(json!("Seattle")) }),
        ))
        .unwrap()
        .with(definition(
            "getWeather",
            capability_fn(|args| async move {
                assert_eq!(args, json!({"location": "Seattle"}));
                Ok(json!({"temperature": 65, "condition": "foggy"}))
            }),
        ))
        .unwrap()
}

#[derive(Default)]
struct CountingObserver {
    provisioned: AtomicUsize,
    disposed: AtomicUsize,
}

impl IsolateObserver for CountingObserver {
    fn on_provisioned(&self, _invocation: Uuid) {
        self.provisioned.fetch_add(1, Ordering::SeqCst);
    }

    fn on_disposed(&self, _invocation: Uuid, _clean: bool) {
        self.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Log output captured from a scoped subscriber
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Run `script` with a subscriber scoped to this test, returning the result text
/// and everything that was logged
async fn execute_with_logs(config: SandboxConfig, script: &str) -> (String, String) {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let text = CodeExecutor::new(config)
        .execute(script, &weather_capabilities(), None)
        .await
        .unwrap();
    (text, logs.contents())
}

fn abort_on_auth() -> Arc<dyn InspectionCallback> {
    Arc::new(|_: &str, value: &Value, _: &Value| {
        if value.get("authRequired") == Some(&json!(true)) {
            ResultSignal::abort(value.clone())
        } else {
            ResultSignal::proceed(value.clone())
        }
    })
}

#[tokio::test]
async fn test_single_capability_result() {
    let executor = CodeExecutor::new(config());
    let text = executor
        .execute("return await getUserLocation();", &weather_capabilities(), None)
        .await
        .unwrap();
    assert_eq!(text, "Final result: \"Seattle\"");
}

#[tokio::test]
async fn test_chained_capabilities_with_trace() {
    let executor = CodeExecutor::new(config());
    let script = r#"
        const location = await getUserLocation();
        return await getWeather({ location });
    "#;

    let text = executor
        .execute(script, &weather_capabilities(), Some(true))
        .await
        .unwrap();
    assert_eq!(
        text,
        "getUserLocation({}) → \"Seattle\"\n\
         getWeather({\"location\":\"Seattle\"}) → {\"temperature\":65,\"condition\":\"foggy\"}\n\
         \n\
         Final result: {\"temperature\":65,\"condition\":\"foggy\"}"
    );

    let quiet = executor
        .execute(script, &weather_capabilities(), Some(false))
        .await
        .unwrap();
    assert_eq!(quiet, "Final result: {\"temperature\":65,\"condition\":\"foggy\"}");
}

#[tokio::test]
async fn test_configured_trace_default() {
    let executor = CodeExecutor::new(config().with_trace_in_output(true));
    let text = executor
        .execute("return await getUserLocation();", &weather_capabilities(), None)
        .await
        .unwrap();
    assert!(text.starts_with("getUserLocation({}) → \"Seattle\"\n\n"));
}

#[tokio::test]
async fn test_argument_normalization() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let capabilities = CapabilityTable::new()
        .with(definition(
            "record",
            capability_fn(move |args| {
                sink.lock().unwrap().push(args);
                async { Ok(Value::Null) }
            }),
        ))
        .unwrap();

    let executor = CodeExecutor::new(config());
    executor
        .execute(
            "await record(); await record({ a: 1 }); await record(1, 'two'); return null;",
            &capabilities,
            None,
        )
        .await
        .unwrap();

    assert_eq!(
        *received.lock().unwrap(),
        vec![json!({}), json!({"a": 1}), json!([1, "two"])]
    );
}

#[tokio::test]
async fn test_abort_stops_later_calls() {
    let tool_b_calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&tool_b_calls);
    let capabilities = CapabilityTable::new()
        .with(definition(
            "toolA",
            capability_fn(|_| async { Ok(json!({"authRequired": true})) }),
        ))
        .unwrap()
        .with(definition(
            "toolB",
            capability_fn(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(json!("ran")) }
            }),
        ))
        .unwrap();

    let executor = CodeExecutor::new(config()).with_inspector(abort_on_auth());
    let script = "const a = await toolA(); await toolB(); return 'done';";

    for include_trace in [false, true] {
        let text = executor
            .execute(script, &capabilities, Some(include_trace))
            .await
            .unwrap();
        assert_eq!(text, "{\"authRequired\":true}");
    }
    assert_eq!(tool_b_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_abort_bypasses_script_catch() {
    let capabilities = CapabilityTable::new()
        .with(definition(
            "toolA",
            capability_fn(|_| async { Ok(json!({"authRequired": true})) }),
        ))
        .unwrap();

    let executor = CodeExecutor::new(config()).with_inspector(abort_on_auth());
    let text = executor
        .execute(
            "try { await toolA(); } catch (e) { return 'caught'; } return 'finished';",
            &capabilities,
            None,
        )
        .await
        .unwrap();
    assert_eq!(text, "{\"authRequired\":true}");
}

#[tokio::test]
async fn test_abort_drops_inflight_calls() {
    let finished = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&finished);
    let capabilities = CapabilityTable::new()
        .with(definition(
            "toolA",
            capability_fn(|_| async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(json!({"authRequired": true}))
            }),
        ))
        .unwrap()
        .with(definition(
            "slow",
            capability_fn(move |_| {
                let flag = Arc::clone(&flag);
                async move {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            }),
        ))
        .unwrap();

    let engine = SandboxEngine::new(config()).with_inspector(abort_on_auth());
    let report = engine
        .run("return await Promise.all([slow(), toolA()]);", &capabilities)
        .await;

    assert_eq!(
        report.outcome,
        InvocationOutcome::Aborted(json!({"authRequired": true}))
    );
    assert_eq!(report.trace.len(), 1);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!finished.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_pending_forever_times_out() {
    let executor = CodeExecutor::new(config().with_timeout_ms(200));
    let started = Instant::now();
    let err = executor
        .execute("await new Promise(() => {}); return 1;", &CapabilityTable::new(), None)
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert_eq!(err.to_string(), "Script execution timed out after 200ms");
    assert!(started.elapsed() < Duration::from_millis(200 + 1_500));
}

#[tokio::test]
async fn test_long_timer_times_out() {
    let executor = CodeExecutor::new(config().with_timeout_ms(200));
    let err = executor
        .execute(
            "await new Promise(resolve => setTimeout(resolve, 10000)); return 1;",
            &CapabilityTable::new(),
            None,
        )
        .await
        .unwrap_err();
    assert!(err.is_timeout());
}

#[tokio::test]
async fn test_far_future_timer_times_out_and_disposes() {
    let observer = Arc::new(CountingObserver::default());
    let engine = SandboxEngine::new(config().with_timeout_ms(300)).with_observer(observer.clone());

    let report = engine
        .run(
            "await new Promise(resolve => setTimeout(resolve, 1e15)); return 1;",
            &CapabilityTable::new(),
        )
        .await;

    assert_eq!(report.outcome, InvocationOutcome::TimedOut { timeout_ms: 300 });
    assert_eq!(observer.provisioned.load(Ordering::SeqCst), 1);
    assert_eq!(observer.disposed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cpu_loop_times_out() {
    let executor = CodeExecutor::new(config().with_timeout_ms(200));
    let started = Instant::now();
    let err = executor
        .execute("while (true) {}", &CapabilityTable::new(), None)
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert!(started.elapsed() < Duration::from_millis(200 + 1_500));
}

#[tokio::test]
async fn test_concurrent_calls_trace_in_completion_order() {
    let capabilities = CapabilityTable::new()
        .with(definition(
            "slow",
            capability_fn(|_| async {
                tokio::time::sleep(Duration::from_millis(80)).await;
                Ok(json!("s"))
            }),
        ))
        .unwrap()
        .with(definition(
            "fast",
            capability_fn(|_| async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(json!("f"))
            }),
        ))
        .unwrap();

    let engine = SandboxEngine::new(config());
    let started = Instant::now();
    let report = engine
        .run("return await Promise.all([slow(), fast()]);", &capabilities)
        .await;

    assert_eq!(report.outcome, InvocationOutcome::Completed(json!(["s", "f"])));
    let order: Vec<_> = report.trace.iter().map(|e| e.capability.as_str()).collect();
    assert_eq!(order, vec!["fast", "slow"]);
    // Both calls were in flight together
    assert!(started.elapsed() < Duration::from_millis(80 + 5 + 500));
}

#[tokio::test]
async fn test_capability_error_catchable() {
    let capabilities = CapabilityTable::new()
        .with(definition(
            "fetchRecord",
            capability_fn(|_| async {
                Err(CapabilityError::new("not found").with_payload(json!({"code": 404})))
            }),
        ))
        .unwrap();

    let executor = CodeExecutor::new(config());
    let text = executor
        .execute(
            "try { await fetchRecord({ id: 1 }); } catch (e) { return { message: e.message, code: e.data.code }; }",
            &capabilities,
            Some(true),
        )
        .await
        .unwrap();

    assert_eq!(
        text,
        "fetchRecord({\"id\":1}) → Error: not found\n\nFinal result: {\"message\":\"not found\",\"code\":404}"
    );
}

#[tokio::test]
async fn test_uncaught_capability_error_is_script_error() {
    let capabilities = CapabilityTable::new()
        .with(definition(
            "fetchRecord",
            capability_fn(|_| async { Err(CapabilityError::new("not found")) }),
        ))
        .unwrap();

    let executor = CodeExecutor::new(config());
    let err = executor
        .execute("return await fetchRecord({ id: 1 });", &capabilities, Some(true))
        .await
        .unwrap_err();

    match err {
        ExecutionError::Script { message, report } => {
            assert_eq!(message, "not found");
            assert_eq!(
                report,
                "fetchRecord({\"id\":1}) → Error: not found\n\nScript error: not found"
            );
        }
        other => panic!("expected script error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_syntax_error() {
    let executor = CodeExecutor::new(config());
    let err = executor
        .execute("return (;", &CapabilityTable::new(), None)
        .await
        .unwrap_err();

    match err {
        ExecutionError::Script { message, report } => {
            assert!(message.starts_with("SyntaxError"), "{message}");
            assert!(report.starts_with("Script error: SyntaxError"));
        }
        other => panic!("expected script error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unserializable_result() {
    let executor = CodeExecutor::new(config());
    let err = executor
        .execute("const a = {}; a.self = a; return a;", &CapabilityTable::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ExecutionError::Script { ref message, .. }
            if message.starts_with("Result is not serializable")
    ));
}

#[tokio::test]
async fn test_identifier_collision_is_setup_error() {
    let capabilities = CapabilityTable::new()
        .with(definition("files.read", capability_fn(|_| async { Ok(Value::Null) })))
        .unwrap()
        .with(definition("files-read", capability_fn(|_| async { Ok(Value::Null) })))
        .unwrap();

    let executor = CodeExecutor::new(config());
    let err = executor
        .execute("return 1;", &capabilities, None)
        .await
        .unwrap_err();

    match err {
        ExecutionError::Setup { message, .. } => {
            assert!(message.contains("files.read"));
            assert!(message.contains("files-read"));
        }
        other => panic!("expected setup error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_sanitized_names_keep_original_in_trace() {
    let capabilities = CapabilityTable::new()
        .with(definition(
            "github.create-issue",
            capability_fn(|args| async move { Ok(json!({"number": 7, "title": args["title"]})) }),
        ))
        .unwrap();

    let engine = SandboxEngine::new(config());
    let report = engine
        .run(
            "return (await github_create_issue({ title: 'bug' })).number;",
            &capabilities,
        )
        .await;

    assert_eq!(report.outcome, InvocationOutcome::Completed(json!(7)));
    assert_eq!(report.trace[0].capability, "github.create-issue");
}

#[tokio::test]
async fn test_disposal_exactly_once_per_outcome() {
    let observer = Arc::new(CountingObserver::default());
    let capabilities = CapabilityTable::new()
        .with(definition(
            "toolA",
            capability_fn(|_| async { Ok(json!({"authRequired": true})) }),
        ))
        .unwrap();
    let engine = SandboxEngine::new(config().with_timeout_ms(300))
        .with_inspector(abort_on_auth())
        .with_observer(observer.clone());

    let scripts = [
        ("return 1;", "completed"),
        ("throw new Error('boom');", "script_error"),
        ("await new Promise(() => {});", "timed_out"),
        ("await toolA();", "aborted"),
    ];
    for (script, expected) in scripts {
        let report = engine.run(script, &capabilities).await;
        assert_eq!(report.outcome.kind(), expected);
    }

    let colliding = CapabilityTable::new()
        .with(definition("a.b", capability_fn(|_| async { Ok(Value::Null) })))
        .unwrap()
        .with(definition("a-b", capability_fn(|_| async { Ok(Value::Null) })))
        .unwrap();
    let report = engine.run("return 1;", &colliding).await;
    assert_eq!(report.outcome.kind(), "setup_error");

    assert_eq!(observer.provisioned.load(Ordering::SeqCst), 5);
    assert_eq!(observer.disposed.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_timers_and_clear() {
    let executor = CodeExecutor::new(config());
    let text = executor
        .execute(
            r#"
            const fired = [];
            const cancelled = setTimeout(() => fired.push("cancelled"), 10);
            clearTimeout(cancelled);
            setTimeout((label) => fired.push(label), 5, "first");
            await new Promise(resolve => setTimeout(() => { fired.push("second"); resolve(); }, 30));
            return fired;
            "#,
            &CapabilityTable::new(),
            None,
        )
        .await
        .unwrap();
    assert_eq!(text, "Final result: [\"first\",\"second\"]");
}

#[tokio::test]
async fn test_console_is_available() {
    for forwarding in [false, true] {
        let executor = CodeExecutor::new(config().with_console_forwarding(forwarding));
        let text = executor
            .execute(
                "console.log('value', { a: 1 }); console.error(new Error('x')); return typeof console.warn;",
                &CapabilityTable::new(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(text, "Final result: \"function\"");
    }
}

#[tokio::test]
async fn test_operator_log_records_script_and_trace() {
    let script = "console.log('forwarded-' + (40 + 2)); return await getUserLocation();";
    let (text, logs) = execute_with_logs(config().with_console_forwarding(true), script).await;

    // Trace lines stay out of the result text but always reach the operator log
    assert_eq!(text, "Final result: \"Seattle\"");
    assert!(logs.contains("ergon::operator"));
    assert!(logs.contains("getUserLocation();"));
    assert!(logs.contains("getUserLocation({}) → \"Seattle\""));

    assert!(logs.contains("ergon::console"));
    assert!(logs.contains("forwarded-42"));
}

#[tokio::test]
async fn test_console_discarded_without_forwarding() {
    let script = "console.log('forwarded-' + (40 + 2)); return await getUserLocation();";
    let (text, logs) = execute_with_logs(config().with_console_forwarding(false), script).await;

    assert_eq!(text, "Final result: \"Seattle\"");
    assert!(logs.contains("getUserLocation({}) → \"Seattle\""));
    assert!(!logs.contains("ergon::console"));
    assert!(!logs.contains("forwarded-42"));
}

#[tokio::test]
async fn test_memory_ceiling_enforced() {
    let executor = CodeExecutor::new(
        config()
            .with_memory_ceiling_bytes(8 * 1024 * 1024)
            .with_timeout_ms(5_000),
    );
    let result = executor
        .execute(
            "const chunks = []; while (true) { chunks.push(new Array(100000).fill(chunks.length)); }",
            &CapabilityTable::new(),
            None,
        )
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_mcp_envelope_unwrapped() {
    let capabilities = CapabilityTable::new()
        .with(definition(
            "search",
            capability_fn(|_| async {
                Ok(serde_json::to_value(
                    ToolCallResult::text("3 results").with_structured_content(json!({"count": 3})),
                )
                .unwrap())
            }),
        ))
        .unwrap()
        .with(definition(
            "summarize",
            capability_fn(|_| async {
                Ok(serde_json::to_value(ToolCallResult::text("short summary")).unwrap())
            }),
        ))
        .unwrap()
        .with(definition(
            "broken",
            capability_fn(|_| async {
                Ok(serde_json::to_value(
                    ToolCallResult::error("rate limited")
                        .with_structured_content(json!({"retryAfter": 30})),
                )
                .unwrap())
            }),
        ))
        .unwrap();

    let engine = SandboxEngine::new(config());
    let report = engine
        .run(
            r#"
            const found = await search();
            const summary = await summarize();
            let failure;
            try { await broken(); } catch (e) { failure = [e.message, e.data.retryAfter]; }
            return { count: found.count, summary, failure };
            "#,
            &capabilities,
        )
        .await;

    assert_eq!(
        report.outcome,
        InvocationOutcome::Completed(json!({
            "count": 3,
            "summary": "short summary",
            "failure": ["rate limited", 30]
        }))
    );
    assert!(report.trace[2].outcome.is_error());
}

#[tokio::test]
async fn test_envelope_adapter_can_be_disabled() {
    let capabilities = CapabilityTable::new()
        .with(definition(
            "summarize",
            capability_fn(|_| async {
                Ok(serde_json::to_value(ToolCallResult::text("short summary")).unwrap())
            }),
        ))
        .unwrap();

    let engine = SandboxEngine::new(config()).without_envelope_adapter();
    let report = engine
        .run("return (await summarize()).content[0].text;", &capabilities)
        .await;
    assert_eq!(
        report.outcome,
        InvocationOutcome::Completed(json!("short summary"))
    );
}

#[tokio::test]
async fn test_inspector_replaces_values() {
    let redact: Arc<dyn InspectionCallback> = Arc::new(|name: &str, value: &Value, _: &Value| {
        if name == "getUserLocation" {
            ResultSignal::proceed(json!("[redacted]"))
        } else {
            ResultSignal::proceed(value.clone())
        }
    });

    let executor = CodeExecutor::new(config()).with_inspector(redact);
    let text = executor
        .execute("return await getUserLocation();", &weather_capabilities(), None)
        .await
        .unwrap();
    assert_eq!(text, "Final result: \"[redacted]\"");
}

#[tokio::test]
async fn test_hardened_globals() {
    let executor = CodeExecutor::new(config());
    let text = executor
        .execute(
            r#""use strict";
            let reassigned = true;
            try { getUserLocation = () => "spoofed"; } catch (e) { reassigned = false; }
            return [
                reassigned,
                await getUserLocation(),
                typeof eval,
                (function () {}).constructor === undefined,
                Object.keys(globalThis).includes("__ergonRun"),
                typeof __ergonSettleCall,
                (() => { try { return Function("return 40 + 2")(); } catch (e) { return e.name; } })(),
            ];
            "#,
            &weather_capabilities(),
            None,
        )
        .await
        .unwrap();
    assert_eq!(
        text,
        "Final result: [false,\"Seattle\",\"undefined\",true,false,\"undefined\",\"EvalError\"]"
    );
}

#[tokio::test]
async fn test_independent_concurrent_invocations() {
    let executor = CodeExecutor::new(config());
    let capabilities = weather_capabilities();

    let (first, second) = tokio::join!(
        executor.execute(
            "globalThis.leak = 1; return await getUserLocation();",
            &capabilities,
            None
        ),
        executor.execute("return typeof globalThis.leak;", &capabilities, None),
    );
    assert_eq!(first.unwrap(), "Final result: \"Seattle\"");
    assert_eq!(second.unwrap(), "Final result: \"undefined\"");
}
