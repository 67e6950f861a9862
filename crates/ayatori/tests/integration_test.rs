use async_trait::async_trait;
use ayatori::prelude::*;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Barrier;

type Log = Arc<Mutex<Vec<String>>>;

fn record(log: &Log, entry: impl Into<String>) {
    log.lock().expect("log lock").push(entry.into());
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().expect("log lock").clone()
}

fn data(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// A step that logs its execution and every terminal hook.
fn traced(name: &'static str, log: &Log) -> StepBuilder {
    let exec_log = log.clone();
    let rollback_log = log.clone();
    let success_log = log.clone();
    let failure_log = log.clone();
    step(name, move |_ctx, _props| {
        let log = exec_log.clone();
        async move {
            record(&log, format!("execute:{}", name));
            Ok(json!(name))
        }
    })
    .rollback(move |_ctx, _props, _error| {
        let log = rollback_log.clone();
        async move {
            record(&log, format!("rollback:{}", name));
            Ok(())
        }
    })
    .success(move |_ctx, _props| {
        let log = success_log.clone();
        async move {
            record(&log, format!("success:{}", name));
            Ok(())
        }
    })
    .failure(move |_ctx, _props, _error| {
        let log = failure_log.clone();
        async move {
            record(&log, format!("failure:{}", name));
            Ok(())
        }
    })
}

async fn wait_until(handle: &ExecutionHandle, check: impl Fn(&Context) -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check(handle.context()) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

#[tokio::test]
async fn test_empty_workflow_resolves_to_empty_results() {
    let workflow = Workflow::builder("empty").build().expect("valid workflow");

    let results = workflow.dispatch(vec![]).await.expect("workflow succeeds");

    assert!(results.is_empty());
}

#[tokio::test]
async fn test_dependencies_run_in_series() {
    let log: Log = Arc::default();
    let workflow = Workflow::builder("series")
        .step(traced("a", &log).build().expect("valid step"))
        .step(traced("b", &log).build().expect("valid step"))
        .step(
            step("c", |ctx, _props| async move {
                let b = ctx.result("b").unwrap_or_default();
                Ok(json!({ "after": b }))
            })
            .build()
            .expect("valid step"),
        )
        .depends_on("b", ["a"])
        .depends_on("c", ["b"])
        .build()
        .expect("valid workflow");

    let results = workflow.dispatch(vec![]).await.expect("workflow succeeds");

    assert_eq!(
        entries(&log)
            .into_iter()
            .filter(|e| e.starts_with("execute:"))
            .collect::<Vec<_>>(),
        vec!["execute:a", "execute:b"]
    );
    assert_eq!(results.get("c"), Some(&json!({ "after": "b" })));
    assert_eq!(results.len(), 3);
}

#[tokio::test]
async fn test_independent_steps_run_concurrently() {
    // Both steps must be in flight at once to get past the barrier.
    let barrier = Arc::new(Barrier::new(2));
    let starts: Arc<Mutex<Vec<Instant>>> = Arc::default();

    let meeting = |name: &'static str| {
        let barrier = barrier.clone();
        let starts = starts.clone();
        step(name, move |_ctx, _props| {
            let barrier = barrier.clone();
            let starts = starts.clone();
            async move {
                starts.lock().expect("starts lock").push(Instant::now());
                barrier.wait().await;
                Ok(json!(name))
            }
        })
        .build()
        .expect("valid step")
    };

    let workflow = Workflow::builder("parallel")
        .step(meeting("left"))
        .step(meeting("right"))
        .build()
        .expect("valid workflow");

    let results = tokio::time::timeout(Duration::from_secs(2), workflow.dispatch(vec![]))
        .await
        .expect("parallel steps met at the barrier")
        .expect("workflow succeeds");

    assert_eq!(results.len(), 2);
    let starts = starts.lock().expect("starts lock").clone();
    assert_eq!(starts.len(), 2);
    let spread = if starts[0] > starts[1] {
        starts[0] - starts[1]
    } else {
        starts[1] - starts[0]
    };
    assert!(spread < Duration::from_millis(50), "spread was {:?}", spread);
}

#[tokio::test]
async fn test_step_waits_for_every_prerequisite() {
    let workflow = Workflow::builder("diamond")
        .step(
            step("slow", |_ctx, _props| async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(json!(1))
            })
            .build()
            .expect("valid step"),
        )
        .step(step("fast", |_ctx, _props| async { Ok(json!(2)) }).build().expect("valid step"))
        .step(
            step("sum", |ctx, _props| async move {
                let slow = ctx.result("slow").and_then(|v| v.as_i64());
                let fast = ctx.result("fast").and_then(|v| v.as_i64());
                match (slow, fast) {
                    (Some(a), Some(b)) => Ok(json!(a + b)),
                    _ => Err(StepError::new("prerequisite missing")),
                }
            })
            .build()
            .expect("valid step"),
        )
        .depends_on("sum", ["slow", "fast"])
        .build()
        .expect("valid workflow");

    let results = workflow.dispatch(vec![]).await.expect("workflow succeeds");

    assert_eq!(results.get("sum"), Some(&json!(3)));
}

#[tokio::test]
async fn test_args_reach_every_step() {
    let workflow = Workflow::builder("args")
        .step(
            step("greet", |ctx, _props| async move {
                let who = ctx.arg(0).unwrap_or(json!("nobody"));
                Ok(json!(format!("hello {}", who.as_str().unwrap_or_default())))
            })
            .build()
            .expect("valid step"),
        )
        .build()
        .expect("valid workflow");

    let results = workflow
        .dispatch(vec![json!("ayatori")])
        .await
        .expect("workflow succeeds");

    assert_eq!(results.get("greet"), Some(&json!("hello ayatori")));
}

#[tokio::test]
async fn test_retry_converges() {
    let inits = Arc::new(AtomicU32::new(0));
    let init_count = inits.clone();

    let flaky = step("flaky", |_ctx, props| async move {
        let attempt = props.increment("attempts");
        if attempt < 3 {
            Err(StepError::new(format!("attempt {} failed", attempt)))
        } else {
            Ok(json!(format!("attempt {}", attempt)))
        }
    })
    .init(move |_ctx, _props| {
        let inits = init_count.clone();
        async move {
            inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
    .retry(|_ctx, _props, _error| async { Ok(()) })
    .build()
    .expect("valid step");

    let workflow = Workflow::builder("retry")
        .step(flaky)
        .build()
        .expect("valid workflow");

    let results = workflow.dispatch(vec![]).await.expect("workflow succeeds");

    assert_eq!(results.get("flaky"), Some(&json!("attempt 3")));
    assert_eq!(inits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_retry_policy_bounds_attempts() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();

    let workflow = Workflow::builder("bounded")
        .step(
            step("never", move |_ctx, _props| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(StepError::new("still broken"))
                }
            })
            .retry_policy(RetryPolicy::fixed(2, Duration::from_millis(1)))
            .build()
            .expect("valid step"),
        )
        .build()
        .expect("valid workflow");

    let error = workflow
        .dispatch(vec![])
        .await
        .expect_err("retries are exhausted");

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(error.message(), "still broken");
}

#[tokio::test]
async fn test_timeout_fails_the_attempt() {
    let workflow = Workflow::builder("timeout")
        .step(
            step("hang", |_ctx, _props| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(Value::Null)
            })
            .timeout(Duration::from_millis(20))
            .build()
            .expect("valid step"),
        )
        .build()
        .expect("valid workflow");

    let error = workflow
        .dispatch(vec![])
        .await
        .expect_err("attempt times out");

    assert_eq!(error.message(), "Step 'hang' timed out");
    assert_eq!(error.get("timeout_ms"), Some(&json!(20)));
}

#[tokio::test]
async fn test_rollback_covers_started_steps_only() {
    let log: Log = Arc::default();
    let failing_log = log.clone();

    let workflow = Workflow::builder("rollback")
        .step(traced("a", &log).build().expect("valid step"))
        .step(
            traced("b", &log)
                .execute(move |_ctx, _props| {
                    let log = failing_log.clone();
                    async move {
                        record(&log, "execute:b");
                        Err(StepError::new("b broke").with("code", json!(42)))
                    }
                })
                .build()
                .expect("valid step"),
        )
        .step(traced("c", &log).build().expect("valid step"))
        .depends_on("b", ["a"])
        .depends_on("c", ["b"])
        .build()
        .expect("valid workflow");

    let error = workflow
        .dispatch(vec![])
        .await
        .expect_err("workflow fails");

    match &error {
        ProcessError::StepFailed {
            process,
            step,
            running,
            completed,
            error,
        } => {
            assert_eq!(process, "rollback");
            assert_eq!(step, "b");
            assert_eq!(running, &vec![StepName::from("b")]);
            assert_eq!(completed, &vec![StepName::from("a")]);
            assert_eq!(error.get("code"), Some(&json!(42)));
        }
        other => panic!("unexpected error: {:?}", other),
    }

    let log = entries(&log);
    assert!(log.contains(&"rollback:a".to_string()));
    assert!(log.contains(&"rollback:b".to_string()));
    assert!(!log.contains(&"rollback:c".to_string()));
    assert!(!log.contains(&"execute:c".to_string()));
    for name in ["a", "b", "c"] {
        assert!(log.contains(&format!("failure:{}", name)));
        assert!(!log.contains(&format!("success:{}", name)));
    }
}

#[tokio::test]
async fn test_hook_errors_do_not_change_the_outcome() {
    let workflow = Workflow::builder("noisy")
        .step(
            step("a", |_ctx, _props| async { Ok(json!("done")) })
                .success(|_ctx, _props| async { Err(StepError::new("success hook broke")) })
                .build()
                .expect("valid step"),
        )
        .step(
            step("b", |_ctx, _props| async { Err(StepError::new("b broke")) })
                .rollback(|_ctx, _props, _error| async { Err(StepError::new("rollback broke")) })
                .build()
                .expect("valid step"),
        )
        .depends_on("b", ["a"])
        .build()
        .expect("valid workflow");

    let error = workflow
        .dispatch(vec![])
        .await
        .expect_err("workflow fails");
    assert_eq!(error.message(), "b broke");

    let succeeding = Workflow::builder("noisy-success")
        .step(
            step("a", |_ctx, _props| async { Ok(json!("done")) })
                .success(|_ctx, _props| async { Err(StepError::new("success hook broke")) })
                .build()
                .expect("valid step"),
        )
        .build()
        .expect("valid workflow");
    let results = succeeding.dispatch(vec![]).await.expect("workflow succeeds");
    assert_eq!(results.get("a"), Some(&json!("done")));
}

#[tokio::test]
async fn test_success_hooks_run_on_every_step() {
    let log: Log = Arc::default();
    let workflow = Workflow::builder("success")
        .step(traced("a", &log).build().expect("valid step"))
        .step(traced("b", &log).build().expect("valid step"))
        .depends_on("b", ["a"])
        .build()
        .expect("valid workflow");

    workflow.dispatch(vec![]).await.expect("workflow succeeds");

    let log = entries(&log);
    assert!(log.contains(&"success:a".to_string()));
    assert!(log.contains(&"success:b".to_string()));
    assert!(!log.iter().any(|e| e.starts_with("failure:") || e.starts_with("rollback:")));
}

#[tokio::test]
async fn test_cancel_rejects_with_caller_data() {
    let later = Arc::new(AtomicU32::new(0));
    let later_count = later.clone();

    let workflow = Workflow::builder("cancel")
        .step(
            step("slow", |_ctx, _props| async {
                tokio::time::sleep(Duration::from_millis(40)).await;
                Ok(json!("slow"))
            })
            .build()
            .expect("valid step"),
        )
        .step(
            step("later", move |_ctx, _props| {
                let later = later_count.clone();
                async move {
                    later.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            })
            .build()
            .expect("valid step"),
        )
        .depends_on("later", ["slow"])
        .build()
        .expect("valid workflow");

    let handle = workflow.dispatch(vec![]);
    wait_until(&handle, |ctx| !ctx.started().is_empty()).await;
    handle.cancel(data(json!({ "key": "value" })));

    let error = handle.await.expect_err("run is cancelled");

    assert!(error.is_cancelled());
    assert_eq!(error.message(), "Process cancelled.");
    assert_eq!(error.get("key"), Some(&json!("value")));
    assert_eq!(error.severity(), Severity::Recoverable);
    assert_eq!(error.running(), &[StepName::from("slow")]);
    assert!(error.completed().is_empty());

    // The in-flight step finishes on its own, but nothing new starts.
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(later.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancel_severity_can_be_overridden() {
    let workflow = Workflow::builder("fatal-cancel")
        .step(
            step("wait", |_ctx, _props| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(Value::Null)
            })
            .build()
            .expect("valid step"),
        )
        .build()
        .expect("valid workflow");

    let handle = workflow.dispatch(vec![]);
    handle.cancel(data(json!({ "severity": "fatal" })));

    let error = handle.await.expect_err("run is cancelled");
    assert_eq!(error.severity(), Severity::Fatal);
}

#[tokio::test]
async fn test_step_can_cancel_its_own_run() {
    let workflow = Workflow::builder("self-cancel")
        .step(
            step("abort", |ctx, _props| async move {
                ctx.cancel(Map::new());
                Ok(Value::Null)
            })
            .build()
            .expect("valid step"),
        )
        .build()
        .expect("valid workflow");

    let error = workflow
        .dispatch(vec![])
        .await
        .expect_err("run is cancelled");

    assert!(error.is_cancelled());
    assert_eq!(error.running(), &[StepName::from("abort")]);
}

#[tokio::test]
async fn test_stop_from_step_keeps_partial_results() {
    let log: Log = Arc::default();
    let workflow = Workflow::builder("stop")
        .step(
            step("first", |ctx, _props| async move {
                ctx.stop();
                Ok(json!("first"))
            })
            .build()
            .expect("valid step"),
        )
        .step(traced("second", &log).build().expect("valid step"))
        .depends_on("second", ["first"])
        .build()
        .expect("valid workflow");

    let results = workflow.dispatch(vec![]).await.expect("stop succeeds");

    assert_eq!(results.get("first"), Some(&json!("first")));
    assert!(!results.contains_key("second"));
    assert!(!entries(&log).contains(&"execute:second".to_string()));
    assert!(entries(&log).contains(&"success:second".to_string()));
}

#[tokio::test]
async fn test_stop_keeps_result_of_stopping_branch() {
    let log: Log = Arc::default();
    let workflow = Workflow::builder("parallel-stop")
        .step(
            step("stopper", |ctx, _props| async move {
                ctx.stop();
                tokio::time::sleep(Duration::from_millis(60)).await;
                Ok(json!("stopper"))
            })
            .build()
            .expect("valid step"),
        )
        .step(
            step("quick", |_ctx, _props| async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(json!("quick"))
            })
            .build()
            .expect("valid step"),
        )
        .step(traced("after", &log).build().expect("valid step"))
        .depends_on("after", ["quick"])
        .build()
        .expect("valid workflow");

    let results = workflow.dispatch(vec![]).await.expect("stop succeeds");

    assert_eq!(results.get("stopper"), Some(&json!("stopper")));
    assert_eq!(results.get("quick"), Some(&json!("quick")));
    assert!(!results.contains_key("after"));
    assert!(!entries(&log).contains(&"execute:after".to_string()));
}

#[tokio::test]
async fn test_step_context_names_its_step() {
    let workflow = Workflow::builder("scoped")
        .step(
            step("a", |ctx, _props| async move {
                Ok(json!(ctx.step().map(|s| s.to_string())))
            })
            .build()
            .expect("valid step"),
        )
        .build()
        .expect("valid workflow");

    let handle = workflow.dispatch(vec![]);
    assert_eq!(handle.context().step(), None);

    let results = handle.await.expect("workflow succeeds");
    assert_eq!(results.get("a"), Some(&json!("a")));
}

#[tokio::test]
async fn test_external_stop_waits_for_the_step_in_flight() {
    let workflow = Workflow::builder("external-stop")
        .step(
            step("slow", |_ctx, _props| async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(json!("slow"))
            })
            .build()
            .expect("valid step"),
        )
        .step(step("next", |_ctx, _props| async { Ok(json!("next")) }).build().expect("valid step"))
        .depends_on("next", ["slow"])
        .build()
        .expect("valid workflow");

    let handle = workflow.dispatch(vec![]);
    wait_until(&handle, |ctx| !ctx.started().is_empty()).await;
    handle.stop();

    let results = handle.await.expect("stop succeeds");
    assert_eq!(results.get("slow"), Some(&json!("slow")));
    assert!(!results.contains_key("next"));
}

#[tokio::test]
async fn test_dispatcher_runs_independent_instances() {
    let workflow = Workflow::builder("counter")
        .step(
            step("count", |_ctx, props| async move { Ok(json!(props.increment("runs"))) })
                .build()
                .expect("valid step"),
        )
        .build()
        .expect("valid workflow");
    let dispatch = workflow.dispatcher();

    let first = dispatch(vec![]).await.expect("first run succeeds");
    let second = dispatch(vec![]).await.expect("second run succeeds");

    // Properties are reset at the start of every run.
    assert_eq!(first.get("count"), Some(&json!(1)));
    assert_eq!(second.get("count"), Some(&json!(1)));
}

#[derive(Debug, Default)]
struct Flaky {
    inits: AtomicU32,
    attempts: AtomicU32,
    rollbacks: AtomicU32,
    fail_times: u32,
}

#[async_trait]
impl Step for Flaky {
    fn name(&self) -> StepName {
        StepName::new("flaky")
    }

    async fn init(&self, _ctx: &Context) -> Result<(), StepError> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        self.attempts.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn execute(&self, _ctx: &Context) -> Result<Value, StepError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.fail_times {
            return Err(StepError::new(format!("attempt {} failed", attempt)));
        }
        Ok(json!(attempt))
    }

    async fn retry(&self, _ctx: &Context, error: StepError) -> Result<(), StepError> {
        if self.attempts.load(Ordering::SeqCst) < 5 {
            Ok(())
        } else {
            Err(error)
        }
    }

    async fn rollback(&self, _ctx: &Context, _error: &ProcessError) -> Result<(), StepError> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_step_trait_implementation() {
    let flaky = Arc::new(Flaky {
        fail_times: 2,
        ..Flaky::default()
    });
    let workflow = Workflow::builder("trait")
        .shared_step(flaky.clone())
        .build()
        .expect("valid workflow");

    let results = workflow.dispatch(vec![]).await.expect("first run succeeds");
    assert_eq!(results.get("flaky"), Some(&json!(3)));

    let results = workflow.dispatch(vec![]).await.expect("second run succeeds");
    assert_eq!(results.get("flaky"), Some(&json!(3)));

    assert_eq!(flaky.inits.load(Ordering::SeqCst), 2);
    assert_eq!(flaky.rollbacks.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_step_trait_gives_up() {
    let flaky = Arc::new(Flaky {
        fail_times: 10,
        ..Flaky::default()
    });
    let workflow = Workflow::builder("trait-failure")
        .shared_step(flaky.clone())
        .build()
        .expect("valid workflow");

    let error = workflow
        .dispatch(vec![])
        .await
        .expect_err("retries give up");

    assert_eq!(error.message(), "attempt 5 failed");
    assert_eq!(flaky.attempts.load(Ordering::SeqCst), 5);
    assert_eq!(flaky.rollbacks.load(Ordering::SeqCst), 1);
}

#[test]
fn test_invalid_dependencies_are_rejected() {
    let result = Workflow::builder("invalid")
        .step(step("a", |_ctx, _props| async { Ok(Value::Null) }).build().expect("valid step"))
        .depends_on("a", ["ghost"])
        .build();

    assert!(matches!(result, Err(ProcessError::Configuration(_))));
}
