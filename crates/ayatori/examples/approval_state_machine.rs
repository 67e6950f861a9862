//! Document approval state machine.
//!
//! Demonstrates:
//! - Guarded transitions loaded from JSON
//! - A run that waits for an external decision
//! - Steering the run with `update` from outside
//! - A revision loop back into an earlier state
//!
//! Run with `RUST_LOG=info cargo run --example approval_state_machine`.

use ayatori::prelude::*;
use serde_json::{json, Map, Value};
use std::time::Duration;

fn decision(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn review_machine() -> Result<StateMachine, ProcessError> {
    let transitions: Vec<Transition> = serde_json::from_value(json!([
        ["draft", "review"],
        ["review", "publish", { "decision": "approve" }],
        ["review", "revise", { "decision": "revise" }],
        ["review", "archive", { "decision": "reject" }],
        ["revise", "review"]
    ]))
    .map_err(|e| ProcessError::Configuration(e.to_string()))?;

    StateMachine::builder("document_review")
        .step(
            step("draft", |ctx, _props| async move {
                let title = ctx.arg(0).unwrap_or(json!("untitled"));
                println!("Drafting {}", title);
                Ok(json!({ "title": title, "version": 1 }))
            })
            .build()?,
        )
        .step(
            step("review", |ctx, _props| async move {
                let round = ctx
                    .result("review")
                    .and_then(|v| v["round"].as_i64())
                    .unwrap_or(0)
                    + 1;
                println!("Review round {} waiting for a decision", round);
                // Each round needs a fresh decision.
                let mut cleared = Map::new();
                cleared.insert("decision".into(), Value::Null);
                ctx.update(cleared);
                Ok(json!({ "round": round }))
            })
            .build()?,
        )
        .step(
            step("revise", |ctx, _props| async move {
                let version = ctx
                    .result("revise")
                    .or_else(|| ctx.result("draft"))
                    .and_then(|v| v["version"].as_i64())
                    .unwrap_or(1);
                println!("Revising to version {}", version + 1);
                Ok(json!({ "version": version + 1 }))
            })
            .build()?,
        )
        .step(
            step("publish", |_ctx, _props| async {
                println!("Published");
                Ok(json!("published"))
            })
            .build()?,
        )
        .step(
            step("archive", |_ctx, _props| async {
                println!("Archived");
                Ok(json!("archived"))
            })
            .build()?,
        )
        .transitions(transitions)
        .build()
}

async fn wait_for_review(handle: &ExecutionHandle, round: i64) {
    while handle
        .context()
        .result("review")
        .and_then(|v| v["round"].as_i64())
        != Some(round)
        || handle.context().running().iter().any(|s| s == "review")
    {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::main]
async fn main() -> Result<(), ProcessError> {
    tracing_subscriber::fmt::init();

    let machine = review_machine()?;
    let handle = machine.dispatch(None, Map::new(), vec![json!("Release notes")]);

    wait_for_review(&handle, 1).await;
    println!("Reviewer asks for changes");
    handle.update(decision(json!({ "decision": "revise" })));

    wait_for_review(&handle, 2).await;
    println!("Reviewer approves");
    handle.update(decision(json!({ "decision": "approve" })));

    let results = handle.await?;
    println!("Final state: {}", results.get("publish").unwrap_or(&Value::Null));
    if let Some(review) = results.get("review") {
        println!("Review rounds: {}", review["round"]);
    }

    Ok(())
}
