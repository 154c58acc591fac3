//! Minimal agent usage: one successful invocation with nested spans, user
//! tags, and a captured log, then one failing invocation. Reports are written
//! to stdout as NDJSON so the full payloads are visible without a collector.

use anyhow::Result;
use lambda_apm_agent::{init_agent, AgentConfig, ExecutionContextManager, InvocationRequest};
use serde_json::{json, Value};
use std::time::Duration;

/// Nested operation that joins the invocation's trace through the ambient
/// context, without any parameter passing.
async fn lookup_inventory(sku: &str) -> Value {
    let context = ExecutionContextManager::get();
    let span = context.tracer().start_span("inventory-lookup");
    span.set_tag("sku", sku);

    tokio::time::sleep(Duration::from_millis(25)).await;

    span.finish();
    json!({"sku": sku, "inStock": true})
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AgentConfig::builder()
        .application_name("orders-demo".to_string())
        .application_stage("dev".to_string())
        .report_stdout(true)
        .build();
    let agent = init_agent(config)?;

    let response = agent
        .invoke(
            InvocationRequest::builder()
                .function_name("orders-fn".to_string())
                .request_id("req-demo-1".to_string())
                .remaining_time(Duration::from_secs(30))
                .build(),
            |_completion| async {
                let context = ExecutionContextManager::get();
                context.set_user_tag("order.id", 42);
                context.capture_log("INFO", "orders", "processing order 42");

                let inventory = lookup_inventory("sku-123").await;
                Ok(json!({"order": 42, "inventory": inventory}))
            },
        )
        .await?;
    println!("order handled: {response}");

    let failed = agent
        .invoke(
            InvocationRequest::builder()
                .function_name("orders-fn".to_string())
                .request_id("req-demo-2".to_string())
                .build(),
            |_completion| async { Err("payment gateway unreachable".into()) },
        )
        .await;
    println!("second invocation failed as expected: {}", failed.is_err());

    Ok(())
}
