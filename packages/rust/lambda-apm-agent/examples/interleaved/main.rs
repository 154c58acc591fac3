//! Two invocations driven concurrently on one agent. Each handler creates
//! spans directly and from a spawned task, and every span lands in the trace
//! of the invocation that caused it even while both run interleaved on the
//! same runtime.

use anyhow::Result;
use lambda_apm_agent::{
    init_agent, AgentConfig, BoxError, ContextFutureExt, ExecutionContextManager,
    InvocationRequest,
};
use serde_json::{json, Value};
use std::time::Duration;

async fn handle(label: &'static str, delay: Duration) -> Result<Value, BoxError> {
    let context = ExecutionContextManager::get();
    context.set_user_tag("invocation.label", label);

    // Spawned work leaves the task-local scope, so it carries the context
    // explicitly and rejoins the same trace.
    let enrichment = tokio::spawn(
        async move {
            let context = ExecutionContextManager::get();
            let span = context.tracer().start_span("enrich");
            tokio::time::sleep(delay).await;
            span.finish();
            context.trace_id()
        }
        .with_execution_context(context.clone()),
    );

    let span = context.tracer().start_span("persist");
    tokio::time::sleep(delay / 2).await;
    span.finish();

    let spawned_trace = enrichment.await?;
    println!(
        "[{label}] spawned span landed in trace {spawned_trace}, invocation owns {}",
        context.trace_id()
    );
    Ok(json!({"label": label, "trace": context.trace_id().to_string()}))
}

#[tokio::main]
async fn main() -> Result<()> {
    let agent = init_agent(
        AgentConfig::builder()
            .application_name("interleaved-demo".to_string())
            .report_stdout(true)
            .build(),
    )?;

    let fast = agent.invoke(
        InvocationRequest::builder()
            .function_name("fast-fn".to_string())
            .build(),
        |_completion| handle("fast", Duration::from_millis(20)),
    );
    let slow = agent.invoke(
        InvocationRequest::builder()
            .function_name("slow-fn".to_string())
            .build(),
        |_completion| handle("slow", Duration::from_millis(60)),
    );

    let (fast, slow) = tokio::join!(fast, slow);
    println!("fast: {}", fast?);
    println!("slow: {}", slow?);
    Ok(())
}
