//! Metric plugin: process stats and per-operation span usage.
//!
//! `before_invocation` snapshots the process CPU counters so the report can
//! carry per-invocation deltas rather than process lifetime totals.
//! `after_invocation` queues one [`StatData`] report with the CPU/RSS
//! figures (read from procfs; omitted on platforms without it) and one
//! [`SpanUsage`] row per distinct `(class_name, operation_name)` pair, in
//! first-finish order. Only finished spans count toward usage.
//!
//! When `metric_sample_count_freq` is configured, a
//! [`CountAwareSampler`] gates the report to every Nth invocation.

use crate::config::AgentConfig;
use crate::context::ExecutionContext;
use crate::error::AgentError;
use crate::plugin::Plugin;
use crate::report::{ProcessStats, Report, ReportData, SpanUsage, StatData};
use crate::sampler::{CountAwareSampler, Sampler};
use crate::span::epoch_millis_now;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

const PAGE_SIZE_BYTES: u64 = 4096;
// USER_HZ is 100 on the kernels we run on, so one tick is 10ms.
const TICK_MS: u64 = 10;

#[derive(Debug, Clone, Copy)]
struct CpuSnapshot {
    user_ms: u64,
    system_ms: u64,
}

fn read_cpu_snapshot() -> Option<CpuSnapshot> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    // The comm field may contain spaces, so index from after its closing
    // paren: utime and stime are then the 12th and 13th fields.
    let after_comm = stat.rsplit(')').next()?;
    let mut fields = after_comm.split_whitespace();
    let utime: u64 = fields.nth(11)?.parse().ok()?;
    let stime: u64 = fields.next()?.parse().ok()?;
    Some(CpuSnapshot {
        user_ms: utime * TICK_MS,
        system_ms: stime * TICK_MS,
    })
}

fn read_rss_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * PAGE_SIZE_BYTES)
}

pub struct MetricPlugin {
    api_key: String,
    sampler: Option<Box<dyn Sampler>>,
    cpu_baselines: Mutex<HashMap<Uuid, CpuSnapshot>>,
}

impl MetricPlugin {
    pub fn new(config: &AgentConfig) -> Self {
        let sampler = config
            .metric_sample_count_freq
            .map(|freq| Box::new(CountAwareSampler::new(freq)) as Box<dyn Sampler>);
        Self {
            api_key: config.api_key.clone(),
            sampler,
            cpu_baselines: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the count-based gate with a custom sampler.
    pub fn with_sampler(config: &AgentConfig, sampler: Box<dyn Sampler>) -> Self {
        Self {
            sampler: Some(sampler),
            ..Self::new(config)
        }
    }

    /// CPU deltas against the before-hook baseline. Without a baseline (no
    /// procfs, or the before hook never ran) the section is omitted.
    fn process_stats(&self, transaction_id: Uuid) -> Option<ProcessStats> {
        let baseline = self
            .cpu_baselines
            .lock()
            .ok()
            .and_then(|mut baselines| baselines.remove(&transaction_id))?;
        let now = read_cpu_snapshot()?;
        let rss_bytes = read_rss_bytes()?;
        Some(ProcessStats {
            rss_bytes,
            cpu_user_ms: now.user_ms.saturating_sub(baseline.user_ms),
            cpu_system_ms: now.system_ms.saturating_sub(baseline.system_ms),
        })
    }
}

fn span_usages(context: &ExecutionContext) -> Vec<SpanUsage> {
    let mut usages: IndexMap<(String, String), SpanUsage> = IndexMap::new();
    for span in context.tracer().recorder().span_list() {
        let key = (
            span.class_name().to_string(),
            span.operation_name().to_string(),
        );
        let usage = usages.entry(key).or_insert_with(|| SpanUsage {
            class_name: span.class_name().to_string(),
            operation_name: span.operation_name().to_string(),
            count: 0,
            error_count: 0,
            total_duration_ms: 0,
        });
        usage.count += 1;
        if span.is_erroneous() {
            usage.error_count += 1;
        }
        usage.total_duration_ms += span.duration().unwrap_or(0);
    }
    usages.into_values().collect()
}

impl std::fmt::Debug for MetricPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricPlugin")
            .field("sampled", &self.sampler.is_some())
            .finish()
    }
}

#[async_trait]
impl Plugin for MetricPlugin {
    fn name(&self) -> &'static str {
        "metric"
    }

    async fn before_invocation(&self, context: &Arc<ExecutionContext>) -> Result<(), AgentError> {
        if let Some(snapshot) = read_cpu_snapshot() {
            if let Ok(mut baselines) = self.cpu_baselines.lock() {
                baselines.insert(context.transaction_id(), snapshot);
            }
        }
        Ok(())
    }

    async fn after_invocation(&self, context: &Arc<ExecutionContext>) -> Result<(), AgentError> {
        // The baseline is removed even when sampling skips the report, so
        // unsampled invocations cannot grow the map.
        let process_stats = self.process_stats(context.transaction_id());

        if let Some(sampler) = &self.sampler {
            if !sampler.should_sample(context) {
                return Ok(());
            }
        }

        let data = StatData {
            trace_id: context.trace_id(),
            transaction_id: context.transaction_id(),
            stat_timestamp: epoch_millis_now(),
            process_stats,
            span_usages: span_usages(context),
        };
        context.add_report(Report::new(ReportData::Stat(data), &self.api_key));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::InvocationRequest;
    use crate::listener::SpanListenerRegistry;
    use crate::tracer::SpanOptions;
    use std::time::Duration;

    fn fresh_context() -> Arc<ExecutionContext> {
        ExecutionContext::new(
            Arc::new(SpanListenerRegistry::new()),
            InvocationRequest::default(),
            Duration::from_millis(200),
            false,
        )
    }

    #[tokio::test]
    async fn test_span_usage_aggregation() {
        let plugin = MetricPlugin::new(&AgentConfig::default());
        let context = fresh_context();

        plugin.before_invocation(&context).await.unwrap();

        let query_options = || SpanOptions::builder().class_name("DB".to_string()).build();
        let first = context.tracer().start_span_with("query", query_options());
        first.finish_at(first.start_time() + 10);
        let second = context.tracer().start_span_with("query", query_options());
        second.set_error_tags("Error", "duplicate key");
        second.finish_at(second.start_time() + 30);
        let other = context.tracer().start_span("render");
        other.finish();

        plugin.after_invocation(&context).await.unwrap();

        let reports = context.take_reports();
        assert_eq!(reports.len(), 1);
        let ReportData::Stat(data) = &reports[0].data else {
            panic!("expected stat data");
        };
        assert_eq!(data.span_usages.len(), 2);
        let query = &data.span_usages[0];
        assert_eq!(query.class_name, "DB");
        assert_eq!(query.operation_name, "query");
        assert_eq!(query.count, 2);
        assert_eq!(query.error_count, 1);
        assert_eq!(query.total_duration_ms, 40);
        assert_eq!(data.span_usages[1].operation_name, "render");
    }

    #[tokio::test]
    async fn test_unfinished_spans_do_not_count() {
        let plugin = MetricPlugin::new(&AgentConfig::default());
        let context = fresh_context();

        let _open = context.tracer().start_span("stuck");
        plugin.after_invocation(&context).await.unwrap();

        let reports = context.take_reports();
        let ReportData::Stat(data) = &reports[0].data else {
            panic!("expected stat data");
        };
        assert!(data.span_usages.is_empty());
    }

    #[tokio::test]
    async fn test_sample_count_freq_gates_reports() {
        let config = AgentConfig::builder().metric_sample_count_freq(2).build();
        let plugin = MetricPlugin::new(&config);

        for expected_reports in [1usize, 0, 1, 0] {
            let context = fresh_context();
            plugin.before_invocation(&context).await.unwrap();
            plugin.after_invocation(&context).await.unwrap();
            assert_eq!(context.take_reports().len(), expected_reports);
        }
    }

    #[tokio::test]
    async fn test_baselines_do_not_accumulate() {
        let plugin = MetricPlugin::new(&AgentConfig::default());

        for _ in 0..3 {
            let context = fresh_context();
            plugin.before_invocation(&context).await.unwrap();
            plugin.after_invocation(&context).await.unwrap();
        }

        assert!(plugin.cpu_baselines.lock().unwrap().is_empty());
    }
}
