//! Report samplers.
//!
//! A [`Sampler`] decides once per invocation whether a plugin should emit
//! its report. The metric plugin uses [`CountAwareSampler`] when
//! `metric_sample_count_freq` is configured; the log plugin takes one
//! through [`LogPlugin::with_sampler`](crate::log::LogPlugin::with_sampler).

use crate::context::ExecutionContext;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Per-invocation sampling decision.
pub trait Sampler: Send + Sync {
    fn should_sample(&self, context: &ExecutionContext) -> bool;
}

/// Samples every Nth call.
///
/// The first call is always sampled so a cold function reports immediately.
#[derive(Debug)]
pub struct CountAwareSampler {
    freq: u64,
    counter: AtomicU64,
}

impl CountAwareSampler {
    pub fn new(freq: u64) -> Self {
        Self {
            freq: freq.max(1),
            counter: AtomicU64::new(0),
        }
    }
}

impl Sampler for CountAwareSampler {
    fn should_sample(&self, _context: &ExecutionContext) -> bool {
        self.counter.fetch_add(1, Ordering::Relaxed) % self.freq == 0
    }
}

/// Samples at most once per period.
#[derive(Debug)]
pub struct TimeAwareSampler {
    period: Duration,
    last_sampled: Mutex<Option<Instant>>,
}

impl TimeAwareSampler {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last_sampled: Mutex::new(None),
        }
    }
}

impl Sampler for TimeAwareSampler {
    fn should_sample(&self, _context: &ExecutionContext) -> bool {
        let Ok(mut last) = self.last_sampled.lock() else {
            return true;
        };
        match *last {
            Some(at) if at.elapsed() < self.period => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }
}

/// Samples only invocations that ended with an error.
#[derive(Debug, Default)]
pub struct ErrorAwareSampler;

impl ErrorAwareSampler {
    pub fn new() -> Self {
        Self
    }
}

impl Sampler for ErrorAwareSampler {
    fn should_sample(&self, context: &ExecutionContext) -> bool {
        context.error().is_some()
    }
}

/// How a [`CompositeSampler`] combines its members.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeOperator {
    Any,
    All,
}

/// Combines samplers with AND/OR semantics.
///
/// Every member is consulted on every call, even after the outcome is
/// decided, so stateful members keep counting.
pub struct CompositeSampler {
    samplers: Vec<Box<dyn Sampler>>,
    operator: CompositeOperator,
}

impl CompositeSampler {
    pub fn new(samplers: Vec<Box<dyn Sampler>>, operator: CompositeOperator) -> Self {
        Self { samplers, operator }
    }
}

impl Sampler for CompositeSampler {
    fn should_sample(&self, context: &ExecutionContext) -> bool {
        let votes: Vec<bool> = self
            .samplers
            .iter()
            .map(|sampler| sampler.should_sample(context))
            .collect();
        match self.operator {
            CompositeOperator::Any => votes.iter().any(|&v| v),
            CompositeOperator::All => !votes.is_empty() && votes.iter().all(|&v| v),
        }
    }
}

impl std::fmt::Debug for CompositeSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeSampler")
            .field("samplers", &self.samplers.len())
            .field("operator", &self.operator)
            .finish()
    }
}
