use std::borrow::Cow;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::{Registry, Unit};
use tokio::time::Instant;

use crate::{Error, metrics};

/// Metrics of one periodic reconciliation pass, labelled with the pass name.
#[derive(Clone)]
pub struct PassMetrics {
    pub runs: Counter,
    pub failures: Family<ErrorLabels, Counter>,
    pub duration: Histogram,
}

impl PassMetrics {
    pub fn new(pass: &str) -> Self {
        let runs = Counter::default();
        let failures = Family::<ErrorLabels, Counter>::default();
        let duration = Histogram::new([0.001, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0].into_iter());

        with_registry(|registry| {
            let registry = registry.sub_registry_with_label((
                Cow::Borrowed("pass"),
                Cow::Owned(pass.to_string()),
            ));
            registry.register_with_unit(
                "pass_duration",
                "reconciliation pass duration",
                Unit::Seconds,
                duration.clone(),
            );
            registry.register(
                "pass_failures",
                "Number of failed reconciliation passes and items",
                failures.clone(),
            );
            registry.register("pass_runs", "Number of reconciliation passes", runs.clone());
        });
        Self {
            runs,
            failures,
            duration,
        }
    }

    pub fn count_and_measure(&self) -> PassMeasurer {
        self.runs.inc();
        PassMeasurer {
            start: Instant::now(),
            metric: self.duration.clone(),
        }
    }

    pub fn count_failure(&self, e: &Error) {
        self.failures
            .get_or_create(&ErrorLabels {
                error: e.metric_label(),
            })
            .inc();
    }

    /// Failures of single items inside an otherwise completed pass.
    pub fn count_item_failures(&self, n: usize) {
        if n == 0 {
            return;
        }
        self.failures
            .get_or_create(&ErrorLabels {
                error: "item".into(),
            })
            .inc_by(n as u64);
    }
}

pub struct PassMeasurer {
    start: Instant,
    metric: Histogram,
}

impl Drop for PassMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric.observe(duration);
    }
}

/// Gauges describing the kernel state the agent owns, and ingestion counters.
#[derive(Clone, Default)]
pub struct StateMetrics {
    pub slots: Gauge,
    pub attached: Gauge,
    pub events: Family<EventLabels, Counter>,
}

impl StateMetrics {
    pub fn new() -> Self {
        let metrics = Self::default();
        with_registry(|registry| {
            registry.register(
                "policy_slots",
                "Populated slots of the cgroup policy table",
                metrics.slots.clone(),
            );
            registry.register(
                "attached_hooks",
                "Interfaces with the ingress hook attached",
                metrics.attached.clone(),
            );
            registry.register(
                "lifecycle_events",
                "Container lifecycle events received",
                metrics.events.clone(),
            );
        });
        metrics
    }

    pub fn count_event(&self, action: &str, status: &str) {
        self.events
            .get_or_create(&EventLabels {
                action: action.into(),
                status: status.into(),
            })
            .inc();
    }
}

fn with_registry(f: impl FnOnce(&mut Registry)) {
    let mut guard = match metrics::REGISTRY.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    f(&mut guard);
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub error: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EventLabels {
    pub action: String,
    pub status: String,
}
