use burn::train::renderer::{MetricState, MetricsRenderer, TrainingProgress};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Forwards learner progress to `tracing` instead of drawing a terminal dashboard.
pub(crate) struct TracingRenderer {
    phase: &'static str,
    train: BTreeMap<String, String>,
    valid: BTreeMap<String, String>,
    log_every: usize,
}

impl TracingRenderer {
    pub(crate) fn new(phase: &'static str) -> Self {
        Self {
            phase,
            train: BTreeMap::new(),
            valid: BTreeMap::new(),
            log_every: 50,
        }
    }
}

fn record(metrics: &mut BTreeMap<String, String>, state: MetricState) {
    let entry = match state {
        MetricState::Generic(entry) => entry,
        MetricState::Numeric(entry, _) => entry,
    };
    metrics.insert(entry.name, entry.formatted);
}

fn summary(metrics: &BTreeMap<String, String>) -> String {
    metrics
        .iter()
        .map(|(name, value)| format!("{name}: {value}"))
        .collect::<Vec<_>>()
        .join(" | ")
}

fn epoch_done(item: &TrainingProgress) -> bool {
    item.progress.items_processed >= item.progress.items_total
}

impl MetricsRenderer for TracingRenderer {
    fn update_train(&mut self, state: MetricState) {
        record(&mut self.train, state);
    }

    fn update_valid(&mut self, state: MetricState) {
        record(&mut self.valid, state);
    }

    fn render_train(&mut self, item: TrainingProgress) {
        if epoch_done(&item) {
            info!(
                phase = self.phase,
                "train epoch {}/{}: {}",
                item.epoch,
                item.epoch_total,
                summary(&self.train)
            );
        } else if item.iteration % self.log_every == 0 {
            debug!(
                phase = self.phase,
                "train epoch {}/{} iteration {} ({}/{}): {}",
                item.epoch,
                item.epoch_total,
                item.iteration,
                item.progress.items_processed,
                item.progress.items_total,
                summary(&self.train)
            );
        }
    }

    fn render_valid(&mut self, item: TrainingProgress) {
        if epoch_done(&item) {
            info!(
                phase = self.phase,
                "valid epoch {}/{}: {}",
                item.epoch,
                item.epoch_total,
                summary(&self.valid)
            );
        }
    }
}
