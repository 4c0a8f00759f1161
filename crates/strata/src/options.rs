// RuntimeOptions — Knobs that apply to a whole pipeline

/// Runtime options for a `Pipeline`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeOptions {
    /// Training mode (affects batch_norm statistics).
    pub training: bool,
    /// Log the data-format flow of every (re)configuration at info level
    /// instead of debug.
    pub log_format_flow: bool,
    /// Per-contributor coefficients for fan-out gradient aggregation.
    /// `None` sums with 1.0 each.
    pub aggregator_scales: Option<Vec<f32>>,
}

impl RuntimeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set training mode.
    pub fn with_training(mut self, training: bool) -> Self {
        self.training = training;
        self
    }

    pub fn with_log_format_flow(mut self, enabled: bool) -> Self {
        self.log_format_flow = enabled;
        self
    }

    pub fn with_aggregator_scales(mut self, scales: Vec<f32>) -> Self {
        self.aggregator_scales = Some(scales);
        self
    }
}
