// Multi-worker evaluation
//
// A Pipeline holds Rc/RefCell state and cannot leave the thread that built
// it. Parallel evaluation therefore shares only the plain-data config and
// the registry; every rayon worker builds its own pipeline (own stages,
// buffers and engine) once via `map_init` and reuses it for every batch it
// is handed.

use rayon::prelude::*;
use strata_core::{Error, HostTensor, Result};
use tracing::debug;

use crate::config::PipelineConfig;
use crate::pipeline::{Feed, Pipeline};
use crate::registry::StageRegistry;

/// Run the forward pass of `config` over every batch in parallel.
///
/// `batches[k]` holds one tensor per pipeline input. Results come back in
/// batch order.
pub fn evaluate_parallel(
    config: &PipelineConfig,
    registry: &StageRegistry,
    batches: &[Vec<HostTensor>],
) -> Result<Vec<HostTensor>> {
    batches
        .par_iter()
        .map_init(
            || {
                debug!("building worker pipeline");
                Pipeline::from_config(config, registry)
            },
            |pipeline, batch| {
                let pipeline = pipeline
                    .as_mut()
                    .map_err(|e| Error::msg(format!("worker pipeline: {e}")))?;
                let feeds: Vec<Feed> = batch.iter().map(Feed::from).collect();
                pipeline.forward(&feeds)
            },
        )
        .collect()
}
