// Pipeline — Driver for a directed acyclic graph of stages
//
// The pipeline owns every stage, one engine and one stream. It is the only
// place that knows the graph, so it decides:
//
//   - whether a stage publishes its output (it is not the pipeline output
//     and every consumer participates in negotiation)
//   - where each stage's inputs come from (pipeline feeds or the user view
//     of a producer's output)
//   - how gradients flow back: straight through for a single consumer,
//     through a DiffAggregator for a fan-out point
//
// Stages are kept in insertion order, which is a topological order because
// a stage can only name sources that already exist. Forward walks that
// order; backward walks it in reverse. Each stage's pending list runs as
// one stream dispatch.

use std::collections::{HashMap, HashSet};
use std::fmt;

use strata_core::{
    DataHandle, Engine, EngineStats, Error, HostTensor, Memory, PrimitiveRef, Result, Shape,
    Stream,
};
use strata_nn::{
    Contribution, DiffAggregator, PublishedLayout, Stage, StageEnv, StageInput, StageOps,
};
use tracing::{debug, info};

use crate::options::RuntimeOptions;

/// Index of a stage inside its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(pub usize);

/// Where a stage input comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    /// Pipeline input by position.
    Input(usize),
    /// Output of another stage.
    Stage(StageId),
}

/// Caller-owned storage fed into a pipeline, in canonical layout.
#[derive(Debug, Clone)]
pub struct Feed {
    pub shape: Shape,
    pub data: DataHandle,
}

impl Feed {
    pub fn new(shape: impl Into<Shape>, data: DataHandle) -> Self {
        Feed {
            shape: shape.into(),
            data,
        }
    }
}

impl From<&HostTensor> for Feed {
    fn from(t: &HostTensor) -> Self {
        Feed::new(t.shape().clone(), t.to_handle())
    }
}

struct Node {
    stage: Stage,
    sources: Vec<Source>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum AggregatorKey {
    Stage(StageId),
    Input(usize),
}

// Builder

/// Assembles a pipeline stage by stage.
#[derive(Default)]
pub struct PipelineBuilder {
    inputs: Vec<String>,
    nodes: Vec<Node>,
    names: HashSet<String>,
    output: Option<StageId>,
    options: RuntimeOptions,
    engine: Option<Engine>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a pipeline input.
    pub fn input(&mut self, name: impl Into<String>) -> Result<Source> {
        let name = name.into();
        self.claim(&name)?;
        self.inputs.push(name);
        Ok(Source::Input(self.inputs.len() - 1))
    }

    /// Add a stage reading from `sources`, which must already exist.
    pub fn stage(
        &mut self,
        name: impl Into<String>,
        ops: Box<dyn StageOps>,
        sources: &[Source],
    ) -> Result<StageId> {
        let name = name.into();
        if sources.is_empty() {
            return Err(Error::config(format!("stage '{name}' has no inputs")));
        }
        for src in sources {
            let known = match *src {
                Source::Input(i) => i < self.inputs.len(),
                Source::Stage(StageId(s)) => s < self.nodes.len(),
            };
            if !known {
                return Err(Error::config(format!(
                    "stage '{name}' reads from unknown source {src:?}"
                )));
            }
        }
        self.claim(&name)?;
        self.nodes.push(Node {
            stage: Stage::new(name, ops),
            sources: sources.to_vec(),
        });
        Ok(StageId(self.nodes.len() - 1))
    }

    /// Mark the stage whose output the pipeline returns. Defaults to the
    /// last stage added.
    pub fn output(&mut self, id: StageId) -> &mut Self {
        self.output = Some(id);
        self
    }

    pub fn options(&mut self, options: RuntimeOptions) -> &mut Self {
        self.options = options;
        self
    }

    /// Use an existing engine instead of a fresh CPU engine.
    pub fn engine(&mut self, engine: &Engine) -> &mut Self {
        self.engine = Some(engine.clone());
        self
    }

    fn claim(&mut self, name: &str) -> Result<()> {
        if !self.names.insert(name.to_string()) {
            return Err(Error::config(format!("duplicate name '{name}'")));
        }
        Ok(())
    }

    pub fn build(self) -> Result<Pipeline> {
        if self.nodes.is_empty() {
            return Err(Error::config("pipeline has no stages"));
        }
        let output = self.output.unwrap_or(StageId(self.nodes.len() - 1));
        if output.0 >= self.nodes.len() {
            return Err(Error::config(format!("output {output:?} is not a stage")));
        }

        let mut consumers = vec![Vec::new(); self.nodes.len()];
        let mut input_consumers = vec![Vec::new(); self.inputs.len()];
        for (idx, node) in self.nodes.iter().enumerate() {
            for (k, src) in node.sources.iter().enumerate() {
                match *src {
                    Source::Input(i) => input_consumers[i].push((StageId(idx), k)),
                    Source::Stage(p) => consumers[p.0].push((StageId(idx), k)),
                }
            }
        }
        for (idx, node) in self.nodes.iter().enumerate() {
            let consumed = !consumers[idx].is_empty();
            if StageId(idx) == output && consumed {
                return Err(Error::config(format!(
                    "output stage '{}' must not have consumers",
                    node.stage.name()
                )));
            }
            if StageId(idx) != output && !consumed {
                return Err(Error::config(format!(
                    "stage '{}' is neither consumed nor the output",
                    node.stage.name()
                )));
            }
        }
        for (i, name) in self.inputs.iter().enumerate() {
            if input_consumers[i].is_empty() {
                return Err(Error::config(format!("input '{name}' is never consumed")));
            }
        }

        let engine = self.engine.unwrap_or_else(Engine::cpu);
        Ok(Pipeline {
            stream: Stream::new(&engine),
            engine,
            options: self.options,
            input_names: self.inputs,
            nodes: self.nodes,
            consumers,
            input_consumers,
            output,
            input_shapes: None,
            forward_done: false,
            aggregators: HashMap::new(),
        })
    }
}

// Pipeline

pub struct Pipeline {
    engine: Engine,
    stream: Stream,
    options: RuntimeOptions,
    input_names: Vec<String>,
    nodes: Vec<Node>,
    consumers: Vec<Vec<(StageId, usize)>>,
    input_consumers: Vec<Vec<(StageId, usize)>>,
    output: StageId,
    input_shapes: Option<Vec<Shape>>,
    forward_done: bool,
    aggregators: HashMap<AggregatorKey, DiffAggregator>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    fn env(&self) -> StageEnv {
        StageEnv::new(&self.engine)
            .with_training(self.options.training)
            .with_log_format_flow(self.options.log_format_flow)
    }

    /// Configure every stage for these input shapes.
    ///
    /// Returns whether any stage was rebuilt. On error the pipeline is left
    /// unconfigured and the next `forward` configures again.
    pub fn configure(&mut self, shapes: &[Shape]) -> Result<bool> {
        self.forward_done = false;
        match self.configure_stages(shapes) {
            Ok(changed) => {
                if changed {
                    info!(
                        stages = self.nodes.len(),
                        inputs = ?shapes.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
                        "pipeline configured"
                    );
                }
                self.input_shapes = Some(shapes.to_vec());
                Ok(changed)
            }
            Err(e) => {
                self.input_shapes = None;
                Err(e)
            }
        }
    }

    fn configure_stages(&mut self, shapes: &[Shape]) -> Result<bool> {
        if shapes.len() != self.input_names.len() {
            return Err(Error::msg(format!(
                "pipeline has {} inputs, got {} shapes",
                self.input_names.len(),
                shapes.len()
            )));
        }
        for (name, shape) in self.input_names.iter().zip(shapes) {
            if shape.dims().contains(&0) {
                return Err(Error::invalid_shape(
                    name,
                    shape.dims(),
                    "zero-length dimension",
                ));
            }
        }
        let env = self.env();
        let mut changed = false;
        for idx in 0..self.nodes.len() {
            let inputs = self.stage_inputs(idx, shapes)?;
            let publish = self.publishes(StageId(idx));
            changed |= self.nodes[idx].stage.configure(&inputs, publish, &env)?;
        }
        Ok(changed)
    }

    fn stage_inputs(&self, idx: usize, shapes: &[Shape]) -> Result<Vec<StageInput>> {
        self.nodes[idx]
            .sources
            .iter()
            .map(|src| match *src {
                Source::Input(i) => Ok(StageInput::new(shapes[i].clone())),
                Source::Stage(p) => {
                    let producer = &self.nodes[p.0].stage;
                    Ok(StageInput::new(producer.output_shape()?)
                        .with_data(producer.output_memory()?.data_handle())
                        .with_published(producer.published_output()))
                }
            })
            .collect()
    }

    fn publishes(&self, id: StageId) -> bool {
        id != self.output
            && self.consumers[id.0]
                .iter()
                .all(|(c, _)| self.nodes[c.0].stage.participates())
    }

    /// Run one forward pass. Reconfigures first if the feed shapes differ
    /// from the configured ones.
    pub fn forward(&mut self, feeds: &[Feed]) -> Result<HostTensor> {
        self.forward_done = false;
        if feeds.len() != self.input_names.len() {
            return Err(Error::msg(format!(
                "pipeline has {} inputs, got {} feeds",
                self.input_names.len(),
                feeds.len()
            )));
        }
        let shapes: Vec<Shape> = feeds.iter().map(|f| f.shape.clone()).collect();
        if self.input_shapes.as_deref() != Some(shapes.as_slice()) {
            self.configure(&shapes)?;
        }

        for node in self.nodes.iter_mut() {
            node.stage.mark_dirty();
        }
        for idx in 0..self.nodes.len() {
            let handles = self.nodes[idx]
                .sources
                .iter()
                .map(|src| match *src {
                    Source::Input(i) => Ok(feeds[i].data.clone()),
                    Source::Stage(p) => Ok(self.nodes[p.0].stage.output_memory()?.data_handle()),
                })
                .collect::<Result<Vec<DataHandle>>>()?;
            let refs: Vec<Option<&DataHandle>> = handles.iter().map(Some).collect();
            let mut pending = Vec::new();
            self.nodes[idx].stage.forward(&mut pending, &refs)?;
            self.stream.submit(&pending)?;
        }
        self.forward_done = true;
        HostTensor::from_memory(self.nodes[self.output.0].stage.output_memory()?)
    }

    /// Propagate `grad` (the gradient of the output, canonical layout) back
    /// through the graph. Returns one gradient per pipeline input.
    pub fn backward(&mut self, grad: &Feed) -> Result<Vec<HostTensor>> {
        if !self.forward_done {
            return Err(Error::msg("backward called without a preceding forward"));
        }
        let out = &self.nodes[self.output.0].stage;
        let expected = out.output_shape()?;
        if grad.shape != expected {
            return Err(Error::ShapeMismatch {
                stage: out.name().to_string(),
                expected,
                got: grad.shape.clone(),
            });
        }

        let env = self.env();
        for idx in (0..self.nodes.len()).rev() {
            let id = StageId(idx);
            let mut pending = Vec::new();
            let (offered, data) = if id == self.output {
                (None, grad.data.clone())
            } else {
                self.incoming_grad(id, &mut pending)?
            };
            let producers: Vec<bool> = self.nodes[idx]
                .sources
                .iter()
                .map(|src| match *src {
                    Source::Input(_) => false,
                    Source::Stage(p) => self.nodes[p.0].stage.participates(),
                })
                .collect();
            let stage = &mut self.nodes[idx].stage;
            stage.configure_backward(offered.as_ref(), Some(data.clone()), &producers, &env)?;
            stage.mark_backward_dirty();
            stage.backward(&mut pending, Some(&data))?;
            self.stream.submit(&pending)?;
        }

        (0..self.input_names.len())
            .map(|i| self.input_grad(i))
            .collect()
    }

    fn incoming_grad(
        &mut self,
        id: StageId,
        pending: &mut Vec<PrimitiveRef>,
    ) -> Result<(Option<PublishedLayout>, DataHandle)> {
        let consumers = self.consumers[id.0].clone();
        if let [(c, k)] = consumers.as_slice() {
            let consumer = &self.nodes[c.0].stage;
            return Ok((
                consumer.published_input_grad(*k),
                consumer.input_grad_memory(*k)?.data_handle(),
            ));
        }
        let contributions = self.contributions(&consumers)?;
        let label = format!("{}.grad", self.nodes[id.0].stage.name());
        let sum = self.aggregate(AggregatorKey::Stage(id), &label, &contributions, pending)?;
        let offered = self.nodes[id.0]
            .stage
            .participates()
            .then(|| PublishedLayout::new(label, sum.layout().clone()));
        Ok((offered, sum.data_handle()))
    }

    fn input_grad(&mut self, input: usize) -> Result<HostTensor> {
        let consumers = self.input_consumers[input].clone();
        match consumers.as_slice() {
            [] => {
                let shape = self
                    .input_shapes
                    .as_ref()
                    .and_then(|s| s.get(input).cloned())
                    .ok_or_else(|| Error::msg("pipeline is not configured"))?;
                Ok(HostTensor::zeros(shape))
            }
            [(c, k)] => HostTensor::from_memory(self.nodes[c.0].stage.input_grad_memory(*k)?),
            _ => {
                let contributions = self.contributions(&consumers)?;
                let label = format!("{}.grad", self.input_names[input]);
                let mut pending = Vec::new();
                let sum = self.aggregate(
                    AggregatorKey::Input(input),
                    &label,
                    &contributions,
                    &mut pending,
                )?;
                self.stream.submit(&pending)?;
                HostTensor::from_memory(&sum)
            }
        }
    }

    fn contributions(&self, consumers: &[(StageId, usize)]) -> Result<Vec<Contribution>> {
        consumers
            .iter()
            .map(|(c, k)| {
                let m = self.nodes[c.0].stage.input_grad_memory(*k)?;
                Ok(Contribution::new(m.layout().clone(), m.data_handle()))
            })
            .collect()
    }

    /// Queue the aggregation for a fan-out point, rebuilding the aggregator
    /// when the contributor layouts changed. Returns the result view.
    fn aggregate(
        &mut self,
        key: AggregatorKey,
        label: &str,
        contributions: &[Contribution],
        pending: &mut Vec<PrimitiveRef>,
    ) -> Result<Memory> {
        let stale = self
            .aggregators
            .get(&key)
            .map_or(true, |a| !a.matches(contributions));
        if stale {
            debug!(aggregator = %label, contributors = contributions.len(), "rebuild gradient aggregator");
            let agg = DiffAggregator::new(
                label,
                contributions,
                self.options.aggregator_scales.as_deref(),
                &self.engine,
            )?;
            self.aggregators.insert(key, agg);
        }
        let agg = self
            .aggregators
            .get_mut(&key)
            .ok_or_else(|| Error::msg(format!("{label}: aggregator missing")))?;
        agg.mark_dirty();
        agg.submit(pending, contributions)?;
        Ok(agg.result().clone())
    }

    // Inspection

    /// Conversions executed on the edge `from → to`: the producer's output
    /// buffer plus every consumer input buffer reading from it.
    pub fn edge_conversions(&self, from: StageId, to: StageId) -> Result<u64> {
        let producer = self.node(from)?;
        let consumer = self.node(to)?;
        let mut total = 0;
        let mut found = false;
        for (k, src) in consumer.sources.iter().enumerate() {
            if *src == Source::Stage(from) {
                found = true;
                total += consumer
                    .stage
                    .input_buffer(k)
                    .map_or(0, |b| b.conversions_executed());
            }
        }
        if !found {
            return Err(Error::msg(format!(
                "no edge from '{}' to '{}'",
                producer.stage.name(),
                consumer.stage.name()
            )));
        }
        let out = producer
            .stage
            .output_buffer()
            .map_or(0, |b| b.conversions_executed());
        Ok(total + out)
    }

    /// Layout the stage's output is offered in, if it publishes.
    pub fn published_layout(&self, id: StageId) -> Option<PublishedLayout> {
        self.nodes.get(id.0).and_then(|n| n.stage.published_output())
    }

    fn node(&self, id: StageId) -> Result<&Node> {
        self.nodes
            .get(id.0)
            .ok_or_else(|| Error::msg(format!("no stage {}", id.0)))
    }

    pub fn stage(&self, id: StageId) -> Option<&Stage> {
        self.nodes.get(id.0).map(|n| &n.stage)
    }

    pub fn stage_id(&self, name: &str) -> Option<StageId> {
        self.nodes
            .iter()
            .position(|n| n.stage.name() == name)
            .map(StageId)
    }

    pub fn sources(&self, id: StageId) -> Option<&[Source]> {
        self.nodes.get(id.0).map(|n| n.sources.as_slice())
    }

    /// The aggregator summing gradients for a fan-out stage, once built.
    pub fn aggregator(&self, id: StageId) -> Option<&DiffAggregator> {
        self.aggregators.get(&AggregatorKey::Stage(id))
    }

    pub fn output_id(&self) -> StageId {
        self.output
    }

    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    pub fn input_shapes(&self) -> Option<&[Shape]> {
        self.input_shapes.as_deref()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn stats(&self) -> EngineStats {
        self.engine.stats()
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("inputs", &self.input_names)
            .field("stages", &self.nodes.iter().map(|n| n.stage.name()).collect::<Vec<_>>())
            .field("output", &self.output)
            .field("configured", &self.input_shapes.is_some())
            .finish()
    }
}
