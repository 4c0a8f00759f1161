// PipelineConfig — Declarative pipeline description (JSON via serde)
//
//   {
//     "inputs":  [{ "name": "x", "dims": [4, 16, 3, 3] }],
//     "stages":  [{ "name": "s", "kind": "scale", "inputs": ["x"],
//                   "attrs": { "channels": 16 } }],
//     "output":  "s",
//     "training": false,
//     "aggregator": { "scales": [1.0, 0.5] }
//   }
//
// The config is plain data and `Send + Sync`; it is what crosses thread
// boundaries when several workers evaluate the same pipeline.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strata_core::{Error, Result, Shape};

use crate::options::RuntimeOptions;
use crate::pipeline::{Pipeline, PipelineBuilder, Source};
use crate::registry::StageRegistry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    pub name: String,
    pub dims: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    pub kind: String,
    pub inputs: Vec<String>,
    #[serde(default)]
    pub attrs: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregatorOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scales: Option<Vec<f32>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub inputs: Vec<InputConfig>,
    pub stages: Vec<StageConfig>,
    pub output: String,
    #[serde(default)]
    pub training: bool,
    #[serde(default)]
    pub aggregator: AggregatorOptions,
    #[serde(default)]
    pub log_format_flow: bool,
}

impl PipelineConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::config(format!("invalid pipeline config: {e}")))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::config(format!("cannot serialize pipeline config: {e}")))
    }

    pub fn runtime_options(&self) -> RuntimeOptions {
        let mut options = RuntimeOptions::new()
            .with_training(self.training)
            .with_log_format_flow(self.log_format_flow);
        if let Some(scales) = &self.aggregator.scales {
            options = options.with_aggregator_scales(scales.clone());
        }
        options
    }

    /// Declared input shapes, in input order.
    pub fn input_shapes(&self) -> Vec<Shape> {
        self.inputs.iter().map(|i| Shape::new(i.dims.clone())).collect()
    }
}

impl StageConfig {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, inputs: &[&str]) -> Self {
        StageConfig {
            name: name.into(),
            kind: kind.into(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            attrs: Map::new(),
        }
    }

    pub fn with_attr(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attrs.insert(key.to_string(), value.into());
        self
    }

    fn bad_attr(&self, key: &str, want: &str) -> Error {
        Error::config(format!(
            "stage '{}' ({}): attribute '{key}' must be {want}",
            self.name, self.kind
        ))
    }

    pub fn usize_attr(&self, key: &str) -> Result<usize> {
        match self.attrs.get(key) {
            Some(v) => v
                .as_u64()
                .map(|n| n as usize)
                .ok_or_else(|| self.bad_attr(key, "a non-negative integer")),
            None => Err(Error::config(format!(
                "stage '{}' ({}): missing attribute '{key}'",
                self.name, self.kind
            ))),
        }
    }

    pub fn opt_u64_attr(&self, key: &str) -> Result<Option<u64>> {
        match self.attrs.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_u64()
                .map(Some)
                .ok_or_else(|| self.bad_attr(key, "a non-negative integer")),
        }
    }

    pub fn opt_f32_attr(&self, key: &str) -> Result<Option<f32>> {
        match self.attrs.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_f64()
                .map(|x| Some(x as f32))
                .ok_or_else(|| self.bad_attr(key, "a number")),
        }
    }

    pub fn opt_bool_attr(&self, key: &str) -> Result<Option<bool>> {
        match self.attrs.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_bool()
                .map(Some)
                .ok_or_else(|| self.bad_attr(key, "a boolean")),
        }
    }

    /// Integer array where `-1` marks a dim left open.
    pub fn dims_attr(&self, key: &str) -> Result<Vec<Option<usize>>> {
        let items = match self.attrs.get(key) {
            Some(Value::Array(items)) => items,
            Some(_) => return Err(self.bad_attr(key, "an array of integers")),
            None => {
                return Err(Error::config(format!(
                    "stage '{}' ({}): missing attribute '{key}'",
                    self.name, self.kind
                )))
            }
        };
        items
            .iter()
            .map(|v| match v.as_i64() {
                Some(-1) => Ok(None),
                Some(d) if d > 0 => Ok(Some(d as usize)),
                _ => Err(self.bad_attr(key, "positive integers or -1")),
            })
            .collect()
    }

    pub fn opt_str_attr(&self, key: &str) -> Result<Option<&str>> {
        match self.attrs.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_str()
                .map(Some)
                .ok_or_else(|| self.bad_attr(key, "a string")),
        }
    }
}

impl Pipeline {
    /// Build a pipeline from `config` with stage kinds from `registry`, and
    /// configure it for the declared input dims.
    pub fn from_config(config: &PipelineConfig, registry: &StageRegistry) -> Result<Pipeline> {
        let mut builder = PipelineBuilder::new();
        builder.options(config.runtime_options());
        let mut sources: std::collections::HashMap<&str, Source> = std::collections::HashMap::new();
        for input in &config.inputs {
            sources.insert(input.name.as_str(), builder.input(input.name.clone())?);
        }
        let mut output = None;
        for stage in &config.stages {
            let inputs = stage
                .inputs
                .iter()
                .map(|name| {
                    sources.get(name.as_str()).copied().ok_or_else(|| {
                        Error::config(format!(
                            "stage '{}' reads from unknown '{}'",
                            stage.name, name
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let ops = registry.create(stage)?;
            let id = builder.stage(stage.name.clone(), ops, &inputs)?;
            if stage.name == config.output {
                output = Some(id);
            }
            sources.insert(stage.name.as_str(), Source::Stage(id));
        }
        let output = output
            .ok_or_else(|| Error::config(format!("output '{}' is not a stage", config.output)))?;
        builder.output(output);
        let mut pipeline = builder.build()?;
        pipeline.configure(&config.input_shapes())?;
        Ok(pipeline)
    }
}
