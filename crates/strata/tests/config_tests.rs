// Integration tests for declarative pipelines and multi-worker evaluation

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use strata::prelude::*;
use strata::{evaluate_parallel, AggregatorOptions, InputConfig};

fn scale_relu_config(batch: usize) -> PipelineConfig {
    PipelineConfig {
        inputs: vec![InputConfig {
            name: "x".into(),
            dims: vec![batch, 16, 3, 3],
        }],
        stages: vec![
            StageConfig::new("legacy", "tanh", &["x"]),
            StageConfig::new("scale", "scale", &["legacy"]).with_attr("channels", 16),
            StageConfig::new("mix", "pointwise", &["scale"])
                .with_attr("in_channels", 16)
                .with_attr("out_channels", 8)
                .with_attr("weight_format", "internal")
                .with_attr("seed", 7),
            StageConfig::new("act", "relu", &["mix"]),
        ],
        output: "act".into(),
        training: false,
        aggregator: AggregatorOptions::default(),
        log_format_flow: false,
    }
}

fn random_tensor(rng: &mut StdRng, dims: &[usize]) -> HostTensor {
    let n: usize = dims.iter().product();
    let data: Vec<f32> = (0..n).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    HostTensor::new(dims.to_vec(), data).unwrap()
}

#[test]
fn test_config_json_round_trip() -> Result<()> {
    let cfg = scale_relu_config(2);
    let text = cfg.to_json()?;
    let back = PipelineConfig::from_json(&text)?;
    assert_eq!(back, cfg);
    Ok(())
}

#[test]
fn test_from_config_is_configured_for_declared_dims() -> Result<()> {
    let registry = StageRegistry::new();
    let p = Pipeline::from_config(&scale_relu_config(4), &registry)?;
    assert_eq!(p.input_shapes().unwrap()[0].dims(), &[4, 16, 3, 3]);
    let mix = p.stage_id("mix").unwrap();
    assert_eq!(p.stage(mix).unwrap().output_shape()?.dims(), &[4, 8, 3, 3]);
    // pointwise is the consumer of scale and accepts the blocked layout
    let scale = p.stage_id("scale").unwrap();
    assert!(p.published_layout(scale).is_some());
    Ok(())
}

#[test]
fn test_unknown_kind_and_unknown_source() {
    let registry = StageRegistry::new();
    let mut cfg = scale_relu_config(1);
    cfg.stages[1].kind = "warp".into();
    assert!(matches!(
        Pipeline::from_config(&cfg, &registry),
        Err(Error::UnknownStageKind(k)) if k == "warp"
    ));

    let mut cfg = scale_relu_config(1);
    cfg.stages[3].inputs = vec!["nowhere".into()];
    assert!(matches!(
        Pipeline::from_config(&cfg, &registry),
        Err(Error::Config(_))
    ));
}

#[test]
fn test_aggregator_scales_from_config() -> Result<()> {
    let cfg = PipelineConfig::from_json(
        r#"{
            "inputs": [{ "name": "x", "dims": [1, 4] }],
            "stages": [
                { "name": "a", "kind": "relu", "inputs": ["x"] },
                { "name": "b", "kind": "relu", "inputs": ["x"] },
                { "name": "sum", "kind": "addto", "inputs": ["a", "b"] }
            ],
            "output": "sum",
            "aggregator": { "scales": [1.0, 0.5] }
        }"#,
    )?;
    let mut p = Pipeline::from_config(&cfg, &StageRegistry::new())?;
    assert_eq!(p.options().aggregator_scales.as_deref(), Some(&[1.0, 0.5][..]));
    let x = HostTensor::new((1, 4), vec![1.0, -1.0, 2.0, 3.0])?;
    p.forward(&[Feed::from(&x)])?;
    let grads = p.backward(&Feed::from(&HostTensor::new((1, 4), vec![1.0; 4])?))?;
    assert_eq!(grads[0].data(), &[1.5, 0.0, 1.5, 1.5]);
    Ok(())
}

#[test]
fn test_aggregator_scale_count_mismatch_is_config_error() -> Result<()> {
    let mut b = Pipeline::builder();
    let x = b.input("x")?;
    let r1 = b.stage("r1", Box::new(ReLU::new()), &[x])?;
    let r2 = b.stage("r2", Box::new(ReLU::new()), &[x])?;
    b.stage("sum", Box::new(AddTo::new()), &[Source::Stage(r1), Source::Stage(r2)])?;
    b.options(RuntimeOptions::new().with_aggregator_scales(vec![1.0, 1.0, 1.0]));
    let mut p = b.build()?;
    let x = HostTensor::new((1, 2), vec![1.0, 2.0])?;
    p.forward(&[Feed::from(&x)])?;
    let err = p.backward(&Feed::from(&HostTensor::new((1, 2), vec![1.0, 1.0])?));
    assert!(matches!(err, Err(Error::Config(_))));
    Ok(())
}

#[test]
fn test_parallel_matches_sequential() -> Result<()> {
    let registry = StageRegistry::new();
    let cfg = scale_relu_config(2);
    let mut rng = StdRng::seed_from_u64(11);
    let batches: Vec<Vec<HostTensor>> = (0..12)
        .map(|_| vec![random_tensor(&mut rng, &[2, 16, 3, 3])])
        .collect();

    let parallel = evaluate_parallel(&cfg, &registry, &batches)?;

    let mut sequential = Pipeline::from_config(&cfg, &registry)?;
    assert_eq!(parallel.len(), batches.len());
    for (batch, got) in batches.iter().zip(parallel.iter()) {
        let feeds: Vec<Feed> = batch.iter().map(Feed::from).collect();
        let want = sequential.forward(&feeds)?;
        assert_eq!(got.dims(), want.dims());
        for (g, w) in got.data().iter().zip(want.data().iter()) {
            assert!((g - w).abs() < 1e-6, "got {g} expected {w}");
        }
    }
    Ok(())
}

#[test]
fn test_internal_weights_persist_once_per_pipeline() -> Result<()> {
    let registry = StageRegistry::new();
    let cfg = scale_relu_config(2);
    let mut p = Pipeline::from_config(&cfg, &registry)?;
    let mut rng = StdRng::seed_from_u64(3);
    for batch in [2usize, 2, 5, 2] {
        let x = random_tensor(&mut rng, &[batch, 16, 3, 3]);
        p.forward(&[Feed::from(&x)])?;
    }
    let mix = p.stage(p.stage_id("mix").unwrap()).unwrap();
    let weight = mix.weights()[0];
    assert_eq!(weight.persisted_conversions(), 1);
    assert_eq!(weight.conversions_executed(), 0);
    assert_eq!(weight.export_canonical()?.data().len(), 16 * 8);
    Ok(())
}
