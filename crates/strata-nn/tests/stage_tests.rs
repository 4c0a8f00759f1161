// Stage lifecycle tests
//
// Reconfiguration only on shape/offer change, all-or-nothing configure,
// the lazy backward reset, and aggregator order independence.

use proptest::prelude::*;
use strata_core::{DataHandle, Engine, Format, LayoutDescriptor, Memory, Result, Stream};
use strata_nn::{
    Contribution, DiffAggregator, Scale, Stage, StageEnv, StageInput, StageState,
};

fn scale_stage(channels: usize) -> Stage {
    Stage::new("scale", Box::new(Scale::new(channels).unwrap()))
}

#[test]
fn test_same_shape_does_not_reconfigure() -> Result<()> {
    let engine = Engine::cpu();
    let env = StageEnv::new(&engine);
    let mut stage = scale_stage(8);
    let input = [StageInput::new(vec![4, 8, 3, 3])];
    assert!(stage.configure(&input, false, &env)?);
    assert!(!stage.configure(&input, false, &env)?);
    assert_eq!(stage.configure_count(), 1);
    Ok(())
}

#[test]
fn test_batch_change_rebuilds_buffers() -> Result<()> {
    let engine = Engine::cpu();
    let env = StageEnv::new(&engine);
    let mut stage = scale_stage(8);
    stage.configure(&[StageInput::new(vec![32, 8, 3, 3])], false, &env)?;
    let old = stage.input_buffer(0).unwrap().internal_memory().unwrap().clone();
    let allocs = engine.stats().allocations;

    assert!(stage.configure(&[StageInput::new(vec![16, 8, 3, 3])], false, &env)?);
    let buf = stage.input_buffer(0).unwrap();
    assert!(!buf.internal_memory().unwrap().same_as(&old));
    assert_eq!(buf.dims(), &[16, 8, 3, 3]);
    assert!(engine.stats().allocations > allocs);
    assert_eq!(stage.configure_count(), 2);
    assert!(stage.needs_backward_reset());
    Ok(())
}

#[test]
fn test_failed_configure_leaves_stage_unconfigured() -> Result<()> {
    let engine = Engine::cpu();
    let env = StageEnv::new(&engine);
    let mut stage = scale_stage(8);
    stage.configure(&[StageInput::new(vec![2, 8, 3, 3])], false, &env)?;
    assert_eq!(stage.state(), StageState::Configured);
    assert!(stage
        .configure(&[StageInput::new(vec![2, 4, 3, 3])], false, &env)
        .is_err());
    assert_eq!(stage.state(), StageState::Unconfigured);
    assert!(stage.output_buffer().is_none());
    Ok(())
}

#[test]
fn test_backward_rebuilt_once_per_forward_reconfiguration() -> Result<()> {
    let engine = Engine::cpu();
    let env = StageEnv::new(&engine);
    let stream = Stream::new(&engine);
    let mut stage = scale_stage(8);
    for batch in [2usize, 2, 3] {
        stage.configure(&[StageInput::new(vec![batch, 8, 2, 2])], false, &env)?;
        let x = DataHandle::zeros(batch * 8 * 4);
        let dy = DataHandle::zeros(batch * 8 * 4);
        for _ in 0..3 {
            stage.mark_dirty();
            let mut pending = Vec::new();
            stage.forward(&mut pending, &[Some(&x)])?;
            stream.submit(&pending)?;
            stage.configure_backward(None, Some(dy.clone()), &[false], &env)?;
            stage.mark_backward_dirty();
            let mut pending = Vec::new();
            stage.backward(&mut pending, Some(&dy))?;
            stream.submit(&pending)?;
        }
    }
    assert_eq!(stage.configure_count(), 2);
    assert_eq!(stage.backward_configure_count(), 2);
    Ok(())
}

#[test]
fn test_blocked_scale_converts_input_once_per_call() -> Result<()> {
    let engine = Engine::cpu();
    let env = StageEnv::new(&engine);
    let stream = Stream::new(&engine);
    let mut stage = scale_stage(8);
    stage.configure(&[StageInput::new(vec![1, 8, 2, 2])], false, &env)?;
    let x = DataHandle::from_vec((0..32).map(|v| v as f32).collect::<Vec<_>>());
    for _ in 0..5 {
        stage.mark_dirty();
        let mut pending = Vec::new();
        stage.forward(&mut pending, &[Some(&x)])?;
        stream.submit(&pending)?;
    }
    assert_eq!(stage.input_buffer(0).unwrap().conversions_executed(), 5);
    assert_eq!(stage.output_buffer().unwrap().conversions_executed(), 5);
    let y = stage.output_memory()?.read_canonical()?;
    assert_eq!(y, (0..32).map(|v| v as f32).collect::<Vec<_>>());
    Ok(())
}

fn layout_for(dims: &[usize], choice: usize) -> LayoutDescriptor {
    match choice % 4 {
        0 => LayoutDescriptor::canonical(dims).unwrap(),
        1 => LayoutDescriptor::plain(dims.to_vec(), Format::Nhwc).unwrap(),
        2 => LayoutDescriptor::plain(dims.to_vec(), Format::Chwn).unwrap(),
        _ => LayoutDescriptor::blocked(dims.to_vec(), 8).unwrap(),
    }
}

fn contribution(layout: LayoutDescriptor, values: &[f32]) -> Contribution {
    let mem = Memory::new(layout.clone(), DataHandle::zeros(layout.physical_len())).unwrap();
    mem.write_canonical(values).unwrap();
    Contribution::new(layout, mem.data_handle())
}

fn aggregate(contribs: &[Contribution]) -> Vec<f32> {
    let engine = Engine::cpu();
    let mut agg = DiffAggregator::new("g", contribs, None, &engine).unwrap();
    let mut pending = Vec::new();
    agg.submit(&mut pending, contribs).unwrap();
    Stream::new(&engine).submit(&pending).unwrap();
    agg.result().read_canonical().unwrap()
}

proptest! {
    #[test]
    fn test_aggregator_sum_is_order_independent(
        c in 1usize..12,
        hw in 1usize..4,
        parts in prop::collection::vec((0usize..4, prop::collection::vec(-50i32..50, 1..2)), 2..5),
        rotate in 0usize..4,
    ) {
        let dims = vec![2, c, hw, hw];
        let n: usize = dims.iter().product();
        // integer-valued contributions keep float addition exact
        let contribs: Vec<Contribution> = parts
            .iter()
            .enumerate()
            .map(|(k, (choice, seed))| {
                let values: Vec<f32> = (0..n).map(|i| ((i as i32 * (k as i32 + 1) + seed[0]) % 97) as f32).collect();
                contribution(layout_for(&dims, *choice), &values)
            })
            .collect();
        let mut expected = vec![0.0f32; n];
        for c in &contribs {
            let mem = Memory::new(c.layout.clone(), c.data.clone()).unwrap();
            for (e, v) in expected.iter_mut().zip(mem.read_canonical().unwrap()) {
                *e += v;
            }
        }

        let forward = aggregate(&contribs);
        let mut rotated = contribs.clone();
        rotated.rotate_left(rotate % contribs.len());
        let mut reversed = contribs.clone();
        reversed.reverse();

        prop_assert_eq!(&forward, &expected);
        prop_assert_eq!(&aggregate(&rotated), &expected);
        prop_assert_eq!(&aggregate(&reversed), &expected);
    }
}
