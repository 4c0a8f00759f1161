// Property and contract tests for Buffer / Reorder
//
// Covers: bit-exact user->internal->user round trips across formats, the
// layout-equality short circuit, at-most-one conversion per invocation,
// and pointer changes forcing a reconversion.

use proptest::prelude::*;
use strata_core::{
    Buffer, ConversionDirection, DType, DataHandle, Engine, Format, LayoutDescriptor,
    PrimitiveRef, Stream,
};

fn layout_for(dims: &[usize], choice: usize) -> LayoutDescriptor {
    match choice {
        0 => LayoutDescriptor::plain(dims.to_vec(), Format::Nchw).unwrap(),
        1 => LayoutDescriptor::plain(dims.to_vec(), Format::Nhwc).unwrap(),
        2 => LayoutDescriptor::plain(dims.to_vec(), Format::Chwn).unwrap(),
        3 => LayoutDescriptor::blocked(dims.to_vec(), 4).unwrap(),
        4 => LayoutDescriptor::blocked(dims.to_vec(), 8).unwrap(),
        _ => LayoutDescriptor::blocked(dims.to_vec(), 16).unwrap(),
    }
}

fn dims_strategy() -> impl Strategy<Value = Vec<usize>> {
    (1usize..4, 1usize..20, 1usize..5, 1usize..5).prop_map(|(n, c, h, w)| vec![n, c, h, w])
}

fn values(n: usize, seed: u32) -> Vec<f32> {
    // distinct, non-trivial bit patterns
    (0..n)
        .map(|i| ((i as u32).wrapping_mul(2654435761) ^ seed) as f32 * 1.0e-3 - 7.25)
        .collect()
}

proptest! {
    #[test]
    fn test_round_trip_is_bit_exact(
        dims in dims_strategy(),
        user_choice in 0usize..6,
        intl_choice in 0usize..6,
        seed in any::<u32>(),
    ) {
        let engine = Engine::cpu();
        let stream = Stream::new(&engine);
        let user = layout_for(&dims, user_choice);
        let intl = layout_for(&dims, intl_choice);
        let canon = values(user.elem_count(), seed);

        let mut input = Buffer::new(dims.clone(), DType::F32).unwrap();
        input.init_user(None, user.clone(), &engine).unwrap();
        input.require_user().unwrap().write_canonical(&canon).unwrap();
        input.init_conversion(&intl, ConversionDirection::UserToInternal).unwrap();

        let mut output = Buffer::new(dims.clone(), DType::F32).unwrap();
        output.init_user(None, user.clone(), &engine).unwrap();
        output.init_conversion(&intl, ConversionDirection::InternalToUser).unwrap();

        let mut pending: Vec<PrimitiveRef> = Vec::new();
        input.submit(&mut pending, None).unwrap();
        stream.submit(&pending).unwrap();

        // hand the raw internal representation over, then convert it back
        let raw = input.require_internal().unwrap().data_handle().to_f32_vec();
        output.require_internal().unwrap().data_handle().write_f32(&raw).unwrap();
        let mut pending: Vec<PrimitiveRef> = Vec::new();
        output.submit(&mut pending, None).unwrap();
        stream.submit(&pending).unwrap();

        let back = output.require_user().unwrap().read_canonical().unwrap();
        let bits = |v: &[f32]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
        prop_assert_eq!(bits(&back), bits(&canon));
    }

    #[test]
    fn test_equal_layouts_never_build_conversion(
        dims in dims_strategy(),
        choice in 0usize..6,
        to_user in any::<bool>(),
    ) {
        let engine = Engine::cpu();
        let layout = layout_for(&dims, choice);
        let same = layout_for(&dims, choice);
        let direction = if to_user {
            ConversionDirection::InternalToUser
        } else {
            ConversionDirection::UserToInternal
        };
        let mut buf = Buffer::new(dims, DType::F32).unwrap();
        buf.init_user(None, layout, &engine).unwrap();
        let allocs = engine.stats().allocations;
        prop_assert!(!buf.init_conversion(&same, direction).unwrap());
        prop_assert!(buf.conversion().is_none());
        prop_assert!(buf.is_aliased());
        prop_assert_eq!(engine.stats().allocations, allocs);
    }

    #[test]
    fn test_at_most_one_conversion_per_invocation(
        dims in dims_strategy(),
        submits in 1usize..6,
        invocations in 1usize..5,
    ) {
        let engine = Engine::cpu();
        let stream = Stream::new(&engine);
        let user = layout_for(&dims, 0);
        let intl = layout_for(&dims, 4);
        let data = DataHandle::zeros(user.physical_len());
        let mut buf = Buffer::new(dims, DType::F32).unwrap();
        buf.init_user(Some(data.clone()), user, &engine).unwrap();
        prop_assert!(buf.init_conversion(&intl, ConversionDirection::UserToInternal).unwrap());

        for _ in 0..invocations {
            buf.mark_dirty();
            let mut pending: Vec<PrimitiveRef> = Vec::new();
            for _ in 0..submits {
                buf.submit(&mut pending, Some(&data)).unwrap();
            }
            prop_assert_eq!(pending.len(), 1);
            stream.submit(&pending).unwrap();
        }
        prop_assert_eq!(buf.conversions_executed(), invocations as u64);
    }
}

#[test]
fn test_second_submit_with_same_pointer_is_noop() {
    let engine = Engine::cpu();
    let stream = Stream::new(&engine);
    let dims = vec![2, 8, 3, 3];
    let user = LayoutDescriptor::canonical(&dims).unwrap();
    let intl = LayoutDescriptor::blocked(dims.clone(), 8).unwrap();
    let data = DataHandle::zeros(user.physical_len());
    let mut buf = Buffer::new(dims, DType::F32).unwrap();
    buf.init_user(Some(data.clone()), user, &engine).unwrap();
    buf.init_conversion(&intl, ConversionDirection::UserToInternal)
        .unwrap();

    let mut pending = Vec::new();
    buf.submit(&mut pending, Some(&data)).unwrap();
    stream.submit(&pending).unwrap();
    let before = engine.stats().conversions_executed;

    let mut pending = Vec::new();
    buf.submit(&mut pending, Some(&data)).unwrap();
    stream.submit(&pending).unwrap();
    assert_eq!(engine.stats().conversions_executed, before);
}

#[test]
fn test_new_pointer_converts_exactly_once_before_next_reset() {
    let engine = Engine::cpu();
    let stream = Stream::new(&engine);
    let dims = vec![1, 4, 2, 2];
    let user = LayoutDescriptor::canonical(&dims).unwrap();
    let intl = LayoutDescriptor::plain(dims.clone(), Format::Nhwc).unwrap();
    let a = DataHandle::zeros(16);
    let b = DataHandle::from_vec((0..16).map(|v| v as f32).collect::<Vec<_>>());
    let mut buf = Buffer::new(dims, DType::F32).unwrap();
    buf.init_user(Some(a.clone()), user, &engine).unwrap();
    buf.init_conversion(&intl, ConversionDirection::UserToInternal)
        .unwrap();

    let mut pending = Vec::new();
    buf.submit(&mut pending, Some(&a)).unwrap();
    stream.submit(&pending).unwrap();
    assert_eq!(buf.conversions_executed(), 1);

    let mut pending = Vec::new();
    buf.submit(&mut pending, Some(&b)).unwrap();
    buf.submit(&mut pending, Some(&b)).unwrap();
    stream.submit(&pending).unwrap();
    assert_eq!(buf.conversions_executed(), 2);
    let expected: Vec<f32> = (0..16).map(|v| v as f32).collect();
    assert_eq!(
        buf.require_internal().unwrap().read_canonical().unwrap(),
        expected
    );
}
