// Reference kernel helpers shared by the built-in kinds
//
// Kernels are deliberately plain: read the bound internal views into
// canonical order, compute, scatter back through the output layout. The
// layouts matter to the conversion cache, not to these loops.

use std::rc::Rc;

use strata_core::{Error, FnPrimitive, LayoutDescriptor, Memory, PrimitiveRef, Result, Shape};

pub(crate) fn expect_inputs(stage: &str, kind: &str, inputs: &[Shape], n: usize) -> Result<()> {
    if inputs.len() != n {
        return Err(Error::config(format!(
            "stage '{stage}' ({kind}) takes {n} input(s), got {}",
            inputs.len()
        )));
    }
    Ok(())
}

pub(crate) fn expect_some_inputs(stage: &str, kind: &str, inputs: &[Shape]) -> Result<()> {
    if inputs.is_empty() {
        return Err(Error::config(format!(
            "stage '{stage}' ({kind}) needs at least one input"
        )));
    }
    Ok(())
}

/// Channel-wise kinds need [n, c] or [n, c, h, w].
pub(crate) fn expect_channel_rank(stage: &str, shape: &Shape) -> Result<()> {
    match shape.rank() {
        2 | 4 => Ok(()),
        _ => Err(Error::invalid_shape(
            stage,
            shape.dims(),
            "expected rank 2 [n, c] or rank 4 [n, c, h, w]",
        )),
    }
}

/// (batch, channels, spatial positions) of a canonical tensor.
pub(crate) fn ncs(dims: &[usize]) -> (usize, usize, usize) {
    let n = dims.first().copied().unwrap_or(1);
    let c = dims.get(1).copied().unwrap_or(1);
    let s = dims.iter().skip(2).product::<usize>();
    (n, c, s)
}

/// Whether a rank-4 layout or shape has more than one spatial position.
pub(crate) fn has_spatial(dims: &[usize]) -> bool {
    dims.len() == 4 && dims[2] * dims[3] > 1
}

/// Channel-blocked layout with the given block factor for rank 4, canonical otherwise.
pub(crate) fn blocked_or_canonical(dims: &[usize], block: usize) -> Result<LayoutDescriptor> {
    if dims.len() == 4 {
        LayoutDescriptor::blocked(dims.to_vec(), block)
    } else {
        LayoutDescriptor::canonical(dims)
    }
}

/// Elementwise primitive `out = f(input)`.
pub(crate) fn unary(
    name: String,
    input: Memory,
    output: Memory,
    f: impl Fn(f32) -> f32 + 'static,
) -> PrimitiveRef {
    Rc::new(FnPrimitive::new(name, move || {
        let x = input.read_canonical()?;
        let y: Vec<f32> = x.into_iter().map(&f).collect();
        output.write_canonical(&y)
    }))
}

/// Elementwise gradient primitive `dx = g(dy, saved)`.
pub(crate) fn unary_grad(
    name: String,
    saved: Memory,
    output_grad: Memory,
    input_grad: Memory,
    g: impl Fn(f32, f32) -> f32 + 'static,
) -> PrimitiveRef {
    Rc::new(FnPrimitive::new(name, move || {
        let s = saved.read_canonical()?;
        let dy = output_grad.read_canonical()?;
        let dx: Vec<f32> = dy.iter().zip(s.iter()).map(|(&d, &v)| g(d, v)).collect();
        input_grad.write_canonical(&dx)
    }))
}
