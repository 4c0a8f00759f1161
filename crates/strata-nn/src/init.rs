// init — Weight initialization for stage kinds that own parameters
//
//   constant(dims, val)          — all elements = val
//   uniform(dims, low, high)     — U(low, high)
//   kaiming_uniform(dims, mode)  — He uniform, bound = sqrt(6 / fan)
//
// Values are produced in canonical order. A seed makes the draw
// reproducible (StdRng), otherwise thread_rng is used.

use rand::rngs::StdRng;
use rand::{thread_rng, Rng, SeedableRng};

/// Fan computation mode for Kaiming initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FanMode {
    /// Use fan_in (input features).
    #[default]
    FanIn,
    /// Use fan_out (output features).
    FanOut,
}

/// (fan_in, fan_out) for weight dims [o], [o, i] or [o, i, kh, kw].
fn compute_fans(dims: &[usize]) -> (f64, f64) {
    match dims.len() {
        0 => (1.0, 1.0),
        1 => (dims[0] as f64, dims[0] as f64),
        2 => (dims[1] as f64, dims[0] as f64),
        _ => {
            let receptive_field: usize = dims[2..].iter().product();
            let fan_in = dims[1] as f64 * receptive_field as f64;
            let fan_out = dims[0] as f64 * receptive_field as f64;
            (fan_in, fan_out)
        }
    }
}

pub fn constant(dims: &[usize], val: f32) -> Vec<f32> {
    vec![val; dims.iter().product()]
}

pub fn uniform(dims: &[usize], low: f32, high: f32, seed: Option<u64>) -> Vec<f32> {
    let n: usize = dims.iter().product();
    match seed {
        Some(s) => {
            let mut rng = StdRng::seed_from_u64(s);
            (0..n).map(|_| rng.gen_range(low..high)).collect()
        }
        None => {
            let mut rng = thread_rng();
            (0..n).map(|_| rng.gen_range(low..high)).collect()
        }
    }
}

/// He uniform: U(-bound, bound) with bound = sqrt(6 / fan).
pub fn kaiming_uniform(dims: &[usize], mode: FanMode, seed: Option<u64>) -> Vec<f32> {
    let (fan_in, fan_out) = compute_fans(dims);
    let fan = match mode {
        FanMode::FanIn => fan_in,
        FanMode::FanOut => fan_out,
    };
    let bound = (6.0 / fan.max(1.0)).sqrt() as f32;
    uniform(dims, -bound, bound, seed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kaiming_bound() {
        let w = kaiming_uniform(&[16, 6], FanMode::FanIn, Some(7));
        let bound = 1.0f32;
        assert_eq!(w.len(), 96);
        assert!(w.iter().all(|v| v.abs() <= bound));
    }

    #[test]
    fn test_seed_is_reproducible() {
        let a = uniform(&[4, 4], -1.0, 1.0, Some(42));
        let b = uniform(&[4, 4], -1.0, 1.0, Some(42));
        assert_eq!(a, b);
    }

    #[test]
    fn test_constant_fills_every_element() {
        assert_eq!(constant(&[2, 3], 0.5), vec![0.5; 6]);
    }

    #[test]
    fn test_fans() {
        assert_eq!(compute_fans(&[8, 4]), (4.0, 8.0));
        assert_eq!(compute_fans(&[8, 4, 3, 3]), (36.0, 72.0));
    }
}
