use candle_core::{DType, Device, Result, Shape, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Uniform `[-1, 1)` values on the CPU, reproducible from `seed`.
pub fn random_tensor<S: Into<Shape>>(shape: S, dtype: DType, seed: u64) -> Result<Tensor> {
    let shape = shape.into();
    let mut rng = StdRng::seed_from_u64(seed);
    let data: Vec<f64> = (0..shape.elem_count())
        .map(|_| rng.gen_range(-1.0..1.0))
        .collect();
    Tensor::from_vec(data, shape, &Device::Cpu)?.to_dtype(dtype)
}

/// `(batch, seqlen)` segment ids: each row starts at 0 and increments at
/// `segments - 1` random boundaries (fewer if the row is too short).
pub fn random_seq_idx(batch: usize, seqlen: usize, segments: usize, seed: u64) -> Result<Tensor> {
    let mut rng = StdRng::seed_from_u64(seed);
    let cuts = segments.saturating_sub(1).min(seqlen.saturating_sub(1));
    let mut ids = Vec::with_capacity(batch * seqlen);
    for _ in 0..batch {
        let mut boundary = vec![false; seqlen];
        for pos in rand::seq::index::sample(&mut rng, seqlen.saturating_sub(1), cuts).into_iter() {
            boundary[pos + 1] = true;
        }
        let mut id = 0i64;
        for is_start in boundary {
            if is_start {
                id += 1;
            }
            ids.push(id);
        }
    }
    Tensor::from_vec(ids, (batch, seqlen), &Device::Cpu)
}

/// Largest elementwise `|a - b|`, compared in `f64`.
pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f64> {
    if a.elem_count() == 0 {
        return Ok(0.0);
    }
    let diff = (a.to_dtype(DType::F64)? - b.to_dtype(DType::F64)?)?;
    diff.abs()?.flatten_all()?.max(0)?.to_scalar::<f64>()
}

/// Absolute tolerance for comparing results stored in `dtype`.
pub fn default_tolerance(dtype: DType) -> f64 {
    match dtype {
        DType::F64 => 1e-10,
        DType::F32 => 1e-5,
        DType::F16 => 1e-2,
        DType::BF16 => 5e-2,
        _ => 0.0,
    }
}
