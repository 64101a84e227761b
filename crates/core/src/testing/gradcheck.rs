use candle_core::{DType, Result, Tensor};

/// Central finite-difference gradient of `sum(f(input) * dout)` with respect
/// to `input`, evaluated in `f64`.
///
/// Costs two evaluations of `f` per element of `input`; meant for tiny
/// problems.
pub fn numerical_grad<F, E>(f: F, input: &Tensor, dout: &Tensor, eps: f64) -> Result<Tensor>
where
    F: Fn(&Tensor) -> std::result::Result<Tensor, E>,
    E: std::error::Error + Send + Sync + 'static,
{
    let dims = input.dims().to_vec();
    let device = input.device();
    let base = input.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
    let dout = dout.to_dtype(DType::F64)?;

    let objective = |values: &[f64]| -> Result<f64> {
        let probe = Tensor::from_slice(values, dims.as_slice(), device)?;
        let out = f(&probe).map_err(candle_core::Error::wrap)?;
        out.to_dtype(DType::F64)?
            .mul(&dout)?
            .sum_all()?
            .to_scalar::<f64>()
    };

    let mut probe = base.clone();
    let mut grad = Vec::with_capacity(base.len());
    for i in 0..base.len() {
        probe[i] = base[i] + eps;
        let plus = objective(&probe)?;
        probe[i] = base[i] - eps;
        let minus = objective(&probe)?;
        probe[i] = base[i];
        grad.push((plus - minus) / (2.0 * eps));
    }
    Tensor::from_vec(grad, dims, device)
}
