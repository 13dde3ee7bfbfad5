//! Weight initialization for layer parameters.
//!
//! Strategies are described by [`WeightInit`] so they can live in a
//! serialized configuration, and are sampled with `rand`/`rand_distr`.

use crate::{
    error::{Result, TensorustError},
    tensor::Scalar,
};
use rand::{
    distributions::{Distribution, Uniform},
    rngs::StdRng,
    Rng, SeedableRng,
};
use rand_distr::Normal;
use serde::{Deserialize, Serialize};

/// How a weight matrix is filled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightInit {
    /// Glorot uniform: `U(-a, a)` with `a = sqrt(6 / (fan_in + fan_out))`.
    XavierUniform,
    /// Zero-mean normal with the given standard deviation.
    Normal { std: f64 },
    /// Uniform in `[low, high)`.
    Uniform { low: f64, high: f64 },
    /// Every weight set to the same value.
    Constant(f64),
}

impl Default for WeightInit {
    fn default() -> Self {
        WeightInit::XavierUniform
    }
}

impl WeightInit {
    pub fn validate(&self) -> Result<()> {
        match *self {
            WeightInit::Normal { std } if !(std.is_finite() && std >= 0.0) => Err(
                TensorustError::InvalidConfig(format!("normal std must be finite and >= 0, got {std}")),
            ),
            WeightInit::Uniform { low, high } if !(low < high) => Err(TensorustError::InvalidConfig(
                format!("uniform range [{low}, {high}) is empty"),
            )),
            WeightInit::Constant(v) if !v.is_finite() => Err(TensorustError::InvalidConfig(
                format!("constant init must be finite, got {v}"),
            )),
            _ => Ok(()),
        }
    }

    /// Samples `fan_out * fan_in` weights.
    pub fn sample<T: Scalar>(&self, fan_in: usize, fan_out: usize, rng: &mut impl Rng) -> Result<Vec<T>> {
        self.validate()?;
        let len = fan_in * fan_out;
        let values: Vec<f64> = match *self {
            WeightInit::XavierUniform => {
                let bound = (6.0 / (fan_in + fan_out).max(1) as f64).sqrt();
                let dist = Uniform::new_inclusive(-bound, bound);
                (0..len).map(|_| dist.sample(rng)).collect()
            }
            WeightInit::Normal { std } => {
                let dist = Normal::new(0.0, std)
                    .map_err(|e| TensorustError::InvalidConfig(e.to_string()))?;
                (0..len).map(|_| dist.sample(rng)).collect()
            }
            WeightInit::Uniform { low, high } => {
                let dist = Uniform::new(low, high);
                (0..len).map(|_| dist.sample(rng)).collect()
            }
            WeightInit::Constant(v) => vec![v; len],
        };
        values.into_iter().map(cast::<T>).collect()
    }
}

/// Seeded generator when a seed is configured, entropy-seeded otherwise.
pub fn rng_from_seed(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Converts a configuration constant into the element type.
pub(crate) fn cast<T: Scalar>(value: f64) -> Result<T> {
    T::from(value).ok_or_else(|| {
        TensorustError::InvalidConfig(format!("{value} is not representable in the element type"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xavier_bounds() {
        let mut rng = rng_from_seed(Some(7));
        let w: Vec<f32> = WeightInit::XavierUniform.sample(4, 8, &mut rng).unwrap();
        let bound = (6.0f32 / 12.0).sqrt();
        assert_eq!(w.len(), 32);
        assert!(w.iter().all(|v| v.abs() <= bound + 1e-6));
    }

    #[test]
    fn test_seed_is_deterministic() {
        let a: Vec<f64> = WeightInit::Normal { std: 0.1 }
            .sample(3, 3, &mut rng_from_seed(Some(42)))
            .unwrap();
        let b: Vec<f64> = WeightInit::Normal { std: 0.1 }
            .sample(3, 3, &mut rng_from_seed(Some(42)))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_invalid_uniform_rejected() {
        let init = WeightInit::Uniform { low: 1.0, high: 1.0 };
        assert!(init.validate().is_err());
        let res: Result<Vec<f32>> = init.sample(2, 2, &mut rng_from_seed(Some(0)));
        assert!(res.is_err());
    }
}
