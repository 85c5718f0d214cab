use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};

use crate::Result;

/// How a tensor's initial values are drawn.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    Zeros,
    Ones,
    /// Xavier (Glorot) uniform: `U(-r, r)` with `r = sqrt(6 / (fan_in + fan_out))`.
    XavierUniform {
        fan_in: usize,
        fan_out: usize,
    },
    Normal {
        mean: f32,
        std_dev: f32,
    },
}

impl Init {
    /// Fills `out` with values following this initialization.
    ///
    /// # Arguments
    /// * `rng` - A random number generator.
    /// * `out` - The tensor's slice of the flat buffer.
    ///
    /// # Returns
    /// An error if the distribution can't be built from its parameters.
    pub fn fill<R: Rng + ?Sized>(&self, rng: &mut R, out: &mut [f32]) -> Result<()> {
        match *self {
            Init::Zeros => out.fill(0.0),
            Init::Ones => out.fill(1.0),
            Init::XavierUniform { fan_in, fan_out } => {
                let range = (6. / (fan_in + fan_out).max(1) as f32).sqrt();
                let dist = Uniform::new(-range, range)?;
                out.iter_mut().for_each(|w| *w = dist.sample(rng));
            }
            Init::Normal { mean, std_dev } => {
                let dist = Normal::new(mean, std_dev)?;
                out.iter_mut().for_each(|w| *w = dist.sample(rng));
            }
        }

        Ok(())
    }
}
