use std::f64::consts::{FRAC_1_SQRT_2, PI};

use super::types::NoiseKind;

/// Per-path seed, independent of how paths are split into batches.
pub(crate) fn derive_path_seed(base_seed: u64, path_index: u64) -> u64 {
    splitmix64(base_seed ^ path_index.rotate_left(32) ^ 0x5EED_0F_u64)
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// xorshift64* source feeding the variate generators. One per trajectory.
pub(crate) struct Rng {
    state: u64,
    cached_normal: Option<f64>,
}

impl Rng {
    pub(crate) fn new(seed: u64) -> Self {
        let state = if seed == 0 {
            0xA5A5_A5A5_A5A5_A5A5
        } else {
            seed
        };
        Self {
            state,
            cached_normal: None,
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    /// Uniform on the open interval (0, 1); never returns exactly 0 or 1.
    pub(crate) fn next_f64(&mut self) -> f64 {
        const DENOM: f64 = (1_u64 << 53) as f64;
        let v = self.next_u64() >> 11;
        ((v as f64) + 0.5) / DENOM
    }

    /// Box-Muller; the sine branch is cached and returned on the next call.
    pub(crate) fn standard_normal(&mut self) -> f64 {
        if let Some(z) = self.cached_normal.take() {
            return z;
        }

        let u1 = self.next_f64();
        let u2 = self.next_f64();
        let r = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * PI * u2;

        self.cached_normal = Some(r * theta.sin());
        r * theta.cos()
    }

    /// Inverse-CDF Laplace draw with the given scale (variance `2 * scale^2`).
    pub(crate) fn laplace(&mut self, scale: f64) -> f64 {
        let u = self.next_f64() - 0.5;
        -scale * u.signum() * (1.0 - 2.0 * u.abs()).ln()
    }

    /// Knuth's product-of-uniforms Poisson sampler. Intended for small `lambda`.
    pub(crate) fn poisson_count(&mut self, lambda: f64) -> u32 {
        if lambda <= 0.0 {
            return 0;
        }
        let limit = (-lambda).exp();
        let mut count = 0_u32;
        let mut product = self.next_f64();
        while product > limit {
            count += 1;
            product *= self.next_f64();
        }
        count
    }

    /// Zero-mean, unit-variance draw from the requested family.
    pub(crate) fn unit_noise(&mut self, kind: NoiseKind) -> f64 {
        match kind {
            NoiseKind::Gaussian => self.standard_normal(),
            NoiseKind::Laplace => self.laplace(FRAC_1_SQRT_2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mean_and_variance(samples: &[f64]) -> (f64, f64) {
        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        let var = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        (mean, var)
    }

    #[test]
    fn uniform_stays_inside_open_interval() {
        let mut rng = Rng::new(0);
        for _ in 0..100_000 {
            let u = rng.next_f64();
            assert!(u > 0.0 && u < 1.0, "u = {u}");
        }
    }

    #[test]
    fn same_seed_same_stream() {
        let mut a = Rng::new(99);
        let mut b = Rng::new(99);
        for _ in 0..64 {
            assert_eq!(a.standard_normal().to_bits(), b.standard_normal().to_bits());
        }
    }

    #[test]
    fn standard_normal_moments() {
        let mut rng = Rng::new(7);
        let samples: Vec<f64> = (0..200_000).map(|_| rng.standard_normal()).collect();
        let (mean, var) = mean_and_variance(&samples);
        assert!(mean.abs() < 0.01, "mean = {mean}");
        assert!((var - 1.0).abs() < 0.02, "var = {var}");
    }

    #[test]
    fn laplace_unit_noise_has_unit_variance_and_fat_tails() {
        let mut rng = Rng::new(11);
        let samples: Vec<f64> = (0..200_000)
            .map(|_| rng.unit_noise(NoiseKind::Laplace))
            .collect();
        let (mean, var) = mean_and_variance(&samples);
        assert!(mean.abs() < 0.01, "mean = {mean}");
        assert!((var - 1.0).abs() < 0.03, "var = {var}");

        let beyond_four = samples.iter().filter(|x| x.abs() > 4.0).count();
        // Gaussian would give ~13 of 200k; Laplace(1/sqrt2) gives ~700.
        assert!(beyond_four > 200, "tail count = {beyond_four}");
    }

    #[test]
    fn poisson_mean_matches_lambda() {
        let mut rng = Rng::new(3);
        for lambda in [0.05, 0.5, 3.0] {
            let n = 100_000;
            let total: u64 = (0..n).map(|_| rng.poisson_count(lambda) as u64).sum();
            let mean = total as f64 / n as f64;
            assert!(
                (mean - lambda).abs() < 0.03 * lambda.max(1.0),
                "lambda {lambda}: mean {mean}"
            );
        }
    }

    #[test]
    fn poisson_with_zero_rate_never_jumps() {
        let mut rng = Rng::new(5);
        assert!((0..1_000).all(|_| rng.poisson_count(0.0) == 0));
    }

    #[test]
    fn path_seeds_differ_per_index_and_base() {
        let a = derive_path_seed(42, 0);
        let b = derive_path_seed(42, 1);
        let c = derive_path_seed(43, 0);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, derive_path_seed(42, 0));
    }
}
