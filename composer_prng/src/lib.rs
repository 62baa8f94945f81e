// Seeded random streams for the composer.
//
// xoshiro256++ (Blackman & Vigna) behind a SplitMix64 seeder. Weight
// initialisation, bar sampling, noise and composed velocities all draw from a `ComposerRng`; each component forks its own stream from the
// root seed in a fixed order, so one seed pins down a whole training run and
// its composition on every platform.
//
// The state update is integer-only. Float helpers are derived from the
// integer stream and never feed back into it.

use serde::{Deserialize, Serialize};

const SPLITMIX_GAMMA: u64 = 0x9e37_79b9_7f4a_7c15;

/// One SplitMix64 step; expands a single seed word into state words.
fn splitmix_next(state: &mut u64) -> u64 {
    *state = state.wrapping_add(SPLITMIX_GAMMA);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// A xoshiro256++ stream. Serializable so a run can checkpoint its position.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposerRng {
    state: [u64; 4],
}

impl ComposerRng {
    /// Seeds all four state words from `seed` via SplitMix64, so nearby
    /// seeds (0, 1, 2, ...) still give unrelated streams.
    pub fn new(seed: u64) -> Self {
        let mut sm = seed;
        let state = std::array::from_fn(|_| splitmix_next(&mut sm));
        ComposerRng { state }
    }

    /// A child stream seeded from this one's next output. Forking the same
    /// parent in the same order gives the same children.
    pub fn fork(&mut self) -> Self {
        ComposerRng::new(self.next_u64())
    }

    /// Next 64 bits of the stream; every other draw is built on this.
    pub fn next_u64(&mut self) -> u64 {
        let [a, b, c, d] = &mut self.state;
        let out = a.wrapping_add(*d).rotate_left(23).wrapping_add(*a);
        let shifted = *b << 17;
        *c ^= *a;
        *d ^= *b;
        *b ^= *c;
        *a ^= *d;
        *c ^= shifted;
        *d = d.rotate_left(45);
        out
    }

    /// Uniform in [0, 1) with 53 bits of precision.
    pub fn next_f64(&mut self) -> f64 {
        const SCALE: f64 = 1.0 / (1u64 << 53) as f64;
        (self.next_u64() >> 11) as f64 * SCALE
    }

    /// Uniform in `[low, high)`. Panics unless `low < high`.
    pub fn range_f64(&mut self, low: f64, high: f64) -> f64 {
        assert!(low < high, "empty float range [{low}, {high})");
        low + (high - low) * self.next_f64()
    }

    /// Uniform in `[low, high)` without modulo bias (widening multiply with
    /// rejection). Panics unless `low < high`.
    pub fn range_u64(&mut self, low: u64, high: u64) -> u64 {
        assert!(low < high, "empty integer range [{low}, {high})");
        let span = high - low;
        let floor = span.wrapping_neg() % span;
        loop {
            let wide = u128::from(self.next_u64()) * u128::from(span);
            if (wide as u64) >= floor {
                return low + (wide >> 64) as u64;
            }
        }
    }

    pub fn range_usize(&mut self, low: usize, high: usize) -> usize {
        self.range_u64(low as u64, high as u64) as usize
    }

    /// `true` with probability `p`.
    pub fn random_bool(&mut self, p: f64) -> bool {
        self.next_f64() < p
    }

    /// Standard normal draw (Box-Muller, cosine branch).
    pub fn next_gaussian(&mut self) -> f64 {
        // Shifted into (0, 1] so the logarithm stays finite.
        let radius = (-2.0 * (1.0 - self.next_f64()).ln()).sqrt();
        let angle = std::f64::consts::TAU * self.next_f64();
        radius * angle.cos()
    }

    pub fn gaussian(&mut self, mean: f64, std: f64) -> f64 {
        mean + std * self.next_gaussian()
    }

    /// `k` distinct indices from `0..n`, in random order. Panics if `k > n`.
    pub fn choose_distinct(&mut self, n: usize, k: usize) -> Vec<usize> {
        assert!(k <= n, "cannot choose {k} distinct values from {n}");
        let mut pool: Vec<usize> = (0..n).collect();
        for i in 0..k {
            let j = self.range_usize(i, n);
            pool.swap(i, j);
        }
        pool.truncate(k);
        pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_fixes_stream() {
        let mut a = ComposerRng::new(42);
        let mut b = ComposerRng::new(42);
        assert!((0..1000).all(|_| a.next_u64() == b.next_u64()));
        let mut c = ComposerRng::new(43);
        assert_ne!(ComposerRng::new(42).next_u64(), c.next_u64());
    }

    #[test]
    fn test_fork_order_is_reproducible() {
        let mut left = ComposerRng::new(7);
        let mut right = ComposerRng::new(7);
        let mut first = left.fork();
        let mut second = left.fork();
        let mut mirror = right.fork();
        assert_eq!(first, mirror);
        assert_eq!(first.next_u64(), mirror.next_u64());
        assert_ne!(first.next_u64(), second.next_u64());
    }

    #[test]
    fn test_float_ranges() {
        let mut rng = ComposerRng::new(12345);
        for _ in 0..10_000 {
            assert!((0.0..1.0).contains(&rng.next_f64()));
            let v = rng.range_f64(-0.5, 0.5);
            assert!((-0.5..0.5).contains(&v), "{v}");
        }
    }

    #[test]
    fn test_integer_range_hits_every_value() {
        let mut rng = ComposerRng::new(555);
        let mut seen = [0usize; 10];
        for _ in 0..10_000 {
            let v = rng.range_usize(5, 15);
            assert!((5..15).contains(&v), "{v}");
            seen[v - 5] += 1;
        }
        assert!(seen.iter().all(|&count| count > 800));
        assert_eq!(rng.range_u64(3, 4), 3);
    }

    #[test]
    fn test_random_bool_extremes() {
        let mut rng = ComposerRng::new(42);
        assert!((0..100).all(|_| !rng.random_bool(0.0)));
        assert!((0..100).all(|_| rng.random_bool(1.0)));
    }

    #[test]
    fn test_gaussian_moments() {
        let mut rng = ComposerRng::new(2024);
        let n = 20_000;
        let samples: Vec<f64> = (0..n).map(|_| rng.gaussian(64.0, 8.0)).collect();
        let mean = samples.iter().sum::<f64>() / n as f64;
        let std = (samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64).sqrt();
        assert!((mean - 64.0).abs() < 0.3, "mean {mean}");
        assert!((std - 8.0).abs() < 0.3, "std {std}");
        assert!(samples.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_choose_distinct() {
        let mut rng = ComposerRng::new(99);
        for k in 0..=12 {
            let mut picked = rng.choose_distinct(12, k);
            assert_eq!(picked.len(), k);
            picked.sort_unstable();
            picked.dedup();
            assert_eq!(picked.len(), k);
            assert!(picked.iter().all(|&i| i < 12));
        }
    }

    #[test]
    fn test_state_survives_json() {
        let mut rng = ComposerRng::new(42);
        rng.fork();
        let json = serde_json::to_string(&rng).unwrap();
        let mut restored: ComposerRng = serde_json::from_str(&json).unwrap();
        assert!((0..100).all(|_| rng.next_u64() == restored.next_u64()));
    }
}
