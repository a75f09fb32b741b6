//! Metric kinds and pairwise distance kernels.
//!
//! Inner product is a similarity (larger is better); the L2 family are
//! distances (smaller is better). Kinds above L2 carry a scalar argument,
//! e.g. the exponent of the Minkowski metric.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricKind {
    InnerProduct,
    L2,
    Lp,
    Linf,
}

impl MetricKind {
    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            0 => Ok(MetricKind::InnerProduct),
            1 => Ok(MetricKind::L2),
            2 => Ok(MetricKind::Lp),
            3 => Ok(MetricKind::Linf),
            other => Err(Error::UnsupportedMetric(other)),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            MetricKind::InnerProduct => 0,
            MetricKind::L2 => 1,
            MetricKind::Lp => 2,
            MetricKind::Linf => 3,
        }
    }

    pub fn higher_is_better(self) -> bool {
        matches!(self, MetricKind::InnerProduct)
    }

    /// The sentinel filling unreached result slots.
    pub fn worst(self) -> f32 {
        if self.higher_is_better() {
            f32::NEG_INFINITY
        } else {
            f32::INFINITY
        }
    }

    /// Whether `a` is a strictly better score than `b` under this metric.
    pub fn is_better(self, a: f32, b: f32) -> bool {
        if self.higher_is_better() {
            a > b
        } else {
            a < b
        }
    }
}

/// Pairwise score between `a` and `b` under `metric`.
#[inline]
pub fn distance(metric: MetricKind, metric_arg: f32, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        MetricKind::InnerProduct => dot(a, b),
        MetricKind::L2 => l2_sqr(a, b),
        MetricKind::Lp => lp(a, b, metric_arg),
        MetricKind::Linf => linf(a, b),
    }
}

#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    #[cfg(target_arch = "x86_64")]
    {
        if std::is_x86_feature_detected!("avx2") && a.len() >= 8 {
            unsafe {
                return dot_avx2(a, b);
            }
        }
    }
    dot_scalar(a, b)
}

/// Squared euclidean distance, the L2 convention of the search kernels.
#[inline]
pub fn l2_sqr(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    #[cfg(target_arch = "x86_64")]
    {
        if std::is_x86_feature_detected!("avx2") && a.len() >= 8 {
            unsafe {
                return l2_sqr_avx2(a, b);
            }
        }
    }
    l2_sqr_scalar(a, b)
}

#[inline]
fn lp(a: &[f32], b: &[f32], p: f32) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs().powf(p))
        .sum()
}

#[inline]
fn linf(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0f32, f32::max)
}

#[inline]
fn dot_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[inline]
fn l2_sqr_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum()
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn dot_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let mut acc = _mm256_setzero_ps();
    let mut i = 0usize;
    while i + 8 <= a.len() {
        let va = _mm256_loadu_ps(a.as_ptr().add(i));
        let vb = _mm256_loadu_ps(b.as_ptr().add(i));
        acc = _mm256_add_ps(acc, _mm256_mul_ps(va, vb));
        i += 8;
    }
    let mut tmp = [0f32; 8];
    _mm256_storeu_ps(tmp.as_mut_ptr(), acc);
    let mut sum = tmp.iter().sum::<f32>();
    while i < a.len() {
        sum += a[i] * b[i];
        i += 1;
    }
    sum
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn l2_sqr_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let mut acc = _mm256_setzero_ps();
    let mut i = 0usize;
    while i + 8 <= a.len() {
        let va = _mm256_loadu_ps(a.as_ptr().add(i));
        let vb = _mm256_loadu_ps(b.as_ptr().add(i));
        let diff = _mm256_sub_ps(va, vb);
        acc = _mm256_add_ps(acc, _mm256_mul_ps(diff, diff));
        i += 8;
    }
    let mut tmp = [0f32; 8];
    _mm256_storeu_ps(tmp.as_mut_ptr(), acc);
    let mut sum = tmp.iter().sum::<f32>();
    while i < a.len() {
        let diff = a[i] - b[i];
        sum += diff * diff;
        i += 1;
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn approx_close(expected: f32, actual: f32, eps: f32) -> bool {
        let allowance = eps.max(expected.abs() * 1e-5);
        (expected - actual).abs() <= allowance
    }

    #[test]
    fn dot_matches_scalar() {
        let mut rng = StdRng::seed_from_u64(42);
        for dim in [8usize, 17, 128, 384, 1024] {
            let a: Vec<f32> = (0..dim).map(|_| rng.gen()).collect();
            let b: Vec<f32> = (0..dim).map(|_| rng.gen()).collect();
            let scalar = dot_scalar(&a, &b);
            let fast = dot(&a, &b);
            assert!(
                approx_close(scalar, fast, 1e-4),
                "dim={dim} scalar={scalar} fast={fast}"
            );
        }
    }

    #[test]
    fn l2_matches_scalar() {
        let mut rng = StdRng::seed_from_u64(7);
        for dim in [8usize, 33, 512] {
            let a: Vec<f32> = (0..dim).map(|_| rng.gen()).collect();
            let b: Vec<f32> = (0..dim).map(|_| rng.gen()).collect();
            let scalar = l2_sqr_scalar(&a, &b);
            let fast = l2_sqr(&a, &b);
            assert!(approx_close(scalar, fast, 1e-4));
        }
    }

    #[test]
    fn metric_codes_round_trip() {
        for code in 0..4 {
            assert_eq!(MetricKind::from_code(code).unwrap().code(), code);
        }
        assert!(matches!(
            MetricKind::from_code(9),
            Err(Error::UnsupportedMetric(9))
        ));
    }

    #[test]
    fn ordering_follows_metric() {
        assert!(MetricKind::InnerProduct.is_better(0.9, 0.2));
        assert!(MetricKind::L2.is_better(0.2, 0.9));
        assert_eq!(MetricKind::InnerProduct.worst(), f32::NEG_INFINITY);
        assert_eq!(MetricKind::L2.worst(), f32::INFINITY);
    }

    #[test]
    fn extra_metrics() {
        let a = [1.0f32, 2.0, 3.0];
        let b = [0.0f32, 0.0, 0.0];
        assert!(approx_close(distance(MetricKind::Lp, 1.0, &a, &b), 6.0, 1e-5));
        assert!(approx_close(distance(MetricKind::Linf, 0.0, &a, &b), 3.0, 1e-5));
    }
}
