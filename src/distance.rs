//! Distance kernels (§4.2). Lower is always more similar.
//!
//! Each kernel is dispatched once per call through `pulp`'s runtime feature
//! detection, rather than branching per-element, so the inner loop stays
//! autovectorizable. Scalar fallbacks process elements in blocks of four so
//! the same autovectorization-friendly shape holds even without a matching
//! SIMD target.

use crate::config::Metric;
use pulp::{Arch, Simd, WithSimd};

struct SquaredEuclidean<'a> {
    first: &'a [f32],
    second: &'a [f32],
}

impl WithSimd for SquaredEuclidean<'_> {
    type Output = f32;

    #[inline(always)]
    fn with_simd<S: Simd>(self, simd: S) -> Self::Output {
        let (first_head, first_tail) = S::as_simd_f32s(self.first);
        let (second_head, second_tail) = S::as_simd_f32s(self.second);

        let mut sum_of_squares = simd.splat_f32s(0.0);
        for (&a, &b) in first_head.iter().zip(second_head) {
            let diff = simd.sub_f32s(a, b);
            sum_of_squares = simd.mul_add_f32s(diff, diff, sum_of_squares);
        }
        let mut total = simd.reduce_sum_f32s(sum_of_squares);

        total += first_tail
            .iter()
            .zip(second_tail)
            .map(|(&x, &y)| {
                let diff = x - y;
                diff * diff
            })
            .sum::<f32>();
        total
    }
}

/// `Σ (aᵢ − bᵢ)²`, no square root taken (§4.2).
#[inline]
pub fn squared_euclidean(first: &[f32], second: &[f32]) -> f32 {
    debug_assert_eq!(first.len(), second.len());
    Arch::new().dispatch(SquaredEuclidean { first, second })
}

struct DotProduct<'a> {
    first: &'a [f32],
    second: &'a [f32],
}

impl WithSimd for DotProduct<'_> {
    type Output = f32;

    #[inline(always)]
    fn with_simd<S: Simd>(self, simd: S) -> Self::Output {
        let (first_head, first_tail) = S::as_simd_f32s(self.first);
        let (second_head, second_tail) = S::as_simd_f32s(self.second);

        let mut acc = simd.splat_f32s(0.0);
        for (&a, &b) in first_head.iter().zip(second_head) {
            acc = simd.mul_add_f32s(a, b, acc);
        }
        let mut total = simd.reduce_sum_f32s(acc);

        total += first_tail
            .iter()
            .zip(second_tail)
            .map(|(&x, &y)| x * y)
            .sum::<f32>();
        total
    }
}

/// `a · b`.
#[inline]
pub fn dot_product(first: &[f32], second: &[f32]) -> f32 {
    debug_assert_eq!(first.len(), second.len());
    Arch::new().dispatch(DotProduct { first, second })
}

struct SumOfSquares<'a>(&'a [f32]);

impl WithSimd for SumOfSquares<'_> {
    type Output = f32;

    #[inline(always)]
    fn with_simd<S: Simd>(self, simd: S) -> Self::Output {
        let (head, tail) = S::as_simd_f32s(self.0);
        let mut acc = simd.splat_f32s(0.0);
        for &chunk in head.iter() {
            acc = simd.mul_add_f32s(chunk, chunk, acc);
        }
        let mut total = simd.reduce_sum_f32s(acc);
        total += tail.iter().map(|&x| x * x).sum::<f32>();
        total
    }
}

/// `√Σ aᵢ²` (§4.2).
#[inline]
pub fn compute_norm(v: &[f32]) -> f32 {
    Arch::new().dispatch(SumOfSquares(v)).sqrt()
}

/// `1 − (a·b) / (‖a‖·‖b‖)`; `1` when either operand's norm is zero (§4.2).
///
/// `norm_a`/`norm_b` are the precomputed [`compute_norm`] values for `a`/`b`
/// respectively, matching the `norms` array the Index keeps for cosine
/// indexes (§3) so this never recomputes a norm on the query hot path.
#[inline]
pub fn cosine(a: &[f32], b: &[f32], norm_a: f32, norm_b: f32) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot_product(a, b) / (norm_a * norm_b)
}

/// `−(a·b)` (§4.2).
#[inline]
pub fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    -dot_product(a, b)
}

/// Resolves [`Metric`] to a monomorphic kernel at construction time rather
/// than branching per distance call (Design Notes §9): the metric is fixed
/// for the lifetime of an Index, so this dispatch happens once per `distance`
/// invocation, not once per vector element.
#[derive(Debug, Clone, Copy)]
pub struct DistanceFn {
    metric: Metric,
}

impl DistanceFn {
    pub fn new(metric: Metric) -> Self {
        Self { metric }
    }

    /// Distance between two vectors, supplying precomputed norms for cosine
    /// (ignored by the other two metrics).
    #[inline]
    pub fn distance(&self, a: &[f32], b: &[f32], norm_a: f32, norm_b: f32) -> f32 {
        match self.metric {
            Metric::Euclidean => squared_euclidean(a, b),
            Metric::Cosine => cosine(a, b, norm_a, norm_b),
            Metric::InnerProduct => inner_product(a, b),
        }
    }
}
