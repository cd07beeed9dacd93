//! Pluggable distance functions (spec.md §6).
//!
//! Grounded on `crates/engine/src/primitives/vector/distance.rs`: same
//! three metrics, same "lower distance = more similar" contract.

use serde::{Deserialize, Serialize};

/// Identifies which built-in distance function a collection/index uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceMetric {
    /// `1 - cosine_similarity(a, b)` — the spec.md default.
    Cosine,
    /// Euclidean (L2) distance.
    Euclidean,
    /// `1 - dot(a, b)`, appropriate for pre-normalized vectors.
    Dot,
}

impl Default for DistanceMetric {
    fn default() -> Self {
        DistanceMetric::Cosine
    }
}

/// A distance function: `dist(a, b) -> f32 >= 0` (spec.md §6).
pub trait DistanceFn: Send + Sync {
    /// Compute the distance between two equal-length vectors.
    fn distance(&self, a: &[f32], b: &[f32]) -> f32;
    /// Which metric this implements, for persistence/round-tripping.
    fn metric(&self) -> DistanceMetric;
}

/// Resolve a [`DistanceMetric`] to its [`DistanceFn`] implementation.
pub fn resolve(metric: DistanceMetric) -> Box<dyn DistanceFn> {
    match metric {
        DistanceMetric::Cosine => Box::new(Cosine),
        DistanceMetric::Euclidean => Box::new(Euclidean),
        DistanceMetric::Dot => Box::new(Dot),
    }
}

struct Cosine;
impl DistanceFn for Cosine {
    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        cosine_distance(a, b)
    }
    fn metric(&self) -> DistanceMetric {
        DistanceMetric::Cosine
    }
}

struct Euclidean;
impl DistanceFn for Euclidean {
    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        euclidean_distance(a, b)
    }
    fn metric(&self) -> DistanceMetric {
        DistanceMetric::Euclidean
    }
}

struct Dot;
impl DistanceFn for Dot {
    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        dot_distance(a, b)
    }
    fn metric(&self) -> DistanceMetric {
        DistanceMetric::Dot
    }
}

/// `1 - (a . b) / (||a|| * ||b||)`, clamped to `>= 0`.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    let sim = dot / (norm_a * norm_b);
    (1.0 - sim).max(0.0)
}

/// Euclidean (L2) distance.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// `1 - dot(a, b)`, clamped to `>= 0`. Appropriate for normalized vectors.
pub fn dot_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    (1.0 - dot).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_distance_identical_vectors_is_zero() {
        let v = [1.0, 2.0, 3.0];
        assert!(cosine_distance(&v, &v) < 1e-6);
    }

    #[test]
    fn cosine_distance_orthogonal_unit_vectors() {
        let x = [1.0, 0.0, 0.0];
        let y = [0.0, 1.0, 0.0];
        assert!((cosine_distance(&x, &y) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn euclidean_matches_scenario_3_from_spec() {
        // spec.md §8 scenario 3: x=[1,0,...], y=[0,1,...] -> dist = sqrt(2)
        let mut x = vec![0.0; 8];
        x[0] = 1.0;
        let mut y = vec![0.0; 8];
        y[1] = 1.0;
        let d = euclidean_distance(&x, &y);
        assert!((d - std::f32::consts::SQRT_2).abs() < 1e-5);
    }
}
