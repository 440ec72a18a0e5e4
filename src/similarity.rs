/**
 * Similarity Engine
 * Cosine similarity between two feature vectors, mapped onto a [0, 1] confidence
 */

use serde::Serialize;

use crate::error::{FaceError, FaceResult};
use crate::extractor::FeatureVector;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ComparisonResult {
    pub confidence: f64,
    pub similarity: f64,
}

impl ComparisonResult {
    /// The only way to build a result: confidence is always (similarity + 1) / 2.
    /// A non-finite similarity is treated like a degenerate vector and scores 0.
    pub fn from_similarity(similarity: f64) -> Self {
        let similarity = if similarity.is_finite() {
            similarity.clamp(-1.0, 1.0)
        } else {
            0.0
        };
        Self {
            confidence: (similarity + 1.0) / 2.0,
            similarity,
        }
    }
}

/// Score two vectors that must both have the system dimension.
///
/// A zero-norm vector on either side scores a similarity of 0.
pub fn score(a: &FeatureVector, b: &FeatureVector, dimension: usize) -> FaceResult<ComparisonResult> {
    for v in [a, b] {
        if v.dimension() != dimension {
            return Err(FaceError::DimensionMismatch {
                expected: dimension,
                actual: v.dimension(),
            });
        }
    }

    Ok(ComparisonResult::from_similarity(cosine_similarity(
        a.as_slice(),
        b.as_slice(),
    )))
}

/// Each side is scaled by its largest magnitude first, so squaring cannot
/// overflow or underflow for any finite input.
pub fn cosine_similarity(lhs: &[f64], rhs: &[f64]) -> f64 {
    let scale_lhs = max_abs(lhs);
    let scale_rhs = max_abs(rhs);
    if scale_lhs == 0.0 || scale_rhs == 0.0 {
        return 0.0;
    }

    let mut dot = 0.0;
    let mut norm_lhs = 0.0;
    let mut norm_rhs = 0.0;

    for (l, r) in lhs.iter().zip(rhs.iter()) {
        let l = l / scale_lhs;
        let r = r / scale_rhs;
        dot += l * r;
        norm_lhs += l * l;
        norm_rhs += r * r;
    }

    let similarity = dot / (norm_lhs.sqrt() * norm_rhs.sqrt());
    if similarity.is_finite() {
        similarity
    } else {
        0.0
    }
}

fn max_abs(values: &[f64]) -> f64 {
    values.iter().fold(0.0, |acc: f64, v| acc.max(v.abs()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(values: &[f64]) -> FeatureVector {
        FeatureVector::new(values.to_vec()).unwrap()
    }

    #[test]
    fn symmetric() {
        let pairs = [
            (vec![0.1, 0.2, 0.3], vec![0.3, -0.2, 0.9]),
            (vec![1e-9, 5.0, -3.0], vec![7.0, 0.0, 0.25]),
            (vec![0.0, 0.0, 0.0], vec![1.0, 2.0, 3.0]),
        ];
        for (a, b) in pairs {
            let ab = score(&v(&a), &v(&b), 3).unwrap();
            let ba = score(&v(&b), &v(&a), 3).unwrap();
            assert_eq!(ab.confidence, ba.confidence);
        }
    }

    #[test]
    fn self_similarity_is_one() {
        let a = v(&[0.10, 0.20, 0.05, -0.7]);
        let result = score(&a, &a, 4).unwrap();
        assert!((result.confidence - 1.0).abs() < 1e-12);
        assert!(result.similarity <= 1.0);
    }

    #[test]
    fn zero_vector_scores_half() {
        let zero = v(&[0.0, 0.0, 0.0]);
        let other = v(&[0.1, 0.2, 0.3]);
        let result = score(&zero, &other, 3).unwrap();
        assert_eq!(result.similarity, 0.0);
        assert_eq!(result.confidence, 0.5);
    }

    #[test]
    fn opposite_vectors_score_zero_confidence() {
        let result = score(&v(&[1.0, 2.0]), &v(&[-1.0, -2.0]), 2).unwrap();
        assert!((result.similarity + 1.0).abs() < 1e-12);
        assert!(result.confidence.abs() < 1e-12);
    }

    #[test]
    fn confidence_mapping_and_monotonicity() {
        let mut last = -1.0;
        for step in 0..=20 {
            let s = -1.0 + f64::from(step) * 0.1;
            let result = ComparisonResult::from_similarity(s);
            assert!((result.confidence - (result.similarity + 1.0) / 2.0).abs() < 1e-15);
            assert!(result.confidence >= last);
            last = result.confidence;
        }
    }

    #[test]
    fn dimension_mismatch_is_an_error() {
        let err = score(&v(&[0.1, 0.2]), &v(&[0.1, 0.2, 0.3]), 3).unwrap_err();
        assert!(matches!(
            err,
            FaceError::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        ));
        // equal lengths, but not the system dimension
        assert!(score(&v(&[0.1, 0.2]), &v(&[0.1, 0.2]), 3).is_err());
    }

    fn signed(pattern: &[f64], magnitude: f64) -> FeatureVector {
        v(&pattern.iter().map(|p| p * magnitude).collect::<Vec<_>>())
    }

    #[test]
    fn extreme_magnitudes_stay_in_range() {
        let patterns: [&[f64]; 4] = [
            &[1.0, 1.0, 1.0],
            &[-1.0, -1.0, -1.0],
            &[1.0, -0.5, 0.25],
            &[0.0, 3.0, -7.0],
        ];
        let magnitudes: Vec<f64> = (-15..=15).map(|e| 10f64.powi(e * 20)).collect();

        for &ma in &magnitudes {
            for &mb in &magnitudes {
                for pa in patterns {
                    for pb in patterns {
                        let result = score(&signed(pa, ma), &signed(pb, mb), 3).unwrap();
                        assert!(result.confidence.is_finite(), "{ma:e} vs {mb:e}");
                        assert!((0.0..=1.0).contains(&result.confidence));
                        assert!((-1.0..=1.0).contains(&result.similarity));
                    }
                }
            }
        }
    }

    #[test]
    fn large_opposite_vectors_do_not_overflow() {
        let result = score(&v(&[1e200; 3]), &v(&[-1e200; 3]), 3).unwrap();
        assert!((result.similarity + 1.0).abs() < 1e-12);
        assert!(result.confidence.abs() < 1e-12);

        let result = score(&v(&[f64::MAX, f64::MAX]), &v(&[f64::MAX, f64::MAX]), 2).unwrap();
        assert!((result.confidence - 1.0).abs() < 1e-12);
    }

    #[test]
    fn subnormal_vectors_keep_their_direction() {
        let tiny = f64::MIN_POSITIVE / 1e10;
        let result = score(&v(&[tiny, 0.0]), &v(&[tiny, tiny]), 2).unwrap();
        assert!((result.similarity - std::f64::consts::FRAC_1_SQRT_2).abs() < 1e-9);
    }

    #[test]
    fn non_finite_similarity_scores_as_degenerate() {
        let result = ComparisonResult::from_similarity(f64::NAN);
        assert_eq!(result.similarity, 0.0);
        assert_eq!(result.confidence, 0.5);
    }
}
