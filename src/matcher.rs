/**
 * Match Selector
 * Full scan of a candidate set against one target vector.
 *
 * Every candidate is opened and scored; nothing stops early. A candidate
 * that cannot be opened is recorded as skipped and the scan carries on.
 * Large sets fan out over rayon, and results are collected back in
 * candidate order so the first-seen tie-break still holds.
 */

use std::sync::Arc;

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, warn};

use crate::codec::{EncryptedTemplate, TemplateCodec};
use crate::error::{FaceError, FaceResult};
use crate::extractor::FeatureVector;
use crate::similarity::{self, ComparisonResult};

/// One entry of the caller's candidate mapping, in the caller's order.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub identity: String,
    template: Result<EncryptedTemplate, FaceError>,
}

impl Candidate {
    pub fn new(identity: impl Into<String>, template: EncryptedTemplate) -> Self {
        Self {
            identity: identity.into(),
            template: Ok(template),
        }
    }

    /// A candidate whose stored form could not even be parsed. It is still
    /// part of the scan so it shows up as skipped.
    pub fn unreadable(identity: impl Into<String>, error: FaceError) -> Self {
        Self {
            identity: identity.into(),
            template: Err(error),
        }
    }

    /// Parse from the stored string form; parse failures stay with the candidate.
    pub fn from_encoded(identity: impl Into<String>, encoded: &str) -> Self {
        match EncryptedTemplate::decode(encoded) {
            Ok(template) => Self::new(identity, template),
            Err(err) => Self::unreadable(identity, err),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CandidateOutcome {
    Scored(ComparisonResult),
    Skipped { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct CandidateResult {
    pub identity: String,
    pub position: usize,
    pub outcome: CandidateOutcome,
}

impl CandidateResult {
    pub fn comparison(&self) -> Option<&ComparisonResult> {
        match &self.outcome {
            CandidateOutcome::Scored(result) => Some(result),
            CandidateOutcome::Skipped { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectedMatch {
    pub identity: String,
    pub position: usize,
    pub confidence: f64,
    pub similarity: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchReport {
    /// Every candidate, in input order.
    pub results: Vec<CandidateResult>,
    pub selected: Option<SelectedMatch>,
    pub threshold: f64,
}

impl MatchReport {
    pub fn scored(&self) -> impl Iterator<Item = (&CandidateResult, &ComparisonResult)> {
        self.results
            .iter()
            .filter_map(|r| r.comparison().map(|c| (r, c)))
    }

    pub fn skipped(&self) -> impl Iterator<Item = (&CandidateResult, &str)> {
        self.results.iter().filter_map(|r| match &r.outcome {
            CandidateOutcome::Skipped { error } => Some((r, error.as_str())),
            CandidateOutcome::Scored(_) => None,
        })
    }

    /// Highest confidence seen, whether or not it cleared the threshold.
    pub fn best_observed(&self) -> Option<f64> {
        self.scored().map(|(_, c)| c.confidence).reduce(f64::max)
    }
}

pub struct MatchSelector {
    codec: Arc<TemplateCodec>,
    dimension: usize,
    parallel_min_candidates: usize,
}

impl MatchSelector {
    pub fn new(codec: Arc<TemplateCodec>, dimension: usize, parallel_min_candidates: usize) -> Self {
        Self {
            codec,
            dimension,
            parallel_min_candidates,
        }
    }

    /// Scan all candidates and select the best one strictly above `threshold`.
    ///
    /// Fails only when the target itself is unusable; candidate failures are
    /// recorded per entry.
    pub fn best_match(
        &self,
        target: &FeatureVector,
        candidates: &[Candidate],
        threshold: f64,
    ) -> FaceResult<MatchReport> {
        if target.dimension() != self.dimension {
            return Err(FaceError::DimensionMismatch {
                expected: self.dimension,
                actual: target.dimension(),
            });
        }

        let results: Vec<CandidateResult> = if candidates.len() >= self.parallel_min_candidates {
            debug!("Scanning {} candidates in parallel", candidates.len());
            candidates
                .par_iter()
                .enumerate()
                .map(|(position, candidate)| self.evaluate(target, position, candidate))
                .collect()
        } else {
            candidates
                .iter()
                .enumerate()
                .map(|(position, candidate)| self.evaluate(target, position, candidate))
                .collect()
        };

        let selected = select(&results, threshold);

        Ok(MatchReport {
            results,
            selected,
            threshold,
        })
    }

    fn evaluate(&self, target: &FeatureVector, position: usize, candidate: &Candidate) -> CandidateResult {
        let scored = match &candidate.template {
            Ok(template) => self.codec.decrypt(template).and_then(|stored| {
                // `stored` is dropped, and wiped, when this closure returns
                similarity::score(target, &stored, self.dimension)
            }),
            Err(err) => Err(err.clone()),
        };

        let outcome = match scored {
            Ok(result) => CandidateOutcome::Scored(result),
            Err(err) => {
                warn!(
                    "Skipping candidate {} at position {}: {}",
                    candidate.identity, position, err
                );
                CandidateOutcome::Skipped {
                    error: err.public_message(),
                }
            }
        };

        CandidateResult {
            identity: candidate.identity.clone(),
            position,
            outcome,
        }
    }
}

// Strictly greater wins, so an exact tie keeps the earlier position.
fn select(results: &[CandidateResult], threshold: f64) -> Option<SelectedMatch> {
    let mut best: Option<SelectedMatch> = None;
    for result in results {
        let Some(comparison) = result.comparison() else {
            continue;
        };
        if !comparison.confidence.is_finite() || comparison.confidence <= threshold {
            continue;
        }
        if best
            .as_ref()
            .map_or(true, |b| comparison.confidence > b.confidence)
        {
            best = Some(SelectedMatch {
                identity: result.identity.clone(),
                position: result.position,
                confidence: comparison.confidence,
                similarity: comparison.similarity,
            });
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{TemplateKey, KEY_LEN};

    const DIM: usize = 3;

    fn codec() -> Arc<TemplateCodec> {
        Arc::new(TemplateCodec::new(TemplateKey::from_bytes([3; KEY_LEN], 1)).unwrap())
    }

    fn v(values: &[f64]) -> FeatureVector {
        FeatureVector::new(values.to_vec()).unwrap()
    }

    fn candidate(codec: &TemplateCodec, id: &str, values: &[f64]) -> Candidate {
        Candidate::new(id, codec.encrypt(&v(values)).unwrap())
    }

    #[test]
    fn selects_global_maximum() {
        let codec = codec();
        let candidates = vec![
            candidate(&codec, "a", &[0.0, 1.0, 0.0]),
            candidate(&codec, "b", &[1.0, 0.1, 0.0]),
            candidate(&codec, "c", &[1.0, 0.0, 0.0]),
            candidate(&codec, "d", &[-1.0, 0.0, 0.0]),
        ];
        let selector = MatchSelector::new(codec, DIM, usize::MAX);

        let report = selector
            .best_match(&v(&[1.0, 0.0, 0.0]), &candidates, 0.5)
            .unwrap();
        assert_eq!(report.results.len(), 4);
        let selected = report.selected.as_ref().unwrap();
        assert_eq!(selected.identity, "c");
        assert_eq!(selected.position, 2);

        let max = report
            .scored()
            .map(|(_, c)| c.confidence)
            .fold(f64::MIN, f64::max);
        assert_eq!(selected.confidence, max);
    }

    #[test]
    fn exact_tie_goes_to_first_seen() {
        let codec = codec();
        let candidates = vec![
            candidate(&codec, "low", &[0.0, 1.0, 0.0]),
            candidate(&codec, "first", &[2.0, 0.0, 0.0]),
            candidate(&codec, "second", &[2.0, 0.0, 0.0]),
        ];
        let selector = MatchSelector::new(codec, DIM, usize::MAX);
        let report = selector
            .best_match(&v(&[1.0, 0.0, 0.0]), &candidates, 0.0)
            .unwrap();
        assert_eq!(report.selected.unwrap().identity, "first");
    }

    #[test]
    fn parallel_scan_matches_sequential_scan() {
        let codec = codec();
        let mut candidates = Vec::new();
        for i in 0..200 {
            // repeating pattern produces many exact ties
            let x = f64::from(i % 7);
            candidates.push(candidate(&codec, &format!("id-{i}"), &[x, 1.0, 0.5]));
        }
        let target = v(&[6.0, 1.0, 0.5]);

        let sequential = MatchSelector::new(codec.clone(), DIM, usize::MAX)
            .best_match(&target, &candidates, 0.1)
            .unwrap();
        let parallel = MatchSelector::new(codec, DIM, 1)
            .best_match(&target, &candidates, 0.1)
            .unwrap();

        assert_eq!(sequential.selected.as_ref().unwrap().identity, "id-6");
        assert_eq!(
            parallel.selected.as_ref().unwrap().identity,
            sequential.selected.as_ref().unwrap().identity
        );
        let positions: Vec<usize> = parallel.results.iter().map(|r| r.position).collect();
        assert_eq!(positions, (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn undecryptable_candidate_is_skipped_not_fatal() {
        let codec = codec();
        let foreign = TemplateCodec::new(TemplateKey::from_bytes([4; KEY_LEN], 1)).unwrap();
        let candidates = vec![
            Candidate::new("foreign", foreign.encrypt(&v(&[1.0, 0.0, 0.0])).unwrap()),
            Candidate::from_encoded("garbage", "%%%"),
            candidate(&codec, "good", &[0.9, 0.1, 0.0]),
        ];
        let selector = MatchSelector::new(codec, DIM, usize::MAX);
        let report = selector
            .best_match(&v(&[1.0, 0.0, 0.0]), &candidates, 0.85)
            .unwrap();

        assert_eq!(report.results.len(), 3);
        let skipped: Vec<&str> = report.skipped().map(|(r, _)| r.identity.as_str()).collect();
        assert_eq!(skipped, vec!["foreign", "garbage"]);
        assert_eq!(report.selected.unwrap().identity, "good");
    }

    #[test]
    fn stored_dimension_mismatch_is_skipped() {
        let codec = codec();
        let candidates = vec![candidate(&codec, "short", &[1.0, 0.0])];
        let selector = MatchSelector::new(codec, DIM, usize::MAX);
        let report = selector
            .best_match(&v(&[1.0, 0.0, 0.0]), &candidates, 0.0)
            .unwrap();
        assert_eq!(report.skipped().count(), 1);
        assert!(report.selected.is_none());
    }

    #[test]
    fn nothing_selected_at_or_below_threshold() {
        let codec = codec();
        let candidates = vec![candidate(&codec, "a", &[0.0, 1.0, 0.0])];
        let selector = MatchSelector::new(codec, DIM, usize::MAX);
        // orthogonal: confidence is exactly 0.5, threshold is strict
        let report = selector
            .best_match(&v(&[1.0, 0.0, 0.0]), &candidates, 0.5)
            .unwrap();
        assert!(report.selected.is_none());
        assert_eq!(report.best_observed(), Some(0.5));
    }

    #[test]
    fn empty_candidate_set() {
        let selector = MatchSelector::new(codec(), DIM, usize::MAX);
        let report = selector.best_match(&v(&[1.0, 0.0, 0.0]), &[], 0.0).unwrap();
        assert!(report.results.is_empty());
        assert!(report.selected.is_none());
        assert_eq!(report.best_observed(), None);
    }

    #[test]
    fn target_with_wrong_dimension_aborts() {
        let codec = codec();
        let candidates = vec![candidate(&codec, "a", &[1.0, 0.0, 0.0])];
        let selector = MatchSelector::new(codec, DIM, usize::MAX);
        assert!(matches!(
            selector.best_match(&v(&[1.0, 0.0]), &candidates, 0.0),
            Err(FaceError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn large_magnitude_opposite_is_not_selected() {
        let codec = codec();
        let candidates = vec![
            candidate(&codec, "opposite", &[1e200, 1e200, 1e200]),
            candidate(&codec, "tiny", &[1e-300, -1e-300, 1e-300]),
        ];
        let selector = MatchSelector::new(codec, DIM, usize::MAX);
        let report = selector
            .best_match(&v(&[-1e200, -1e200, -1e200]), &candidates, 0.85)
            .unwrap();

        assert!(report.selected.is_none());
        for (_, comparison) in report.scored() {
            assert!(comparison.confidence.is_finite());
            assert!((0.0..=1.0).contains(&comparison.confidence));
        }
        assert!(report.best_observed().unwrap() < 0.85);
    }

    #[test]
    fn non_finite_confidence_is_never_selected() {
        let scored = |identity: &str, position, confidence| CandidateResult {
            identity: identity.to_string(),
            position,
            outcome: CandidateOutcome::Scored(ComparisonResult {
                confidence,
                similarity: confidence * 2.0 - 1.0,
            }),
        };
        let results = vec![scored("nan", 0, f64::NAN), scored("real", 1, 0.9)];
        let selected = select(&results, 0.85).unwrap();
        assert_eq!(selected.identity, "real");
        assert!(select(&results[..1], 0.0).is_none());
    }
}
