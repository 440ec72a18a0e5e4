/**
 * Biometric Service
 * Composes extraction, sealing and matching into enroll / authenticate.
 *
 * Built once at start-up from a provisioned key and shared behind an Arc;
 * the key material goes away with it when the process shuts down.
 *
 * Authentication walks Received -> Extracting -> Comparing -> Decided and
 * always ends in exactly one MatchDecision and one audit record.
 */

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditOperation, AuditRecord, AuditSink, TracingAuditSink};
use crate::codec::{EncryptedTemplate, TemplateCodec, TemplateKey};
use crate::config::{MatchSettings, MultiFacePolicy, ServiceConfig};
use crate::error::{ErrorKind, FaceError, FaceResult};
use crate::extractor::{EmbeddingExtractor, FeatureVector, ImagePayload, RemoteExtractor};
use crate::matcher::{Candidate, MatchReport, MatchSelector};
use crate::similarity::{self, ComparisonResult};
use crate::store::{EnrollDisposition, IdentityRecord, IdentityStatus, IdentityStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStage {
    Received,
    Extracting,
    Comparing,
    Decided,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    InvalidInput,
    NoFaceDetected,
    UnreadableImage,
    AmbiguousFaces,
    ExtractionTimeout,
    ExtractorUnavailable,
    DimensionMismatch,
    NoEnrolledIdentities,
    NoUsableTemplates,
    BelowThreshold,
    Internal,
}

impl RejectReason {
    fn from_error(err: &FaceError) -> Self {
        match err {
            FaceError::NoFaceDetected => RejectReason::NoFaceDetected,
            FaceError::UnreadableImage(_) => RejectReason::UnreadableImage,
            FaceError::AmbiguousFaces { .. } => RejectReason::AmbiguousFaces,
            FaceError::ExtractionTimeout(_) => RejectReason::ExtractionTimeout,
            FaceError::ExtractorUnavailable(_) => RejectReason::ExtractorUnavailable,
            FaceError::DimensionMismatch { .. } => RejectReason::DimensionMismatch,
            other => match other.kind() {
                ErrorKind::Input => RejectReason::InvalidInput,
                _ => RejectReason::Internal,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::InvalidInput => "invalid_input",
            RejectReason::NoFaceDetected => "no_face_detected",
            RejectReason::UnreadableImage => "unreadable_image",
            RejectReason::AmbiguousFaces => "ambiguous_faces",
            RejectReason::ExtractionTimeout => "extraction_timeout",
            RejectReason::ExtractorUnavailable => "extractor_unavailable",
            RejectReason::DimensionMismatch => "dimension_mismatch",
            RejectReason::NoEnrolledIdentities => "no_enrolled_identities",
            RejectReason::NoUsableTemplates => "no_usable_templates",
            RejectReason::BelowThreshold => "below_threshold",
            RejectReason::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchedIdentity {
    pub id: String,
    pub display_name: String,
}

/// Result of one authentication attempt. Fields are read-only once built.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchDecision {
    request_id: Uuid,
    outcome: Outcome,
    identity: Option<MatchedIdentity>,
    confidence: f64,
    threshold: f64,
    reason: Option<RejectReason>,
    decided_from: RequestStage,
    candidates_scanned: usize,
    timestamp: DateTime<Utc>,
}

impl MatchDecision {
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn accepted(&self) -> bool {
        self.outcome == Outcome::Accepted
    }

    pub fn identity(&self) -> Option<&MatchedIdentity> {
        self.identity.as_ref()
    }

    /// Confidence of the selected match, or the best one seen when rejected.
    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn reason(&self) -> Option<RejectReason> {
        self.reason
    }

    /// The last stage reached before the request was decided.
    pub fn decided_from(&self) -> RequestStage {
        self.decided_from
    }

    pub fn candidates_scanned(&self) -> usize {
        self.candidates_scanned
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnrollmentRequest {
    pub identity: String,
    pub display_name: String,
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentReceipt {
    pub request_id: Uuid,
    pub identity: String,
    pub disposition: EnrollDisposition,
    pub scheme: &'static str,
    pub key_version: u32,
    pub enrolled_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ExtractedTemplate {
    pub template: EncryptedTemplate,
    pub faces_detected: usize,
}

struct RequestTrace {
    request_id: Uuid,
    stage: RequestStage,
}

impl RequestTrace {
    fn new() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            stage: RequestStage::Received,
        }
    }

    fn advance(&mut self, next: RequestStage) {
        debug!(
            "request {}: {:?} -> {:?}",
            self.request_id, self.stage, next
        );
        self.stage = next;
    }
}

pub struct BiometricService {
    settings: MatchSettings,
    codec: Arc<TemplateCodec>,
    selector: Arc<MatchSelector>,
    store: IdentityStore,
    extractor: Arc<dyn EmbeddingExtractor>,
    audit: Arc<dyn AuditSink>,
}

impl BiometricService {
    pub fn new(
        settings: MatchSettings,
        key: TemplateKey,
        extractor: Arc<dyn EmbeddingExtractor>,
        audit: Arc<dyn AuditSink>,
    ) -> FaceResult<Self> {
        let codec = Arc::new(TemplateCodec::new(key)?);
        let selector = Arc::new(MatchSelector::new(
            codec.clone(),
            settings.dimension,
            settings.parallel_min_candidates,
        ));

        Ok(Self {
            settings,
            codec,
            selector,
            store: IdentityStore::new(),
            extractor,
            audit,
        })
    }

    /// Production wiring: remote extractor, audit to the tracing log.
    pub fn from_config(config: ServiceConfig) -> FaceResult<Self> {
        let extractor = RemoteExtractor::new(
            config.extractor_url,
            config.model_name,
            config.matching.extraction_timeout,
        )?;
        Self::new(
            config.matching,
            config.key,
            Arc::new(extractor),
            Arc::new(TracingAuditSink),
        )
    }

    pub fn settings(&self) -> &MatchSettings {
        &self.settings
    }

    pub fn model_name(&self) -> &str {
        self.extractor.model_name()
    }

    pub fn store(&self) -> &IdentityStore {
        &self.store
    }

    pub async fn enroll(
        &self,
        request: EnrollmentRequest,
        image: &ImagePayload,
    ) -> FaceResult<EnrollmentReceipt> {
        let request_id = Uuid::new_v4();
        let result = self.enroll_inner(request_id, &request, image).await;

        let record = match &result {
            Ok(receipt) => AuditRecord::new(request_id, AuditOperation::Enroll, "enrolled")
                .reason(Some(format!("{:?}", receipt.disposition).to_lowercase())),
            Err(err) => {
                log_failure("enroll", request_id, err);
                AuditRecord::new(request_id, AuditOperation::Enroll, "failed")
                    .reason(Some(err.public_message()))
            }
        };
        self.audit
            .record(&record.identity(Some(request.identity.as_str())).seal());

        result
    }

    async fn enroll_inner(
        &self,
        request_id: Uuid,
        request: &EnrollmentRequest,
        image: &ImagePayload,
    ) -> FaceResult<EnrollmentReceipt> {
        crate::store::validate_identity(&request.identity)?;

        // cheap early exit; the store re-checks under its write lock
        if self.settings.reenroll == crate::store::ReenrollPolicy::Reject
            && self.store.is_active(&request.identity)
        {
            return Err(FaceError::AlreadyEnrolled(request.identity.clone()));
        }

        let (vector, _) = self.extract_single(image).await?;
        let template = self.codec.encrypt(&vector)?;
        drop(vector);

        let enrolled_at = Utc::now();
        let record = IdentityRecord {
            id: request.identity.clone(),
            display_name: request.display_name.clone(),
            attributes: request.attributes.clone(),
            template,
            status: IdentityStatus::Active,
            enrolled_at,
        };
        let disposition = self.store.enroll(record, self.settings.reenroll)?;
        info!(
            "Enrolled identity {} ({:?}, request {})",
            request.identity, disposition, request_id
        );

        Ok(EnrollmentReceipt {
            request_id,
            identity: request.identity.clone(),
            disposition,
            scheme: crate::codec::SCHEME_NAME,
            key_version: self.codec.key_version(),
            enrolled_at,
        })
    }

    /// Authenticate from the wire form of an image. Decoding failures still
    /// produce a (rejected) decision.
    pub async fn authenticate_encoded(&self, image_data: &str, image_type: &str) -> MatchDecision {
        match ImagePayload::decode(image_data, image_type) {
            Ok(image) => self.authenticate(&image).await,
            Err(err) => {
                let trace = RequestTrace::new();
                self.reject(trace, &err, 0.0, 0)
            }
        }
    }

    pub async fn authenticate(&self, image: &ImagePayload) -> MatchDecision {
        let mut trace = RequestTrace::new();

        trace.advance(RequestStage::Extracting);
        let target = match self.extract_single(image).await {
            Ok((vector, _)) => vector,
            Err(err) => return self.reject(trace, &err, 0.0, 0),
        };

        trace.advance(RequestStage::Comparing);
        let snapshot = self.store.active_snapshot();
        if snapshot.is_empty() {
            return self.decide(trace, None, Some(RejectReason::NoEnrolledIdentities), 0.0, 0);
        }

        let candidates: Vec<Candidate> = snapshot
            .iter()
            .map(|record| Candidate::new(record.id.clone(), record.template.clone()))
            .collect();
        let report = match self
            .scan(target, candidates, self.settings.threshold)
            .await
        {
            Ok(report) => report,
            Err(err) => return self.reject(trace, &err, 0.0, snapshot.len()),
        };

        let scanned = report.results.len();
        match &report.selected {
            Some(selected) => {
                let matched = MatchedIdentity {
                    id: selected.identity.clone(),
                    display_name: snapshot[selected.position].display_name.clone(),
                };
                self.decide(trace, Some(matched), None, selected.confidence, scanned)
            }
            None => {
                let (reason, best) = match report.best_observed() {
                    Some(best) => (RejectReason::BelowThreshold, best),
                    None => (RejectReason::NoUsableTemplates, 0.0),
                };
                self.decide(trace, None, Some(reason), best, scanned)
            }
        }
    }

    pub fn revoke(&self, identity: &str) -> FaceResult<()> {
        let request_id = Uuid::new_v4();
        let result = self.store.revoke(identity);
        let record = match &result {
            Ok(()) => AuditRecord::new(request_id, AuditOperation::Revoke, "revoked"),
            Err(err) => AuditRecord::new(request_id, AuditOperation::Revoke, "failed")
                .reason(Some(err.public_message())),
        };
        self.audit.record(&record.identity(Some(identity)).seal());
        if result.is_ok() {
            info!("Revoked identity {}", identity);
        }
        result
    }

    /// Extract and seal a template without enrolling it.
    pub async fn extract_template(&self, image: &ImagePayload) -> FaceResult<ExtractedTemplate> {
        let (vector, faces_detected) = self.extract_single(image).await?;
        let template = self.codec.encrypt(&vector)?;
        Ok(ExtractedTemplate {
            template,
            faces_detected,
        })
    }

    pub fn compare_templates(&self, first: &str, second: &str) -> FaceResult<ComparisonResult> {
        let first = self.codec.decrypt(&EncryptedTemplate::decode(first)?)?;
        let second = self.codec.decrypt(&EncryptedTemplate::decode(second)?)?;
        similarity::score(&first, &second, self.settings.dimension)
    }

    /// Compare one sealed target against caller-supplied sealed templates.
    ///
    /// A target that cannot be opened fails the call; a stored entry that
    /// cannot be opened is reported as skipped.
    pub async fn batch_compare(
        &self,
        target: &str,
        stored: Vec<(String, String)>,
        threshold: f64,
    ) -> FaceResult<MatchReport> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(FaceError::Input(format!(
                "threshold must be within [0, 1], got {threshold}"
            )));
        }

        let target = self.codec.decrypt(&EncryptedTemplate::decode(target)?)?;
        let candidates = stored
            .iter()
            .map(|(id, encoded)| Candidate::from_encoded(id.clone(), encoded))
            .collect();
        self.scan(target, candidates, threshold).await
    }

    async fn scan(
        &self,
        target: FeatureVector,
        candidates: Vec<Candidate>,
        threshold: f64,
    ) -> FaceResult<MatchReport> {
        let selector = self.selector.clone();
        tokio::task::spawn_blocking(move || selector.best_match(&target, &candidates, threshold))
            .await
            .map_err(|e| FaceError::Internal(format!("match scan did not complete: {e}")))?
    }

    async fn extract_single(&self, image: &ImagePayload) -> FaceResult<(FeatureVector, usize)> {
        let timeout = self.settings.extraction_timeout;
        // on timeout the extraction future is dropped, which cancels it
        let faces = tokio::time::timeout(timeout, self.extractor.extract(image))
            .await
            .map_err(|_| FaceError::ExtractionTimeout(timeout))??;

        let count = faces.len();
        let vector = faces.into_iter().next().ok_or(FaceError::NoFaceDetected)?;
        if count > 1 {
            match self.settings.multi_face {
                MultiFacePolicy::Reject => return Err(FaceError::AmbiguousFaces { count }),
                MultiFacePolicy::UseFirst => {
                    warn!("{} faces detected; using the first", count);
                }
            }
        }

        if vector.dimension() != self.settings.dimension {
            return Err(FaceError::DimensionMismatch {
                expected: self.settings.dimension,
                actual: vector.dimension(),
            });
        }

        Ok((vector, count))
    }

    fn reject(
        &self,
        trace: RequestTrace,
        err: &FaceError,
        confidence: f64,
        scanned: usize,
    ) -> MatchDecision {
        log_failure("authenticate", trace.request_id, err);
        self.decide(
            trace,
            None,
            Some(RejectReason::from_error(err)),
            confidence,
            scanned,
        )
    }

    // The single exit of every authentication attempt.
    fn decide(
        &self,
        mut trace: RequestTrace,
        matched: Option<MatchedIdentity>,
        reason: Option<RejectReason>,
        confidence: f64,
        scanned: usize,
    ) -> MatchDecision {
        let decided_from = trace.stage;
        trace.advance(RequestStage::Decided);

        let outcome = if matched.is_some() {
            Outcome::Accepted
        } else {
            Outcome::Rejected
        };
        let decision = MatchDecision {
            request_id: trace.request_id,
            outcome,
            reason: if matched.is_some() { None } else { reason },
            identity: matched,
            confidence,
            threshold: self.settings.threshold,
            decided_from,
            candidates_scanned: scanned,
            timestamp: Utc::now(),
        };

        info!(
            "Authentication {}: {:?} (confidence {:.4}, threshold {:.2}, {} candidates)",
            decision.request_id, decision.outcome, decision.confidence, decision.threshold, scanned
        );

        let record = AuditRecord::new(
            decision.request_id,
            AuditOperation::Authenticate,
            match outcome {
                Outcome::Accepted => "accepted",
                Outcome::Rejected => "rejected",
            },
        )
        .identity(decision.identity.as_ref().map(|m| m.id.as_str()))
        .scores(Some(decision.confidence), Some(decision.threshold))
        .reason(decision.reason.map(|r| r.as_str().to_string()))
        .at(decision.timestamp)
        .seal();
        self.audit.record(&record);

        decision
    }
}

fn log_failure(operation: &str, request_id: Uuid, err: &FaceError) {
    match err.kind() {
        ErrorKind::Internal => error!("{} {} failed: {:?}", operation, request_id, err),
        ErrorKind::Crypto => warn!("{} {} failed: {}", operation, request_id, err),
        _ => info!("{} {} rejected: {}", operation, request_id, err),
    }
}
