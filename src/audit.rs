/**
 * Audit trail
 * One sealed record per enroll or authenticate attempt. The digest covers
 * every other field so a record can be checked after it leaves the process.
 */

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    Enroll,
    Authenticate,
    Revoke,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub request_id: Uuid,
    pub operation: AuditOperation,
    pub outcome: String,
    pub identity: Option<String>,
    pub confidence: Option<f64>,
    pub threshold: Option<f64>,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub digest: String,
}

#[derive(Serialize)]
struct DigestInput<'a> {
    request_id: &'a Uuid,
    operation: AuditOperation,
    outcome: &'a str,
    identity: Option<&'a str>,
    confidence: Option<f64>,
    threshold: Option<f64>,
    reason: Option<&'a str>,
    timestamp: String,
}

impl AuditRecord {
    pub fn new(request_id: Uuid, operation: AuditOperation, outcome: impl Into<String>) -> Self {
        Self {
            request_id,
            operation,
            outcome: outcome.into(),
            identity: None,
            confidence: None,
            threshold: None,
            reason: None,
            timestamp: Utc::now(),
            digest: String::new(),
        }
    }

    pub fn identity(mut self, identity: Option<&str>) -> Self {
        self.identity = identity.map(str::to_string);
        self
    }

    pub fn scores(mut self, confidence: Option<f64>, threshold: Option<f64>) -> Self {
        self.confidence = confidence;
        self.threshold = threshold;
        self
    }

    pub fn reason(mut self, reason: Option<String>) -> Self {
        self.reason = reason;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Fill in the digest. Must be the last builder step.
    pub fn seal(mut self) -> Self {
        self.digest = self.compute_digest();
        self
    }

    pub fn verify(&self) -> bool {
        !self.digest.is_empty() && self.digest == self.compute_digest()
    }

    fn compute_digest(&self) -> String {
        let input = DigestInput {
            request_id: &self.request_id,
            operation: self.operation,
            outcome: &self.outcome,
            identity: self.identity.as_deref(),
            confidence: self.confidence,
            threshold: self.threshold,
            reason: self.reason.as_deref(),
            timestamp: self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
        };
        // serializing plain fields cannot fail
        let bytes = serde_json::to_vec(&input).unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        format!("sha256:{}", hex::encode(hasher.finalize()))
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord);
}

/// Writes audit records to the `facematch::audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: &AuditRecord) {
        info!(
            target: "facematch::audit",
            request_id = %record.request_id,
            operation = ?record.operation,
            outcome = %record.outcome,
            identity = record.identity.as_deref().unwrap_or("-"),
            confidence = ?record.confidence,
            threshold = ?record.threshold,
            reason = record.reason.as_deref().unwrap_or("-"),
            digest = %record.digest,
            "audit"
        );
    }
}
