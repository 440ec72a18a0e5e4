#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use facematch::audit::{AuditRecord, AuditSink};
use facematch::codec::{TemplateKey, KEY_LEN};
use facematch::config::MatchSettings;
use facematch::{BiometricService, EmbeddingExtractor, FaceError, FaceResult, FeatureVector, ImagePayload};

pub const DIM: usize = 8;

pub const V001: [f64; DIM] = [0.10, 0.20, 0.05, 0.30, 0.15, 0.25, 0.40, 0.35];
pub const V002: [f64; DIM] = [0.90, -0.10, 0.20, 0.00, -0.30, 0.10, 0.05, -0.20];
pub const V003: [f64; DIM] = [-0.20, 0.40, -0.30, 0.10, 0.60, -0.10, 0.00, 0.20];

#[derive(Clone)]
pub enum Canned {
    Faces(Vec<Vec<f64>>),
    Fail(FaceError),
    Hang,
}

/// Extractor stand-in keyed by the raw image bytes it is handed.
#[derive(Default)]
pub struct StubExtractor {
    responses: Mutex<HashMap<Vec<u8>, Canned>>,
}

impl StubExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, image: &[u8], response: Canned) -> Self {
        self.responses.lock().insert(image.to_vec(), response);
        self
    }

    pub fn face(self, image: &[u8], vector: &[f64]) -> Self {
        self.on(image, Canned::Faces(vec![vector.to_vec()]))
    }
}

#[async_trait]
impl EmbeddingExtractor for StubExtractor {
    async fn extract(&self, image: &ImagePayload) -> FaceResult<Vec<FeatureVector>> {
        let canned = self
            .responses
            .lock()
            .get(&image.bytes)
            .cloned()
            .unwrap_or_else(|| Canned::Fail(FaceError::UnreadableImage("unknown image".into())));

        match canned {
            Canned::Faces(faces) => faces.into_iter().map(FeatureVector::new).collect(),
            Canned::Fail(err) => Err(err),
            Canned::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Vec::new())
            }
        }
    }

    fn model_name(&self) -> &str {
        "stub-model"
    }
}

#[derive(Default)]
pub struct CollectingAudit {
    pub records: Mutex<Vec<AuditRecord>>,
}

impl CollectingAudit {
    pub fn snapshot(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }
}

impl AuditSink for CollectingAudit {
    fn record(&self, record: &AuditRecord) {
        self.records.lock().push(record.clone());
    }
}

pub fn settings() -> MatchSettings {
    MatchSettings {
        threshold: 0.85,
        dimension: DIM,
        extraction_timeout: Duration::from_millis(200),
        ..MatchSettings::default()
    }
}

pub fn service_with(
    extractor: StubExtractor,
    settings: MatchSettings,
) -> (Arc<BiometricService>, Arc<CollectingAudit>) {
    let audit = Arc::new(CollectingAudit::default());
    let service = BiometricService::new(
        settings,
        TemplateKey::from_bytes([42u8; KEY_LEN], 1),
        Arc::new(extractor),
        audit.clone(),
    )
    .expect("service builds");
    (Arc::new(service), audit)
}

pub fn service(extractor: StubExtractor) -> (Arc<BiometricService>, Arc<CollectingAudit>) {
    service_with(extractor, settings())
}

pub fn image(bytes: &[u8]) -> ImagePayload {
    ImagePayload::new(bytes.to_vec(), facematch::extractor::ImageFormat::Jpeg)
}

pub fn nudged(values: &[f64], delta: f64) -> Vec<f64> {
    values.iter().map(|v| v + delta).collect()
}
