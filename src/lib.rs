/**
 * facematch
 * Encrypted biometric template matching: sealing face embeddings at rest,
 * scoring them, and deciding who (if anyone) a fresh capture belongs to.
 */

pub mod api;
pub mod audit;
pub mod biometric;
pub mod codec;
pub mod config;
pub mod error;
pub mod extractor;
pub mod matcher;
pub mod similarity;
pub mod store;

pub use biometric::{BiometricService, MatchDecision, Outcome, RejectReason};
pub use codec::{EncryptedTemplate, TemplateCodec, TemplateKey};
pub use error::{ErrorKind, FaceError, FaceResult};
pub use extractor::{EmbeddingExtractor, FeatureVector, ImagePayload};
