/**
 * Embedding Extractor boundary
 * Raw image bytes in, fixed-length feature vectors out. The vision model
 * itself lives in a separate service; this module only speaks its contract.
 */

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{FaceError, FaceResult};

/// Face embedding produced by the extractor. Wiped from memory on drop.
#[derive(Clone, PartialEq, Zeroize, ZeroizeOnDrop)]
pub struct FeatureVector(Vec<f64>);

impl FeatureVector {
    pub fn new(values: Vec<f64>) -> FaceResult<Self> {
        if values.is_empty() {
            return Err(FaceError::Input("feature vector is empty".into()));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(FaceError::Input(
                "feature vector contains non-finite values".into(),
            ));
        }
        Ok(Self(values))
    }

    pub fn dimension(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }
}

// Components are biometric data; only the shape is printable.
impl fmt::Debug for FeatureVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureVector")
            .field("dimension", &self.0.len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Webp,
    Unknown,
}

impl ImageFormat {
    fn from_mime(mime: &str) -> Option<Self> {
        match mime.trim().to_ascii_lowercase().as_str() {
            "image/jpeg" | "image/jpg" => Some(ImageFormat::Jpeg),
            "image/png" => Some(ImageFormat::Png),
            "image/webp" => Some(ImageFormat::Webp),
            other if other.starts_with("image/") => Some(ImageFormat::Unknown),
            _ => None,
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
            ImageFormat::Webp => "image/webp",
            ImageFormat::Unknown => "application/octet-stream",
        }
    }
}

/// Decoded image bytes plus the format hint passed on to the extractor.
#[derive(Clone)]
pub struct ImagePayload {
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
}

impl fmt::Debug for ImagePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImagePayload")
            .field("len", &self.bytes.len())
            .field("format", &self.format)
            .finish()
    }
}

impl ImagePayload {
    pub fn new(bytes: Vec<u8>, format: ImageFormat) -> Self {
        Self { bytes, format }
    }

    /// Decode the wire form: base64 text, optionally as a `data:` URL.
    ///
    /// `image_type` is either `base64` or a MIME type such as `image/png`.
    pub fn decode(image_data: &str, image_type: &str) -> FaceResult<Self> {
        let image_data = image_data.trim();
        if image_data.is_empty() {
            return Err(FaceError::Input("no image data provided".into()));
        }

        let mut format = match image_type.trim() {
            "" | "base64" => ImageFormat::Unknown,
            mime => ImageFormat::from_mime(mime).ok_or_else(|| {
                FaceError::Input(format!("unsupported image type '{mime}'"))
            })?,
        };

        let encoded = match image_data.split_once(',') {
            Some((header, body)) => {
                // data:image/png;base64,....
                if let Some(mime) = header
                    .strip_prefix("data:")
                    .and_then(|rest| rest.split(';').next())
                {
                    if format == ImageFormat::Unknown {
                        format = ImageFormat::from_mime(mime).unwrap_or(ImageFormat::Unknown);
                    }
                }
                body
            }
            None => image_data,
        };

        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|_| FaceError::Input("image data is not valid base64".into()))?;
        if bytes.is_empty() {
            return Err(FaceError::Input("image data is empty".into()));
        }

        Ok(Self { bytes, format })
    }
}

/// External capability turning an image into one vector per detected face.
///
/// An empty list and `FaceError::NoFaceDetected` mean the same thing.
/// Undecodable images are reported as `FaceError::UnreadableImage`.
#[async_trait]
pub trait EmbeddingExtractor: Send + Sync {
    async fn extract(&self, image: &ImagePayload) -> FaceResult<Vec<FeatureVector>>;

    fn model_name(&self) -> &str;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RepresentRequest<'a> {
    image_data: String,
    image_type: &'a str,
    model: &'a str,
}

#[derive(Deserialize)]
struct RepresentResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f64>>,
    error: Option<String>,
    kind: Option<String>,
}

/// Client for a model service exposing a JSON `represent` endpoint.
pub struct RemoteExtractor {
    client: reqwest::Client,
    url: String,
    model: String,
}

impl RemoteExtractor {
    pub fn new(url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> FaceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FaceError::Config(format!("failed to build extractor client: {e}")))?;

        Ok(Self {
            client,
            url: url.into(),
            model: model.into(),
        })
    }
}

#[async_trait]
impl EmbeddingExtractor for RemoteExtractor {
    async fn extract(&self, image: &ImagePayload) -> FaceResult<Vec<FeatureVector>> {
        let request = RepresentRequest {
            image_data: STANDARD.encode(&image.bytes),
            image_type: image.format.mime(),
            model: &self.model,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| FaceError::ExtractorUnavailable(e.to_string()))?;

        let status = response.status();
        let body: RepresentResponse = response
            .json()
            .await
            .map_err(|e| FaceError::ExtractorUnavailable(format!("invalid response body: {e}")))?;

        if !status.is_success() {
            let message = body.error.unwrap_or_else(|| status.to_string());
            return Err(match body.kind.as_deref() {
                Some("no_face") => FaceError::NoFaceDetected,
                Some("unreadable_image") => FaceError::UnreadableImage(message),
                _ => {
                    warn!("Extractor returned {}: {}", status, message);
                    FaceError::ExtractorUnavailable(format!("extractor returned {status}"))
                }
            });
        }

        debug!("Extractor returned {} embedding(s)", body.embeddings.len());
        body.embeddings.into_iter().map(FeatureVector::new).collect()
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
