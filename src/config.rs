/**
 * Service configuration
 * Read once from the environment at start-up
 */

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use crate::codec::TemplateKey;
use crate::error::{FaceError, FaceResult};
use crate::store::ReenrollPolicy;

pub const DEFAULT_BIND: &str = "0.0.0.0:8080";
pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.85;
pub const DEFAULT_EMBEDDING_DIM: usize = 512;
pub const DEFAULT_EXTRACTION_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_EXTRACTOR_URL: &str = "http://127.0.0.1:5001/represent";
pub const DEFAULT_MODEL_NAME: &str = "Facenet512";
pub const DEFAULT_PARALLEL_MIN_CANDIDATES: usize = 64;

const KEY_ENV: &str = "FACEMATCH_TEMPLATE_KEY";

/// What to do when the extractor finds more than one face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MultiFacePolicy {
    #[default]
    Reject,
    UseFirst,
}

/// Knobs the matching engine itself cares about.
#[derive(Debug, Clone)]
pub struct MatchSettings {
    pub threshold: f64,
    pub dimension: usize,
    pub extraction_timeout: Duration,
    pub multi_face: MultiFacePolicy,
    pub reenroll: ReenrollPolicy,
    pub parallel_min_candidates: usize,
}

impl Default for MatchSettings {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
            dimension: DEFAULT_EMBEDDING_DIM,
            extraction_timeout: Duration::from_millis(DEFAULT_EXTRACTION_TIMEOUT_MS),
            multi_face: MultiFacePolicy::default(),
            reenroll: ReenrollPolicy::default(),
            parallel_min_candidates: DEFAULT_PARALLEL_MIN_CANDIDATES,
        }
    }
}

pub struct ServiceConfig {
    pub bind: SocketAddr,
    pub extractor_url: String,
    pub model_name: String,
    pub matching: MatchSettings,
    pub key: TemplateKey,
}

impl ServiceConfig {
    pub fn from_env() -> FaceResult<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> FaceResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        // No fallback: a regenerated key would orphan every stored template.
        let key_material = get(KEY_ENV)
            .ok_or_else(|| FaceError::Config(format!("{KEY_ENV} must be set")))?;
        let key_version = parse_or(get("FACEMATCH_KEY_VERSION"), "FACEMATCH_KEY_VERSION", 1u32)?;
        let key = TemplateKey::from_base64(&key_material, key_version)?;

        let bind = parse_or(
            get("FACEMATCH_BIND"),
            "FACEMATCH_BIND",
            DEFAULT_BIND.parse().map_err(|_| FaceError::Config("bad default bind".into()))?,
        )?;

        let threshold = parse_or(
            get("FACEMATCH_MATCH_THRESHOLD"),
            "FACEMATCH_MATCH_THRESHOLD",
            DEFAULT_MATCH_THRESHOLD,
        )?;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(FaceError::Config(format!(
                "FACEMATCH_MATCH_THRESHOLD must be within [0, 1], got {threshold}"
            )));
        }

        let dimension = parse_or(
            get("FACEMATCH_EMBEDDING_DIM"),
            "FACEMATCH_EMBEDDING_DIM",
            DEFAULT_EMBEDDING_DIM,
        )?;
        if dimension == 0 {
            return Err(FaceError::Config("FACEMATCH_EMBEDDING_DIM must be positive".into()));
        }

        let timeout_ms = parse_or(
            get("FACEMATCH_EXTRACTION_TIMEOUT_MS"),
            "FACEMATCH_EXTRACTION_TIMEOUT_MS",
            DEFAULT_EXTRACTION_TIMEOUT_MS,
        )?
        .max(1);

        let multi_face = match get("FACEMATCH_MULTI_FACE_POLICY").as_deref() {
            None | Some("reject") => MultiFacePolicy::Reject,
            Some("first") => MultiFacePolicy::UseFirst,
            Some(other) => {
                return Err(FaceError::Config(format!(
                    "FACEMATCH_MULTI_FACE_POLICY must be 'reject' or 'first', got '{other}'"
                )))
            }
        };

        let reenroll = match get("FACEMATCH_REENROLL_POLICY").as_deref() {
            None | Some("reject") => ReenrollPolicy::Reject,
            Some("overwrite") => ReenrollPolicy::Overwrite,
            Some(other) => {
                return Err(FaceError::Config(format!(
                    "FACEMATCH_REENROLL_POLICY must be 'reject' or 'overwrite', got '{other}'"
                )))
            }
        };

        let parallel_min_candidates = parse_or(
            get("FACEMATCH_PARALLEL_MIN_CANDIDATES"),
            "FACEMATCH_PARALLEL_MIN_CANDIDATES",
            DEFAULT_PARALLEL_MIN_CANDIDATES,
        )?;

        Ok(Self {
            bind,
            extractor_url: get("FACEMATCH_EXTRACTOR_URL")
                .unwrap_or_else(|| DEFAULT_EXTRACTOR_URL.to_string()),
            model_name: get("FACEMATCH_MODEL_NAME").unwrap_or_else(|| DEFAULT_MODEL_NAME.to_string()),
            matching: MatchSettings {
                threshold,
                dimension,
                extraction_timeout: Duration::from_millis(timeout_ms),
                multi_face,
                reenroll,
                parallel_min_candidates,
            },
            key,
        })
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, name: &str, default: T) -> FaceResult<T> {
    match value {
        Some(raw) => raw
            .parse()
            .map_err(|_| FaceError::Config(format!("{name} has invalid value '{raw}'"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use base64::{engine::general_purpose::STANDARD, Engine as _};

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn key() -> String {
        STANDARD.encode([9u8; 32])
    }

    #[test]
    fn defaults_apply_when_only_key_is_set() {
        let key = key();
        let config = ServiceConfig::from_lookup(lookup(&[(KEY_ENV, &key)])).unwrap();
        assert_eq!(config.bind.port(), 8080);
        assert_eq!(config.matching.threshold, DEFAULT_MATCH_THRESHOLD);
        assert_eq!(config.matching.dimension, 512);
        assert_eq!(config.matching.multi_face, MultiFacePolicy::Reject);
        assert_eq!(config.matching.reenroll, ReenrollPolicy::Reject);
        assert_eq!(config.key.version(), 1);
        assert_eq!(config.model_name, "Facenet512");
    }

    #[test]
    fn missing_key_is_fatal() {
        let err = ServiceConfig::from_lookup(lookup(&[])).err().unwrap();
        assert!(matches!(err, FaceError::Config(msg) if msg.contains(KEY_ENV)));
    }

    #[test]
    fn overrides_are_parsed() {
        let key = key();
        let config = ServiceConfig::from_lookup(lookup(&[
            (KEY_ENV, &key),
            ("FACEMATCH_KEY_VERSION", "3"),
            ("FACEMATCH_BIND", "127.0.0.1:9000"),
            ("FACEMATCH_MATCH_THRESHOLD", "0.9"),
            ("FACEMATCH_EMBEDDING_DIM", "128"),
            ("FACEMATCH_EXTRACTION_TIMEOUT_MS", "250"),
            ("FACEMATCH_MULTI_FACE_POLICY", "first"),
            ("FACEMATCH_REENROLL_POLICY", "overwrite"),
        ]))
        .unwrap();
        assert_eq!(config.key.version(), 3);
        assert_eq!(config.bind.port(), 9000);
        assert_eq!(config.matching.threshold, 0.9);
        assert_eq!(config.matching.dimension, 128);
        assert_eq!(config.matching.extraction_timeout, Duration::from_millis(250));
        assert_eq!(config.matching.multi_face, MultiFacePolicy::UseFirst);
        assert_eq!(config.matching.reenroll, ReenrollPolicy::Overwrite);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let key = key();
        for (name, value) in [
            ("FACEMATCH_MATCH_THRESHOLD", "1.5"),
            ("FACEMATCH_MATCH_THRESHOLD", "high"),
            ("FACEMATCH_EMBEDDING_DIM", "0"),
            ("FACEMATCH_MULTI_FACE_POLICY", "largest"),
            ("FACEMATCH_REENROLL_POLICY", "merge"),
        ] {
            let result = ServiceConfig::from_lookup(lookup(&[(KEY_ENV, &key), (name, value)]));
            assert!(matches!(result, Err(FaceError::Config(_))), "{name}={value}");
        }
    }
}
