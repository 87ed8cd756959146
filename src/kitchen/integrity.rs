//! Subresource integrity metadata: parsing, strongest-algorithm selection and validation.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256, Sha384, Sha512};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IntegrityAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl IntegrityAlgorithm {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "sha256" => Some(Self::Sha256),
            "sha384" => Some(Self::Sha384),
            "sha512" => Some(Self::Sha512),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        }
    }

    pub fn digest(&self, bytes: &[u8]) -> String {
        match self {
            Self::Sha256 => STANDARD.encode(Sha256::digest(bytes)),
            Self::Sha384 => STANDARD.encode(Sha384::digest(bytes)),
            Self::Sha512 => STANDARD.encode(Sha512::digest(bytes)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityMetadata {
    pub algorithm: IntegrityAlgorithm,
    pub digest: String,
}

/// Parse an `integrity` attribute. Unknown algorithms and malformed tokens are skipped.
pub fn parse_integrity(value: &str) -> Vec<IntegrityMetadata> {
    value
        .split_ascii_whitespace()
        .filter_map(|token| {
            let (algorithm, rest) = token.split_once('-')?;
            let algorithm = IntegrityAlgorithm::parse(algorithm)?;
            // Options after `?` are reserved and ignored.
            let digest = rest.split('?').next().unwrap_or(rest);
            Some(IntegrityMetadata {
                algorithm,
                digest: digest.to_owned(),
            })
        })
        .collect()
}

/// Metadata entries using the strongest algorithm present.
pub fn strongest(metadata: &[IntegrityMetadata]) -> Vec<&IntegrityMetadata> {
    let Some(max) = metadata.iter().map(|m| m.algorithm).max() else {
        return Vec::new();
    };
    metadata.iter().filter(|m| m.algorithm == max).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("integrity mismatch: expected {expected}, got {algorithm}-{actual}")]
pub struct IntegrityMismatch {
    pub algorithm: &'static str,
    pub expected: String,
    pub actual: String,
}

/// Check `bytes` against an integrity attribute.
///
/// Only the strongest algorithm counts; any of its digests matching is enough. A value
/// with no recognized metadata passes.
pub fn validate_integrity(bytes: &[u8], integrity: &str) -> Result<(), IntegrityMismatch> {
    let metadata = parse_integrity(integrity);
    let candidates = strongest(&metadata);
    let Some(first) = candidates.first() else {
        return Ok(());
    };
    let actual = first.algorithm.digest(bytes);
    if candidates.iter().any(|m| m.digest == actual) {
        return Ok(());
    }
    Err(IntegrityMismatch {
        algorithm: first.algorithm.as_str(),
        expected: integrity.to_owned(),
        actual,
    })
}

/// `<algorithm>-<base64 digest>` for `bytes`.
pub fn compute_integrity(bytes: &[u8], algorithm: IntegrityAlgorithm) -> String {
    format!("{}-{}", algorithm.as_str(), algorithm.digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matching_digest_passes() {
        let integrity = compute_integrity(b"console.log(1)", IntegrityAlgorithm::Sha384);
        assert!(validate_integrity(b"console.log(1)", &integrity).is_ok());
        assert!(validate_integrity(b"console.log(2)", &integrity).is_err());
    }

    #[test]
    fn test_only_strongest_algorithm_is_checked() {
        let weak_ok = compute_integrity(b"a", IntegrityAlgorithm::Sha256);
        let strong_bad = "sha512-AAAA";
        let value = format!("{weak_ok} {strong_bad}");
        let err = validate_integrity(b"a", &value).unwrap_err();
        assert_eq!(err.algorithm, "sha512");
    }

    #[test]
    fn test_unknown_algorithms_are_ignored() {
        assert!(validate_integrity(b"a", "md5-xyz").is_ok());
        assert!(parse_integrity("sha256-abc?opt sha1-zzz").len() == 1);
    }
}
