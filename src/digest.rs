//! SHA-256 digests as a validated type.
//!
//! Every checksum that flows through the engine (expected values from config,
//! values reported by `sha256sum` on the remote machine, local tarball
//! digests) is parsed into `Sha256Digest` before it is compared, so a
//! malformed or truncated value can never compare equal by accident.

use crate::error::{ProvisionError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;
use std::str::FromStr;

/// Lowercase hex encoding of a SHA-256 digest (64 characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Sha256Digest(String);

impl Sha256Digest {
    /// Parse a hex digest, accepting either case.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        let bytes = hex::decode(value).map_err(|e| {
            ProvisionError::validation(format!("invalid sha256 digest '{}': {}", value, e))
        })?;
        if bytes.len() != 32 {
            return Err(ProvisionError::validation(format!(
                "invalid sha256 digest '{}': expected 32 bytes, got {}",
                value,
                bytes.len()
            )));
        }
        Ok(Self(hex::encode(bytes)))
    }

    /// Parse the first field of `sha256sum` output (`<digest>  <path>`).
    pub fn from_sha256sum_output(output: &str) -> Result<Self> {
        let field = output.split_whitespace().next().ok_or_else(|| {
            ProvisionError::validation("sha256sum produced no output".to_string())
        })?;
        // sha256sum prefixes the digest with '\' when the path needed escaping
        Self::parse(field.trim_start_matches('\\'))
    }

    /// Digest of an in-memory byte string.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    /// Digest of a local file, streamed.
    pub fn of_file(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut hasher = Sha256::new();
        io::copy(&mut file, &mut hasher)?;
        Ok(Self(hex::encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Sha256Digest {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Sha256Digest {
    type Error = ProvisionError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Sha256Digest> for String {
    fn from(digest: Sha256Digest) -> Self {
        digest.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const EMPTY: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_digest_of_empty_input() {
        assert_eq!(Sha256Digest::of_bytes(b"").as_str(), EMPTY);
    }

    #[test]
    fn test_parse_normalizes_case() {
        let upper = EMPTY.to_uppercase();
        let digest = Sha256Digest::parse(&upper).expect("uppercase hex should parse");
        assert_eq!(digest.as_str(), EMPTY);
    }

    #[test]
    fn test_parse_rejects_short_and_non_hex() {
        assert!(Sha256Digest::parse("abcd").is_err());
        assert!(Sha256Digest::parse(&"z".repeat(64)).is_err());
        assert!(Sha256Digest::parse("").is_err());
    }

    #[test]
    fn test_from_sha256sum_output() {
        let line = format!("{}  /usr/local/bin/pack\n", EMPTY);
        let digest = Sha256Digest::from_sha256sum_output(&line).expect("should parse");
        assert_eq!(digest.as_str(), EMPTY);

        let escaped = format!("\\{}  /tmp/odd\\nname\n", EMPTY);
        let digest = Sha256Digest::from_sha256sum_output(&escaped).expect("should parse");
        assert_eq!(digest.as_str(), EMPTY);

        assert!(Sha256Digest::from_sha256sum_output("   ").is_err());
    }

    #[test]
    fn test_of_file_matches_of_bytes() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(b"hello tarball").expect("write");
        let from_file = Sha256Digest::of_file(file.path()).expect("digest file");
        assert_eq!(from_file, Sha256Digest::of_bytes(b"hello tarball"));
    }

    #[test]
    fn test_serde_roundtrip_rejects_invalid() {
        let json = format!("\"{}\"", EMPTY);
        let digest: Sha256Digest = serde_json::from_str(&json).expect("valid digest");
        assert_eq!(serde_json::to_string(&digest).expect("serialize"), json);

        let bad: std::result::Result<Sha256Digest, _> = serde_json::from_str("\"1234\"");
        assert!(bad.is_err());
    }
}
