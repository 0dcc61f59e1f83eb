//! Identity and detection value types.
//!
//! Everything a detector hands to the attendance ledger passes through these
//! constructors, so malformed labels or scores are rejected at the boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("identity is empty")]
    EmptyIdentity,
    #[error("identity {0:?} contains a control character")]
    ControlCharacter(String),
    #[error("confidence {0} is outside [0, 1]")]
    ConfidenceOutOfRange(f32),
}

/// Opaque identifier of a recognized person (e.g. a student number).
///
/// Surrounding whitespace is trimmed on construction; the stored value is
/// never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    pub fn new(raw: impl AsRef<str>) -> Result<Self, ValidationError> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyIdentity);
        }
        if trimmed.chars().any(char::is_control) {
            return Err(ValidationError::ControlCharacter(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Identity {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Identity {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Identity> for String {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

/// One recognized person in one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    identity: Identity,
    confidence: f32,
}

impl Detection {
    /// Build a detection; `confidence` must be finite and within `[0, 1]`.
    pub fn new(identity: Identity, confidence: f32) -> Result<Self, ValidationError> {
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            return Err(ValidationError::ConfidenceOutOfRange(confidence));
        }
        Ok(Self {
            identity,
            confidence,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_trims_whitespace() {
        let id = Identity::new("  s1024 ").unwrap();
        assert_eq!(id.as_str(), "s1024");
    }

    #[test]
    fn test_identity_rejects_empty() {
        assert_eq!(Identity::new("   "), Err(ValidationError::EmptyIdentity));
        assert_eq!(Identity::new(""), Err(ValidationError::EmptyIdentity));
    }

    #[test]
    fn test_identity_rejects_control_characters() {
        assert!(matches!(
            Identity::new("ali\nce"),
            Err(ValidationError::ControlCharacter(_))
        ));
    }

    #[test]
    fn test_identity_serde_validates() {
        let id: Identity = serde_json::from_str("\"alice\"").unwrap();
        assert_eq!(id.as_str(), "alice");
        assert!(serde_json::from_str::<Identity>("\"\"").is_err());
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"alice\"");
    }

    #[test]
    fn test_detection_accepts_unit_interval() {
        let id = Identity::new("bob").unwrap();
        assert!(Detection::new(id.clone(), 0.0).is_ok());
        assert!(Detection::new(id.clone(), 1.0).is_ok());
        let det = Detection::new(id, 0.73).unwrap();
        assert_eq!(det.identity().as_str(), "bob");
        assert!((det.confidence() - 0.73).abs() < 1e-6);
    }

    #[test]
    fn test_detection_rejects_bad_confidence() {
        let id = Identity::new("bob").unwrap();
        for bad in [-0.01, 1.01, f32::NAN, f32::INFINITY] {
            assert!(Detection::new(id.clone(), bad).is_err(), "accepted {bad}");
        }
    }
}
