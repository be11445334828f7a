//! Work unit identity.
//!
//! A unit is one content item in one dimension. Its key
//! `(parent_content_id, dimension, sub_type)` is what every idempotence
//! check compares.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One axis of repeated work within a job, e.g. a target language code.
///
/// Stored trimmed and lowercased so `"DE "` and `"de"` name the same
/// dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Dimension(String);

impl Dimension {
    pub fn new(code: impl AsRef<str>) -> Self {
        Self(code.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Dimension {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for Dimension {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<Dimension> for String {
    fn from(d: Dimension) -> Self {
        d.0
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The idempotence key of a unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitKey {
    pub parent_content_id: String,
    pub dimension: Dimension,
    pub sub_type: String,
}

impl UnitKey {
    pub fn new(
        parent_content_id: impl Into<String>,
        dimension: impl Into<Dimension>,
        sub_type: impl Into<String>,
    ) -> Self {
        Self {
            parent_content_id: parent_content_id.into(),
            dimension: dimension.into(),
            sub_type: sub_type.into(),
        }
    }

    /// Short stable fingerprint of the key (8 hex chars).
    ///
    /// Used for locator and title suffixes, so the same unit always gets the
    /// same suffix no matter how many times it is retried.
    pub fn fingerprint(&self) -> String {
        // FNV-1a 64, folded to 32 bits.
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for part in [
            self.parent_content_id.as_str(),
            self.dimension.as_str(),
            self.sub_type.as_str(),
        ] {
            for byte in part.bytes().chain(std::iter::once(0u8)) {
                hash ^= u64::from(byte);
                hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
            }
        }
        format!("{:08x}", (hash ^ (hash >> 32)) as u32)
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.parent_content_id, self.dimension, self.sub_type
        )
    }
}

/// A unit produced by the generation collaborator, ready to be written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducedUnit {
    pub key: UnitKey,
    pub scope_id: String,
    pub ordinal: i64,
    /// Group shared with the source and every other dimension variant.
    pub grouping_key: String,
    pub title: String,
    pub body: serde_json::Value,
    /// The sibling record in this dimension that the unit links back to.
    pub link_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimension_is_normalized() {
        assert_eq!(Dimension::new(" DE "), Dimension::from("de"));
        assert_eq!(Dimension::new("Pt-BR").as_str(), "pt-br");
    }

    #[test]
    fn test_dimension_serde_is_plain_string() {
        let json = serde_json::to_string(&Dimension::new("FR")).unwrap();
        assert_eq!(json, "\"fr\"");
        let back: Dimension = serde_json::from_str("\"IT\"").unwrap();
        assert_eq!(back.as_str(), "it");
    }

    #[test]
    fn test_fingerprint_is_stable_and_distinct() {
        let a = UnitKey::new("src-1", "de", "article");
        let b = UnitKey::new("src-1", "fr", "article");
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
        assert_eq!(a.fingerprint().len(), 8);
        assert_ne!(a.fingerprint(), b.fingerprint());
        // Field boundaries matter.
        assert_ne!(
            UnitKey::new("ab", "c", "x").fingerprint(),
            UnitKey::new("a", "bc", "x").fingerprint()
        );
    }

    #[test]
    fn test_unit_key_display() {
        assert_eq!(UnitKey::new("s", "DE", "faq").to_string(), "s/de/faq");
    }
}
