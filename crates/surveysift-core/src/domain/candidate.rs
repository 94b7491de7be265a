//! Candidate records: the immutable input of an evaluation run.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};

/// One paper subject to classification.
///
/// Owned by whoever loaded it; the engine only ever reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub id: String,
    pub title: String,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    #[serde(default)]
    pub categories: Vec<String>,
    /// Publication time. Accepts RFC 3339 or a bare `YYYY-MM-DD` date.
    #[serde(deserialize_with = "deserialize_published_at")]
    pub published_at: DateTime<Utc>,
}

impl CandidateRecord {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        abstract_text: impl Into<String>,
        categories: Vec<String>,
        published_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            abstract_text: abstract_text.into(),
            categories,
            published_at,
        }
    }

    /// SHA-256 over id, title and abstract, hex encoded.
    pub fn fingerprint(&self) -> CandidateFingerprint {
        let mut hasher = Sha256::new();
        for part in [&self.id, &self.title, &self.abstract_text] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        CandidateFingerprint {
            id: self.id.clone(),
            digest: hex::encode(hasher.finalize()),
        }
    }
}

/// Identity of a candidate as recorded in a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateFingerprint {
    pub id: String,
    pub digest: String,
}

fn deserialize_published_at<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_published_at(&raw).map_err(serde::de::Error::custom)
}

/// Parse a publication timestamp from RFC 3339 or `YYYY-MM-DD`.
pub fn parse_published_at(raw: &str) -> Result<DateTime<Utc>, String> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| format!("unrecognised publication timestamp: {raw:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CandidateRecord {
        CandidateRecord::new(
            "2401.00001",
            "A Survey of Graph Neural Networks",
            "We review message passing architectures.",
            vec!["cs.LG".into()],
            parse_published_at("2024-01-02").unwrap(),
        )
    }

    #[test]
    fn test_fingerprint_is_stable_and_content_sensitive() {
        let a = sample();
        let b = sample();
        assert_eq!(a.fingerprint(), b.fingerprint());

        let mut changed = sample();
        changed.title.push('!');
        assert_ne!(a.fingerprint().digest, changed.fingerprint().digest);
        assert_eq!(a.fingerprint().id, changed.fingerprint().id);
    }

    #[test]
    fn test_published_at_accepts_date_and_rfc3339() {
        let date = parse_published_at("2024-03-01").unwrap();
        let full = parse_published_at("2024-03-01T00:00:00Z").unwrap();
        assert_eq!(date, full);
        assert!(parse_published_at("March 1st").is_err());
    }

    #[test]
    fn test_deserializes_abstract_field_name() {
        let json = r#"{
            "id": "x1",
            "title": "T",
            "abstract": "A",
            "categories": ["cs.AI"],
            "published_at": "2023-12-31"
        }"#;
        let record: CandidateRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.abstract_text, "A");
        assert_eq!(record.categories, vec!["cs.AI".to_string()]);
    }
}
