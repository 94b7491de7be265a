//! Candidate file loading.
//!
//! Accepts a JSON array of records or JSON Lines (one record per line,
//! blank lines ignored). Field names follow [`CandidateRecord`]'s serde
//! form: `id`, `title`, `abstract`, `categories`, `published_at`.

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use surveysift_core::{CandidateRecord, Result, SiftError};

/// Days per month when applying `--months`.
const DAYS_PER_MONTH: i64 = 30;

pub fn load_candidates(path: &Path) -> Result<Vec<CandidateRecord>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| SiftError::InputUnreadable(format!("{}: {e}", path.display())))?;
    parse_candidates(&raw)
        .map_err(|detail| SiftError::InputUnreadable(format!("{}: {detail}", path.display())))
}

fn parse_candidates(raw: &str) -> std::result::Result<Vec<CandidateRecord>, String> {
    if raw.trim_start().starts_with('[') {
        return serde_json::from_str(raw).map_err(|e| e.to_string());
    }
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line).map_err(|e| format!("line {}: {e}", n + 1))
        })
        .collect()
}

/// Keep candidates published within the last `months` (30-day) months.
pub fn filter_recent(
    candidates: Vec<CandidateRecord>,
    months: u32,
    now: DateTime<Utc>,
) -> Vec<CandidateRecord> {
    let cutoff = now - Duration::days(DAYS_PER_MONTH * i64::from(months));
    candidates
        .into_iter()
        .filter(|c| c.published_at >= cutoff)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const RECORD_A: &str = r#"{"id":"2401.00001","title":"A Survey of GNNs","abstract":"We review.","categories":["cs.LG"],"published_at":"2024-01-05"}"#;
    const RECORD_B: &str = r#"{"id":"2402.00002","title":"GraphRAG","abstract":"A method.","published_at":"2024-02-10T12:00:00Z"}"#;

    #[test]
    fn test_json_array() {
        let raw = format!("[{RECORD_A},\n{RECORD_B}]");
        let records = parse_candidates(&raw).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "2401.00001");
        assert_eq!(records[0].abstract_text, "We review.");
        assert!(records[1].categories.is_empty());
    }

    #[test]
    fn test_json_lines_skip_blank_lines() {
        let raw = format!("{RECORD_A}\n\n{RECORD_B}\n");
        let records = parse_candidates(&raw).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].id, "2402.00002");
    }

    #[test]
    fn test_bad_line_is_reported_with_its_number() {
        let raw = format!("{RECORD_A}\n\n{{\"id\": 3}}\n");
        let err = parse_candidates(&raw).unwrap_err();
        assert!(err.starts_with("line 3:"), "{err}");
    }

    #[test]
    fn test_missing_file_is_input_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_candidates(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, SiftError::InputUnreadable(_)));
        assert!(err.is_fatal_config());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("papers.jsonl");
        std::fs::write(&path, format!("{RECORD_A}\n{RECORD_B}\n")).unwrap();
        assert_eq!(load_candidates(&path).unwrap().len(), 2);
    }

    #[test]
    fn test_filter_recent_uses_thirty_day_months() {
        let records = parse_candidates(&format!("[{RECORD_A},{RECORD_B}]")).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();

        // Cutoff 2024-01-31: only the February record survives.
        let kept = filter_recent(records.clone(), 1, now);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "2402.00002");

        // Cutoff 2024-01-01: both survive, order preserved.
        let kept = filter_recent(records, 2, now);
        let ids: Vec<_> = kept.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["2401.00001", "2402.00002"]);
    }
}
