use strsim::jaro_winkler;

use crate::config::Config;
use crate::models::{ApplicationRecord, EmailFinding};

/// Trailing legal-form tokens stripped from company names before matching.
/// The concrete list is a local choice; it only needs to be stable.
const LEGAL_SUFFIXES: &[&str] = &[
    "inc",
    "incorporated",
    "llc",
    "ltd",
    "limited",
    "corp",
    "corporation",
    "co",
    "company",
    "gmbh",
    "plc",
    "technologies",
    "labs",
];

/// Case-fold, replace punctuation with spaces, collapse whitespace.
fn scrub(s: &str) -> String {
    let lowered: String = s
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    lowered.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn normalize_company(s: &str) -> String {
    let scrubbed = scrub(s);
    let mut tokens: Vec<&str> = scrubbed.split_whitespace().collect();
    // Strip trailing legal suffixes, but never down to nothing.
    while tokens.len() > 1 {
        match tokens.last() {
            Some(last) if LEGAL_SUFFIXES.contains(last) => {
                tokens.pop();
            }
            _ => break,
        }
    }
    tokens.join(" ")
}

pub fn normalize_position(s: &str) -> String {
    scrub(s)
}

/// The natural key of a record: normalized company and position.
pub fn normalized_key(company: &str, position: &str) -> String {
    format!("{}|{}", normalize_company(company), normalize_position(position))
}

#[derive(Debug, Clone, Copy)]
pub struct MatchThresholds {
    pub company: f64,
    pub position: f64,
    /// Fuzzy matches below this score are demoted to NoMatch by the caller.
    pub confirm: f64,
}

impl MatchThresholds {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            company: cfg.company_threshold,
            position: cfg.position_threshold,
            confirm: cfg.confirm_threshold,
        }
    }
}

/// Outcome of matching a finding against the current records. Indices
/// refer to the slice passed to `match_finding`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchResult {
    Exact { index: usize },
    Fuzzy { index: usize, score: f64 },
    NoMatch,
}

/// Map a finding onto an existing record, or conclude it is new.
///
/// Exact key equality wins, then thread continuity (the same mailbox
/// thread cannot split into two applications, so a known thread id
/// outranks any text drift), then fuzzy company similarity with a weaker
/// position check. Ties on fuzzy score prefer the most recently updated
/// record.
pub fn match_finding(
    finding: &EmailFinding,
    records: &[ApplicationRecord],
    thresholds: &MatchThresholds,
) -> MatchResult {
    if let (Some(company), Some(position)) = (&finding.company, &finding.position) {
        let key = normalized_key(company, position);
        if let Some(index) = records
            .iter()
            .position(|r| normalized_key(&r.company, &r.position) == key)
        {
            return MatchResult::Exact { index };
        }
    }

    if !finding.source_thread_id.is_empty() {
        if let Some(index) = records
            .iter()
            .position(|r| r.thread_ids.contains(&finding.source_thread_id))
        {
            return MatchResult::Exact { index };
        }
    }

    let Some(company) = &finding.company else {
        return MatchResult::NoMatch;
    };
    let norm_company = normalize_company(company);
    if norm_company.is_empty() {
        return MatchResult::NoMatch;
    }

    let mut best: Option<(usize, f64)> = None;
    for (index, record) in records.iter().enumerate() {
        let score = jaro_winkler(&norm_company, &normalize_company(&record.company));
        let better = match best {
            None => true,
            Some((best_index, best_score)) => {
                score > best_score
                    || (score == best_score
                        && record.last_updated > records[best_index].last_updated)
            }
        };
        if better {
            best = Some((index, score));
        }
    }

    let Some((index, score)) = best else {
        return MatchResult::NoMatch;
    };
    if score < thresholds.company {
        return MatchResult::NoMatch;
    }

    // A plausible company alone is not enough; the position must agree too.
    let Some(position) = &finding.position else {
        return MatchResult::NoMatch;
    };
    let position_score = jaro_winkler(
        &normalize_position(position),
        &normalize_position(&records[index].position),
    );
    if position_score < thresholds.position {
        return MatchResult::NoMatch;
    }

    MatchResult::Fuzzy { index, score }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Status;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeSet;

    fn record(company: &str, position: &str, updated_secs: i64) -> ApplicationRecord {
        ApplicationRecord {
            company: company.to_string(),
            position: position.to_string(),
            status: Status::Applied,
            date_applied: Utc.timestamp_opt(0, 0).unwrap().date_naive(),
            last_updated: Utc.timestamp_opt(updated_secs, 0).unwrap(),
            contact_person: None,
            contact_email: None,
            job_url: None,
            salary_range: None,
            location: None,
            notes: vec![],
            thread_ids: BTreeSet::new(),
        }
    }

    fn finding(company: Option<&str>, position: Option<&str>, thread: &str) -> EmailFinding {
        EmailFinding {
            is_job_related: true,
            confidence: 0.9,
            company: company.map(|s| s.to_string()),
            position: position.map(|s| s.to_string()),
            detected_status: Status::Unknown,
            contact_person: None,
            contact_email: None,
            job_url: None,
            salary_range: None,
            location: None,
            important_dates: vec![],
            source_thread_id: thread.to_string(),
            source_timestamp: Utc.timestamp_opt(100, 0).unwrap(),
        }
    }

    fn thresholds() -> MatchThresholds {
        MatchThresholds {
            company: 0.88,
            position: 0.75,
            confirm: 0.93,
        }
    }

    #[test]
    fn test_normalize_company_strips_legal_suffixes() {
        assert_eq!(normalize_company("Acme Corp."), "acme");
        assert_eq!(normalize_company("Acme, Inc."), "acme");
        assert_eq!(normalize_company("Initech  Co"), "initech");
        assert_eq!(normalize_company("Wayne Enterprises Ltd"), "wayne enterprises");
        // never strip down to nothing
        assert_eq!(normalize_company("Inc"), "inc");
    }

    #[test]
    fn test_normalize_position_collapses() {
        assert_eq!(normalize_position("Sr.  Backend   Engineer"), "sr backend engineer");
        assert_eq!(normalize_position("ENGINEER (Backend)"), "engineer backend");
    }

    #[test]
    fn test_exact_match_on_normalized_key() {
        let records = vec![record("Acme Corp", "Backend Engineer", 0)];
        let f = finding(Some("Acme Corp."), Some("Backend  Engineer"), "t-new");
        assert_eq!(
            match_finding(&f, &records, &thresholds()),
            MatchResult::Exact { index: 0 }
        );
    }

    #[test]
    fn test_thread_continuity_outranks_text_drift() {
        let mut r = record("Acme Corp", "Backend Engineer", 0);
        r.thread_ids.insert("t1".to_string());
        let records = vec![r];
        // Company text drifted completely; the thread still binds it.
        let f = finding(Some("AC Holdings"), Some("Software Engineer II"), "t1");
        assert_eq!(
            match_finding(&f, &records, &thresholds()),
            MatchResult::Exact { index: 0 }
        );
    }

    #[test]
    fn test_fuzzy_match_close_company() {
        let records = vec![record("Acme", "Backend Engineer", 0)];
        let f = finding(Some("Acmee"), Some("Backend Engineer"), "t2");
        match match_finding(&f, &records, &thresholds()) {
            MatchResult::Fuzzy { index, score } => {
                assert_eq!(index, 0);
                assert!(score >= 0.93, "score {score}");
            }
            other => panic!("expected fuzzy match, got {other:?}"),
        }
    }

    #[test]
    fn test_different_companies_no_match() {
        let records = vec![record("Acme Corp", "Backend Engineer", 0)];
        let f = finding(Some("Acme Robotics"), Some("Backend Engineer"), "t3");
        assert_eq!(match_finding(&f, &records, &thresholds()), MatchResult::NoMatch);
    }

    #[test]
    fn test_fuzzy_requires_position_agreement() {
        let records = vec![record("Acme", "Backend Engineer", 0)];
        let f = finding(Some("Acmee"), Some("Head of Marketing"), "t4");
        assert_eq!(match_finding(&f, &records, &thresholds()), MatchResult::NoMatch);
    }

    #[test]
    fn test_fuzzy_without_position_is_no_match() {
        let records = vec![record("Acme", "Backend Engineer", 0)];
        let f = finding(Some("Acmee"), None, "t5");
        assert_eq!(match_finding(&f, &records, &thresholds()), MatchResult::NoMatch);
    }

    #[test]
    fn test_tie_break_prefers_most_recently_updated() {
        // Both normalize to "acme"; neither matches the finding's key exactly.
        let records = vec![
            record("Acme Inc", "Engineer One", 10),
            record("Acme LLC", "Engineer Two", 20),
        ];
        let f = finding(Some("Acme"), Some("Engineer"), "t6");
        match match_finding(&f, &records, &thresholds()) {
            MatchResult::Fuzzy { index, .. } => assert_eq!(index, 1),
            other => panic!("expected fuzzy match, got {other:?}"),
        }
    }

    #[test]
    fn test_no_records_no_match() {
        let f = finding(Some("Acme"), Some("Engineer"), "t7");
        assert_eq!(match_finding(&f, &[], &thresholds()), MatchResult::NoMatch);
    }
}
