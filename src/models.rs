use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

/// Application lifecycle status. Closed enumeration; the partial order
/// between non-terminal states lives in `merge::StatusPolicy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Applied,
    UnderReview,
    AssessmentRequested,
    InterviewScheduled,
    InterviewCompleted,
    Offer,
    Rejected,
    Withdrawn,
    Unknown,
}

impl Status {
    pub const ALL: [Status; 9] = [
        Status::Applied,
        Status::UnderReview,
        Status::AssessmentRequested,
        Status::InterviewScheduled,
        Status::InterviewCompleted,
        Status::Offer,
        Status::Rejected,
        Status::Withdrawn,
        Status::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Applied => "Applied",
            Status::UnderReview => "Under Review",
            Status::AssessmentRequested => "Assessment Requested",
            Status::InterviewScheduled => "Interview Scheduled",
            Status::InterviewCompleted => "Interview Completed",
            Status::Offer => "Offer",
            Status::Rejected => "Rejected",
            Status::Withdrawn => "Withdrawn",
            Status::Unknown => "Unknown",
        }
    }

    /// Terminal states override any rank and end normal progression.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Rejected | Status::Withdrawn)
    }

    /// Exact case-insensitive parse.
    pub fn parse(s: &str) -> Option<Status> {
        let s = s.trim();
        Status::ALL
            .iter()
            .copied()
            .find(|st| st.as_str().eq_ignore_ascii_case(s))
    }

    /// Lenient parse for model output: exact match first, then canonical
    /// name contained in the input ("offer received" -> Offer). Unmapped
    /// values come back as Unknown.
    pub fn parse_loose(s: &str) -> Status {
        if let Some(st) = Status::parse(s) {
            return st;
        }
        let lower = s.trim().to_lowercase();
        for st in Status::ALL {
            if st == Status::Unknown {
                continue;
            }
            if lower.contains(&st.as_str().to_lowercase()) {
                return st;
            }
        }
        Status::Unknown
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tracked application; one row of the tabular store. The normalized
/// `(company, position)` pair is the natural key and at most one record
/// exists per key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationRecord {
    pub company: String,
    pub position: String,
    pub status: Status,
    /// Set once at creation; only an explicit correction may change it.
    pub date_applied: NaiveDate,
    pub last_updated: DateTime<Utc>,
    pub contact_person: Option<String>,
    pub contact_email: Option<String>,
    pub job_url: Option<String>,
    pub salary_range: Option<String>,
    pub location: Option<String>,
    /// Append-only chronological log; one timestamped entry per merged email.
    pub notes: Vec<String>,
    /// A record may aggregate several mailbox threads for the same key.
    pub thread_ids: BTreeSet<String>,
}

/// A dated event mentioned in an email (interview, deadline, start date).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportantDate {
    pub label: String,
    pub date: NaiveDate,
}

/// Ephemeral classification result for one email. Consumed by the matcher
/// and merge engine, then discarded; never persisted as-is.
#[derive(Debug, Clone)]
pub struct EmailFinding {
    pub is_job_related: bool,
    pub confidence: f64,
    pub company: Option<String>,
    pub position: Option<String>,
    pub detected_status: Status,
    pub contact_person: Option<String>,
    pub contact_email: Option<String>,
    pub job_url: Option<String>,
    pub salary_range: Option<String>,
    pub location: Option<String>,
    pub important_dates: Vec<ImportantDate>,
    pub source_thread_id: String,
    pub source_timestamp: DateTime<Utc>,
}

/// One email as retrieved from the mailbox provider.
#[derive(Debug, Clone)]
pub struct RawEmail {
    pub id: String,
    pub subject: String,
    pub body: String,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
    pub thread_id: String,
}

/// Run-to-run continuity state, passed explicitly into and out of each
/// cycle so cycles are testable in isolation. The durable copy lives in
/// the store and is advanced only after a successful persist.
#[derive(Debug, Clone, Default)]
pub struct CycleState {
    /// Latest timestamp up to which emails have been reconciled.
    pub watermark: Option<DateTime<Utc>>,
    /// Email ids already folded into the tracker.
    pub processed: HashSet<String>,
}
