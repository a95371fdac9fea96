use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use tracing::warn;

use crate::matcher::MatchResult;
use crate::models::{ApplicationRecord, EmailFinding, Status};

/// Configurable partial order over non-terminal statuses. Terminal
/// statuses (Rejected, Withdrawn) sit outside the order and always apply.
#[derive(Debug, Clone)]
pub struct StatusPolicy {
    ranks: HashMap<Status, u8>,
}

impl StatusPolicy {
    pub fn from_order(order: &[Status]) -> Self {
        let ranks = order
            .iter()
            .enumerate()
            .map(|(i, st)| (*st, i as u8))
            .collect();
        Self { ranks }
    }

    pub fn rank(&self, status: Status) -> Option<u8> {
        self.ranks.get(&status).copied()
    }
}

impl Default for StatusPolicy {
    fn default() -> Self {
        Self::from_order(&[
            Status::Applied,
            Status::UnderReview,
            Status::AssessmentRequested,
            Status::InterviewScheduled,
            Status::InterviewCompleted,
            Status::Offer,
        ])
    }
}

/// What the merge engine decided for one finding. Persistence is the
/// caller's job; this produces only the next record state.
#[derive(Debug, Clone)]
pub enum MergeOutcome {
    CreateNew(ApplicationRecord),
    UpdateExisting {
        /// Index into the records slice the match referred to.
        index: usize,
        record: ApplicationRecord,
        /// Field names that changed, for logging.
        changed: Vec<&'static str>,
    },
    Skip,
}

/// Fold a finding into the tracked set.
///
/// Fuzzy matches below `confirm_threshold` are treated as no match: a
/// duplicate-candidate row is cheaper to fix by hand than two silently
/// merged applications.
pub fn apply(
    match_result: MatchResult,
    records: &[ApplicationRecord],
    finding: &EmailFinding,
    now: DateTime<Utc>,
    policy: &StatusPolicy,
    confirm_threshold: f64,
) -> MergeOutcome {
    if !finding.is_job_related {
        return MergeOutcome::Skip;
    }

    let matched = match match_result {
        MatchResult::Exact { index } => Some(index),
        MatchResult::Fuzzy { index, score } if score >= confirm_threshold => Some(index),
        _ => None,
    };

    match matched {
        Some(index) => update_existing(index, &records[index], finding, now, policy),
        None => create_new(finding, now),
    }
}

fn create_new(finding: &EmailFinding, now: DateTime<Utc>) -> MergeOutcome {
    let Some(company) = clean(&finding.company) else {
        // Without a company there is nothing to key the row on.
        return MergeOutcome::Skip;
    };
    let position = clean(&finding.position).unwrap_or_else(|| "Unknown Position".to_string());

    let status = match finding.detected_status {
        Status::Unknown => Status::Applied,
        other => other,
    };
    let date_applied = finding
        .important_dates
        .iter()
        .map(|d| d.date)
        .min()
        .unwrap_or_else(|| finding.source_timestamp.date_naive());

    let mut thread_ids = BTreeSet::new();
    if !finding.source_thread_id.is_empty() {
        thread_ids.insert(finding.source_thread_id.clone());
    }

    MergeOutcome::CreateNew(ApplicationRecord {
        company,
        position,
        status,
        date_applied,
        last_updated: now,
        contact_person: clean(&finding.contact_person),
        contact_email: clean(&finding.contact_email),
        job_url: clean(&finding.job_url),
        salary_range: clean(&finding.salary_range),
        location: clean(&finding.location),
        notes: vec![note_line(finding, now)],
        thread_ids,
    })
}

fn update_existing(
    index: usize,
    existing: &ApplicationRecord,
    finding: &EmailFinding,
    now: DateTime<Utc>,
    policy: &StatusPolicy,
) -> MergeOutcome {
    let mut record = existing.clone();
    let mut changed = Vec::new();

    fill(&mut record.contact_person, &finding.contact_person, "contact_person", &mut changed);
    fill(&mut record.contact_email, &finding.contact_email, "contact_email", &mut changed);
    fill(&mut record.job_url, &finding.job_url, "job_url", &mut changed);
    fill(&mut record.salary_range, &finding.salary_range, "salary_range", &mut changed);
    fill(&mut record.location, &finding.location, "location", &mut changed);

    record.notes.push(note_line(finding, now));

    let new_status = finding.detected_status;
    if new_status != Status::Unknown && new_status != record.status {
        if let Some(conflict) = next_status(&mut record, new_status, policy, now) {
            warn!(
                company = %record.company,
                position = %record.position,
                current = %record.status,
                reported = %new_status,
                "status conflict; keeping current status"
            );
            record.notes.push(conflict);
        } else {
            changed.push("status");
        }
    }

    if !finding.source_thread_id.is_empty()
        && record.thread_ids.insert(finding.source_thread_id.clone())
    {
        changed.push("email_thread_id");
    }

    record.last_updated = now;

    MergeOutcome::UpdateExisting {
        index,
        record,
        changed,
    }
}

/// Apply the transition policy. Returns a conflict note when the reported
/// status ranks below the current one and is therefore not applied.
fn next_status(
    record: &mut ApplicationRecord,
    new_status: Status,
    policy: &StatusPolicy,
    now: DateTime<Utc>,
) -> Option<String> {
    let conflict = |record: &ApplicationRecord| {
        Some(format!(
            "[{}] status conflict: email reported {} but record is {}",
            now.format("%Y-%m-%d %H:%M"),
            new_status,
            record.status
        ))
    };

    // Terminal states are reachable from anywhere, including each other.
    if new_status.is_terminal() {
        record.status = new_status;
        return None;
    }
    // Reviving a terminal record would be a backward move.
    if record.status.is_terminal() {
        return conflict(record);
    }

    match (policy.rank(new_status), policy.rank(record.status)) {
        (Some(new_rank), Some(cur_rank)) if new_rank > cur_rank => {
            record.status = new_status;
            None
        }
        // Current status is outside the configured order: accept the
        // ranked value rather than being stuck forever.
        (Some(_), None) => {
            record.status = new_status;
            None
        }
        _ => conflict(record),
    }
}

/// Fill-if-empty with most-recent-non-empty-wins: a differing non-empty
/// value replaces, an empty or missing one never blanks a known value.
fn fill(
    slot: &mut Option<String>,
    incoming: &Option<String>,
    name: &'static str,
    changed: &mut Vec<&'static str>,
) {
    let Some(value) = incoming.as_deref().map(str::trim).filter(|v| !v.is_empty()) else {
        return;
    };
    if slot.as_deref() != Some(value) {
        *slot = Some(value.to_string());
        changed.push(name);
    }
}

fn clean(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// One timestamped, append-only note summarizing the email.
fn note_line(finding: &EmailFinding, now: DateTime<Utc>) -> String {
    let mut parts = Vec::new();
    if finding.detected_status != Status::Unknown {
        parts.push(format!("status: {}", finding.detected_status));
    } else {
        parts.push("email received".to_string());
    }
    for d in &finding.important_dates {
        parts.push(format!("{}: {}", d.label, d.date));
    }
    if !finding.source_thread_id.is_empty() {
        parts.push(format!("thread {}", finding.source_thread_id));
    }
    format!("[{}] {}", now.format("%Y-%m-%d %H:%M"), parts.join("; "))
}
