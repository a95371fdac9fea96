use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::ai::{Classification, Classifier, sender_domain};
use crate::config::Config;
use crate::error::TrackerError;
use crate::mailbox::Mailbox;
use crate::matcher::{MatchThresholds, match_finding};
use crate::merge::{self, MergeOutcome, StatusPolicy};
use crate::models::{CycleState, RawEmail};
use crate::store::TrackerStore;

/// Phases of one cycle, attached to failure logs so a bad email or
/// store hiccup can be placed without re-running.
#[derive(Debug, Clone, Copy)]
enum Stage {
    Classifying,
    Persisting,
}

/// Counters for one reconciliation cycle.
#[derive(Debug, Default, Clone, Copy)]
pub struct CycleReport {
    pub fetched: usize,
    pub candidates: usize,
    pub job_related: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Cheap prefilter deciding whether an email is worth a provider call.
/// Known recruiting platforms always qualify; social/notification senders
/// must show a keyword in the subject; everything else needs a keyword
/// anywhere.
pub fn is_candidate(email: &RawEmail, cfg: &Config) -> bool {
    let domain = sender_domain(&email.sender).unwrap_or_default();
    if cfg.ats_domains.iter().any(|d| domain.ends_with(d.as_str())) {
        return true;
    }

    let subject = email.subject.to_lowercase();
    if cfg.social_domains.iter().any(|d| domain.ends_with(d.as_str())) {
        return cfg
            .keywords
            .iter()
            .any(|k| subject.contains(&k.to_lowercase()));
    }

    let body = email.body.to_lowercase();
    cfg.keywords.iter().any(|k| {
        let k = k.to_lowercase();
        subject.contains(&k) || body.contains(&k)
    })
}

/// Start of the fetch window: the watermark when it is inside the
/// lookback window, the lookback floor otherwise. The floor bounds how
/// far a stale watermark can drag a fetch into the past.
pub fn cycle_since(
    now: DateTime<Utc>,
    cfg: &Config,
    watermark: Option<DateTime<Utc>>,
) -> DateTime<Utc> {
    let floor = now - Duration::hours(cfg.lookback_hours);
    match watermark {
        Some(w) if w > floor => w,
        _ => floor,
    }
}

/// One reconciliation cycle: fetch, classify, match, merge, persist.
///
/// Already-processed emails are skipped up front, so re-running a cycle
/// over the same window is a no-op. An email is marked processed only
/// after the record change it caused (if any) has been persisted;
/// transport failures leave it unmarked for the next cycle. The watermark
/// advances only when every email in the window settled.
pub fn run_cycle(
    mailbox: &mut dyn Mailbox,
    classifier: &Classifier,
    store: &mut dyn TrackerStore,
    cfg: &Config,
    state: &mut CycleState,
    since: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<CycleReport, TrackerError> {
    let policy = StatusPolicy::from_order(&cfg.parsed_status_order()?);
    let thresholds = MatchThresholds::from_config(cfg);
    let mut report = CycleReport::default();

    let emails = mailbox.fetch(since, cfg.max_emails_per_cycle)?;
    report.fetched = emails.len();
    debug!(fetched = emails.len(), since = %since, "cycle window");

    // Working view of the table; same-key emails within one cycle merge
    // sequentially against it before anything is persisted.
    let mut records = store.list_records()?;
    let baseline = records.len();

    // index -> emails that shaped that record this cycle
    let mut touched: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    let mut done_ids: Vec<String> = Vec::new();
    let mut clean = true;

    for email in &emails {
        if state.processed.contains(&email.id) {
            continue;
        }
        if !is_candidate(email, cfg) {
            report.skipped += 1;
            done_ids.push(email.id.clone());
            continue;
        }
        report.candidates += 1;

        let finding = match classifier.classify(email) {
            Ok(Classification::JobRelated(f)) => f,
            Ok(Classification::NotJobRelated) => {
                report.skipped += 1;
                done_ids.push(email.id.clone());
                continue;
            }
            Err(err) => {
                warn!(
                    email_id = %email.id,
                    stage = ?Stage::Classifying,
                    %err,
                    "classification failed, will retry"
                );
                report.failed += 1;
                clean = false;
                continue;
            }
        };
        report.job_related += 1;

        let matched = match_finding(&finding, &records, &thresholds);
        match merge::apply(matched, &records, &finding, now, &policy, cfg.confirm_threshold) {
            MergeOutcome::CreateNew(record) => {
                info!(company = %record.company, position = %record.position, "new application");
                records.push(record);
                touched
                    .entry(records.len() - 1)
                    .or_default()
                    .push(email.id.clone());
                report.created += 1;
            }
            MergeOutcome::UpdateExisting {
                index,
                record,
                changed,
            } => {
                info!(
                    company = %record.company,
                    position = %record.position,
                    ?changed,
                    "application updated"
                );
                records[index] = record;
                touched.entry(index).or_default().push(email.id.clone());
                report.updated += 1;
            }
            MergeOutcome::Skip => {
                report.skipped += 1;
                done_ids.push(email.id.clone());
            }
        }
    }

    // Persist changed records. A failed persist keeps its emails
    // unmarked so the next cycle retries them.
    for (index, email_ids) in &touched {
        let result = if *index >= baseline {
            store.append_record(&records[*index])
        } else {
            store.update_record(&records[*index])
        };
        match result {
            Ok(()) => done_ids.extend(email_ids.iter().cloned()),
            Err(err) => {
                warn!(
                    company = %records[*index].company,
                    stage = ?Stage::Persisting,
                    %err,
                    "persist failed, emails kept for retry"
                );
                report.failed += email_ids.len();
                clean = false;
            }
        }
    }

    for id in &done_ids {
        match store.mark_processed(id) {
            Ok(()) => {
                state.processed.insert(id.clone());
            }
            Err(err) => {
                warn!(
                    email_id = %id,
                    stage = ?Stage::Persisting,
                    %err,
                    "failed to mark processed"
                );
                clean = false;
            }
        }
    }

    if clean {
        // A fetch that filled the limit may have cut off later emails in
        // the window; the watermark then stops just past the last email
        // seen instead of jumping to now.
        let target = if report.fetched >= cfg.max_emails_per_cycle {
            emails
                .last()
                .map(|e| e.timestamp + Duration::seconds(1))
                .unwrap_or(now)
                .min(now)
        } else {
            now
        };
        match store.set_watermark(target) {
            Ok(()) => state.watermark = Some(target),
            Err(err) => warn!(%err, "failed to persist watermark"),
        }
    }

    Ok(report)
}

/// Poll forever until `stop` is raised. Cycle failures are logged and the
/// loop keeps going; the interval sleep is sliced so shutdown stays
/// responsive.
pub fn run_watch(
    mailbox: &mut dyn Mailbox,
    classifier: &Classifier,
    store: &mut dyn TrackerStore,
    cfg: &Config,
    stop: &AtomicBool,
) -> Result<(), TrackerError> {
    let mut state = store.load_state()?;
    info!(
        interval_secs = cfg.poll_interval_secs,
        "watching for new email"
    );

    while !stop.load(Ordering::Relaxed) {
        let now = Utc::now();
        let since = cycle_since(now, cfg, state.watermark);
        match run_cycle(mailbox, classifier, store, cfg, &mut state, since, now) {
            Ok(report) => info!(
                fetched = report.fetched,
                created = report.created,
                updated = report.updated,
                skipped = report.skipped,
                failed = report.failed,
                "cycle complete"
            ),
            Err(err) => warn!(%err, "cycle failed"),
        }

        let deadline = Instant::now() + std::time::Duration::from_secs(cfg.poll_interval_secs);
        while Instant::now() < deadline && !stop.load(Ordering::Relaxed) {
            std::thread::sleep(std::time::Duration::from_millis(250));
        }
    }

    info!("watch stopped");
    Ok(())
}
