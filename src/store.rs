use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, params};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use tracing::debug;

use crate::error::TrackerError;
use crate::matcher::normalized_key;
use crate::models::{ApplicationRecord, CycleState, Status};

/// Durable side of the tracker: the application table plus the two pieces
/// of continuity state (processed email ids and the time watermark).
/// Records are addressed by their normalized company|position key.
pub trait TrackerStore {
    fn list_records(&mut self) -> Result<Vec<ApplicationRecord>, TrackerError>;
    fn append_record(&mut self, record: &ApplicationRecord) -> Result<(), TrackerError>;
    fn update_record(&mut self, record: &ApplicationRecord) -> Result<(), TrackerError>;
    fn mark_processed(&mut self, email_id: &str) -> Result<(), TrackerError>;
    fn set_watermark(&mut self, ts: DateTime<Utc>) -> Result<(), TrackerError>;
    fn load_state(&mut self) -> Result<CycleState, TrackerError>;
}

pub struct SqliteStore {
    conn: Connection,
    table: String,
}

const DATE_FMT: &str = "%Y-%m-%d";

impl SqliteStore {
    /// Open (creating if needed) the database and ensure the schema. The
    /// table name comes from validated config and is a plain identifier.
    pub fn open(path: &Path, table: &str) -> Result<Self, TrackerError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    TrackerError::Config(format!(
                        "failed to create {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| TrackerError::transport(format!("failed to open database: {e}")))?;
        let store = Self {
            conn,
            table: table.to_string(),
        };
        store.init_schema()?;
        debug!(path = %path.display(), table, "store opened");
        Ok(store)
    }

    #[cfg(test)]
    fn open_in_memory(table: &str) -> Result<Self, TrackerError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| TrackerError::transport(e))?;
        let store = Self {
            conn,
            table: table.to_string(),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), TrackerError> {
        self.conn
            .execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    norm_key TEXT PRIMARY KEY,
                    company TEXT NOT NULL,
                    position TEXT NOT NULL,
                    status TEXT NOT NULL,
                    date_applied TEXT NOT NULL,
                    last_updated TEXT NOT NULL,
                    contact_person TEXT,
                    contact_email TEXT,
                    job_url TEXT,
                    salary_range TEXT,
                    location TEXT,
                    notes TEXT NOT NULL DEFAULT '',
                    thread_ids TEXT NOT NULL DEFAULT ''
                );
                CREATE TABLE IF NOT EXISTS processed_emails (
                    id TEXT PRIMARY KEY,
                    processed_at TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS tracker_meta (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );",
                table = self.table
            ))
            .map_err(|e| TrackerError::transport(format!("schema init failed: {e}")))
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApplicationRecord> {
    let status: String = row.get("status")?;
    let date_applied: String = row.get("date_applied")?;
    let last_updated: String = row.get("last_updated")?;
    let notes: String = row.get("notes")?;
    let thread_ids: String = row.get("thread_ids")?;

    Ok(ApplicationRecord {
        company: row.get("company")?,
        position: row.get("position")?,
        // lenient on our own data: unreadable values degrade, not fail
        status: Status::parse(&status).unwrap_or(Status::Unknown),
        date_applied: NaiveDate::parse_from_str(&date_applied, DATE_FMT)
            .unwrap_or_default(),
        last_updated: DateTime::parse_from_rfc3339(&last_updated)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_default(),
        contact_person: row.get("contact_person")?,
        contact_email: row.get("contact_email")?,
        job_url: row.get("job_url")?,
        salary_range: row.get("salary_range")?,
        location: row.get("location")?,
        notes: split_joined(&notes, " | "),
        thread_ids: split_joined(&thread_ids, ",").into_iter().collect::<BTreeSet<_>>(),
    })
}

fn split_joined(s: &str, sep: &str) -> Vec<String> {
    s.split(sep)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

impl TrackerStore for SqliteStore {
    fn list_records(&mut self) -> Result<Vec<ApplicationRecord>, TrackerError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT * FROM {} ORDER BY date_applied, company, position",
                self.table
            ))
            .map_err(|e| TrackerError::transport(e))?;
        let rows = stmt
            .query_map([], row_to_record)
            .map_err(|e| TrackerError::transport(e))?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(|e| TrackerError::transport(e))?);
        }
        Ok(records)
    }

    fn append_record(&mut self, record: &ApplicationRecord) -> Result<(), TrackerError> {
        let key = normalized_key(&record.company, &record.position);
        self.conn
            .execute(
                &format!(
                    "INSERT INTO {} (norm_key, company, position, status, date_applied,
                        last_updated, contact_person, contact_email, job_url,
                        salary_range, location, notes, thread_ids)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    self.table
                ),
                params![
                    key,
                    record.company,
                    record.position,
                    record.status.as_str(),
                    record.date_applied.format(DATE_FMT).to_string(),
                    record.last_updated.to_rfc3339(),
                    record.contact_person,
                    record.contact_email,
                    record.job_url,
                    record.salary_range,
                    record.location,
                    record.notes.join(" | "),
                    record
                        .thread_ids
                        .iter()
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(","),
                ],
            )
            .map_err(|e| TrackerError::transport(format!("insert failed: {e}")))?;
        Ok(())
    }

    fn update_record(&mut self, record: &ApplicationRecord) -> Result<(), TrackerError> {
        let key = normalized_key(&record.company, &record.position);
        let changed = self
            .conn
            .execute(
                &format!(
                    "UPDATE {} SET company = ?2, position = ?3, status = ?4,
                        date_applied = ?5, last_updated = ?6, contact_person = ?7,
                        contact_email = ?8, job_url = ?9, salary_range = ?10,
                        location = ?11, notes = ?12, thread_ids = ?13
                     WHERE norm_key = ?1",
                    self.table
                ),
                params![
                    key,
                    record.company,
                    record.position,
                    record.status.as_str(),
                    record.date_applied.format(DATE_FMT).to_string(),
                    record.last_updated.to_rfc3339(),
                    record.contact_person,
                    record.contact_email,
                    record.job_url,
                    record.salary_range,
                    record.location,
                    record.notes.join(" | "),
                    record
                        .thread_ids
                        .iter()
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(","),
                ],
            )
            .map_err(|e| TrackerError::transport(format!("update failed: {e}")))?;
        if changed == 0 {
            return Err(TrackerError::Validation(format!(
                "no record with key '{key}'"
            )));
        }
        Ok(())
    }

    fn mark_processed(&mut self, email_id: &str) -> Result<(), TrackerError> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO processed_emails (id, processed_at) VALUES (?1, ?2)",
                params![email_id, Utc::now().to_rfc3339()],
            )
            .map_err(|e| TrackerError::transport(e))?;
        Ok(())
    }

    fn set_watermark(&mut self, ts: DateTime<Utc>) -> Result<(), TrackerError> {
        self.conn
            .execute(
                "INSERT INTO tracker_meta (key, value) VALUES ('watermark', ?1)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![ts.to_rfc3339()],
            )
            .map_err(|e| TrackerError::transport(e))?;
        Ok(())
    }

    fn load_state(&mut self) -> Result<CycleState, TrackerError> {
        let watermark: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM tracker_meta WHERE key = 'watermark'",
                [],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(TrackerError::transport(other)),
            })?;
        let watermark = watermark
            .as_deref()
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let mut stmt = self
            .conn
            .prepare("SELECT id FROM processed_emails")
            .map_err(|e| TrackerError::transport(e))?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| TrackerError::transport(e))?;
        let mut processed = HashSet::new();
        for id in ids {
            processed.insert(id.map_err(|e| TrackerError::transport(e))?);
        }

        Ok(CycleState {
            watermark,
            processed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_record() -> ApplicationRecord {
        ApplicationRecord {
            company: "Acme Corp".to_string(),
            position: "Backend Engineer".to_string(),
            status: Status::Applied,
            date_applied: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            last_updated: Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap(),
            contact_person: Some("Jane Doe".to_string()),
            contact_email: None,
            job_url: None,
            salary_range: None,
            location: Some("Remote".to_string()),
            notes: vec!["[2025-06-01 09:00] status: Applied".to_string()],
            thread_ids: ["t1".to_string(), "t2".to_string()].into_iter().collect(),
        }
    }

    #[test]
    fn test_append_and_list_roundtrip() {
        let mut store = SqliteStore::open_in_memory("applications").unwrap();
        store.append_record(&sample_record()).unwrap();
        let records = store.list_records().unwrap();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.company, "Acme Corp");
        assert_eq!(r.status, Status::Applied);
        assert_eq!(r.notes.len(), 1);
        assert_eq!(r.thread_ids.len(), 2);
        assert_eq!(r.date_applied, NaiveDate::from_ymd_opt(2025, 6, 1).unwrap());
    }

    #[test]
    fn test_update_by_key() {
        let mut store = SqliteStore::open_in_memory("applications").unwrap();
        store.append_record(&sample_record()).unwrap();
        let mut r = sample_record();
        r.status = Status::InterviewScheduled;
        r.notes.push("second note".to_string());
        store.update_record(&r).unwrap();
        let records = store.list_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, Status::InterviewScheduled);
        assert_eq!(records[0].notes.len(), 2);
    }

    #[test]
    fn test_update_missing_record_fails() {
        let mut store = SqliteStore::open_in_memory("applications").unwrap();
        let err = store.update_record(&sample_record()).unwrap_err();
        assert!(matches!(err, TrackerError::Validation(_)));
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut store = SqliteStore::open_in_memory("applications").unwrap();
        store.append_record(&sample_record()).unwrap();
        // same normalized key ("Acme Corp." normalizes like "Acme Corp")
        let mut dup = sample_record();
        dup.company = "Acme Corp.".to_string();
        assert!(store.append_record(&dup).is_err());
    }

    #[test]
    fn test_processed_set_and_watermark() {
        let mut store = SqliteStore::open_in_memory("applications").unwrap();
        store.mark_processed("m1").unwrap();
        store.mark_processed("m2").unwrap();
        store.mark_processed("m1").unwrap(); // idempotent
        let ts = Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap();
        store.set_watermark(ts).unwrap();
        store.set_watermark(ts).unwrap(); // upsert

        let state = store.load_state().unwrap();
        assert_eq!(state.processed.len(), 2);
        assert!(state.processed.contains("m1"));
        assert_eq!(state.watermark, Some(ts));
    }

    #[test]
    fn test_fresh_store_has_empty_state() {
        let mut store = SqliteStore::open_in_memory("applications").unwrap();
        let state = store.load_state().unwrap();
        assert!(state.watermark.is_none());
        assert!(state.processed.is_empty());
        assert!(store.list_records().unwrap().is_empty());
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tracker.db");
        let mut store = SqliteStore::open(&path, "applications").unwrap();
        assert!(path.exists());
        store.append_record(&sample_record()).unwrap();
    }
}
