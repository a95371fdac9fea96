use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::TrackerError;
use crate::models::Status;

/// IMAP mailbox settings. The app password is kept in a separate file,
/// never in the config itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImapSettings {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password_file: String,
}

impl Default for ImapSettings {
    fn default() -> Self {
        Self {
            server: "imap.gmail.com".to_string(),
            port: 993,
            username: String::new(),
            password_file: "~/.gmail.app_password.txt".to_string(),
        }
    }
}

impl ImapSettings {
    /// Read and trim the app password. `~/` is expanded against $HOME.
    pub fn password(&self) -> Result<String, TrackerError> {
        let path = expand_tilde(&self.password_file);
        let password = std::fs::read_to_string(&path).map_err(|e| {
            TrackerError::Config(format!(
                "failed to read password file {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(password.trim().to_string())
    }
}

/// Full configuration surface. Loaded from an optional JSON file; every
/// field has a usable default except the IMAP username and the extraction
/// provider credential (env var, checked at provider construction).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database path; defaults to the platform data directory.
    pub database: Option<PathBuf>,
    /// Table holding the application rows (the "sheet" of the tracker).
    pub table: String,
    /// Extraction provider: "openai" or "anthropic".
    pub provider: String,
    pub model: String,
    pub imap: ImapSettings,
    pub poll_interval_secs: u64,
    pub max_emails_per_cycle: usize,
    pub lookback_hours: i64,
    /// Findings below this confidence are treated as not job related.
    pub confidence_threshold: f64,
    /// Minimum company similarity for a fuzzy match candidate.
    pub company_threshold: f64,
    /// Minimum position similarity accompanying a fuzzy company match.
    pub position_threshold: f64,
    /// Fuzzy matches below this score are treated as no match at merge time.
    pub confirm_threshold: f64,
    /// Subject/body keywords that make an email a classification candidate.
    pub keywords: Vec<String>,
    /// Applicant-tracking-system sender domains, always candidates.
    pub ats_domains: Vec<String>,
    /// Social/notification domains that need an explicit keyword hit.
    pub social_domains: Vec<String>,
    /// Non-terminal statuses in ascending rank.
    pub status_order: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: None,
            table: "applications".to_string(),
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            imap: ImapSettings::default(),
            poll_interval_secs: 1800,
            max_emails_per_cycle: 50,
            lookback_hours: 24,
            confidence_threshold: 0.6,
            company_threshold: 0.88,
            position_threshold: 0.75,
            confirm_threshold: 0.93,
            keywords: [
                "application",
                "interview",
                "position",
                "role",
                "job",
                "career",
                "hiring",
                "recruitment",
                "recruiter",
                "human resources",
                "offer",
                "rejection",
                "screening",
                "assessment",
                "coding challenge",
                "next steps",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            ats_domains: [
                "greenhouse.io",
                "lever.co",
                "workday.com",
                "smartrecruiters.com",
                "bamboohr.com",
                "jobvite.com",
                "icims.com",
                "taleo.net",
                "ashbyhq.com",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            social_domains: [
                "linkedin.com",
                "linkedinmail.com",
                "bounce.linkedin.com",
                "facebookmail.com",
                "twitter.com",
                "meetup.com",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            status_order: [
                "Applied",
                "Under Review",
                "Assessment Requested",
                "Interview Scheduled",
                "Interview Completed",
                "Offer",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl Config {
    /// Load from a JSON file, or fall back to defaults when `path` is None
    /// and no `apptrack.json` exists in the working directory.
    pub fn load(path: Option<&Path>) -> Result<Config, TrackerError> {
        let fallback = Path::new("apptrack.json");
        let path = match path {
            Some(p) => Some(p),
            None if fallback.exists() => Some(fallback),
            None => None,
        };

        let cfg = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p).map_err(|e| {
                    TrackerError::Config(format!("failed to read {}: {}", p.display(), e))
                })?;
                serde_json::from_str(&content).map_err(|e| {
                    TrackerError::Config(format!("failed to parse {}: {}", p.display(), e))
                })?
            }
            None => Config::default(),
        };

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), TrackerError> {
        if self.table.is_empty()
            || !self
                .table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(TrackerError::Config(
                "table must be a non-empty identifier (ascii alphanumerics and _)".into(),
            ));
        }
        if self.provider != "openai" && self.provider != "anthropic" {
            return Err(TrackerError::Config(format!(
                "unknown provider '{}': expected 'openai' or 'anthropic'",
                self.provider
            )));
        }
        if self.poll_interval_secs == 0 {
            return Err(TrackerError::Config("poll_interval_secs must be > 0".into()));
        }
        if self.max_emails_per_cycle == 0 {
            return Err(TrackerError::Config("max_emails_per_cycle must be > 0".into()));
        }
        if self.lookback_hours <= 0 {
            return Err(TrackerError::Config("lookback_hours must be > 0".into()));
        }
        for (name, v) in [
            ("confidence_threshold", self.confidence_threshold),
            ("company_threshold", self.company_threshold),
            ("position_threshold", self.position_threshold),
            ("confirm_threshold", self.confirm_threshold),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(TrackerError::Config(format!(
                    "{name} must be between 0 and 1"
                )));
            }
        }
        self.parsed_status_order().map(|_| ())
    }

    /// The configured status partial order, ascending. Terminal and
    /// Unknown statuses are not orderable and rejected here.
    pub fn parsed_status_order(&self) -> Result<Vec<Status>, TrackerError> {
        if self.status_order.is_empty() {
            return Err(TrackerError::Config("status_order must not be empty".into()));
        }
        let mut order = Vec::with_capacity(self.status_order.len());
        for name in &self.status_order {
            let st = Status::parse(name).ok_or_else(|| {
                TrackerError::Config(format!("status_order contains unknown status '{name}'"))
            })?;
            if st.is_terminal() || st == Status::Unknown {
                return Err(TrackerError::Config(format!(
                    "status_order must not contain '{name}'"
                )));
            }
            order.push(st);
        }
        Ok(order)
    }

    /// Resolved database path, defaulting to the platform data directory.
    pub fn database_path(&self) -> PathBuf {
        if let Some(p) = &self.database {
            return expand_tilde(&p.to_string_lossy());
        }
        if let Some(dirs) = directories::ProjectDirs::from("", "", "apptrack") {
            dirs.data_dir().join("apptrack.db")
        } else {
            PathBuf::from("apptrack.db")
        }
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_default();
        return PathBuf::from(home).join(rest);
    }
    PathBuf::from(path)
}
