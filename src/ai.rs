use serde::{Deserialize, Serialize};
use std::env;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::TrackerError;
use crate::models::{EmailFinding, ImportantDate, RawEmail, Status};

// --- Provider trait ---

pub trait Provider {
    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, TrackerError>;
    fn model_name(&self) -> &str;
}

pub fn create_provider(cfg: &Config) -> Result<Box<dyn Provider>, TrackerError> {
    match cfg.provider.as_str() {
        "openai" => Ok(Box::new(OpenAiProvider::new(cfg.model.clone())?)),
        "anthropic" => Ok(Box::new(AnthropicProvider::new(cfg.model.clone())?)),
        other => Err(TrackerError::Config(format!("unknown provider '{other}'"))),
    }
}

const CALL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

fn http_client() -> Result<reqwest::blocking::Client, TrackerError> {
    reqwest::blocking::Client::builder()
        .timeout(CALL_TIMEOUT)
        .build()
        .map_err(|e| TrackerError::Config(format!("failed to build HTTP client: {e}")))
}

// --- OpenAI provider ---

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<OpenAiMessage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

pub struct OpenAiProvider {
    api_key: String,
    model_id: String,
    client: reqwest::blocking::Client,
}

impl OpenAiProvider {
    pub fn new(model_id: String) -> Result<Self, TrackerError> {
        let api_key = env::var("OPENAI_API_KEY").map_err(|_| {
            TrackerError::Config(
                "OPENAI_API_KEY environment variable not set. Set it with: export OPENAI_API_KEY=your-key-here".into(),
            )
        })?;
        Ok(Self {
            api_key,
            model_id,
            client: http_client()?,
        })
    }
}

impl Provider for OpenAiProvider {
    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, TrackerError> {
        let request = OpenAiRequest {
            model: self.model_id.clone(),
            max_tokens,
            temperature: 0.1,
            messages: vec![
                OpenAiMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                OpenAiMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
        };

        let response = self
            .client
            .post(OPENAI_API_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .map_err(|e| TrackerError::transport(format!("OpenAI request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().unwrap_or_default();
            return Err(TrackerError::Transport(format!(
                "OpenAI API request failed with status {status}: {error_text}"
            )));
        }

        let api_response: OpenAiResponse = response
            .json()
            .map_err(|e| TrackerError::transport(format!("bad OpenAI response body: {e}")))?;

        api_response
            .choices
            .first()
            .map(|choice| choice.message.content.clone())
            .ok_or_else(|| TrackerError::Transport("no choices in OpenAI response".into()))
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- Anthropic provider ---

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    system: String,
    messages: Vec<AnthropicMessage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
}

pub struct AnthropicProvider {
    api_key: String,
    model_id: String,
    client: reqwest::blocking::Client,
}

impl AnthropicProvider {
    pub fn new(model_id: String) -> Result<Self, TrackerError> {
        let api_key = env::var("ANTHROPIC_API_KEY").map_err(|_| {
            TrackerError::Config(
                "ANTHROPIC_API_KEY environment variable not set. Set it with: export ANTHROPIC_API_KEY=your-key-here".into(),
            )
        })?;
        Ok(Self {
            api_key,
            model_id,
            client: http_client()?,
        })
    }
}

impl Provider for AnthropicProvider {
    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, TrackerError> {
        let request = AnthropicRequest {
            model: self.model_id.clone(),
            max_tokens,
            system: SYSTEM_PROMPT.to_string(),
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .map_err(|e| TrackerError::transport(format!("Anthropic request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().unwrap_or_default();
            return Err(TrackerError::Transport(format!(
                "Anthropic API request failed with status {status}: {error_text}"
            )));
        }

        let api_response: AnthropicResponse = response
            .json()
            .map_err(|e| TrackerError::transport(format!("bad Anthropic response body: {e}")))?;

        api_response
            .content
            .first()
            .map(|block| block.text.clone())
            .ok_or_else(|| TrackerError::Transport("no content in Anthropic response".into()))
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- Classification ---

const SYSTEM_PROMPT: &str = "You are an assistant specialized in analyzing job-related emails. \
Extract structured information about job applications, interviews, rejections and offers. \
Always respond with a single valid JSON object and nothing else. \
Extract only information clearly stated in the email.";

#[derive(Debug)]
pub enum Classification {
    JobRelated(EmailFinding),
    NotJobRelated,
}

/// Classifier Adapter: wraps an extraction provider, owns the prompt
/// contract, and validates the structured reply before anything else in
/// the system sees it.
pub struct Classifier {
    provider: Box<dyn Provider>,
    confidence_threshold: f64,
    ats_domains: Vec<String>,
}

impl Classifier {
    pub fn new(provider: Box<dyn Provider>, cfg: &Config) -> Self {
        Self {
            provider,
            confidence_threshold: cfg.confidence_threshold,
            ats_domains: cfg.ats_domains.clone(),
        }
    }

    /// Classify one email. Transport failures propagate (the email is
    /// retried next cycle); malformed provider output is downgraded to
    /// NotJobRelated with a warning.
    pub fn classify(&self, email: &RawEmail) -> Result<Classification, TrackerError> {
        if email.subject.trim().is_empty() && email.body.trim().is_empty() {
            debug!(email_id = %email.id, "empty subject and body");
            return Ok(Classification::NotJobRelated);
        }

        let prompt = build_prompt(email);
        let text = self.provider.complete(&prompt, 1000)?;

        let mut finding = match parse_analysis(&text, email) {
            Ok(f) => f,
            Err(err) => {
                warn!(
                    email_id = %email.id,
                    model = self.provider.model_name(),
                    %err,
                    "classifier output failed validation, treating as not job related"
                );
                return Ok(Classification::NotJobRelated);
            }
        };

        finding = postprocess(finding, email);

        if finding.company.is_none() {
            finding.company = company_from_sender(&email.sender, &self.ats_domains);
        }
        if finding.job_url.is_none() {
            finding.job_url = job_url_from_body(&email.body);
        }

        if !finding.is_job_related || finding.confidence < self.confidence_threshold {
            return Ok(Classification::NotJobRelated);
        }
        Ok(Classification::JobRelated(finding))
    }
}

fn build_prompt(email: &RawEmail) -> String {
    let body: String = email.body.chars().take(2000).collect();
    format!(
        "Analyze the following email and extract job application information.\n\
        \n\
        EMAIL DETAILS:\n\
        Subject: {}\n\
        From: {}\n\
        Date: {}\n\
        \n\
        EMAIL BODY:\n\
        {}\n\
        \n\
        Return a JSON object with exactly these fields:\n\
        {{\n\
          \"is_job_related\": boolean,\n\
          \"confidence\": number between 0 and 1,\n\
          \"company\": string or null,\n\
          \"position\": string or null,\n\
          \"status\": one of \"Applied\", \"Under Review\", \"Interview Scheduled\", \
        \"Interview Completed\", \"Assessment Requested\", \"Offer\", \"Rejected\", \
        \"Withdrawn\", \"Unknown\",\n\
          \"contact_person\": string or null,\n\
          \"contact_email\": string or null,\n\
          \"job_url\": string or null,\n\
          \"salary_range\": string or null,\n\
          \"location\": string or null,\n\
          \"important_dates\": array of {{\"label\": string, \"date\": \"YYYY-MM-DD\"}}\n\
        }}\n\
        \n\
        Set is_job_related to true only if this is clearly about a job application or \
        career opportunity. Use null for anything not clearly stated.",
        email.subject,
        email.sender,
        email.timestamp.format("%Y-%m-%d %H:%M"),
        body,
    )
}

#[derive(Debug, Deserialize)]
struct RawAnalysis {
    #[serde(default)]
    is_job_related: bool,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    company: Option<String>,
    #[serde(default)]
    position: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    contact_person: Option<String>,
    #[serde(default)]
    contact_email: Option<String>,
    #[serde(default)]
    job_url: Option<String>,
    #[serde(default)]
    salary_range: Option<String>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    important_dates: Vec<RawDate>,
}

#[derive(Debug, Deserialize)]
struct RawDate {
    #[serde(default)]
    label: String,
    #[serde(default)]
    date: String,
}

/// Validate the provider's reply against the finding schema. Models tend
/// to wrap JSON in prose or code fences, so only the outermost object is
/// parsed.
fn parse_analysis(text: &str, email: &RawEmail) -> Result<EmailFinding, TrackerError> {
    let json = extract_json(text)
        .ok_or_else(|| TrackerError::Validation("no JSON object in response".into()))?;
    let raw: RawAnalysis = serde_json::from_str(json)
        .map_err(|e| TrackerError::Validation(format!("schema mismatch: {e}")))?;

    let confidence = raw.confidence.unwrap_or(0.5).clamp(0.0, 1.0);
    let detected_status = raw
        .status
        .as_deref()
        .map(Status::parse_loose)
        .unwrap_or(Status::Unknown);

    let important_dates = raw
        .important_dates
        .into_iter()
        .filter_map(|d| {
            let date = parse_date(&d.date)?;
            let label = if d.label.trim().is_empty() {
                "date".to_string()
            } else {
                d.label.trim().to_string()
            };
            Some(ImportantDate { label, date })
        })
        .collect();

    Ok(EmailFinding {
        is_job_related: raw.is_job_related,
        confidence,
        company: clean_field(raw.company),
        position: clean_field(raw.position),
        detected_status,
        contact_person: clean_field(raw.contact_person),
        contact_email: clean_field(raw.contact_email),
        job_url: clean_field(raw.job_url),
        salary_range: clean_field(raw.salary_range),
        location: clean_field(raw.location),
        important_dates,
        source_thread_id: email.thread_id.clone(),
        source_timestamp: email.timestamp,
    })
}

fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn parse_date(s: &str) -> Option<chrono::NaiveDate> {
    let s = s.trim();
    chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            // Accept datetime strings by taking the date part.
            s.get(..10)
                .and_then(|d| chrono::NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        })
}

fn clean_field(value: Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("null"))
        .map(str::to_string)
}

const OFFER_PHRASES: &[&str] = &[
    "we are pleased to offer",
    "congratulations",
    "offer of employment",
    "offer letter",
    "you have been offered",
    "official offer",
    "job offer",
    "we would like to offer you",
];

const INTERVIEW_PHRASES: &[&str] = &[
    "interview",
    "schedule a call",
    "your availability",
    "invite you to interview",
];

/// Content heuristics run after the model: unambiguous offer language
/// overrides whatever the model said, and interview language upgrades an
/// Unknown status.
fn postprocess(mut finding: EmailFinding, email: &RawEmail) -> EmailFinding {
    let subject = email.subject.to_lowercase();
    let body = email.body.to_lowercase();
    let contains = |phrases: &[&str]| {
        phrases
            .iter()
            .any(|p| subject.contains(p) || body.contains(p))
    };

    if contains(OFFER_PHRASES) {
        finding.detected_status = Status::Offer;
        finding.confidence = finding.confidence.max(0.9);
        finding.is_job_related = true;
    } else if contains(INTERVIEW_PHRASES) && finding.detected_status == Status::Unknown {
        finding.detected_status = Status::InterviewScheduled;
        finding.confidence = finding.confidence.max(0.7);
        finding.is_job_related = true;
    }
    finding
}

/// Recover a posting link the model missed: the first URL in the body
/// that looks like a job page.
fn job_url_from_body(body: &str) -> Option<String> {
    static URL_RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = URL_RE.get_or_init(|| {
        regex::Regex::new(r#"https?://[^\s<>"')\]]+"#).unwrap()
    });
    re.find_iter(body)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';']))
        .find(|url| {
            let lower = url.to_lowercase();
            ["job", "career", "position", "greenhouse", "lever.co", "workday"]
                .iter()
                .any(|k| lower.contains(k))
        })
        .map(str::to_string)
}

/// Domain part of a From header value like `Name <jobs@acme.com>`.
pub fn sender_domain(sender: &str) -> Option<String> {
    let after_at = sender.split('@').nth(1)?;
    let domain = after_at
        .split('>')
        .next()
        .unwrap_or(after_at)
        .split('/')
        .next()
        .unwrap_or(after_at)
        .trim()
        .to_lowercase();
    (!domain.is_empty()).then_some(domain)
}

/// Guess a company from the sender domain, skipping recruiting platforms
/// whose domain says nothing about the employer.
fn company_from_sender(sender: &str, ats_domains: &[String]) -> Option<String> {
    let domain = sender_domain(sender)?;
    if ats_domains.iter().any(|d| domain.contains(d.as_str())) {
        return None;
    }
    let label = domain.split('.').next()?;
    if label.is_empty() {
        return None;
    }
    let mut chars = label.chars();
    let first = chars.next()?;
    Some(first.to_uppercase().collect::<String>() + chars.as_str())
}
